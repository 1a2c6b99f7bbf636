//! Core domain model for BRC: report rows, classification results, date windows
//! and the shared error taxonomy.

use std::fmt;

use chrono::{FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "brc-core";

/// Cluster id written for rows that the exclusion rule short-circuits.
pub const EXCLUDED_CLUSTER_ID: i64 = -1;

/// Label returned for cluster ids missing from the label table.
pub const FALLBACK_LABEL: &str = "Others";

/// Opaque row key, unique within one report table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub i64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One operator report as fetched from a discovered table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub id: RowId,
    pub table_name: String,
    pub text: String,
    pub date: NaiveDate,
}

impl ReportRow {
    pub fn into_input(self) -> ClassificationInput {
        ClassificationInput {
            text: Some(self.text),
            id: self.id,
            table_name: self.table_name,
        }
    }
}

/// A `(text, id, table)` triple handed to the classification pipeline.
///
/// A missing `text` classifies as empty text. Request bodies never produce one;
/// non-string texts are rejected before they reach the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationInput {
    pub text: Option<String>,
    pub id: RowId,
    pub table_name: String,
}

impl ClassificationInput {
    pub fn new(text: impl Into<String>, id: i64, table_name: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            id: RowId(id),
            table_name: table_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub cluster_id: i64,
    pub label: String,
}

impl Classification {
    /// Sentinel assignment: the label is the original text, verbatim.
    pub fn excluded(text: &str) -> Self {
        Self {
            cluster_id: EXCLUDED_CLUSTER_ID,
            label: text.to_string(),
        }
    }

    pub fn is_excluded(&self) -> bool {
        self.cluster_id == EXCLUDED_CLUSTER_ID
    }
}

/// Full-row values written back for one report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub table_name: String,
    pub id: RowId,
    pub processed_report: Option<String>,
    pub predicted_cluster: i64,
    pub predicted_label: String,
}

impl RowUpdate {
    pub fn new(input: &ClassificationInput, classification: Classification) -> Self {
        Self {
            table_name: input.table_name.clone(),
            id: input.id,
            processed_report: input.text.clone(),
            predicted_cluster: classification.cluster_id,
            predicted_label: classification.label,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("model inference failed: {0}")]
    ModelInference(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("invalid request: {0}")]
    Validation(String),
}

impl ClassifyError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Today's calendar date in the given civil offset.
pub fn today_in(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}

/// Inclusive calendar window a classification run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ClassifyError> {
        if start > end {
            return Err(ClassifyError::Validation(format!(
                "start_date {start} is after end_date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn today(offset: FixedOffset) -> Self {
        Self::single(today_in(offset))
    }

    /// Builds a window from optional `YYYY-MM-DD` bounds. When either bound is
    /// missing the window collapses to today in `offset`.
    pub fn resolve(
        start: Option<&str>,
        end: Option<&str>,
        offset: FixedOffset,
    ) -> Result<Self, ClassifyError> {
        let start = start.map(str::trim).filter(|s| !s.is_empty());
        let end = end.map(str::trim).filter(|s| !s.is_empty());
        match (start, end) {
            (Some(start), Some(end)) => Self::new(parse_date(start)?, parse_date(end)?),
            _ => Ok(Self::today(offset)),
        }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Number of calendar days the window covers.
    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Rejects windows longer than `max_days`.
    pub fn within_span(self, max_days: u32) -> Result<Self, ClassifyError> {
        if self.span_days() > i64::from(max_days) {
            return Err(ClassifyError::Validation(format!(
                "window {self} spans {} days, more than the {max_days} allowed",
                self.span_days()
            )));
        }
        Ok(self)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end)
        }
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, ClassifyError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|err| ClassifyError::Validation(format!("invalid date {value:?}: {err}")))
}
