//! Report store access for BRC: the `ReportStore` seam, its Postgres
//! implementation, an in-memory store, and table-name allow-listing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use brc_core::{ClassifyError, ReportRow, RowId, RowUpdate};
use chrono::NaiveDate;
use regex::Regex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "brc-storage";

pub const DEFAULT_TABLE_LIKE: &str = "mo%_brk_cap_ai";
pub const DEFAULT_TABLE_ALLOW: &str = r"^mo[a-z0-9_]*_brk_cap_ai$";
pub const DEFAULT_SCHEMA: &str = "public";

/// Column holding the free-text operator report.
pub const REPORT_TEXT_COLUMN: &str = "what_was_report_by_tm_3_operator";

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Table names matching a SQL `LIKE` pattern. Recomputed on every call.
    async fn discover_tables(&self, like_pattern: &str) -> Result<BTreeSet<String>, ClassifyError>;

    /// Rows dated `date` with non-blank report text, ordered by id.
    async fn fetch_batch(
        &self,
        table: &str,
        date: NaiveDate,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReportRow>, ClassifyError>;

    /// Writes every update in one transaction; nothing is retained on failure.
    async fn apply_updates(&self, updates: &[RowUpdate]) -> Result<(), ClassifyError>;

    async fn run_reporting_procedure(&self) -> Result<(), ClassifyError>;
}

/// Guards dynamically spliced table identifiers.
#[derive(Debug, Clone)]
pub struct TableAllowList {
    pattern: Regex,
}

impl Default for TableAllowList {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_TABLE_ALLOW).expect("default allow-list pattern is valid"),
        }
    }
}

impl TableAllowList {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("compiling table allow-list pattern {pattern:?}"))?;
        Ok(Self { pattern })
    }

    pub fn is_allowed(&self, table: &str) -> bool {
        self.pattern.is_match(table)
    }

    pub fn check(&self, table: &str) -> Result<(), ClassifyError> {
        if self.is_allowed(table) {
            Ok(())
        } else {
            Err(ClassifyError::Validation(format!(
                "table {table:?} does not match allow-list {}",
                self.pattern.as_str()
            )))
        }
    }
}

/// Anchored regex with SQL `LIKE` semantics: `%` matches any run, `_` any
/// single char. No escapes.
pub fn like_regex(pattern: &str) -> Result<Regex, ClassifyError> {
    let mut translated = String::from("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            c => translated.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    translated.push('$');
    Regex::new(&translated)
        .map_err(|err| ClassifyError::Validation(format!("LIKE pattern {pattern:?}: {err}")))
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn connection_error(err: sqlx::Error) -> ClassifyError {
    ClassifyError::Connection(err.to_string())
}

fn query_error(err: sqlx::Error) -> ClassifyError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ClassifyError::Connection(err.to_string())
        }
        other => ClassifyError::Query(other.to_string()),
    }
}

/// Postgres-backed store. Connections come from a lazily connected pool and
/// are returned on drop; open transactions roll back on drop.
#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
    schema: String,
}

impl PgReportStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn connect_lazy(
        database_url: &str,
        max_connections: u32,
        schema: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_lazy(database_url)
            .context("configuring postgres pool from DATABASE_URL")?;
        Ok(Self::new(pool, schema))
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn discover_tables(&self, like_pattern: &str) -> Result<BTreeSet<String>, ClassifyError> {
        let mut conn = self.pool.acquire().await.map_err(connection_error)?;
        let rows = sqlx::query(
            r#"
            SELECT table_name::text AS table_name
              FROM information_schema.tables
             WHERE table_name LIKE $1
               AND table_schema = $2
            "#,
        )
        .bind(like_pattern)
        .bind(&self.schema)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_error)?;

        let mut out = BTreeSet::new();
        for row in rows {
            let name: String = row.try_get("table_name").map_err(query_error)?;
            out.insert(name);
        }
        Ok(out)
    }

    async fn fetch_batch(
        &self,
        table: &str,
        date: NaiveDate,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReportRow>, ClassifyError> {
        let sql = format!(
            r#"
            SELECT id::bigint AS id, {col} AS report_text
              FROM {table}
             WHERE "date"::date = $1
               AND {col} IS NOT NULL
               AND TRIM({col}) <> ''
             ORDER BY id
             LIMIT $2 OFFSET $3
            "#,
            col = REPORT_TEXT_COLUMN,
            table = self.qualified(table),
        );
        let mut conn = self.pool.acquire().await.map_err(connection_error)?;
        let rows = sqlx::query(&sql)
            .bind(date)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&mut *conn)
            .await
            .map_err(query_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ReportRow {
                id: RowId(row.try_get("id").map_err(query_error)?),
                table_name: table.to_string(),
                text: row.try_get("report_text").map_err(query_error)?,
                date,
            });
        }
        Ok(out)
    }

    async fn apply_updates(&self, updates: &[RowUpdate]) -> Result<(), ClassifyError> {
        let mut tx = self.pool.begin().await.map_err(connection_error)?;
        for update in updates {
            let sql = format!(
                r#"
                UPDATE {table} SET
                       processed_report = $1,
                       predicted_cluster = $2,
                       predicted_label = $3
                 WHERE id = $4
                "#,
                table = self.qualified(&update.table_name),
            );
            sqlx::query(&sql)
                .bind(&update.processed_report)
                .bind(update.predicted_cluster)
                .bind(&update.predicted_label)
                .bind(update.id.0)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
        }
        tx.commit().await.map_err(query_error)?;
        debug!(rows = updates.len(), "committed classification updates");
        Ok(())
    }

    async fn run_reporting_procedure(&self) -> Result<(), ClassifyError> {
        let mut tx = self.pool.begin().await.map_err(connection_error)?;
        sqlx::query("SELECT run_reporting_procedures()")
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }
}

/// One stored report in a `MemoryReportStore` table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredReport {
    pub date: Option<NaiveDate>,
    pub text: Option<String>,
    pub processed_report: Option<String>,
    pub predicted_cluster: Option<i64>,
    pub predicted_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub table: String,
    pub date: NaiveDate,
    pub offset: usize,
    pub returned: usize,
}

/// In-process store with the same predicate, ordering and transaction
/// semantics as `PgReportStore`. Used for tests and local dry runs.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    tables: Mutex<BTreeMap<String, BTreeMap<RowId, StoredReport>>>,
    fetch_calls: Mutex<Vec<FetchCall>>,
    reporting_calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, table: &str) {
        self.tables.lock().await.entry(table.to_string()).or_default();
    }

    pub async fn insert_report(&self, table: &str, id: i64, date: NaiveDate, text: Option<&str>) {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(
                RowId(id),
                StoredReport {
                    date: Some(date),
                    text: text.map(ToString::to_string),
                    ..Default::default()
                },
            );
    }

    pub async fn report(&self, table: &str, id: i64) -> Option<StoredReport> {
        self.tables
            .lock()
            .await
            .get(table)
            .and_then(|rows| rows.get(&RowId(id)))
            .cloned()
    }

    pub async fn fetch_calls(&self) -> Vec<FetchCall> {
        self.fetch_calls.lock().await.clone()
    }

    pub fn reporting_calls(&self) -> usize {
        self.reporting_calls.load(Ordering::SeqCst)
    }

    /// Makes every subsequent operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), ClassifyError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ClassifyError::Connection("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

fn missing_relation(table: &str) -> ClassifyError {
    ClassifyError::Query(format!("relation {} does not exist", quote_ident(table)))
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn discover_tables(&self, like_pattern: &str) -> Result<BTreeSet<String>, ClassifyError> {
        self.ensure_available()?;
        let matcher = like_regex(like_pattern)?;
        Ok(self
            .tables
            .lock()
            .await
            .keys()
            .filter(|name| matcher.is_match(name))
            .cloned()
            .collect())
    }

    async fn fetch_batch(
        &self,
        table: &str,
        date: NaiveDate,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReportRow>, ClassifyError> {
        self.ensure_available()?;
        let tables = self.tables.lock().await;
        let rows = tables.get(table).ok_or_else(|| missing_relation(table))?;
        let batch = rows
            .iter()
            .filter(|(_, r)| r.date == Some(date))
            .filter_map(|(id, r)| {
                let text = r.text.as_deref()?;
                (!text.trim().is_empty()).then(|| ReportRow {
                    id: *id,
                    table_name: table.to_string(),
                    text: text.to_string(),
                    date,
                })
            })
            .skip(offset)
            .take(limit)
            .collect::<Vec<_>>();
        drop(tables);

        self.fetch_calls.lock().await.push(FetchCall {
            table: table.to_string(),
            date,
            offset,
            returned: batch.len(),
        });
        Ok(batch)
    }

    async fn apply_updates(&self, updates: &[RowUpdate]) -> Result<(), ClassifyError> {
        self.ensure_available()?;
        let mut tables = self.tables.lock().await;
        if let Some(update) = updates.iter().find(|u| !tables.contains_key(&u.table_name)) {
            return Err(missing_relation(&update.table_name));
        }
        for update in updates {
            // an unknown id updates nothing, like an UPDATE matching zero rows
            if let Some(row) = tables
                .get_mut(&update.table_name)
                .and_then(|rows| rows.get_mut(&update.id))
            {
                row.processed_report = update.processed_report.clone();
                row.predicted_cluster = Some(update.predicted_cluster);
                row.predicted_label = Some(update.predicted_label.clone());
            }
        }
        Ok(())
    }

    async fn run_reporting_procedure(&self) -> Result<(), ClassifyError> {
        self.ensure_available()?;
        self.reporting_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
