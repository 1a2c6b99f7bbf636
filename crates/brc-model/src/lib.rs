//! Text normalization, exclusion rule, cluster label table and the model
//! capability (TF-IDF vectorizer + k-means centres) behind cluster assignment.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use brc_core::{Classification, ClassifyError, FALLBACK_LABEL};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "brc-model";

pub const VECTORIZER_ARTIFACT: &str = "tfidf_vectorizer.json";
pub const CLUSTER_MODEL_ARTIFACT: &str = "kmeans_model.json";

/// Reference labels, indexed by cluster id.
pub const CLUSTER_LABELS: [&str; 37] = [
    "Rig and Tripping Issues",
    "Oil and Leak Issues",
    "Engine Starting Problems",
    "CAS and Equipment Issues",
    "Brake and Pressure Issues",
    "Overheating and Engine Problems",
    "Engine Cutting and Overheating",
    "Bucket Movement and Cylinder Issues",
    "Steering and Cylinder Faults",
    "Drilling and Spanner Issues",
    "Emulsion Pumping Problems",
    "Drifter and Bolt Issues",
    "Pump and Hydraulic Issues",
    "Movement and Gear Problems",
    "Brakes Binding and Overheating",
    "Hydraulic Pipe Leaks",
    "Chain and Actuator Breakages",
    "Feed Sling and Cylinder Damage",
    "Motor and Compressor Faults",
    "Spanner and Chain Malfunctions",
    "Hydraulic Pipe Bursts",
    "Reverse Movement and Power Issues",
    "Excessive Smoking Issues",
    "Engine and Remote Faults",
    "Boom Movement and Engine Issues",
    "Tramming and Power Issues",
    "Lighting and Rear Warning Issues",
    "Hydraulic Oil Leaks",
    "Power and Trimming Problems",
    "Power Pack and Tripping Issues",
    "Jack and Stabilizer Malfunctions",
    "Tyre and Sling Damage",
    "Steering and Turning Issues",
    "Profshaft and Bolt Problems",
    "Engine Cut and Sensor Faults",
    "Water Mixing and Leakage",
    "Alternator and Charging Issues",
];

pub fn cluster_label(cluster_id: i64) -> &'static str {
    usize::try_from(cluster_id)
        .ok()
        .and_then(|idx| CLUSTER_LABELS.get(idx))
        .copied()
        .unwrap_or(FALLBACK_LABEL)
}

/// Canonical model input: lowercase, keep only `a-z`, `0-9` and whitespace.
/// Non-textual input normalizes to the empty string.
pub fn normalize_text(text: Option<&str>) -> String {
    let Some(text) = text else {
        return String::new();
    };
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ExclusionRule {
    keywords: Vec<String>,
}

impl Default for ExclusionRule {
    fn default() -> Self {
        Self::new(["service", "extended service"])
    }
}

impl ExclusionRule {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn is_excluded(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("feature dimension {actual} does not match model dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("non-finite feature value at index {0}")]
    NonFinite(usize),
    #[error("cluster model has no centres")]
    Empty,
}

impl From<ModelError> for ClassifyError {
    fn from(err: ModelError) -> Self {
        ClassifyError::ModelInference(err.to_string())
    }
}

/// Sparse feature vector, entries sorted by index.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub dim: usize,
    pub entries: Vec<(usize, f64)>,
}

impl FeatureVector {
    pub fn squared_norm(&self) -> f64 {
        self.entries.iter().map(|(_, v)| v * v).sum()
    }
}

pub trait Vectorizer: Send + Sync {
    fn transform(&self, text: &str) -> Result<FeatureVector, ModelError>;
}

pub trait ClusterModel: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<i64, ModelError>;
    fn n_clusters(&self) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfArtifact {
    pub vocabulary: HashMap<String, usize>,
    pub idf: Vec<f64>,
    #[serde(default = "default_ngram_range")]
    pub ngram_range: (usize, usize),
    #[serde(default)]
    pub sublinear_tf: bool,
}

fn default_ngram_range() -> (usize, usize) {
    (1, 1)
}

#[derive(Debug, Clone)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    ngram_range: (usize, usize),
    sublinear_tf: bool,
}

impl TfidfVectorizer {
    pub fn from_artifact(artifact: TfidfArtifact) -> Result<Self> {
        let (min_n, max_n) = artifact.ngram_range;
        anyhow::ensure!(
            min_n >= 1 && min_n <= max_n,
            "invalid ngram_range ({min_n}, {max_n})"
        );
        if let Some((term, idx)) = artifact
            .vocabulary
            .iter()
            .find(|(_, idx)| **idx >= artifact.idf.len())
        {
            anyhow::bail!(
                "vocabulary term {term:?} maps to index {idx} beyond idf length {}",
                artifact.idf.len()
            );
        }
        Ok(Self {
            vocabulary: artifact.vocabulary,
            idf: artifact.idf,
            ngram_range: artifact.ngram_range,
            sublinear_tf: artifact.sublinear_tf,
        })
    }

    pub fn dim(&self) -> usize {
        self.idf.len()
    }

    fn terms(&self, tokens: &[&str]) -> Vec<String> {
        let (min_n, max_n) = self.ngram_range;
        let mut out = Vec::new();
        for n in min_n..=max_n {
            if n == 1 {
                out.extend(tokens.iter().map(|t| t.to_string()));
            } else {
                out.extend(tokens.windows(n).map(|w| w.join(" ")));
            }
        }
        out
    }
}

impl Vectorizer for TfidfVectorizer {
    fn transform(&self, text: &str) -> Result<FeatureVector, ModelError> {
        // single-character tokens are dropped, matching the training tokenizer
        let tokens = text
            .split_whitespace()
            .filter(|t| t.chars().count() >= 2)
            .collect::<Vec<_>>();

        let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
        for term in self.terms(&tokens) {
            if let Some(idx) = self.vocabulary.get(&term) {
                *counts.entry(*idx).or_default() += 1.0;
            }
        }

        let mut entries = Vec::with_capacity(counts.len());
        for (idx, count) in counts {
            let tf = if self.sublinear_tf { 1.0 + count.ln() } else { count };
            let value = tf * self.idf[idx];
            if !value.is_finite() {
                return Err(ModelError::NonFinite(idx));
            }
            entries.push((idx, value));
        }

        let norm = entries.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, v) in &mut entries {
                *v /= norm;
            }
        }

        Ok(FeatureVector {
            dim: self.dim(),
            entries,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansArtifact {
    pub cluster_centers: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct KMeansModel {
    centers: Vec<Vec<f64>>,
    center_sq_norms: Vec<f64>,
    dim: usize,
}

impl KMeansModel {
    pub fn from_artifact(artifact: KMeansArtifact) -> Result<Self> {
        let dim = artifact
            .cluster_centers
            .first()
            .map(Vec::len)
            .ok_or(ModelError::Empty)?;
        if let Some(pos) = artifact.cluster_centers.iter().position(|c| c.len() != dim) {
            anyhow::bail!(
                "cluster centre {pos} has dimension {} (expected {dim})",
                artifact.cluster_centers[pos].len()
            );
        }
        let center_sq_norms = artifact
            .cluster_centers
            .iter()
            .map(|c| c.iter().map(|v| v * v).sum())
            .collect();
        Ok(Self {
            centers: artifact.cluster_centers,
            center_sq_norms,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl ClusterModel for KMeansModel {
    fn predict(&self, features: &FeatureVector) -> Result<i64, ModelError> {
        if features.dim != self.dim {
            return Err(ModelError::DimensionMismatch {
                expected: self.dim,
                actual: features.dim,
            });
        }
        let x_sq = features.squared_norm();
        let mut best: Option<(usize, f64)> = None;
        for (cluster, center) in self.centers.iter().enumerate() {
            let dot: f64 = features.entries.iter().map(|(i, v)| center[*i] * v).sum();
            let distance = self.center_sq_norms[cluster] - 2.0 * dot + x_sq;
            // strict comparison keeps the lowest index on ties
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((cluster, distance));
            }
        }
        best.map(|(cluster, _)| cluster as i64).ok_or(ModelError::Empty)
    }

    fn n_clusters(&self) -> usize {
        self.centers.len()
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Loads the vectorizer and cluster model from `model_dir` and checks that
/// they agree on the feature dimension.
pub fn load_model_artifacts(model_dir: impl AsRef<Path>) -> Result<(TfidfVectorizer, KMeansModel)> {
    let model_dir = model_dir.as_ref();
    let vectorizer_path = model_dir.join(VECTORIZER_ARTIFACT);
    let model_path = model_dir.join(CLUSTER_MODEL_ARTIFACT);

    let vectorizer = TfidfVectorizer::from_artifact(read_json_file(&vectorizer_path)?)
        .with_context(|| format!("validating {}", vectorizer_path.display()))?;
    let model = KMeansModel::from_artifact(read_json_file(&model_path)?)
        .with_context(|| format!("validating {}", model_path.display()))?;

    anyhow::ensure!(
        vectorizer.dim() == model.dim(),
        "vectorizer dimension {} does not match cluster model dimension {}",
        vectorizer.dim(),
        model.dim()
    );
    if model.n_clusters() != CLUSTER_LABELS.len() {
        warn!(
            n_clusters = model.n_clusters(),
            labels = CLUSTER_LABELS.len(),
            "cluster count differs from label table; unmatched ids resolve to {FALLBACK_LABEL:?}"
        );
    }
    info!(
        model_dir = %model_dir.display(),
        features = vectorizer.dim(),
        n_clusters = model.n_clusters(),
        "loaded model artifacts"
    );
    Ok((vectorizer, model))
}

/// Normalize, vectorize, predict, then resolve the label.
#[derive(Clone)]
pub struct ClusterClassifier {
    vectorizer: Arc<dyn Vectorizer>,
    model: Arc<dyn ClusterModel>,
}

impl ClusterClassifier {
    pub fn new(vectorizer: Arc<dyn Vectorizer>, model: Arc<dyn ClusterModel>) -> Self {
        Self { vectorizer, model }
    }

    pub fn from_model_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let (vectorizer, model) = load_model_artifacts(model_dir)?;
        Ok(Self::new(Arc::new(vectorizer), Arc::new(model)))
    }

    pub fn classify(&self, text: Option<&str>) -> Result<Classification, ClassifyError> {
        let normalized = normalize_text(text);
        let features = self.vectorizer.transform(&normalized)?;
        let cluster_id = self.model.predict(&features)?;
        Ok(Classification {
            cluster_id,
            label: cluster_label(cluster_id).to_string(),
        })
    }
}
