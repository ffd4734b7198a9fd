//! Core domain model for the Model Atlas catalog: normalized records,
//! tag/manifest types, content fingerprinting, and the enrichment merge.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "atlas-core";

/// Length of the truncated content digest stored on each record.
pub const FINGERPRINT_LEN: usize = 12;

/// Digest of a canonical detail-page serialization, used for change
/// detection. Identical canonical content always yields an identical
/// fingerprint.
pub fn fingerprint(canonical_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

/// Compares a stored record's fingerprint against a freshly computed digest.
pub fn fingerprint_matches(existing: &ModelRecord, new_digest: &str) -> bool {
    existing.fingerprint == new_digest
}

/// One layer or config reference inside a registry manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestLayer {
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// Decoded registry manifest for one tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<ManifestLayer>,
    #[serde(default)]
    pub layers: Vec<ManifestLayer>,
}

/// Decoded configuration blob referenced by a manifest. Field aliases match
/// the registry's wire names; our persisted documents use the local names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_format: Option<String>,
    #[serde(default, alias = "model_family")]
    pub base_model: Option<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default, alias = "file_type")]
    pub quantization: Option<String>,
    #[serde(default, alias = "num_ctx")]
    pub context_length: Option<u64>,
}

/// One tag/variant of a model. Replaced wholesale on every full refresh;
/// there is no incremental tag merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TagEntry {
    pub name: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub context_window: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub manifest: Option<Manifest>,
    #[serde(default)]
    pub config: Option<ModelConfig>,
}

/// Similarity edge attached by the downstream score computers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarModel {
    pub name: String,
    pub score: f64,
}

/// The durable, per-entity catalog representation. The `fingerprint` field
/// always reflects the base scraped content, never the enrichment overlay,
/// so manual edits do not perturb change detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub pull_count: Option<u64>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub fingerprint: String,
    #[serde(default)]
    pub tags: Vec<TagEntry>,
    #[serde(default)]
    pub annotations: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub similar_models: Vec<SimilarModel>,
    pub scraped_at: DateTime<Utc>,
}

impl ModelRecord {
    pub fn new(
        name: impl Into<String>,
        fingerprint: impl Into<String>,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            license: None,
            pull_count: None,
            last_updated: None,
            architecture: None,
            family: None,
            summary: None,
            fingerprint: fingerprint.into(),
            tags: Vec::new(),
            annotations: BTreeMap::new(),
            scores: BTreeMap::new(),
            similar_models: Vec::new(),
            scraped_at,
        }
    }
}

/// Manually or LLM-authored partial record overlaid onto the scraped base.
/// Every field is optional; absent fields leave the scraped value in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EnrichmentOverlay {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, JsonValue>,
}

/// Field-by-field precedence merge: a present overlay field wins, the
/// scraped value is kept otherwise. Overlay annotation keys win over base
/// keys of the same name. The base-scrape fingerprint is never touched.
pub fn merge_overlay(base: ModelRecord, overlay: &EnrichmentOverlay) -> ModelRecord {
    let mut merged = base;
    if let Some(description) = &overlay.description {
        merged.description = Some(description.clone());
    }
    if let Some(license) = &overlay.license {
        merged.license = Some(license.clone());
    }
    if let Some(architecture) = &overlay.architecture {
        merged.architecture = Some(architecture.clone());
    }
    if let Some(family) = &overlay.family {
        merged.family = Some(family.clone());
    }
    if let Some(summary) = &overlay.summary {
        merged.summary = Some(summary.clone());
    }
    for (key, value) in &overlay.annotations {
        merged.annotations.insert(key.clone(), value.clone());
    }
    merged
}
