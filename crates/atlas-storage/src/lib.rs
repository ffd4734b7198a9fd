//! Durable per-model record storage + HTTP fetch utilities for Model Atlas.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use atlas_core::ModelRecord;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "atlas-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("writing {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("decoding record {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encoding record for {name}: {source}")]
    Encode {
        name: String,
        source: serde_json::Error,
    },
}

/// One JSON document per model under `root`, named from the slugified
/// identifier. Writes go through a temp file and an atomic rename, so a
/// crashed run leaves either the old record or the new one, never a torn
/// one.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    root: PathBuf,
}

impl CatalogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replaces path-unsafe characters in a model identifier (namespaced
    /// names carry a `/`).
    pub fn slug(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::slug(name)))
    }

    pub async fn load(&self, name: &str) -> Result<Option<ModelRecord>, StoreError> {
        let path = self.record_path(name);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        let record =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode { path, source })?;
        Ok(Some(record))
    }

    pub async fn save(&self, record: &ModelRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.name);
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Encode {
            name: record.name.clone(),
            source,
        })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Write {
                path: self.root.clone(),
                source,
            })?;

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| StoreError::Write {
                path: temp_path.clone(),
                source,
            })?;
        if let Err(source) = file.write_all(&bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write {
                path: temp_path,
                source,
            });
        }
        if let Err(source) = file.flush().await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write {
                path: temp_path,
                source,
            });
        }
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write { path, source });
        }
        debug!(model = %record.name, path = %path.display(), "record persisted");
        Ok(())
    }

    /// Reads the whole catalog, sorted by model name. Undecodable files are
    /// logged and skipped; downstream consumers treat the schema as sparse.
    pub async fn load_all(&self) -> Result<Vec<ModelRecord>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::Read {
                path: self.root.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await.map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            match serde_json::from_slice::<ModelRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping undecodable record");
                }
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin retrying wrapper around one reqwest client. Transient statuses and
/// connect/timeout errors are retried with capped exponential backoff; the
/// concurrency gate lives with the caller, not here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        label: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            debug!(label, url, attempt, "http fetch");

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::{fingerprint, ModelRecord, TagEntry};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn sample_record(name: &str) -> ModelRecord {
        let scraped_at = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("timestamp");
        let mut record = ModelRecord::new(name, fingerprint(name), scraped_at);
        record.description = Some(format!("{name} description"));
        record.tags.push(TagEntry {
            name: "latest".to_string(),
            size: Some("4.7GB".to_string()),
            ..Default::default()
        });
        record
    }

    #[test]
    fn slug_replaces_path_unsafe_characters() {
        assert_eq!(CatalogStore::slug("llama3"), "llama3");
        assert_eq!(CatalogStore::slug("user/custom"), "user_custom");
        assert_eq!(CatalogStore::slug("a:b c"), "a_b_c");
    }

    #[tokio::test]
    async fn load_returns_absent_for_missing_record() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path());
        assert!(store.load("nope").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path());
        let record = sample_record("llama3");

        store.save(&record).await.expect("save");
        let loaded = store.load("llama3").await.expect("load").expect("present");
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn save_replaces_an_existing_record_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path());

        store.save(&sample_record("llama3")).await.expect("first");
        let mut updated = sample_record("llama3");
        updated.description = Some("rewritten".to_string());
        store.save(&updated).await.expect("second");

        let loaded = store.load("llama3").await.expect("load").expect("present");
        assert_eq!(loaded.description.as_deref(), Some("rewritten"));

        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn load_all_is_sorted_and_skips_undecodable_files() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path());

        store.save(&sample_record("zephyr")).await.expect("save");
        store.save(&sample_record("alpha")).await.expect("save");
        std::fs::write(dir.path().join("broken.json"), b"{ not json").expect("write");

        let records = store.load_all().await.expect("load_all");
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zephyr"]);
    }

    #[tokio::test]
    async fn load_all_of_missing_root_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("absent"));
        assert!(store.load_all().await.expect("load_all").is_empty());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
