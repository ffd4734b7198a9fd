//! Incremental catalog synchronization: discovery, fingerprint-gated
//! refresh, bounded-concurrency fan-out, manifest resolution, and merged
//! record persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atlas_adapters::{
    blob_url, canonical_text, detail_url, extract_detail_fields, list_models, manifest_url,
    parse_tags_page, tags_url, PageFetcher, MANIFEST_ACCEPT,
};
use atlas_core::{
    fingerprint, fingerprint_matches, merge_overlay, EnrichmentOverlay, Manifest, ModelConfig,
    ModelRecord, TagEntry,
};
use atlas_storage::{CatalogStore, HttpClientConfig, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "atlas-sync";

/// Run parameters, constructed once per run and passed by reference. No
/// process-wide mutable state.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub registry_url: String,
    pub models_dir: PathBuf,
    pub debug_dir: PathBuf,
    pub enriched_dir: PathBuf,
    pub concurrency: usize,
    pub politeness_delay: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    /// Restricts a run to one entity, for debugging it end-to-end.
    pub only: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("ATLAS_BASE_URL")
                .unwrap_or_else(|_| "https://ollama.com".to_string()),
            registry_url: std::env::var("ATLAS_REGISTRY_URL")
                .unwrap_or_else(|_| "https://registry.ollama.ai".to_string()),
            models_dir: std::env::var("ATLAS_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./models")),
            debug_dir: std::env::var("ATLAS_DEBUG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./debug_dumps")),
            enriched_dir: std::env::var("ATLAS_ENRICHED_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./enriched_outputs")),
            concurrency: std::env::var("ATLAS_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            politeness_delay: Duration::from_millis(
                std::env::var("ATLAS_POLITENESS_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            http_timeout: Duration::from_secs(
                std::env::var("ATLAS_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            user_agent: std::env::var("ATLAS_USER_AGENT")
                .unwrap_or_else(|_| "model-atlas/0.1".to_string()),
            only: None,
        }
    }
}

/// Supplies the optional enrichment overlay for one entity.
pub trait OverlayProvider: Send + Sync {
    fn overlay_for(&self, name: &str) -> Option<EnrichmentOverlay>;
}

#[derive(Default)]
pub struct NoopOverlayProvider;

impl OverlayProvider for NoopOverlayProvider {
    fn overlay_for(&self, _name: &str) -> Option<EnrichmentOverlay> {
        None
    }
}

/// Reads `<dir>/<slug>_enriched.json`. An unreadable overlay leaves the
/// scraped base untouched; the problem is logged, not swallowed.
pub struct DirOverlayProvider {
    dir: PathBuf,
}

impl DirOverlayProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn overlay_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}_enriched.json", CatalogStore::slug(name)))
    }
}

impl OverlayProvider for DirOverlayProvider {
    fn overlay_for(&self, name: &str) -> Option<EnrichmentOverlay> {
        let path = self.overlay_path(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable enrichment overlay");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(overlay) => Some(overlay),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "undecodable enrichment overlay");
                None
            }
        }
    }
}

/// Resolves one (entity, tag) pair into a manifest + decoded config blob.
/// Config blobs are keyed by digest for the lifetime of one run; the
/// per-digest cell guarantees a shared digest is fetched exactly once even
/// under concurrent resolution.
pub struct ManifestResolver {
    fetcher: Arc<dyn PageFetcher>,
    registry_url: String,
    politeness_delay: Duration,
    blob_cache: Mutex<HashMap<String, Arc<OnceCell<Option<ModelConfig>>>>>,
}

impl ManifestResolver {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        registry_url: impl Into<String>,
        politeness_delay: Duration,
    ) -> Self {
        Self {
            fetcher,
            registry_url: registry_url.into(),
            politeness_delay,
            blob_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn blob_cell(&self, digest: &str) -> Arc<OnceCell<Option<ModelConfig>>> {
        let mut cache = self.blob_cache.lock().await;
        cache
            .entry(digest.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Fills in `tag.manifest` and `tag.config` when resolvable. A missing
    /// or undecodable manifest/blob leaves the page-scraped fields in place
    /// and never fails the parent entity.
    pub async fn resolve(&self, name: &str, tag: &mut TagEntry) {
        sleep(self.politeness_delay).await;
        let url = manifest_url(&self.registry_url, name, &tag.name);
        let value = match self.fetcher.fetch_json(name, &url, Some(MANIFEST_ACCEPT)).await {
            Ok(value) => value,
            Err(err) => {
                warn!(model = name, tag = %tag.name, error = %err, "manifest unavailable");
                return;
            }
        };
        let manifest: Manifest = match serde_json::from_value(value) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(model = name, tag = %tag.name, error = %err, "undecodable manifest");
                return;
            }
        };

        let config_digest = manifest.config.as_ref().map(|c| c.digest.clone());
        tag.manifest = Some(manifest);

        let Some(digest) = config_digest else {
            return;
        };
        let cell = self.blob_cell(&digest).await;
        let config = cell
            .get_or_init(|| async {
                sleep(self.politeness_delay).await;
                let url = blob_url(&self.registry_url, name, &digest);
                match self.fetcher.fetch_json(name, &url, None).await {
                    Ok(value) => match serde_json::from_value::<ModelConfig>(value) {
                        Ok(config) => Some(config),
                        Err(err) => {
                            warn!(model = name, %digest, error = %err, "undecodable config blob");
                            None
                        }
                    },
                    Err(err) => {
                        warn!(model = name, %digest, error = %err, "config blob unavailable");
                        None
                    }
                }
            })
            .await;
        tag.config = config.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    /// Fingerprint matched; the stored record was reused unchanged.
    Skipped,
    /// Full refresh: tags and manifests re-fetched, record replaced.
    Refreshed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntityFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub skipped: usize,
    pub refreshed: usize,
    pub failed: Vec<EntityFailure>,
}

struct RunContext {
    base_url: String,
    politeness_delay: Duration,
    debug_dir: PathBuf,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: Arc<dyn PageFetcher>,
    store: CatalogStore,
    overlays: Arc<dyn OverlayProvider>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    /// Injection point for tests and alternative transports.
    pub fn with_fetcher(config: SyncConfig, fetcher: Arc<dyn PageFetcher>) -> Self {
        let store = CatalogStore::new(&config.models_dir);
        let overlays = Arc::new(DirOverlayProvider::new(&config.enriched_dir));
        Self {
            config,
            fetcher,
            store,
            overlays,
        }
    }

    pub fn with_overlays(mut self, overlays: Arc<dyn OverlayProvider>) -> Self {
        self.overlays = overlays;
        self
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// One full synchronization pass. Safe to re-run: unchanged entities are
    /// skipped via fingerprint match and their records are left untouched.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let names = list_models(self.fetcher.as_ref(), &self.config.base_url)
            .await
            .context("listing catalog index")?;
        let names: Vec<String> = match &self.config.only {
            Some(only) => names.into_iter().filter(|n| n == only).collect(),
            None => names,
        };
        let discovered = names.len();
        info!(%run_id, discovered, "starting sync run");

        let ctx = Arc::new(RunContext {
            base_url: self.config.base_url.clone(),
            politeness_delay: self.config.politeness_delay,
            debug_dir: self.config.debug_dir.clone(),
        });
        let resolver = Arc::new(ManifestResolver::new(
            self.fetcher.clone(),
            self.config.registry_url.clone(),
            self.config.politeness_delay,
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        let mut join = JoinSet::new();
        for name in names {
            let ctx = ctx.clone();
            let fetcher = self.fetcher.clone();
            let store = self.store.clone();
            let overlays = self.overlays.clone();
            let resolver = resolver.clone();
            let semaphore = semaphore.clone();
            join.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                let outcome = process_entity(
                    &ctx,
                    fetcher.as_ref(),
                    &store,
                    overlays.as_ref(),
                    &resolver,
                    &name,
                )
                .await;
                (name, outcome)
            });
        }

        let mut skipped = 0usize;
        let mut refreshed = 0usize;
        let mut failed = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((_, Ok(EntityOutcome::Skipped))) => skipped += 1,
                Ok((_, Ok(EntityOutcome::Refreshed))) => refreshed += 1,
                Ok((name, Err(err))) => {
                    warn!(model = %name, error = %format!("{err:#}"), "entity failed");
                    failed.push(EntityFailure {
                        name,
                        reason: format!("{err:#}"),
                    });
                }
                Err(join_err) => {
                    failed.push(EntityFailure {
                        name: "<pipeline task>".to_string(),
                        reason: join_err.to_string(),
                    });
                }
            }
        }
        failed.sort_by(|a, b| a.name.cmp(&b.name));

        let finished_at = Utc::now();
        info!(%run_id, skipped, refreshed, failed = failed.len(), "sync run finished");
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            discovered,
            skipped,
            refreshed,
            failed,
        })
    }
}

/// One entity's sequential pipeline: detail fetch, fingerprint gate, tags,
/// manifests, merge, persist.
async fn process_entity(
    ctx: &RunContext,
    fetcher: &dyn PageFetcher,
    store: &CatalogStore,
    overlays: &dyn OverlayProvider,
    resolver: &ManifestResolver,
    name: &str,
) -> Result<EntityOutcome> {
    debug!(model = name, "processing catalog model");

    let detail_url = detail_url(&ctx.base_url, name);
    let html = fetcher
        .fetch_text(name, &detail_url)
        .await
        .context("fetching detail page")?;

    let fields = extract_detail_fields(&html);
    let digest = fingerprint(&canonical_text(name, &fields));

    let existing = match store.load(name).await {
        Ok(existing) => existing,
        Err(err) => {
            warn!(model = name, error = %err, "stored record unreadable, forcing refresh");
            None
        }
    };
    if let Some(existing) = &existing {
        if fingerprint_matches(existing, &digest) {
            debug!(model = name, fingerprint = %digest, "unchanged, skipping");
            return Ok(EntityOutcome::Skipped);
        }
    }

    sleep(ctx.politeness_delay).await;
    let tags_url = tags_url(&ctx.base_url, name);
    let tags_html = match fetcher.fetch_text(name, &tags_url).await {
        Ok(tags_html) => tags_html,
        Err(err) => {
            dump_debug_page(&ctx.debug_dir, name, &html).await;
            return Err(err).context("fetching tags page");
        }
    };

    let mut tags = parse_tags_page(&tags_html);
    for tag in &mut tags {
        resolver.resolve(name, tag).await;
    }

    let mut base = ModelRecord::new(name, digest, Utc::now());
    base.description = fields.description;
    base.license = fields.license;
    base.pull_count = fields.pull_count;
    base.last_updated = fields.last_updated;
    base.architecture = fields.architecture;
    base.family = fields.family;
    base.tags = tags;

    let record = match overlays.overlay_for(name) {
        Some(overlay) => merge_overlay(base, &overlay),
        None => base,
    };

    if let Err(err) = store.save(&record).await {
        dump_debug_page(&ctx.debug_dir, name, &html).await;
        return Err(err).context("persisting record");
    }
    Ok(EntityOutcome::Refreshed)
}

/// Best-effort capture of the raw detail page for offline diagnosis.
async fn dump_debug_page(debug_dir: &Path, name: &str, html: &str) {
    if let Err(err) = tokio::fs::create_dir_all(debug_dir).await {
        warn!(dir = %debug_dir.display(), error = %err, "cannot create debug dir");
        return;
    }
    let path = debug_dir.join(format!("{}.html", CatalogStore::slug(name)));
    if let Err(err) = tokio::fs::write(&path, html).await {
        warn!(path = %path.display(), error = %err, "cannot write debug page");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dir_overlay_provider_reads_slugged_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("user_custom_enriched.json"),
            r#"{"license":"MIT","summary":"curated"}"#,
        )
        .expect("write overlay");

        let provider = DirOverlayProvider::new(dir.path());
        let overlay = provider.overlay_for("user/custom").expect("overlay");
        assert_eq!(overlay.license.as_deref(), Some("MIT"));
        assert_eq!(overlay.summary.as_deref(), Some("curated"));
        assert!(provider.overlay_for("absent").is_none());
    }

    #[test]
    fn undecodable_overlay_is_ignored() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("broken_enriched.json"), "{ nope").expect("write");
        let provider = DirOverlayProvider::new(dir.path());
        assert!(provider.overlay_for("broken").is_none());
    }
}
