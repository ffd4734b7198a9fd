//! Catalog page contracts for Model Atlas: the page-fetcher seam, the
//! best-effort field extractor, the index lister, and registry URL/wire
//! helpers.
//!
//! Extraction is deliberately forgiving. A page that is missing a field
//! yields `None` for that field, never an error, so the sync pipeline fails
//! open toward a refresh instead of silently skipping a model.

use async_trait::async_trait;
use atlas_core::TagEntry;
use atlas_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "atlas-adapters";

/// Accept header for distribution-style v2 manifest requests.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding json from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

/// The seam between the sync pipeline and real HTTP. Implemented for
/// [`HttpFetcher`] and by in-memory fakes in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_text(&self, entity: &str, url: &str) -> Result<String, PageError>;

    async fn fetch_json(
        &self,
        entity: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<JsonValue, PageError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, entity: &str, url: &str) -> Result<String, PageError> {
        let resp = self.fetch_bytes(entity, url, None).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }

    async fn fetch_json(
        &self,
        entity: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<JsonValue, PageError> {
        let resp = self.fetch_bytes(entity, url, accept).await?;
        serde_json::from_slice(&resp.body).map_err(|source| PageError::Decode {
            url: resp.final_url,
            source,
        })
    }
}

/// Registry repository path for a model identifier; un-namespaced names
/// live under `library/`.
pub fn registry_repo(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{name}")
    }
}

pub fn detail_url(base_url: &str, name: &str) -> String {
    if name.contains('/') {
        format!("{base_url}/{name}")
    } else {
        format!("{base_url}/library/{name}")
    }
}

pub fn tags_url(base_url: &str, name: &str) -> String {
    format!("{}/tags", detail_url(base_url, name))
}

pub fn manifest_url(registry_url: &str, name: &str, tag: &str) -> String {
    format!("{registry_url}/v2/{}/manifests/{tag}", registry_repo(name))
}

pub fn blob_url(registry_url: &str, name: &str, digest: &str) -> String {
    format!("{registry_url}/v2/{}/blobs/{digest}", registry_repo(name))
}

/// Best-effort scalar fields scraped from one detail page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub description: Option<String>,
    pub license: Option<String>,
    pub pull_count: Option<u64>,
    pub last_updated: Option<String>,
    pub architecture: Option<String>,
    pub family: Option<String>,
}

/// Stable serialization of the extracted fields, hashed for change
/// detection. Field order is fixed; absent fields serialize as empty.
pub fn canonical_text(name: &str, fields: &DetailFields) -> String {
    let pairs = [
        ("name", Some(name.to_string())),
        ("description", fields.description.clone()),
        ("license", fields.license.clone()),
        ("pull_count", fields.pull_count.map(|v| v.to_string())),
        ("last_updated", fields.last_updated.clone()),
        ("architecture", fields.architecture.clone()),
        ("family", fields.family.clone()),
    ];
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={}", value.as_deref().unwrap_or("")))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn extract_detail_fields(html: &str) -> DetailFields {
    let doc = Html::parse_document(html);
    let page_text = doc.root_element().text().collect::<Vec<_>>().join(" ");
    let stats = select_first_text(&doc, r#"div[class*="text-sm"]"#);
    let prose = select_first_text(&doc, "div.prose").unwrap_or_default();

    DetailFields {
        description: select_first_attr(&doc, r#"meta[name="description"]"#, "content"),
        license: scan_after_phrase(&page_text, "licensed under the "),
        pull_count: stats.as_deref().and_then(scan_pull_count),
        last_updated: stats.as_deref().and_then(scan_relative_age),
        architecture: scan_after_phrase(&prose, "architecture:"),
        family: scan_after_phrase(&prose, "family:"),
    }
}

/// Model names from the library index, in page order, first occurrence
/// wins. Stable for a given index snapshot.
pub fn parse_library_index(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Ok(anchor_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for anchor in doc.select(&anchor_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !href.contains("/library/") {
            continue;
        }
        let tail = href.split('?').next().unwrap_or(href);
        let Some(name) = tail.rsplit('/').next().map(str::trim) else {
            continue;
        };
        if name.is_empty() || name == "library" {
            continue;
        }
        if seen.insert(name.to_string()) {
            names.push(name.to_string());
        }
    }
    names
}

/// Fetches the index page and returns the candidate model set. An
/// unreachable index surfaces as an error, never as an empty success.
pub async fn list_models(
    fetcher: &dyn PageFetcher,
    base_url: &str,
) -> Result<Vec<String>, PageError> {
    let url = format!("{base_url}/library");
    let html = fetcher.fetch_text("library-index", &url).await?;
    Ok(parse_library_index(&html))
}

/// Tag variants from the `/tags` sub-page. Manifest and config stay unset
/// here; the resolver fills them in for changed models.
pub fn parse_tags_page(html: &str) -> Vec<TagEntry> {
    let doc = Html::parse_document(html);
    let Ok(item_sel) = Selector::parse("ul.divide-y > li") else {
        return Vec::new();
    };

    let mut tags = Vec::new();
    for item in doc.select(&item_sel) {
        let Some(name) = tag_name(&item) else {
            continue;
        };
        let text = item.text().collect::<Vec<_>>().join(" ");
        tags.push(TagEntry {
            name,
            size: scan_size(&text),
            digest: scan_hex_digest(&text),
            last_updated: scan_relative_age(&text),
            context_window: scan_context_window(&text),
            input_type: scan_input_type(&text),
            manifest: None,
            config: None,
        });
    }
    tags
}

fn tag_name(item: &ElementRef<'_>) -> Option<String> {
    for selector in ["a span", "a"] {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        if let Some(text) = item
            .select(&sel)
            .next()
            .and_then(|n| text_or_none(n.text().collect::<String>()))
        {
            return text.split_whitespace().next().map(str::to_string);
        }
    }
    None
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

fn select_first_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Token after an ASCII phrase, case-insensitive; stops at the first
/// character outside `[A-Za-z0-9._+-]`.
fn scan_after_phrase(text: &str, phrase: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find(&phrase.to_ascii_lowercase())? + phrase.len();
    let rest = text.get(start..)?;
    let token: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '+' | '_'))
        .collect();
    text_or_none(token)
}

/// Normalizes count strings like `1.2M`, `650K` or `7,234` into integers.
pub fn parse_pull_count(raw: &str) -> Option<u64> {
    let s = raw.trim().replace(',', "");
    if s.is_empty() {
        return None;
    }
    let (number, multiplier) = if let Some(prefix) = s.strip_suffix('M') {
        (prefix.to_string(), 1_000_000f64)
    } else if let Some(prefix) = s.strip_suffix('K') {
        (prefix.to_string(), 1_000f64)
    } else {
        (s, 1f64)
    };
    let value: f64 = number.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

fn scan_pull_count(text: &str) -> Option<u64> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        let Some(next) = tokens.get(i + 1) else {
            continue;
        };
        if !next.eq_ignore_ascii_case("pulls") && !next.eq_ignore_ascii_case("downloads") {
            continue;
        }
        if let Some(count) = parse_pull_count(token) {
            return Some(count);
        }
    }
    None
}

/// Relative age phrases like `3 weeks ago`.
fn scan_relative_age(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for window in tokens.windows(3) {
        let count_ok = !window[0].is_empty() && window[0].chars().all(|c| c.is_ascii_digit());
        let unit_ok = matches!(
            window[1],
            "day" | "days" | "week" | "weeks" | "month" | "months" | "year" | "years"
        );
        if count_ok && unit_ok && window[2] == "ago" {
            return Some(format!("{} {} {}", window[0], window[1], window[2]));
        }
    }
    None
}

fn scan_size(text: &str) -> Option<String> {
    for token in text.split_whitespace() {
        for unit in ["GB", "MB"] {
            let Some(number) = token.strip_suffix(unit) else {
                continue;
            };
            if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit() || c == '.') {
                return Some(token.to_string());
            }
        }
    }
    None
}

fn scan_context_window(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for window in tokens.windows(3) {
        if window[1] != "context" || window[2] != "window" {
            continue;
        }
        let Some(number) = window[0].strip_suffix('K') else {
            continue;
        };
        if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
            return Some(format!("{} context window", window[0]));
        }
    }
    None
}

fn scan_input_type(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for window in tokens.windows(2) {
        if window[1] == "input" && matches!(window[0], "Text" | "Multimodal") {
            return Some(window[0].to_string());
        }
    }
    None
}

/// First run of 12+ lowercase hex characters containing at least one
/// letter (a pure digit run is a count, not a digest).
fn scan_hex_digest(text: &str) -> Option<String> {
    let mut current = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() || ('a'..='f').contains(&ch) {
            current.push(ch);
            continue;
        }
        if current.len() >= 12 && current.chars().any(|c| c.is_ascii_alphabetic()) {
            return Some(current);
        }
        current.clear();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL_PAGE: &str = r#"<html>
<head><meta name="description" content="Meta Llama 3: The most capable openly available LLM to date"></head>
<body>
<h1>llama3</h1>
<div class="flex text-sm text-neutral-500">6.6M Pulls  Updated 3 weeks ago</div>
<div class="prose">
<p>Llama 3 is licensed under the Llama-3 community license.</p>
<p>architecture: llama</p>
<p>family: llama</p>
</div>
</body></html>"#;

    const TAGS_PAGE: &str = r#"<html><body>
<ul class="divide-y" role="list">
<li><a class="group" href="/library/llama3:latest"><span>latest</span></a>
<p class="text-neutral-500">a6990ed6be41 &middot; 4.7GB &middot; 8K context window &middot; Text input &middot; 3 weeks ago</p></li>
<li><a class="group" href="/library/llama3:70b"><span>70b</span></a>
<p class="text-neutral-500">be39eb53a197 &middot; 39GB &middot; 8K context window &middot; Text input &middot; 3 weeks ago</p></li>
</ul>
</body></html>"#;

    const INDEX_PAGE: &str = r#"<html><body>
<ul role="list">
<li><a href="/library/llama3">llama3</a></li>
<li><a href="/library/mistral">mistral</a></li>
<li><a href="/library/llama3">llama3 again</a></li>
<li><a href="/blog/announcement">blog</a></li>
<li><a href="/library/gemma?sort=new">gemma</a></li>
</ul>
</body></html>"#;

    #[test]
    fn detail_extraction_captures_the_scalar_fields() {
        let fields = extract_detail_fields(DETAIL_PAGE);
        assert_eq!(
            fields.description.as_deref(),
            Some("Meta Llama 3: The most capable openly available LLM to date")
        );
        assert_eq!(fields.license.as_deref(), Some("Llama-3"));
        assert_eq!(fields.pull_count, Some(6_600_000));
        assert_eq!(fields.last_updated.as_deref(), Some("3 weeks ago"));
        assert_eq!(fields.architecture.as_deref(), Some("llama"));
        assert_eq!(fields.family.as_deref(), Some("llama"));
    }

    #[test]
    fn detail_extraction_is_best_effort_on_sparse_pages() {
        let fields = extract_detail_fields("<html><body><h1>bare</h1></body></html>");
        assert_eq!(fields, DetailFields::default());
    }

    #[test]
    fn canonical_text_is_stable_and_sensitive_to_field_changes() {
        let fields = extract_detail_fields(DETAIL_PAGE);
        let a = canonical_text("llama3", &fields);
        let b = canonical_text("llama3", &fields);
        assert_eq!(a, b);

        let mut changed = fields.clone();
        changed.pull_count = Some(6_700_000);
        assert_ne!(a, canonical_text("llama3", &changed));
    }

    #[test]
    fn index_parse_deduplicates_and_preserves_order() {
        let names = parse_library_index(INDEX_PAGE);
        assert_eq!(names, vec!["llama3", "mistral", "gemma"]);
    }

    #[test]
    fn tags_parse_captures_variant_fields() {
        let tags = parse_tags_page(TAGS_PAGE);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "latest");
        assert_eq!(tags[0].digest.as_deref(), Some("a6990ed6be41"));
        assert_eq!(tags[0].size.as_deref(), Some("4.7GB"));
        assert_eq!(tags[0].context_window.as_deref(), Some("8K context window"));
        assert_eq!(tags[0].input_type.as_deref(), Some("Text"));
        assert_eq!(tags[0].last_updated.as_deref(), Some("3 weeks ago"));
        assert_eq!(tags[1].name, "70b");
        assert_eq!(tags[1].size.as_deref(), Some("39GB"));
        assert!(tags.iter().all(|t| t.manifest.is_none() && t.config.is_none()));
    }

    #[test]
    fn pull_count_parsing_handles_suffixes() {
        assert_eq!(parse_pull_count("1.2M"), Some(1_200_000));
        assert_eq!(parse_pull_count("650K"), Some(650_000));
        assert_eq!(parse_pull_count("7,234"), Some(7_234));
        assert_eq!(parse_pull_count("42"), Some(42));
        assert_eq!(parse_pull_count(""), None);
        assert_eq!(parse_pull_count("lots"), None);
    }

    #[test]
    fn registry_paths_namespace_bare_names_under_library() {
        assert_eq!(registry_repo("llama3"), "library/llama3");
        assert_eq!(registry_repo("user/custom"), "user/custom");
        assert_eq!(
            manifest_url("https://registry.test", "llama3", "latest"),
            "https://registry.test/v2/library/llama3/manifests/latest"
        );
        assert_eq!(
            blob_url("https://registry.test", "user/custom", "sha256:abc"),
            "https://registry.test/v2/user/custom/blobs/sha256:abc"
        );
    }

    #[test]
    fn detail_urls_handle_namespaced_models() {
        assert_eq!(
            detail_url("https://example.test", "llama3"),
            "https://example.test/library/llama3"
        );
        assert_eq!(
            tags_url("https://example.test", "user/custom"),
            "https://example.test/user/custom/tags"
        );
    }

    #[test]
    fn digest_scan_requires_a_hex_letter() {
        assert_eq!(
            scan_hex_digest("blob a6990ed6be41 rest"),
            Some("a6990ed6be41".to_string())
        );
        // a long pure-digit run is a count, not a digest
        assert_eq!(scan_hex_digest("123456789012345"), None);
        assert_eq!(scan_hex_digest("short ab12"), None);
    }
}
