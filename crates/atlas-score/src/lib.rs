//! Post-merge score computers: a license/popularity trust heuristic and a
//! name/architecture similarity measure over the persisted catalog. Pure
//! functions; the sync core never calls them.

use std::cmp::Ordering;

use atlas_core::{ModelRecord, SimilarModel};
use strsim::jaro_winkler;

pub const CRATE_NAME: &str = "atlas-score";

pub const TRUST_SCORE_KEY: &str = "trust";

const LICENSE_SCORES: &[(&str, f64)] = &[
    ("apache-2.0", 0.9),
    ("mit", 0.9),
    ("gpl-3.0", 0.6),
    ("cc-by-nc", 0.4),
];
const DEFAULT_LICENSE_SCORE: f64 = 0.5;
const MAX_PULLS: f64 = 10_000_000.0;
const DEFAULT_RISK: f64 = 0.5;

/// Architecture names folded into their base family. Specific derivatives
/// come before their generic substring.
const ARCHITECTURE_FAMILIES: &[(&str, &str)] = &[
    ("codellama", "llama"),
    ("vicuna", "llama"),
    ("wizardlm", "llama"),
    ("orca", "llama"),
    ("llama", "llama"),
    ("mistral", "mistral"),
    ("phi", "phi"),
    ("gemma", "gemma"),
    ("qwen", "qwen"),
];

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn annotation_risk(record: &ModelRecord, key: &str) -> f64 {
    record
        .annotations
        .get(key)
        .and_then(|v| v.as_f64())
        .unwrap_or(DEFAULT_RISK)
}

/// Weighted trust heuristic over license, popularity, and the jailbreak /
/// privacy risk annotations (1.0 = low risk). Clamped to 1.0, rounded to
/// three decimals.
pub fn trust_score(record: &ModelRecord) -> f64 {
    let license_key = record
        .license
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    let license_score = LICENSE_SCORES
        .iter()
        .find(|(key, _)| *key == license_key)
        .map(|(_, score)| *score)
        .unwrap_or(DEFAULT_LICENSE_SCORE);

    let pulls = record.pull_count.unwrap_or(0) as f64;
    let pulls_score = (pulls / MAX_PULLS).min(1.0);

    let jailbreak = annotation_risk(record, "jailbreak_risk");
    let privacy = annotation_risk(record, "privacy_risk");

    let score = 0.5 * license_score + 0.2 * pulls_score + 0.15 * jailbreak + 0.15 * privacy;
    round3(score.min(1.0))
}

pub fn normalize_architecture(arch: &str) -> String {
    let lower = arch.to_ascii_lowercase();
    for (key, family) in ARCHITECTURE_FAMILIES {
        if lower.contains(key) {
            return (*family).to_string();
        }
    }
    lower
}

/// Parameter count in billions scanned from a model name (`7b`, `1.5b`).
pub fn parameter_count(name: &str) -> Option<f64> {
    let lower = name.to_ascii_lowercase();
    let chars: Vec<char> = lower.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c != 'b' {
            continue;
        }
        let followed_ok = chars
            .get(i + 1)
            .map_or(true, |next| !next.is_ascii_alphanumeric());
        if !followed_ok {
            continue;
        }
        let mut start = i;
        while start > 0 && (chars[start - 1].is_ascii_digit() || chars[start - 1] == '.') {
            start -= 1;
        }
        if start == i {
            continue;
        }
        let token: String = chars[start..i].iter().collect();
        if let Ok(value) = token.parse::<f64>() {
            return Some(value);
        }
    }
    None
}

fn base_name(name: &str) -> &str {
    name.split(':').next().unwrap_or(name)
}

/// Pairwise similarity: fuzzy base-name score plus bonuses for a shared
/// architecture family and comparable parameter counts. Capped at 1.0.
pub fn similarity(a: &ModelRecord, b: &ModelRecord) -> f64 {
    let name_score = jaro_winkler(base_name(&a.name), base_name(&b.name));

    let arch_bonus = match (a.architecture.as_deref(), b.architecture.as_deref()) {
        (Some(x), Some(y)) if normalize_architecture(x) == normalize_architecture(y) => 0.2,
        _ => 0.0,
    };

    let param_bonus = match (parameter_count(&a.name), parameter_count(&b.name)) {
        (Some(x), Some(y)) if x > 0.0 && y > 0.0 => {
            let ratio = if x > y { y / x } else { x / y };
            0.1 * ratio
        }
        _ => 0.0,
    };

    (0.7 * name_score + arch_bonus + param_bonus).min(1.0)
}

/// Attaches the top-k most similar peers to every record. Ordering is
/// deterministic: score descending, then name ascending on ties.
pub fn attach_similar(records: &mut [ModelRecord], top_k: usize) {
    let count = records.len();
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let mut row: Vec<SimilarModel> = (0..count)
            .filter(|&j| j != i)
            .map(|j| SimilarModel {
                name: records[j].name.clone(),
                score: round3(similarity(&records[i], &records[j])),
            })
            .collect();
        row.sort_by(|x, y| {
            y.score
                .partial_cmp(&x.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| x.name.cmp(&y.name))
        });
        row.truncate(top_k);
        rows.push(row);
    }
    for (record, row) in records.iter_mut().zip(rows) {
        record.similar_models = row;
    }
}

/// Full scoring pass over a loaded catalog: trust score per record plus
/// top-k similarity edges.
pub fn score_catalog(records: &mut [ModelRecord], top_k: usize) {
    for record in records.iter_mut() {
        let trust = trust_score(record);
        record.scores.insert(TRUST_SCORE_KEY.to_string(), trust);
    }
    attach_similar(records, top_k);
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::fingerprint;
    use chrono::{TimeZone, Utc};

    fn record(name: &str) -> ModelRecord {
        let scraped_at = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("timestamp");
        ModelRecord::new(name, fingerprint(name), scraped_at)
    }

    #[test]
    fn trust_score_uses_the_license_table() {
        let mut mit = record("a");
        mit.license = Some("MIT".to_string());
        let mut nc = record("b");
        nc.license = Some("cc-by-nc".to_string());
        let unknown = record("c");

        // pulls absent, risks default: 0.5 * license + 0.15 + 0.15
        assert_eq!(trust_score(&mit), 0.6);
        assert_eq!(trust_score(&nc), 0.35);
        assert_eq!(trust_score(&unknown), 0.4);
    }

    #[test]
    fn trust_score_caps_pull_popularity() {
        let mut popular = record("a");
        popular.license = Some("apache-2.0".to_string());
        popular.pull_count = Some(50_000_000);

        // pulls term saturates at 0.2
        assert_eq!(trust_score(&popular), 0.8);
    }

    #[test]
    fn trust_score_reads_risk_annotations() {
        let mut risky = record("a");
        risky.license = Some("mit".to_string());
        risky
            .annotations
            .insert("jailbreak_risk".to_string(), serde_json::json!(0.0));
        risky
            .annotations
            .insert("privacy_risk".to_string(), serde_json::json!(0.0));

        assert_eq!(trust_score(&risky), 0.45);
    }

    #[test]
    fn architecture_normalization_folds_derivatives() {
        assert_eq!(normalize_architecture("CodeLlama"), "llama");
        assert_eq!(normalize_architecture("vicuna-13b"), "llama");
        assert_eq!(normalize_architecture("Mistral"), "mistral");
        assert_eq!(normalize_architecture("rwkv"), "rwkv");
    }

    #[test]
    fn parameter_counts_come_from_names() {
        assert_eq!(parameter_count("llama3:8b"), Some(8.0));
        assert_eq!(parameter_count("deepseek-r1:1.5b"), Some(1.5));
        assert_eq!(parameter_count("qwen-72B"), Some(72.0));
        assert_eq!(parameter_count("bert-base"), None);
        assert_eq!(parameter_count("mistral"), None);
    }

    #[test]
    fn similarity_rewards_shared_family_and_scale() {
        let mut a = record("llama3:8b");
        a.architecture = Some("llama".to_string());
        let mut b = record("llama3:70b");
        b.architecture = Some("codellama".to_string());
        let c = record("mistral");

        assert!(similarity(&a, &b) > similarity(&a, &c));
        assert!(similarity(&a, &b) <= 1.0);
    }

    #[test]
    fn attach_similar_is_topk_and_deterministic() {
        let mut records = vec![
            record("llama3:8b"),
            record("llama3:70b"),
            record("mistral:7b"),
            record("gemma:2b"),
        ];
        attach_similar(&mut records, 2);

        for rec in &records {
            assert_eq!(rec.similar_models.len(), 2);
        }
        assert_eq!(records[0].similar_models[0].name, "llama3:70b");

        let mut again = vec![
            record("llama3:8b"),
            record("llama3:70b"),
            record("mistral:7b"),
            record("gemma:2b"),
        ];
        attach_similar(&mut again, 2);
        for (x, y) in records.iter().zip(&again) {
            assert_eq!(x.similar_models, y.similar_models);
        }
    }

    #[test]
    fn score_catalog_fills_the_trust_key() {
        let mut records = vec![record("llama3:8b"), record("mistral:7b")];
        score_catalog(&mut records, 3);
        for rec in &records {
            assert!(rec.scores.contains_key(TRUST_SCORE_KEY));
            assert_eq!(rec.similar_models.len(), 1);
        }
    }
}
