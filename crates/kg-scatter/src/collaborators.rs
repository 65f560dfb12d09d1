//! Extract and dedupe are out-of-scope external collaborators - the real
//! production versions are a stateless LLM call and a fingerprint-based
//! resolver respectively. These stand-ins are enough to drive a scatter
//! branch end to end in tests and the CLI demo path.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    pub label: String,
    pub kind: String,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Vec<ExtractedEntity>;
}

/// No-LLM heuristic splitter: one entity per capitalised word run. A stand-in
/// for the real LLM-backed extractor, which is out of scope here.
pub struct HeuristicExtractor;

#[async_trait]
impl Extractor for HeuristicExtractor {
    async fn extract(&self, text: &str) -> Vec<ExtractedEntity> {
        text.split_whitespace()
            .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
            .map(|w| ExtractedEntity {
                label: w.trim_matches(|c: char| !c.is_alphanumeric()).to_string(),
                kind: "entity".to_string(),
            })
            .filter(|e| !e.label.is_empty())
            .collect()
    }
}

#[async_trait]
pub trait Deduper: Send + Sync {
    /// Returns the ids to keep - given already-created candidate entities
    /// keyed by id, drops later duplicates of an earlier fingerprint.
    async fn dedupe(&self, candidates: Vec<(String, ExtractedEntity)>) -> Vec<String>;
}

/// Fingerprints on normalized label + kind; first occurrence wins.
pub struct FingerprintDeduper;

#[async_trait]
impl Deduper for FingerprintDeduper {
    async fn dedupe(&self, candidates: Vec<(String, ExtractedEntity)>) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut kept = Vec::new();
        for (id, entity) in candidates {
            let fingerprint = fingerprint(&entity);
            if seen.insert(fingerprint) {
                kept.push(id);
            }
        }
        kept
    }
}

fn fingerprint(entity: &ExtractedEntity) -> String {
    let normalized = format!("{}:{}", entity.kind.to_lowercase(), entity.label.to_lowercase());
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heuristic_extractor_picks_capitalised_words() {
        let extractor = HeuristicExtractor;
        let out = extractor.extract("Ahab commanded the Pequod.").await;
        let labels: Vec<_> = out.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["Ahab", "Pequod"]);
    }

    #[tokio::test]
    async fn dedupe_keeps_first_occurrence_of_each_fingerprint() {
        let deduper = FingerprintDeduper;
        let candidates = vec![
            (
                "a".to_string(),
                ExtractedEntity { label: "Ahab".to_string(), kind: "person".to_string() },
            ),
            (
                "b".to_string(),
                ExtractedEntity { label: "ahab".to_string(), kind: "PERSON".to_string() },
            ),
            (
                "c".to_string(),
                ExtractedEntity { label: "Pequod".to_string(), kind: "ship".to_string() },
            ),
        ];
        let kept = deduper.dedupe(candidates).await;
        assert_eq!(kept, vec!["a", "c"]);
    }
}
