use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use capsule_core::error::{CapsuleError, Result};

use crate::pointer::encode_pointer;

/// Characters of `text` used as a summary when a record has none.
const SUMMARY_CHARS: usize = 400;

/// A citable evidence passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRecord {
    pub pointer: String,
    pub collection: String,
    pub doc_id: String,
    pub fragment: String,
    pub hash: String,
    pub title: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub anchors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl EvidenceRecord {
    /// Build a record from a loosely shaped index entry.
    ///
    /// `id` (or `docId`) and `hash` are required; the pointer is derived
    /// when the entry does not carry one.
    pub fn normalise(entry: &serde_json::Value, default_collection: &str) -> Result<Self> {
        let str_field = |key: &str| {
            entry
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let doc_id = str_field("id")
            .or_else(|| str_field("docId"))
            .ok_or_else(|| CapsuleError::Storage("evidence record missing id".into()))?;
        let hash = str_field("hash").ok_or_else(|| {
            CapsuleError::Storage(format!("evidence record {} missing hash", doc_id))
        })?;
        let collection = str_field("collection").unwrap_or_else(|| default_collection.to_string());
        let fragment = str_field("fragment").unwrap_or_else(|| "p0".to_string());
        let pointer = str_field("pointer")
            .unwrap_or_else(|| encode_pointer(&collection, &doc_id, &fragment, &hash));
        let text = str_field("text");
        let summary = str_field("summary").unwrap_or_else(|| {
            text.as_deref()
                .map(|t| t.chars().take(SUMMARY_CHARS).collect::<String>().trim().to_string())
                .unwrap_or_default()
        });
        let anchors = entry
            .get("anchors")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            pointer,
            title: str_field("title").unwrap_or_else(|| doc_id.clone()),
            collection,
            doc_id,
            fragment,
            hash,
            summary,
            text,
            anchors,
            source_url: str_field("sourceUrl"),
            updated_at: str_field("updatedAt"),
        })
    }

    /// Pointer-only card as returned to graph steps.
    pub fn to_card(&self, confidence: f64) -> serde_json::Value {
        serde_json::json!({
            "id": self.pointer,
            "title": self.title,
            "summary": self.summary,
            "anchors": self.anchors,
            "freshness": self.updated_at.clone().unwrap_or_default(),
            "confidence": confidence,
            "sourceUrl": self.source_url,
        })
    }

    fn matches(&self, needle: &str) -> bool {
        self.title.to_lowercase().contains(needle)
            || self.summary.to_lowercase().contains(needle)
            || self
                .text
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains(needle))
    }
}

/// In-memory evidence index with pointer lookup.
#[derive(Debug, Clone, Default)]
pub struct EvidenceIndex {
    records: Vec<EvidenceRecord>,
    by_pointer: HashMap<String, usize>,
}

impl EvidenceIndex {
    pub fn new(records: Vec<EvidenceRecord>) -> Self {
        let by_pointer = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.pointer.clone(), i))
            .collect();
        Self {
            records,
            by_pointer,
        }
    }

    /// Parse a JSON array of index entries.
    pub fn from_json(raw: &str, default_collection: &str) -> Result<Self> {
        let entries: Vec<serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| CapsuleError::Storage(format!("failed to parse evidence index: {}", e)))?;
        let records = entries
            .iter()
            .map(|e| EvidenceRecord::normalise(e, default_collection))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(records))
    }

    pub async fn load(path: &Path, default_collection: &str) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CapsuleError::Storage(format!("evidence index {}: {}", path.display(), e))
        })?;
        let index = Self::from_json(&raw, default_collection)?;
        info!(path = %path.display(), records = index.len(), "Evidence index loaded");
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, pointer: &str) -> Option<&EvidenceRecord> {
        self.by_pointer.get(pointer).map(|&i| &self.records[i])
    }

    /// Case-insensitive substring search over title, summary and text.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<&EvidenceRecord> {
        let needle = query.to_lowercase();
        let hits: Vec<&EvidenceRecord> = self
            .records
            .iter()
            .filter(|r| r.matches(&needle))
            .take(top_k)
            .collect();
        debug!(query, hits = hits.len(), "Evidence search");
        hits
    }
}
