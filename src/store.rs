//! Persistence of extracted documents.
//!
//! [`SupabaseStore`] writes to a PostgREST table; [`MemoryStore`] keeps
//! records in process and backs the service when Supabase is not configured.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::schema::{NewDocument, StoredDocument};

/// Maximum number of records returned by a history query.
pub const HISTORY_LIMIT: usize = 10;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Persist a document and return its generated id.
    async fn save(&self, doc: NewDocument) -> Result<String>;

    /// Records saved by `caller_id`, newest first, at most `limit`.
    async fn history(&self, caller_id: &str, limit: usize) -> Result<Vec<StoredDocument>>;
}

// ============================================================================
// Supabase
// ============================================================================

/// Supabase (PostgREST) backed store.
#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    api_key: String,
    table: String,
}

impl SupabaseStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.url.clone(),
            api_key: config.api_key.clone(),
            table: config.table.clone(),
        }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }
}

#[derive(Debug, Deserialize)]
struct IdRow {
    #[serde(deserialize_with = "crate::schema::id_as_string")]
    id: String,
}

#[async_trait]
impl DocumentStore for SupabaseStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn save(&self, doc: NewDocument) -> Result<String> {
        let body = json!({
            "user_ip": doc.caller_id,
            "document_name": doc.document_name,
            "fields": doc.fields,
            "raw_text": doc.raw_text,
            "confidence": doc.confidence,
            "total_accuracy": doc.total_accuracy(),
            "processed_at": doc.processed_at,
        });

        debug!("Inserting document '{}' into {}", doc.document_name, self.table);

        let resp = self
            .client
            .post(self.table_url())
            .query(&[("select", "id")])
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .context("Failed to reach Supabase")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to insert document: {} - {}", status, text));
        }

        let rows: Vec<IdRow> = resp
            .json()
            .await
            .context("Failed to parse Supabase insert response")?;

        let id = rows
            .into_iter()
            .next()
            .map(|r| r.id)
            .ok_or_else(|| anyhow!("Supabase returned no row for the inserted document"))?;

        info!("Saved document {} for caller {}", id, doc.caller_id);
        Ok(id)
    }

    async fn history(&self, caller_id: &str, limit: usize) -> Result<Vec<StoredDocument>> {
        let limit = limit.min(HISTORY_LIMIT).to_string();
        let caller_filter = format!("eq.{}", caller_id);

        let resp = self
            .client
            .get(self.table_url())
            .query(&[
                ("select", "*"),
                ("user_ip", caller_filter.as_str()),
                ("order", "processed_at.desc"),
                ("limit", limit.as_str()),
            ])
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .context("Failed to reach Supabase")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase history query failed: {} - {}", status, text));
        }

        let rows: Vec<StoredDocument> = resp
            .json()
            .await
            .context("Failed to parse Supabase history rows")?;

        debug!("Fetched {} history rows for caller {}", rows.len(), caller_id);
        Ok(rows)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-process store. Records are lost on restart, and each caller keeps only
/// its [`HISTORY_LIMIT`] most recent documents since nothing older is ever read.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Vec<StoredDocument>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, doc: NewDocument) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let stored = StoredDocument::from_new(id.clone(), doc);
        let caller_id = stored.caller_id.clone();

        let mut docs = self.inner.write().await;
        docs.push(stored);

        let owned: Vec<usize> = docs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.caller_id == caller_id)
            .map(|(i, _)| i)
            .collect();
        if owned.len() > HISTORY_LIMIT {
            // First minimum wins, so ties evict the earliest insert.
            if let Some(oldest) = owned.into_iter().min_by_key(|&i| docs[i].processed_at) {
                let evicted = docs.remove(oldest);
                debug!("MemoryStore: evicted document {} for caller {}", evicted.id, caller_id);
            }
        }

        debug!("MemoryStore: stored document {}", id);
        Ok(id)
    }

    async fn history(&self, caller_id: &str, limit: usize) -> Result<Vec<StoredDocument>> {
        let docs = self.inner.read().await;
        // Iterate newest-inserted first so equal timestamps keep that order
        // through the stable sort.
        let mut matching: Vec<StoredDocument> = docs
            .iter()
            .rev()
            .filter(|d| d.caller_id == caller_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        matching.truncate(limit.min(HISTORY_LIMIT));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ConfidenceMap, FieldMap, FieldValue};
    use chrono::{Duration, TimeZone, Utc};

    fn doc(caller: &str, name: &str, minute: i64) -> NewDocument {
        NewDocument {
            caller_id: caller.to_string(),
            document_name: name.to_string(),
            fields: FieldMap::from([("n".to_string(), FieldValue::from(name))]),
            confidence: ConfidenceMap::from([("n".to_string(), 60.0)]),
            raw_text: name.to_string(),
            processed_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minute),
        }
    }

    #[tokio::test]
    async fn test_save_assigns_unique_ids() {
        let store = MemoryStore::new();
        let a = store.save(doc("x", "a", 0)).await.unwrap();
        let b = store.save(doc("x", "b", 1)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_history_is_scoped_and_newest_first() {
        let store = MemoryStore::new();
        store.save(doc("x", "old", 1)).await.unwrap();
        store.save(doc("y", "other", 5)).await.unwrap();
        store.save(doc("x", "new", 3)).await.unwrap();
        store.save(doc("x", "middle", 2)).await.unwrap();

        let history = store.history("x", HISTORY_LIMIT).await.unwrap();
        let names: Vec<&str> = history.iter().map(|d| d.document_name.as_str()).collect();
        assert_eq!(names, vec!["new", "middle", "old"]);
        assert!(history.iter().all(|d| d.caller_id == "x"));
        assert_eq!(history[0].total_accuracy, 60.0);

        assert!(store.history("nobody", HISTORY_LIMIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store.save(doc("x", &format!("doc{}", i), i)).await.unwrap();
        }

        let history = store.history("x", 50).await.unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].document_name, "doc24");
        assert_eq!(history[9].document_name, "doc15");

        assert_eq!(store.history("x", 3).await.unwrap().len(), 3);
        assert_eq!(store.len().await, HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_eviction_drops_oldest_per_caller() {
        let store = MemoryStore::new();
        store.save(doc("y", "other", 0)).await.unwrap();
        for i in 1..=HISTORY_LIMIT as i64 {
            store.save(doc("x", &format!("doc{}", i), i)).await.unwrap();
        }
        // Saved last but dated earliest: it is the one evicted.
        store.save(doc("x", "backdated", -5)).await.unwrap();

        let history = store.history("x", HISTORY_LIMIT).await.unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert!(history.iter().all(|d| d.document_name != "backdated"));
        assert_eq!(store.history("y", HISTORY_LIMIT).await.unwrap().len(), 1);
        assert_eq!(store.len().await, HISTORY_LIMIT + 1);
    }

    #[test]
    fn test_supabase_table_url() {
        let store = SupabaseStore::new(&StorageConfig {
            url: "https://project.supabase.co".to_string(),
            api_key: "anon".to_string(),
            table: "extracted_documents".to_string(),
        });
        assert_eq!(
            store.table_url(),
            "https://project.supabase.co/rest/v1/extracted_documents"
        );
        assert_eq!(store.name(), "supabase");
    }
}
