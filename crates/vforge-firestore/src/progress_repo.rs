//! Append-only progress log.
//!
//! Entries live under `jobs/{job_id}/progress` keyed by the zero-padded
//! sequence number, so lexicographic document order is emission order and
//! clock skew can never reorder the log.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use vforge_models::{JobId, ProgressEntry};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{Document, StructuredQuery, ToFirestoreValue};

/// Repository for progress entries.
#[derive(Clone)]
pub struct ProgressRepository {
    client: FirestoreClient,
}

impl ProgressRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    fn collection(job_id: &JobId) -> String {
        format!("jobs/{}/progress", job_id)
    }

    /// Document id for a sequence number; zero-padded so string order
    /// matches numeric order.
    fn doc_id(sequence: u64) -> String {
        format!("{:012}", sequence)
    }

    /// Append an entry. The caller owns sequence allocation.
    pub async fn append(&self, entry: &ProgressEntry) -> FirestoreResult<()> {
        let metadata_json = serde_json::to_string(&entry.metadata)?;

        let mut fields = HashMap::new();
        fields.insert(
            "job_id".to_string(),
            entry.job_id.as_str().to_firestore_value(),
        );
        fields.insert(
            "sequence_number".to_string(),
            entry.sequence_number.to_firestore_value(),
        );
        fields.insert(
            "timestamp".to_string(),
            entry.timestamp.to_firestore_value(),
        );
        fields.insert("percent".to_string(), entry.percent.to_firestore_value());
        fields.insert(
            "message".to_string(),
            entry.message.as_str().to_firestore_value(),
        );
        fields.insert("stage".to_string(), entry.stage.as_str().to_firestore_value());
        fields.insert(
            "metadata_json".to_string(),
            metadata_json.to_firestore_value(),
        );

        self.client
            .set_document(
                &Self::collection(&entry.job_id),
                &Self::doc_id(entry.sequence_number),
                fields,
            )
            .await?;
        Ok(())
    }

    /// Highest sequence number written for a job, or `None` when the log is
    /// empty. Used to seed the in-memory counter on resume.
    pub async fn latest_sequence(&self, job_id: &JobId) -> FirestoreResult<Option<u64>> {
        let query = StructuredQuery::collection("progress")
            .order_by_field("sequence_number", true)
            .with_limit(1);

        let docs = self
            .client
            .run_query(&format!("jobs/{}", job_id), query)
            .await?;
        Ok(docs.first().and_then(|d| d.get::<u64>("sequence_number")))
    }

    /// Most recent `n` entries, oldest first.
    pub async fn recent(&self, job_id: &JobId, n: u32) -> FirestoreResult<Vec<ProgressEntry>> {
        let query = StructuredQuery::collection("progress")
            .order_by_field("sequence_number", true)
            .with_limit(n);

        let docs = self
            .client
            .run_query(&format!("jobs/{}", job_id), query)
            .await?;

        let mut entries: Vec<ProgressEntry> = docs
            .iter()
            .map(document_to_entry)
            .collect::<FirestoreResult<_>>()?;
        entries.sort_by_key(|e| e.sequence_number);
        Ok(entries)
    }

    /// Delete the whole log for a job.
    pub async fn delete_all(&self, job_id: &JobId) -> FirestoreResult<u32> {
        let docs = self
            .client
            .list_all_documents(&Self::collection(job_id))
            .await?;
        let mut deleted = 0u32;

        for doc in docs {
            if let Some(id) = doc.id() {
                self.client
                    .delete_document(&Self::collection(job_id), id)
                    .await?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(job_id = %job_id, "Deleted {} progress entries", deleted);
        }
        Ok(deleted)
    }

    /// Delete entries older than `age`, for retention.
    pub async fn delete_older_than(&self, job_id: &JobId, age: Duration) -> FirestoreResult<u32> {
        let cutoff = Utc::now() - age;
        let docs = self
            .client
            .list_all_documents(&Self::collection(job_id))
            .await?;
        let mut deleted = 0u32;

        for doc in docs {
            let old = doc
                .get::<DateTime<Utc>>("timestamp")
                .map(|t| t < cutoff)
                .unwrap_or(false);
            if old {
                if let Some(id) = doc.id() {
                    self.client
                        .delete_document(&Self::collection(job_id), id)
                        .await?;
                    deleted += 1;
                }
            }
        }

        Ok(deleted)
    }
}

fn document_to_entry(doc: &Document) -> FirestoreResult<ProgressEntry> {
    let job_id = doc
        .get::<String>("job_id")
        .map(JobId::from_string)
        .ok_or_else(|| FirestoreError::invalid_response("progress entry missing job_id"))?;

    let metadata = match doc.get::<String>("metadata_json") {
        Some(json) => serde_json::from_str(&json)?,
        None => HashMap::new(),
    };

    Ok(ProgressEntry {
        job_id,
        sequence_number: doc.get::<u64>("sequence_number").unwrap_or(0),
        timestamp: doc
            .get::<DateTime<Utc>>("timestamp")
            .unwrap_or_else(Utc::now),
        percent: doc.get::<f64>("percent").unwrap_or(0.0),
        message: doc.get::<String>("message").unwrap_or_default(),
        stage: doc.get::<String>("stage").unwrap_or_default(),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_ids_sort_lexicographically() {
        let ids: Vec<String> = [1u64, 9, 10, 99, 100, 1000]
            .iter()
            .map(|s| ProgressRepository::doc_id(*s))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
