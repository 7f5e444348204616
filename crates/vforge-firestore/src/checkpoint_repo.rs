//! Durable checkpoint store.
//!
//! One document per `(job, stage)` under `jobs/{job_id}/checkpoints`, with
//! the stage name as the document id so re-running a stage is an idempotent
//! upsert. The resume point is the checkpoint with the maximum
//! `(timestamp, sequence)` pair.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use vforge_models::{Checkpoint, JobId};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{Document, ToFirestoreValue};

/// Repository for job checkpoints.
#[derive(Clone)]
pub struct CheckpointRepository {
    client: FirestoreClient,
}

impl CheckpointRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    fn collection(job_id: &JobId) -> String {
        format!("jobs/{}/checkpoints", job_id)
    }

    /// Save a checkpoint. Upserts by stage name; a save failure propagates
    /// because the job must not claim progress it did not durably record.
    pub async fn save(&self, checkpoint: &Checkpoint) -> FirestoreResult<()> {
        let data_json = serde_json::to_string(&checkpoint.data)?;

        let mut fields = HashMap::new();
        fields.insert(
            "job_id".to_string(),
            checkpoint.job_id.as_str().to_firestore_value(),
        );
        fields.insert(
            "stage_name".to_string(),
            checkpoint.stage_name.as_str().to_firestore_value(),
        );
        fields.insert(
            "sequence".to_string(),
            checkpoint.sequence.to_firestore_value(),
        );
        fields.insert(
            "timestamp".to_string(),
            checkpoint.timestamp.to_firestore_value(),
        );
        fields.insert("data_json".to_string(), data_json.to_firestore_value());

        self.client
            .set_document(
                &Self::collection(&checkpoint.job_id),
                &checkpoint.stage_name,
                fields,
            )
            .await?;

        debug!(
            job_id = %checkpoint.job_id,
            stage = %checkpoint.stage_name,
            "Saved checkpoint"
        );
        Ok(())
    }

    /// The authoritative resume point: the checkpoint with the maximum
    /// `(timestamp, sequence)`, or `None` when the job has none.
    pub async fn get_last(&self, job_id: &JobId) -> FirestoreResult<Option<Checkpoint>> {
        let all = self.get_all(job_id).await?;
        Ok(all.into_iter().max_by_key(|c| c.order_key()))
    }

    /// Full ordered history, oldest first. Debugging/audit, not resume.
    pub async fn get_all(&self, job_id: &JobId) -> FirestoreResult<Vec<Checkpoint>> {
        let docs = self
            .client
            .list_all_documents(&Self::collection(job_id))
            .await?;

        let mut checkpoints: Vec<Checkpoint> = docs
            .iter()
            .map(document_to_checkpoint)
            .collect::<FirestoreResult<_>>()?;
        checkpoints.sort_by_key(|c| c.order_key());
        Ok(checkpoints)
    }

    /// Delete every checkpoint of a job.
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
            info!(job_id = %job_id, "Deleted {} checkpoints", deleted);
        }
        Ok(deleted)
    }

    /// Delete checkpoints older than `age`. Safe alongside an in-flight job:
    /// each stage's checkpoint is a single document, so deletion never
    /// leaves a stage partially visible.
    pub async fn delete_older_than(&self, job_id: &JobId, age: Duration) -> FirestoreResult<u32> {
        let cutoff = Utc::now() - age;
        let all = self.get_all(job_id).await?;
        let mut deleted = 0u32;

        for checkpoint in all {
            if checkpoint.timestamp < cutoff {
                self.client
                    .delete_document(&Self::collection(job_id), &checkpoint.stage_name)
                    .await?;
                deleted += 1;
            }
        }

        Ok(deleted)
    }
}

fn document_to_checkpoint(doc: &Document) -> FirestoreResult<Checkpoint> {
    let job_id = doc
        .get::<String>("job_id")
        .map(JobId::from_string)
        .ok_or_else(|| FirestoreError::invalid_response("checkpoint missing job_id"))?;

    let stage_name = doc
        .get::<String>("stage_name")
        .or_else(|| doc.id().map(str::to_string))
        .ok_or_else(|| FirestoreError::invalid_response("checkpoint missing stage_name"))?;

    let data = match doc.get::<String>("data_json") {
        Some(json) => serde_json::from_str(&json)?,
        None => HashMap::new(),
    };

    Ok(Checkpoint {
        job_id,
        stage_name,
        sequence: doc.get::<u64>("sequence").unwrap_or(0),
        timestamp: doc
            .get::<DateTime<Utc>>("timestamp")
            .unwrap_or_else(Utc::now),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use serde_json::json;

    #[test]
    fn document_parses_back_to_checkpoint() {
        let data = HashMap::from([("files".to_string(), json!(["/tmp/a.mp4"]))]);
        let mut fields = HashMap::new();
        fields.insert("job_id".to_string(), Value::StringValue("j1".into()));
        fields.insert(
            "stage_name".to_string(),
            Value::StringValue("download_complete".into()),
        );
        fields.insert("sequence".to_string(), Value::IntegerValue("4".into()));
        fields.insert(
            "timestamp".to_string(),
            Value::TimestampValue(Utc::now().to_rfc3339()),
        );
        fields.insert(
            "data_json".to_string(),
            Value::StringValue(serde_json::to_string(&data).unwrap()),
        );

        let doc = Document {
            name: Some("x/jobs/j1/checkpoints/download_complete".into()),
            fields: Some(fields),
            create_time: None,
            update_time: None,
        };

        let checkpoint = document_to_checkpoint(&doc).unwrap();
        assert_eq!(checkpoint.stage_name, "download_complete");
        assert_eq!(checkpoint.sequence, 4);
        assert_eq!(
            checkpoint.string_list("files").unwrap(),
            vec!["/tmp/a.mp4".to_string()]
        );
    }
}
