//! Typed repository for job records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use vforge_models::{JobError, JobId, JobPayload, JobRecord, JobStatus, JobType, ProjectId};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{Document, StructuredQuery, ToFirestoreValue, Value};

/// Collection holding one document per job attempt.
const COLLECTION: &str = "jobs";

/// Maximum retries for precondition-guarded corrections.
const MAX_GUARDED_RETRIES: u32 = 5;

/// Repository for job records.
#[derive(Clone)]
pub struct JobRepository {
    client: FirestoreClient,
}

impl JobRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    /// Create the record for a new job attempt.
    pub async fn create(&self, record: &JobRecord) -> FirestoreResult<()> {
        let fields = record_to_fields(record)?;
        self.client
            .create_document(COLLECTION, record.job_id.as_str(), fields)
            .await?;
        info!(job_id = %record.job_id, "Created job record");
        Ok(())
    }

    /// Get a record by id.
    pub async fn get(&self, job_id: &JobId) -> FirestoreResult<Option<JobRecord>> {
        Ok(self.get_with_meta(job_id).await?.map(|(record, _)| record))
    }

    /// Get a record together with its store update time, for
    /// precondition-guarded corrections.
    pub async fn get_with_meta(
        &self,
        job_id: &JobId,
    ) -> FirestoreResult<Option<(JobRecord, Option<String>)>> {
        let doc = self.client.get_document(COLLECTION, job_id.as_str()).await?;
        match doc {
            Some(d) => {
                let update_time = d.update_time.clone();
                let record = document_to_record(&d)?;
                Ok(Some((record, update_time)))
            }
            None => Ok(None),
        }
    }

    /// Mark the job running (runner picked it up).
    pub async fn mark_running(&self, job_id: &JobId) -> FirestoreResult<()> {
        let now = Utc::now();
        let mut fields = HashMap::new();
        fields.insert(
            "status".to_string(),
            JobStatus::Running.as_str().to_firestore_value(),
        );
        fields.insert("message".to_string(), "Running".to_firestore_value());
        fields.insert("started_at".to_string(), now.to_firestore_value());
        fields.insert("updated_at".to_string(), now.to_firestore_value());

        self.update_masked(job_id, fields).await
    }

    /// Mark the job completed.
    pub async fn complete(&self, job_id: &JobId) -> FirestoreResult<()> {
        let now = Utc::now();
        let mut fields = HashMap::new();
        fields.insert(
            "status".to_string(),
            JobStatus::Completed.as_str().to_firestore_value(),
        );
        fields.insert("progress".to_string(), 100.0f64.to_firestore_value());
        fields.insert("message".to_string(), "Completed".to_firestore_value());
        fields.insert("completed_at".to_string(), now.to_firestore_value());
        fields.insert("updated_at".to_string(), now.to_firestore_value());

        self.update_masked(job_id, fields).await
    }

    /// Mark the job failed with a structured error.
    pub async fn fail(&self, job_id: &JobId, error: &JobError) -> FirestoreResult<()> {
        let now = Utc::now();
        let mut fields = HashMap::new();
        fields.insert(
            "status".to_string(),
            JobStatus::Failed.as_str().to_firestore_value(),
        );
        fields.insert("message".to_string(), error.message.as_str().to_firestore_value());
        fields.insert("error_code".to_string(), error.code.as_str().to_firestore_value());
        fields.insert(
            "error_message".to_string(),
            error.message.as_str().to_firestore_value(),
        );
        fields.insert("completed_at".to_string(), now.to_firestore_value());
        fields.insert("updated_at".to_string(), now.to_firestore_value());

        self.update_masked(job_id, fields).await
    }

    /// Mark the job cancelled.
    pub async fn cancel(&self, job_id: &JobId) -> FirestoreResult<()> {
        let now = Utc::now();
        let mut fields = HashMap::new();
        fields.insert(
            "status".to_string(),
            JobStatus::Cancelled.as_str().to_firestore_value(),
        );
        fields.insert("message".to_string(), "Cancelled".to_firestore_value());
        fields.insert("completed_at".to_string(), now.to_firestore_value());
        fields.insert("updated_at".to_string(), now.to_firestore_value());

        self.update_masked(job_id, fields).await
    }

    /// Record the execution engine handle after dispatch.
    pub async fn set_execution_ref(
        &self,
        job_id: &JobId,
        execution_ref: &str,
    ) -> FirestoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert(
            "execution_ref".to_string(),
            execution_ref.to_firestore_value(),
        );
        fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());

        self.update_masked(job_id, fields).await
    }

    /// Re-queue a failed attempt for another dispatch.
    pub async fn requeue_for_retry(&self, job_id: &JobId, retry_count: u32) -> FirestoreResult<()> {
        let now = Utc::now();
        let mut fields = HashMap::new();
        fields.insert(
            "status".to_string(),
            JobStatus::Queued.as_str().to_firestore_value(),
        );
        fields.insert("retry_count".to_string(), retry_count.to_firestore_value());
        fields.insert("progress".to_string(), 0.0f64.to_firestore_value());
        fields.insert(
            "message".to_string(),
            format!("Queued (attempt {})", retry_count + 1).to_firestore_value(),
        );
        fields.insert("updated_at".to_string(), now.to_firestore_value());

        self.update_masked(job_id, fields).await
    }

    /// Update the denormalized latest-progress fields for O(1) polling.
    pub async fn update_latest_progress(
        &self,
        job_id: &JobId,
        percent: f64,
        message: &str,
        stage: &str,
    ) -> FirestoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert("progress".to_string(), percent.to_firestore_value());
        fields.insert("message".to_string(), message.to_firestore_value());
        fields.insert("current_stage".to_string(), stage.to_firestore_value());
        fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());

        self.update_masked(job_id, fields).await
    }

    /// Most recent record for a `(project, job_type)` pair.
    pub async fn latest_for_project(
        &self,
        project_id: &ProjectId,
        job_type: JobType,
    ) -> FirestoreResult<Option<JobRecord>> {
        let query = StructuredQuery::collection(COLLECTION)
            .where_eq("project_id", project_id.as_str().to_firestore_value())
            .where_eq("job_type", job_type.as_str().to_firestore_value())
            .order_by_field("created_at", true)
            .with_limit(1);

        let docs = self.client.run_query("", query).await?;
        docs.first().map(document_to_record).transpose()
    }

    /// Recent records for a project, newest first.
    pub async fn list_for_project(
        &self,
        project_id: &ProjectId,
        limit: u32,
    ) -> FirestoreResult<Vec<JobRecord>> {
        let query = StructuredQuery::collection(COLLECTION)
            .where_eq("project_id", project_id.as_str().to_firestore_value())
            .order_by_field("created_at", true)
            .with_limit(limit);

        let docs = self.client.run_query("", query).await?;
        docs.iter().map(document_to_record).collect()
    }

    /// All records currently in a non-terminal state, for the sweep.
    pub async fn list_non_terminal(&self) -> FirestoreResult<Vec<JobRecord>> {
        let mut records = Vec::new();
        for status in [JobStatus::Queued, JobStatus::Running] {
            let query = StructuredQuery::collection(COLLECTION)
                .where_eq("status", status.as_str().to_firestore_value())
                .order_by_field("created_at", false);
            let docs = self.client.run_query("", query).await?;
            for doc in &docs {
                records.push(document_to_record(doc)?);
            }
        }
        Ok(records)
    }

    /// Terminal records older than `age`, for retention.
    pub async fn list_terminal_older_than(
        &self,
        age: chrono::Duration,
    ) -> FirestoreResult<Vec<JobRecord>> {
        let cutoff = Utc::now() - age;
        let mut records = Vec::new();
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            let query = StructuredQuery::collection(COLLECTION)
                .where_eq("status", status.as_str().to_firestore_value());
            let docs = self.client.run_query("", query).await?;
            for doc in &docs {
                let record = document_to_record(doc)?;
                if record.completed_at.map(|t| t < cutoff).unwrap_or(false) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Delete a record (retention only).
    pub async fn delete(&self, job_id: &JobId) -> FirestoreResult<()> {
        self.client.delete_document(COLLECTION, job_id.as_str()).await
    }

    /// Apply a reconciliation correction with compare-and-write discipline.
    ///
    /// The correction re-reads the record on each attempt and only writes
    /// when `should_apply` still holds against the fresh copy, using the
    /// document's update time as a precondition so a concurrent legitimate
    /// writer is never clobbered.
    pub async fn apply_correction<F>(
        &self,
        job_id: &JobId,
        should_apply: F,
        status: JobStatus,
        message: &str,
        error: Option<&JobError>,
    ) -> FirestoreResult<bool>
    where
        F: Fn(&JobRecord) -> bool,
    {
        for attempt in 0..MAX_GUARDED_RETRIES {
            let Some((record, update_time)) = self.get_with_meta(job_id).await? else {
                return Ok(false);
            };

            if !should_apply(&record) {
                return Ok(false);
            }

            let now = Utc::now();
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), status.as_str().to_firestore_value());
            fields.insert("message".to_string(), message.to_firestore_value());
            fields.insert("updated_at".to_string(), now.to_firestore_value());
            let mut mask = vec![
                "status".to_string(),
                "message".to_string(),
                "updated_at".to_string(),
            ];

            if status == JobStatus::Completed {
                fields.insert("progress".to_string(), 100.0f64.to_firestore_value());
                mask.push("progress".to_string());
            }
            if status.is_terminal() {
                fields.insert("completed_at".to_string(), now.to_firestore_value());
                mask.push("completed_at".to_string());
            }
            if let Some(err) = error {
                fields.insert("error_code".to_string(), err.code.as_str().to_firestore_value());
                fields.insert(
                    "error_message".to_string(),
                    err.message.as_str().to_firestore_value(),
                );
                mask.push("error_code".to_string());
                mask.push("error_message".to_string());
            }

            match self
                .client
                .update_document_with_precondition(
                    COLLECTION,
                    job_id.as_str(),
                    fields,
                    Some(mask),
                    update_time.as_deref(),
                )
                .await
            {
                Ok(_) => {
                    info!(job_id = %job_id, status = %status, "Applied job correction");
                    return Ok(true);
                }
                Err(e) if e.is_precondition_failed() => {
                    // A concurrent writer got there first; re-read and re-decide.
                    debug!(
                        job_id = %job_id,
                        attempt = attempt + 1,
                        "Correction precondition failed, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(job_id = %job_id, "Correction abandoned after {} attempts", MAX_GUARDED_RETRIES);
        Err(FirestoreError::request_failed(format!(
            "Failed to correct job {} after {} retries",
            job_id, MAX_GUARDED_RETRIES
        )))
    }

    async fn update_masked(
        &self,
        job_id: &JobId,
        fields: HashMap<String, Value>,
    ) -> FirestoreResult<()> {
        let mask: Vec<String> = fields.keys().cloned().collect();
        self.client
            .update_document(COLLECTION, job_id.as_str(), fields, Some(mask))
            .await?;
        Ok(())
    }
}

fn record_to_fields(record: &JobRecord) -> FirestoreResult<HashMap<String, Value>> {
    let payload_json = serde_json::to_string(&record.payload)?;

    let mut fields = HashMap::new();
    fields.insert(
        "job_type".to_string(),
        record.job_type.as_str().to_firestore_value(),
    );
    fields.insert(
        "project_id".to_string(),
        record.project_id.as_str().to_firestore_value(),
    );
    fields.insert(
        "owner_id".to_string(),
        record.owner_id.as_str().to_firestore_value(),
    );
    fields.insert(
        "status".to_string(),
        record.status.as_str().to_firestore_value(),
    );
    fields.insert("progress".to_string(), record.progress.to_firestore_value());
    fields.insert(
        "message".to_string(),
        record.message.as_str().to_firestore_value(),
    );
    fields.insert("payload_json".to_string(), payload_json.to_firestore_value());
    fields.insert(
        "retry_count".to_string(),
        record.retry_count.to_firestore_value(),
    );
    fields.insert(
        "max_retries".to_string(),
        record.max_retries.to_firestore_value(),
    );
    fields.insert(
        "created_at".to_string(),
        record.created_at.to_firestore_value(),
    );
    fields.insert(
        "updated_at".to_string(),
        record.updated_at.to_firestore_value(),
    );
    if let Some(stage) = &record.current_stage {
        fields.insert("current_stage".to_string(), stage.as_str().to_firestore_value());
    }
    if let Some(t) = record.started_at {
        fields.insert("started_at".to_string(), t.to_firestore_value());
    }
    if let Some(t) = record.completed_at {
        fields.insert("completed_at".to_string(), t.to_firestore_value());
    }
    if let Some(r) = &record.execution_ref {
        fields.insert("execution_ref".to_string(), r.as_str().to_firestore_value());
    }
    if let Some(err) = &record.error {
        fields.insert("error_code".to_string(), err.code.as_str().to_firestore_value());
        fields.insert(
            "error_message".to_string(),
            err.message.as_str().to_firestore_value(),
        );
    }

    Ok(fields)
}

fn document_to_record(doc: &Document) -> FirestoreResult<JobRecord> {
    let job_id = doc
        .id()
        .map(JobId::from_string)
        .ok_or_else(|| FirestoreError::invalid_response("job document has no name"))?;

    let payload_json: String = doc
        .get("payload_json")
        .ok_or_else(|| FirestoreError::invalid_response("job document missing payload_json"))?;
    let payload: JobPayload = serde_json::from_str(&payload_json)?;

    let job_type = match doc.get::<String>("job_type").as_deref() {
        Some("stitching") => JobType::Stitching,
        Some("generation") => JobType::Generation,
        other => {
            return Err(FirestoreError::invalid_response(format!(
                "unknown job_type: {:?}",
                other
            )))
        }
    };

    let status = match doc.get::<String>("status").as_deref() {
        Some("queued") | None => JobStatus::Queued,
        Some("running") => JobStatus::Running,
        Some("completed") => JobStatus::Completed,
        Some("failed") => JobStatus::Failed,
        Some("cancelled") => JobStatus::Cancelled,
        Some(other) => {
            return Err(FirestoreError::invalid_response(format!(
                "unknown job status: {}",
                other
            )))
        }
    };

    let error = match (
        doc.get::<String>("error_code"),
        doc.get::<String>("error_message"),
    ) {
        (Some(code), message) => Some(JobError::new(code, message.unwrap_or_default())),
        _ => None,
    };

    Ok(JobRecord {
        job_id,
        job_type,
        project_id: ProjectId::from_string(doc.get::<String>("project_id").unwrap_or_default()),
        owner_id: doc.get::<String>("owner_id").unwrap_or_default(),
        status,
        progress: doc.get::<f64>("progress").unwrap_or(0.0),
        message: doc.get::<String>("message").unwrap_or_default(),
        current_stage: doc.get::<String>("current_stage"),
        payload,
        retry_count: doc.get::<u32>("retry_count").unwrap_or(0),
        max_retries: doc.get::<u32>("max_retries").unwrap_or(3),
        created_at: doc
            .get::<DateTime<Utc>>("created_at")
            .unwrap_or_else(Utc::now),
        updated_at: doc
            .get::<DateTime<Utc>>("updated_at")
            .unwrap_or_else(Utc::now),
        started_at: doc.get::<DateTime<Utc>>("started_at"),
        completed_at: doc.get::<DateTime<Utc>>("completed_at"),
        execution_ref: doc.get::<String>("execution_ref"),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vforge_models::{JobOptions, StitchingOptions};

    fn sample_record() -> JobRecord {
        let payload = JobPayload {
            job_id: JobId::from("j1"),
            project_id: ProjectId::from("p1"),
            owner_id: "u1".to_string(),
            input_refs: vec!["a".into()],
            output_ref: "out".into(),
            options: JobOptions::Stitching(StitchingOptions::default()),
            retry_attempt: 0,
        };
        JobRecord::new(JobType::Stitching, "u1", payload)
    }

    #[test]
    fn fields_roundtrip_through_document() {
        let record = sample_record().dispatch("exec-9").start();
        let fields = record_to_fields(&record).unwrap();

        let doc = Document {
            name: Some(format!("projects/x/databases/(default)/documents/jobs/{}", record.job_id)),
            fields: Some(fields),
            create_time: None,
            update_time: None,
        };

        let back = document_to_record(&doc).unwrap();
        assert_eq!(back.job_id, record.job_id);
        assert_eq!(back.status, JobStatus::Running);
        assert_eq!(back.execution_ref.as_deref(), Some("exec-9"));
        assert_eq!(back.payload.output_ref, "out");
    }

    #[test]
    fn missing_payload_is_invalid() {
        let doc = Document {
            name: Some("x/jobs/j1".into()),
            fields: Some(HashMap::new()),
            create_time: None,
            update_time: None,
        };
        assert!(document_to_record(&doc).is_err());
    }
}
