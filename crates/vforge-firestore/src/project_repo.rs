//! Typed repository for project projections.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use vforge_models::{ProjectId, ProjectRecord, ProjectStatus};

use crate::client::FirestoreClient;
use crate::error::{FirestoreError, FirestoreResult};
use crate::types::{nullable_string_list, Document, ToFirestoreValue, Value};

const COLLECTION: &str = "projects";

/// Maximum retries for optimistic concurrency updates.
const MAX_UPDATE_RETRIES: u32 = 5;

/// Repository for project records.
#[derive(Clone)]
pub struct ProjectRepository {
    client: FirestoreClient,
}

impl ProjectRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    /// Get a project by id.
    pub async fn get(&self, project_id: &ProjectId) -> FirestoreResult<Option<ProjectRecord>> {
        let doc = self
            .client
            .get_document(COLLECTION, project_id.as_str())
            .await?;
        doc.as_ref().map(document_to_project).transpose()
    }

    /// Create a new project record.
    pub async fn create(&self, project: &ProjectRecord) -> FirestoreResult<()> {
        let fields = project_to_fields(project);
        self.client
            .create_document(COLLECTION, project.project_id.as_str(), fields)
            .await?;
        info!(project_id = %project.project_id, "Created project record");
        Ok(())
    }

    /// Update the summary status.
    pub async fn set_status(
        &self,
        project_id: &ProjectId,
        status: ProjectStatus,
    ) -> FirestoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), status.as_str().to_firestore_value());
        fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());

        self.client
            .update_document(
                COLLECTION,
                project_id.as_str(),
                fields,
                Some(vec!["status".to_string(), "updated_at".to_string()]),
            )
            .await?;
        Ok(())
    }

    /// Record the stitched output ref and mark the project ready.
    pub async fn set_output_ref(
        &self,
        project_id: &ProjectId,
        output_ref: &str,
    ) -> FirestoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert("output_ref".to_string(), output_ref.to_firestore_value());
        fields.insert(
            "status".to_string(),
            ProjectStatus::Ready.as_str().to_firestore_value(),
        );
        fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());

        self.client
            .update_document(
                COLLECTION,
                project_id.as_str(),
                fields,
                Some(vec![
                    "output_ref".to_string(),
                    "status".to_string(),
                    "updated_at".to_string(),
                ]),
            )
            .await?;
        Ok(())
    }

    /// Set one clip slot, using optimistic locking so concurrent slot
    /// writers (or the reconciler) never clobber each other's entries.
    pub async fn set_clip_ref(
        &self,
        project_id: &ProjectId,
        index: usize,
        clip_ref: &str,
    ) -> FirestoreResult<()> {
        for attempt in 0..MAX_UPDATE_RETRIES {
            let doc = self
                .client
                .get_document(COLLECTION, project_id.as_str())
                .await?
                .ok_or_else(|| {
                    FirestoreError::not_found(format!("Project {} not found", project_id))
                })?;

            let update_time = doc.update_time.clone();
            let mut project = document_to_project(&doc)?;
            project.set_clip_ref(index, clip_ref);

            let mut fields = HashMap::new();
            fields.insert("clip_refs".to_string(), nullable_string_list(&project.clip_refs));
            fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());

            match self
                .client
                .update_document_with_precondition(
                    COLLECTION,
                    project_id.as_str(),
                    fields,
                    Some(vec!["clip_refs".to_string(), "updated_at".to_string()]),
                    update_time.as_deref(),
                )
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_precondition_failed() => {
                    debug!(
                        project_id = %project_id,
                        attempt = attempt + 1,
                        "Clip ref update precondition failed, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        50 * (attempt as u64 + 1),
                    ))
                    .await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(project_id = %project_id, "Clip ref update failed after {} retries", MAX_UPDATE_RETRIES);
        Err(FirestoreError::request_failed(format!(
            "Failed to update clip refs for {} after {} retries",
            project_id, MAX_UPDATE_RETRIES
        )))
    }

    /// Replace the full claimed-clip list and summary status, as computed by
    /// the reconciler. Guarded by the supplied update time so a concurrent
    /// legitimate update wins and the reconciliation re-runs instead.
    pub async fn apply_reconciliation(
        &self,
        project_id: &ProjectId,
        clip_refs: &[Option<String>],
        status: ProjectStatus,
        update_time: Option<&str>,
    ) -> FirestoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert("clip_refs".to_string(), nullable_string_list(clip_refs));
        fields.insert("status".to_string(), status.as_str().to_firestore_value());
        fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());

        self.client
            .update_document_with_precondition(
                COLLECTION,
                project_id.as_str(),
                fields,
                Some(vec![
                    "clip_refs".to_string(),
                    "status".to_string(),
                    "updated_at".to_string(),
                ]),
                update_time,
            )
            .await?;
        Ok(())
    }

    /// Get a project together with its store update time.
    pub async fn get_with_meta(
        &self,
        project_id: &ProjectId,
    ) -> FirestoreResult<Option<(ProjectRecord, Option<String>)>> {
        let doc = self
            .client
            .get_document(COLLECTION, project_id.as_str())
            .await?;
        match doc {
            Some(d) => {
                let update_time = d.update_time.clone();
                Ok(Some((document_to_project(&d)?, update_time)))
            }
            None => Ok(None),
        }
    }
}

fn project_to_fields(project: &ProjectRecord) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert(
        "owner_id".to_string(),
        project.owner_id.as_str().to_firestore_value(),
    );
    fields.insert(
        "status".to_string(),
        project.status.as_str().to_firestore_value(),
    );
    fields.insert(
        "expected_clips".to_string(),
        project.expected_clips.to_firestore_value(),
    );
    fields.insert("clip_refs".to_string(), nullable_string_list(&project.clip_refs));
    if let Some(output_ref) = &project.output_ref {
        fields.insert(
            "output_ref".to_string(),
            output_ref.as_str().to_firestore_value(),
        );
    }
    fields.insert(
        "created_at".to_string(),
        project.created_at.to_firestore_value(),
    );
    fields.insert(
        "updated_at".to_string(),
        project.updated_at.to_firestore_value(),
    );
    fields
}

fn document_to_project(doc: &Document) -> FirestoreResult<ProjectRecord> {
    let project_id = doc
        .id()
        .map(ProjectId::from_string)
        .ok_or_else(|| FirestoreError::invalid_response("project document has no name"))?;

    let status = match doc.get::<String>("status").as_deref() {
        Some("draft") | None => ProjectStatus::Draft,
        Some("generating") => ProjectStatus::Generating,
        Some("ready") => ProjectStatus::Ready,
        Some("error") => ProjectStatus::Error,
        Some(other) => {
            return Err(FirestoreError::invalid_response(format!(
                "unknown project status: {}",
                other
            )))
        }
    };

    Ok(ProjectRecord {
        project_id,
        owner_id: doc.get::<String>("owner_id").unwrap_or_default(),
        status,
        expected_clips: doc.get::<u32>("expected_clips").unwrap_or(0),
        clip_refs: doc.get::<Vec<Option<String>>>("clip_refs").unwrap_or_default(),
        output_ref: doc.get::<String>("output_ref"),
        created_at: doc
            .get::<DateTime<Utc>>("created_at")
            .unwrap_or_else(Utc::now),
        updated_at: doc
            .get::<DateTime<Utc>>("updated_at")
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_roundtrip() {
        let mut project = ProjectRecord::new(ProjectId::from("p1"), "u1", 3);
        project.set_clip_ref(0, "media/u1/p1/clips/j1/clip_00.mp4");
        project.status = ProjectStatus::Generating;

        let doc = Document {
            name: Some("x/projects/p1".into()),
            fields: Some(project_to_fields(&project)),
            create_time: None,
            update_time: None,
        };

        let back = document_to_project(&doc).unwrap();
        assert_eq!(back.project_id.as_str(), "p1");
        assert_eq!(back.status, ProjectStatus::Generating);
        assert_eq!(back.clip_refs.len(), 3);
        assert!(back.clip_refs[0].is_some());
        assert!(back.clip_refs[1].is_none());
    }
}
