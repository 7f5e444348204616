//! R2 integration tests.
//!
//! Run against a live bucket with `cargo test -- --ignored` and the R2_*
//! environment variables set.

use vforge_storage::{clip_key, R2Client};

/// Test connectivity to the bucket.
#[tokio::test]
#[ignore = "requires R2"]
async fn test_connectivity() {
    dotenvy::dotenv().ok();

    let client = R2Client::from_env().await.expect("Failed to create client");
    client
        .check_connectivity()
        .await
        .expect("Connectivity check failed");
}

/// Upload, stat, and delete an object.
#[tokio::test]
#[ignore = "requires R2"]
async fn test_upload_info_delete_cycle() {
    dotenvy::dotenv().ok();

    let client = R2Client::from_env().await.expect("Failed to create client");
    let key = clip_key("test-user", "test-project", "test-job", "cycle.mp4").unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let local = dir.path().join("cycle.mp4");
    tokio::fs::write(&local, b"not really a video").await.unwrap();

    client.upload_artifact(&local, &key).await.expect("Upload failed");
    assert!(client.exists(&key).await.expect("Exists check failed"));

    let info = client
        .object_info(&key)
        .await
        .expect("Info failed")
        .expect("Object missing after upload");
    assert_eq!(info.size, 18);

    client.delete_object(&key).await.expect("Delete failed");
    assert!(!client.exists(&key).await.expect("Exists check failed"));
}

/// Deleting a non-existent object is a success.
#[tokio::test]
#[ignore = "requires R2"]
async fn test_idempotent_delete() {
    dotenvy::dotenv().ok();

    let client = R2Client::from_env().await.expect("Failed to create client");
    let key = clip_key("test-user", "test-project", "test-job", "never-existed.mp4").unwrap();

    client.delete_object(&key).await.expect("First delete failed");
    client.delete_object(&key).await.expect("Second delete failed");
}

/// Batch validation partitions present and missing refs exactly.
#[tokio::test]
#[ignore = "requires R2"]
async fn test_validate_refs_partitions() {
    dotenvy::dotenv().ok();

    let client = R2Client::from_env().await.expect("Failed to create client");

    let dir = tempfile::TempDir::new().unwrap();
    let local = dir.path().join("present.mp4");
    tokio::fs::write(&local, b"x").await.unwrap();

    let present_a = clip_key("test-user", "test-project", "validate", "a.mp4").unwrap();
    let present_b = clip_key("test-user", "test-project", "validate", "b.mp4").unwrap();
    let missing_a = clip_key("test-user", "test-project", "validate", "gone-1.mp4").unwrap();
    let missing_b = clip_key("test-user", "test-project", "validate", "gone-2.mp4").unwrap();

    client.upload_artifact(&local, &present_a).await.unwrap();
    client.upload_artifact(&local, &present_b).await.unwrap();

    let refs = vec![
        missing_a.clone(),
        present_a.clone(),
        missing_b.clone(),
        present_b.clone(),
    ];
    let validation = client.validate_refs(&refs).await;

    assert_eq!(validation.valid, vec![present_a.clone(), present_b.clone()]);
    assert_eq!(validation.missing, vec![missing_a, missing_b]);

    client.delete_object(&present_a).await.unwrap();
    client.delete_object(&present_b).await.unwrap();
}

/// Batch downloads keep inputs with duplicate basenames apart.
#[tokio::test]
#[ignore = "requires R2"]
async fn test_download_refs_collision_proof() {
    dotenvy::dotenv().ok();

    let client = R2Client::from_env().await.expect("Failed to create client");

    let dir = tempfile::TempDir::new().unwrap();
    let local = dir.path().join("clip.mp4");

    tokio::fs::write(&local, b"first").await.unwrap();
    let ref_a = clip_key("test-user", "proj-a", "job-a", "clip.mp4").unwrap();
    client.upload_artifact(&local, &ref_a).await.unwrap();

    tokio::fs::write(&local, b"second").await.unwrap();
    let ref_b = clip_key("test-user", "proj-b", "job-b", "clip.mp4").unwrap();
    client.upload_artifact(&local, &ref_b).await.unwrap();

    let dest = tempfile::TempDir::new().unwrap();
    let downloads = client
        .download_refs(&[ref_a.clone(), ref_b.clone()], dest.path(), 2)
        .await
        .expect("Batch download failed");

    assert!(downloads.iter().all(|d| d.succeeded()));
    let paths: Vec<_> = downloads
        .iter()
        .map(|d| d.local_path.clone().unwrap())
        .collect();
    assert_ne!(paths[0], paths[1]);
    assert_eq!(tokio::fs::read(&paths[0]).await.unwrap(), b"first");
    assert_eq!(tokio::fs::read(&paths[1]).await.unwrap(), b"second");

    client.delete_object(&ref_a).await.unwrap();
    client.delete_object(&ref_b).await.unwrap();
}
