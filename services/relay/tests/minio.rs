//! Object store integration tests against a throwaway MinIO container.
//!
//! Requires Docker: `cargo test -- --ignored`

use adaptation_relay::config::StorageConfig;
use adaptation_relay::{provision_buckets, S3Stager, Stager, StagingError};
use std::path::Path;
use std::time::Duration;
use testcontainers::clients::Cli;
use testcontainers::core::WaitFor;
use testcontainers::{Container, GenericImage, RunnableImage};

const MINIO_PORT: u16 = 9000;
const ACCESS_KEY: &str = "minioadmin";
const SECRET_KEY: &str = "minioadmin";

fn minio(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("minio/minio", "RELEASE.2024-01-16T16-07-38Z")
        .with_env_var("MINIO_ROOT_USER", ACCESS_KEY)
        .with_env_var("MINIO_ROOT_PASSWORD", SECRET_KEY)
        .with_exposed_port(MINIO_PORT)
        .with_wait_for(WaitFor::message_on_stdout("API:"));

    let args = vec!["server".to_string(), "/data".to_string()];
    docker.run(RunnableImage::from((image, args)))
}

fn storage_config(port: u16, input_mount: &Path) -> StorageConfig {
    StorageConfig {
        endpoint: format!("127.0.0.1:{port}"),
        access_key: Some(ACCESS_KEY.to_string()),
        secret_key: Some(SECRET_KEY.to_string()),
        use_tls: false,
        region: "us-east-1".to_string(),
        force_path_style: true,
        source_bucket: "sources".to_string(),
        clean_bucket: Some("clean".to_string()),
        input_mount: Some(input_mount.to_path_buf()),
        presigned_url_ttl_secs: 3600,
        multipart_threshold_bytes: 5 * 1024 * 1024,
        part_size_bytes: 5 * 1024 * 1024,
    }
}

async fn fetch(url: &str) -> reqwest::Response {
    reqwest::get(url).await.expect("Failed to fetch presigned URL")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_bucket_provisioning_is_idempotent() {
    let docker = Cli::default();
    let node = minio(&docker);
    let mount = tempfile::tempdir().unwrap();
    let config = storage_config(node.get_host_port_ipv4(MINIO_PORT), mount.path());

    let stager = S3Stager::new(&config).await.unwrap();

    provision_buckets(&stager, &["sources", "clean"]).await.unwrap();
    provision_buckets(&stager, &["sources", "clean"]).await.unwrap();

    stager
        .client()
        .head_bucket()
        .bucket("clean")
        .send()
        .await
        .expect("clean bucket should exist");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upload_and_sign_serves_file_contents() {
    let docker = Cli::default();
    let node = minio(&docker);
    let mount = tempfile::tempdir().unwrap();
    let config = storage_config(node.get_host_port_ipv4(MINIO_PORT), mount.path());

    let contents = b"%PDF-1.7 adaptation relay test document".to_vec();
    std::fs::write(mount.path().join("report.pdf"), &contents).unwrap();

    let stager = S3Stager::new(&config).await.unwrap();
    stager.ensure_bucket("sources").await.unwrap();

    let staged = stager
        .upload_and_sign("sources", "report.pdf", Duration::from_secs(3600))
        .await
        .unwrap();

    assert_eq!(staged.bucket, "sources");
    assert!(staged.key.ends_with("/report.pdf"));

    let response = fetch(&staged.url).await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/pdf")
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), contents.as_slice());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_large_file_uses_multipart_upload() {
    let docker = Cli::default();
    let node = minio(&docker);
    let mount = tempfile::tempdir().unwrap();
    let config = storage_config(node.get_host_port_ipv4(MINIO_PORT), mount.path());

    // Two full parts and a short tail
    let contents: Vec<u8> = (0..(11 * 1024 * 1024)).map(|i| (i % 251) as u8).collect();
    std::fs::write(mount.path().join("large.bin"), &contents).unwrap();

    let stager = S3Stager::new(&config).await.unwrap();
    stager.ensure_bucket("sources").await.unwrap();

    let staged = stager
        .upload_and_sign("sources", "large.bin", Duration::from_secs(600))
        .await
        .unwrap();

    let body = fetch(&staged.url).await.bytes().await.unwrap();
    assert_eq!(body.len(), contents.len());
    assert!(body.as_ref() == contents.as_slice());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_presigned_url_expires() {
    let docker = Cli::default();
    let node = minio(&docker);
    let mount = tempfile::tempdir().unwrap();
    let config = storage_config(node.get_host_port_ipv4(MINIO_PORT), mount.path());

    std::fs::write(mount.path().join("short-lived.txt"), b"expires soon").unwrap();

    let stager = S3Stager::new(&config).await.unwrap();
    stager.ensure_bucket("sources").await.unwrap();

    let staged = stager
        .upload_and_sign("sources", "short-lived.txt", Duration::from_secs(1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    let response = fetch(&staged.url).await;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_missing_source_is_reported() {
    let docker = Cli::default();
    let node = minio(&docker);
    let mount = tempfile::tempdir().unwrap();
    let config = storage_config(node.get_host_port_ipv4(MINIO_PORT), mount.path());

    let stager = S3Stager::new(&config).await.unwrap();
    stager.ensure_bucket("sources").await.unwrap();

    let err = stager
        .upload_and_sign("sources", "does-not-exist.pdf", Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, StagingError::SourceNotFound { .. }));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_interrupted_multipart_upload_leaves_no_parts() {
    let docker = Cli::default();
    let node = minio(&docker);
    let mount = tempfile::tempdir().unwrap();
    let config = storage_config(node.get_host_port_ipv4(MINIO_PORT), mount.path());

    let contents: Vec<u8> = (0..(32 * 1024 * 1024)).map(|i| (i % 251) as u8).collect();
    std::fs::write(mount.path().join("huge.bin"), &contents).unwrap();

    let stager = S3Stager::new(&config).await.unwrap();
    stager.ensure_bucket("sources").await.unwrap();

    let upload = stager.upload_and_sign("sources", "huge.bin", Duration::from_secs(600));
    let _ = tokio::time::timeout(Duration::from_millis(200), upload).await;

    // Give the spawned abort time to reach the store
    tokio::time::sleep(Duration::from_secs(2)).await;

    let pending = stager
        .client()
        .list_multipart_uploads()
        .bucket("sources")
        .send()
        .await
        .unwrap();
    assert!(pending.uploads().is_empty());
}
