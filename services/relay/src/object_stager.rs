use crate::config::StorageConfig;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors raised while provisioning buckets or staging files
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Object store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Failed to create bucket {bucket}: {message}")]
    BucketCreateFailed { bucket: String, message: String },

    #[error("Source file {path} not readable: {message}")]
    SourceNotFound { path: String, message: String },

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Failed to presign URL: {0}")]
    PresignFailed(String),
}

/// A file staged in the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedObject {
    pub bucket: String,
    pub key: String,
    /// Time-limited GET URL for the object
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Bridge from shared file references to retrievable, time-limited URLs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Stager: Send + Sync {
    /// Create the bucket unless it already exists
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StagingError>;

    /// Upload the file behind `source_ref` under a fresh key and sign a GET
    /// URL for it that stays valid for `ttl`
    async fn upload_and_sign(
        &self,
        bucket: &str,
        source_ref: &str,
        ttl: Duration,
    ) -> Result<StagedObject, StagingError>;
}

/// S3-compatible stager (AWS S3, MinIO)
pub struct S3Stager {
    client: S3Client,
    region: String,
    input_mount: Option<PathBuf>,
    multipart_threshold_bytes: u64,
    part_size_bytes: usize,
}

impl S3Stager {
    /// Create a new S3 stager
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "relay-config",
            ));
        }

        let aws_config = loader.load().await;

        let s3_config = S3ConfigBuilder::from(&aws_config)
            .endpoint_url(config.endpoint_url())
            .force_path_style(config.force_path_style)
            .build();

        info!(
            endpoint = %config.endpoint_url(),
            region = %config.region,
            "S3 stager initialized"
        );

        Ok(Self::from_client(S3Client::from_conf(s3_config), config))
    }

    /// Wrap an already configured client
    pub fn from_client(client: S3Client, config: &StorageConfig) -> Self {
        Self {
            client,
            region: config.region.clone(),
            input_mount: config.input_mount.clone(),
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes,
        }
    }

    /// Get the S3 client
    pub fn client(&self) -> &S3Client {
        &self.client
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StagingError> {
        let mut request = self.client.create_bucket().bucket(bucket);

        // us-east-1 is the one region that rejects an explicit constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %bucket, "Bucket created");
                Ok(())
            }
            Err(e)
                if e.as_service_error()
                    .map(|se| se.is_bucket_already_owned_by_you())
                    .unwrap_or(false) =>
            {
                debug!(bucket = %bucket, "Bucket created concurrently");
                Ok(())
            }
            Err(e) if is_unreachable(&e) => Err(StagingError::StorageUnavailable(
                DisplayErrorContext(&e).to_string(),
            )),
            Err(e) => Err(StagingError::BucketCreateFailed {
                bucket: bucket.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }

    /// Single PUT for small files
    async fn simple_upload(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StagingError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StagingError::SourceNotFound {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StagingError::UploadFailed(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    /// Multipart upload for large files, aborted on failure
    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StagingError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StagingError::UploadFailed(DisplayErrorContext(&e).to_string()))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StagingError::UploadFailed("No upload ID in response".to_string()))?
            .to_string();

        let abort_guard = AbortOnDrop::new(abort_multipart_upload(
            self.client.clone(),
            bucket.to_string(),
            key.to_string(),
            upload_id.clone(),
        ));

        let completed_parts = match self.upload_parts(bucket, key, &upload_id, path).await {
            Ok(parts) => parts,
            Err(e) => {
                abort_guard.abort_now().await;
                return Err(e);
            }
        };

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
        {
            abort_guard.abort_now().await;
            return Err(StagingError::UploadFailed(
                DisplayErrorContext(&e).to_string(),
            ));
        }

        abort_guard.disarm();
        Ok(())
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        path: &Path,
    ) -> Result<Vec<CompletedPart>, StagingError> {
        let source_error = |e: std::io::Error| StagingError::SourceNotFound {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        let mut file = tokio::fs::File::open(path).await.map_err(source_error)?;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;

        loop {
            let mut chunk = Vec::with_capacity(self.part_size_bytes);
            (&mut file)
                .take(self.part_size_bytes as u64)
                .read_to_end(&mut chunk)
                .await
                .map_err(source_error)?;

            if chunk.is_empty() {
                break;
            }

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| StagingError::UploadFailed(DisplayErrorContext(&e).to_string()))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        Ok(completed_parts)
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        presigning_config: PresigningConfig,
    ) -> Result<String, StagingError> {
        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StagingError::PresignFailed(DisplayErrorContext(&e).to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

#[async_trait]
impl Stager for S3Stager {
    #[instrument(skip(self))]
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StagingError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!(bucket = %bucket, "Bucket is ready");
                Ok(())
            }
            Err(e) if is_missing_bucket(&e) => {
                info!(bucket = %bucket, "Bucket not found, creating");
                self.create_bucket(bucket).await
            }
            Err(e) => Err(StagingError::StorageUnavailable(
                DisplayErrorContext(&e).to_string(),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn upload_and_sign(
        &self,
        bucket: &str,
        source_ref: &str,
        ttl: Duration,
    ) -> Result<StagedObject, StagingError> {
        // Checked before anything is written
        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StagingError::PresignFailed(e.to_string()))?;
        let validity = chrono::Duration::from_std(ttl)
            .map_err(|e| StagingError::PresignFailed(e.to_string()))?;

        let path = resolve_source(self.input_mount.as_deref(), source_ref)?;
        let metadata =
            tokio::fs::metadata(&path)
                .await
                .map_err(|e| StagingError::SourceNotFound {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;

        if !metadata.is_file() {
            return Err(StagingError::SourceNotFound {
                path: path.display().to_string(),
                message: "not a regular file".to_string(),
            });
        }

        let key = object_key(&path, Utc::now(), Uuid::new_v4());
        let content_type = content_type_for(&path);

        debug!(
            key = %key,
            size_bytes = metadata.len(),
            "Uploading source file"
        );

        if metadata.len() > self.multipart_threshold_bytes {
            self.multipart_upload(bucket, &key, &path, content_type)
                .await?;
        } else {
            self.simple_upload(bucket, &key, &path, content_type).await?;
        }

        let url = self.presign_get(bucket, &key, presigning_config).await?;

        info!(
            bucket = %bucket,
            key = %key,
            size_bytes = metadata.len(),
            "Source file staged"
        );

        Ok(StagedObject {
            bucket: bucket.to_string(),
            key,
            url,
            expires_at: Utc::now() + validity,
        })
    }
}

/// Pending abort of a multipart upload.
///
/// Runs inline through [`AbortOnDrop::abort_now`], or on the runtime when the
/// guard is dropped while still armed, which happens when the upload future
/// is cancelled by a deadline or shutdown.
struct AbortOnDrop {
    abort: Option<BoxFuture<'static, ()>>,
}

impl AbortOnDrop {
    fn new(abort: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            abort: Some(Box::pin(abort)),
        }
    }

    async fn abort_now(mut self) {
        if let Some(abort) = self.abort.take() {
            abort.await;
        }
    }

    /// The upload completed; nothing to abort
    fn disarm(mut self) {
        self.abort = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(abort) = self.abort.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(abort);
            }
            Err(_) => warn!("No runtime left to abort an interrupted multipart upload"),
        }
    }
}

async fn abort_multipart_upload(
    client: S3Client,
    bucket: String,
    key: String,
    upload_id: String,
) {
    match client
        .abort_multipart_upload()
        .bucket(&bucket)
        .key(&key)
        .upload_id(&upload_id)
        .send()
        .await
    {
        Ok(_) => debug!(key = %key, "Multipart upload aborted"),
        Err(e) => warn!(
            key = %key,
            error = %DisplayErrorContext(&e),
            "Failed to abort multipart upload"
        ),
    }
}

fn is_unreachable<E, R>(err: &SdkError<E, R>) -> bool {
    matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
    )
}

fn is_missing_bucket<R>(err: &SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError, R>) -> bool {
    err.as_service_error()
        .map(|e| e.is_not_found())
        .unwrap_or(false)
}

/// Resolve a `source-file-location` against the input mount.
///
/// Absolute paths are taken as-is, relative ones are joined onto the mount,
/// and any `..` component is refused.
pub fn resolve_source(input_mount: Option<&Path>, source_ref: &str) -> Result<PathBuf, StagingError> {
    let not_found = |message: &str| StagingError::SourceNotFound {
        path: source_ref.to_string(),
        message: message.to_string(),
    };

    if source_ref.trim().is_empty() {
        return Err(not_found("empty reference"));
    }

    let path = Path::new(source_ref);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(not_found("parent directory references are not allowed"));
    }

    match input_mount {
        Some(mount) if path.is_relative() => Ok(mount.join(path)),
        _ => Ok(path.to_path_buf()),
    }
}

/// Object key for a staged file
/// Format: {date}/{unique_id}/{file_name}
///
/// The unique segment keeps repeated uploads of the same source apart.
pub fn object_key(path: &Path, now: DateTime<Utc>, unique_id: Uuid) -> String {
    let file_name = path
        .file_name()
        .map(|name| sanitize_file_name(&name.to_string_lossy()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "source".to_string());

    format!(
        "{date}/{unique_id}/{file_name}",
        date = now.format("%Y-%m-%d"),
    )
}

/// Restrict a file name to characters that are safe in any object key
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

/// Get content type from the file extension
fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
