use crate::config::BlobConfig;
use crate::error::{GateError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument};

/// Reference to one blob: container plus the key within it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub container: String,
    pub key: String,
}

impl BlobRef {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Last path segment of the key
    pub fn filename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Sibling of this blob in another folder of the same container,
    /// keeping the filename unchanged
    pub fn sibling_in_folder(&self, folder: &str) -> BlobRef {
        BlobRef::new(&self.container, format!("{}/{}", folder, self.filename()))
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

/// Terminal or pending status of a server-side copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Failed(String),
}

/// Exclusive claim on a source blob, held while moving it
#[derive(Debug, Clone)]
pub struct Lease {
    pub lock_key: String,
}

/// Blob storage capability consumed by the workflow.
///
/// The workflow core only depends on this trait; the S3 binding below is one
/// implementation. All keys are container-relative.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List every blob under `prefix` in `container`
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<BlobRef>>;

    /// Open a blob for streaming reads.
    ///
    /// Fails with [`GateError::BlobNotFound`] when the blob doesn't exist.
    async fn open(&self, blob: &BlobRef) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Start a server-side copy of `src` to `dst`
    async fn begin_copy(&self, src: &BlobRef, dst: &BlobRef) -> Result<()>;

    /// Current status of a copy targeting `dst`
    async fn copy_status(&self, dst: &BlobRef) -> Result<CopyStatus>;

    /// Delete a blob. Deleting a blob that's already gone is not an error.
    async fn delete(&self, blob: &BlobRef) -> Result<()>;

    /// Try to take a time-bounded exclusive lease on a blob.
    ///
    /// `Ok(None)` means another holder currently owns the lease; that's an
    /// expected outcome, not an error. Expired leases may be broken.
    async fn acquire_lease(&self, blob: &BlobRef, duration: Duration) -> Result<Option<Lease>>;

    /// Release a lease taken with [`BlobStore::acquire_lease`]
    async fn release_lease(&self, blob: &BlobRef, lease: &Lease) -> Result<()>;
}

/// S3-backed blob store
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    /// Create an S3 blob store from service configuration
    pub async fn new(config: &BlobConfig) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "S3 blob store initialized");

        Ok(Self { client })
    }

    fn lock_key(blob: &BlobRef) -> String {
        format!("{}.lock", blob.key)
    }

    /// A vanished copy source comes back as a `NoSuchKey` service error;
    /// callers treat that as a concurrent mover having won, so it must not
    /// classify as a plain storage failure.
    fn classify_copy_error(code: Option<&str>, src: &BlobRef, detail: String) -> GateError {
        match code {
            Some("NoSuchKey") => GateError::BlobNotFound {
                key: src.to_string(),
            },
            _ => GateError::Storage(detail),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self))]
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<BlobRef>> {
        let mut blobs = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(container)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                req = req.continuation_token(token);
            }

            let response = req
                .send()
                .await
                .map_err(|e| GateError::Storage(format!("list '{container}/{prefix}': {e}")))?;

            blobs.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    // lease lock objects are bookkeeping, not batch files
                    .filter(|key| !key.ends_with(".lock"))
                    .map(|key| BlobRef::new(container, key)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!(container = %container, prefix = %prefix, count = blobs.len(), "Listed blobs");
        Ok(blobs)
    }

    async fn open(&self, blob: &BlobRef) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let response = self
            .client
            .get_object()
            .bucket(&blob.container)
            .key(&blob.key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                    GateError::BlobNotFound {
                        key: blob.to_string(),
                    }
                } else {
                    GateError::Storage(format!("open '{blob}': {e}"))
                }
            })?;

        Ok(Box::new(response.body.into_async_read()))
    }

    #[instrument(skip(self))]
    async fn begin_copy(&self, src: &BlobRef, dst: &BlobRef) -> Result<()> {
        self.client
            .copy_object()
            .copy_source(format!("{}/{}", src.container, src.key))
            .bucket(&dst.container)
            .key(&dst.key)
            .send()
            .await
            .map_err(|e| {
                Self::classify_copy_error(e.code(), src, format!("copy '{src}' -> '{dst}': {e}"))
            })?;

        Ok(())
    }

    async fn copy_status(&self, dst: &BlobRef) -> Result<CopyStatus> {
        match self
            .client
            .head_object()
            .bucket(&dst.container)
            .key(&dst.key)
            .send()
            .await
        {
            Ok(_) => Ok(CopyStatus::Success),
            Err(e) => {
                if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) {
                    Ok(CopyStatus::Pending)
                } else {
                    Ok(CopyStatus::Failed(format!("head '{dst}': {e}")))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, blob: &BlobRef) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&blob.container)
            .key(&blob.key)
            .send()
            .await
            .map_err(|e| GateError::Storage(format!("delete '{blob}': {e}")))?;

        debug!(blob = %blob, "Blob deleted");
        Ok(())
    }

    async fn acquire_lease(&self, blob: &BlobRef, duration: Duration) -> Result<Option<Lease>> {
        let lock_key = Self::lock_key(blob);
        let expires_at = (Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default())
            .to_rfc3339();

        let put = self
            .client
            .put_object()
            .bucket(&blob.container)
            .key(&lock_key)
            .if_none_match("*")
            .metadata("expires-at", &expires_at)
            .body(ByteStream::from_static(b""))
            .send()
            .await;

        match put {
            Ok(_) => Ok(Some(Lease { lock_key })),
            Err(e) => {
                // Precondition failure: somebody else holds the lock. Break
                // it only if its expiry has passed (holder crashed mid-move).
                let head = self
                    .client
                    .head_object()
                    .bucket(&blob.container)
                    .key(&lock_key)
                    .send()
                    .await;

                let expired = match head {
                    Ok(out) => out
                        .metadata()
                        .and_then(|m| m.get("expires-at"))
                        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                        .map(|t| t < Utc::now())
                        .unwrap_or(false),
                    // lock vanished between put and head; treat as contended
                    Err(_) => false,
                };

                if !expired {
                    debug!(blob = %blob, error = %e, "Lease held elsewhere");
                    return Ok(None);
                }

                self.client
                    .delete_object()
                    .bucket(&blob.container)
                    .key(&lock_key)
                    .send()
                    .await
                    .map_err(|e| GateError::Storage(format!("break lease '{blob}': {e}")))?;

                // one more attempt after breaking the stale lock
                match self
                    .client
                    .put_object()
                    .bucket(&blob.container)
                    .key(&lock_key)
                    .if_none_match("*")
                    .metadata("expires-at", &expires_at)
                    .body(ByteStream::from_static(b""))
                    .send()
                    .await
                {
                    Ok(_) => Ok(Some(Lease { lock_key })),
                    Err(_) => Ok(None),
                }
            }
        }
    }

    async fn release_lease(&self, blob: &BlobRef, lease: &Lease) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&blob.container)
            .key(&lease.lock_key)
            .send()
            .await
            .map_err(|e| GateError::Storage(format!("release lease '{blob}': {e}")))?;

        Ok(())
    }
}
