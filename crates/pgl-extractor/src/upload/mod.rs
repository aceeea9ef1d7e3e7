//! Artifact upload
//!
//! [`ObjectBackend`] is the seam between the pipeline and a concrete object
//! store. [`UploadDispatcher`] bounds how many puts run at once across the
//! whole process and retries transient and throttled failures with backoff.
//! A put is a single request carrying the whole artifact, so an object is
//! either fully present under its key or absent.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{ErrorKind, ExtractError, Result};
use crate::retry::RetryPolicy;
use crate::serialize::Artifact;

mod azure;
mod memory;
mod s3;

pub use azure::AzureBlobBackend;
pub use memory::MemoryBackend;
pub use s3::S3Backend;

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Human readable target, e.g. `s3://bucket`
    fn describe(&self) -> String;

    /// Store `data` under `key`, returning the object's URI
    async fn put(&self, key: &str, data: Bytes) -> Result<String>;
}

/// Outcome of delivering one artifact to one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadResult {
    Uploaded {
        key: String,
        destination: String,
        uri: String,
        attempts: u32,
        retries: u32,
        bytes: u64,
    },
    Failed {
        key: String,
        destination: String,
        /// Artifact kept on disk for a later re-upload
        local_path: PathBuf,
        attempts: u32,
        error: String,
        kind: ErrorKind,
    },
}

impl UploadResult {
    pub fn key(&self) -> &str {
        match self {
            UploadResult::Uploaded { key, .. } | UploadResult::Failed { key, .. } => key,
        }
    }

    pub fn destination(&self) -> &str {
        match self {
            UploadResult::Uploaded { destination, .. } | UploadResult::Failed { destination, .. } => destination,
        }
    }

    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadResult::Uploaded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            UploadResult::Uploaded { attempts, .. } | UploadResult::Failed { attempts, .. } => *attempts,
        }
    }

    /// The failure as an error, for propagating into a table job
    pub fn to_error(&self) -> Option<ExtractError> {
        match self {
            UploadResult::Uploaded { .. } => None,
            UploadResult::Failed {
                key,
                destination,
                attempts,
                error,
                ..
            } => Some(ExtractError::UploadFailed {
                key: key.clone(),
                attempts: *attempts,
                reason: format!("{}: {}", destination, error),
            }),
        }
    }
}

/// Process-wide upload concurrency and retry
#[derive(Clone)]
pub struct UploadDispatcher {
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl UploadDispatcher {
    pub fn new(max_concurrent: usize, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry,
            cancel,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Upload one artifact, deleting the local file once it is stored
    #[instrument(skip_all, fields(key = %artifact.key))]
    pub async fn upload(&self, artifact: &Artifact, backend: &dyn ObjectBackend) -> UploadResult {
        let data = match self.load(artifact).await {
            Ok(data) => data,
            Err(e) => return self.failed(artifact, &backend.describe(), 0, &e),
        };

        let result = self.put(artifact, data, backend).await;
        if result.is_uploaded() {
            discard(artifact).await;
        }
        result
    }

    /// Upload one artifact to every destination, one result per destination
    ///
    /// Destinations are written concurrently, each with its own retries. The
    /// local file is deleted only once every destination holds the object.
    #[instrument(skip_all, fields(key = %artifact.key, destinations = backends.len()))]
    pub async fn upload_to_all(&self, artifact: &Artifact, backends: &[Arc<dyn ObjectBackend>]) -> Vec<UploadResult> {
        let data = match self.load(artifact).await {
            Ok(data) => data,
            Err(e) => {
                return backends
                    .iter()
                    .map(|backend| self.failed(artifact, &backend.describe(), 0, &e))
                    .collect()
            },
        };

        let results = future::join_all(
            backends
                .iter()
                .map(|backend| self.put(artifact, data.clone(), backend.as_ref())),
        )
        .await;

        if results.iter().all(UploadResult::is_uploaded) {
            discard(artifact).await;
        }
        results
    }

    async fn put(&self, artifact: &Artifact, data: Bytes, backend: &dyn ObjectBackend) -> UploadResult {
        let bytes = data.len() as u64;
        let destination = backend.describe();

        let operation = format!("upload {} to {}", artifact.key, destination);
        let permits = &self.permits;
        let outcome = self
            .retry
            .run_counted(&operation, &self.cancel, |_| {
                let data = data.clone();
                async move {
                    let _permit = permits
                        .acquire()
                        .await
                        .map_err(|_| ExtractError::Cancelled)?;
                    backend.put(&artifact.key, data).await
                }
            })
            .await;

        let attempts = outcome.attempts;
        let retries = outcome.retries();
        match outcome.result {
            Ok(uri) => {
                info!(
                    "Uploaded {} ({} bytes, {} attempt(s))",
                    uri, bytes, attempts
                );
                UploadResult::Uploaded {
                    key: artifact.key.clone(),
                    destination,
                    uri,
                    attempts,
                    retries,
                    bytes,
                }
            },
            Err(e) => self.failed(artifact, &destination, attempts, &e),
        }
    }

    async fn load(&self, artifact: &Artifact) -> Result<Bytes> {
        let data = tokio::fs::read(&artifact.path).await?;
        let actual = pgl_common::checksum::checksum_bytes(&data);
        if actual != artifact.sha256 {
            return Err(pgl_common::CommonError::ChecksumMismatch {
                path: artifact.path.display().to_string(),
                expected: artifact.sha256.clone(),
                actual,
            }
            .into());
        }
        Ok(Bytes::from(data))
    }

    fn failed(&self, artifact: &Artifact, destination: &str, attempts: u32, e: &ExtractError) -> UploadResult {
        error!(
            "Upload of {} to {} failed after {} attempt(s): {}; artifact kept at {}",
            artifact.key,
            destination,
            attempts,
            e,
            artifact.path.display()
        );
        UploadResult::Failed {
            key: artifact.key.clone(),
            destination: destination.to_string(),
            local_path: artifact.path.clone(),
            attempts,
            error: e.to_string(),
            kind: e.kind(),
        }
    }
}

async fn discard(artifact: &Artifact) {
    if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
        warn!("Could not remove {}: {}", artifact.path.display(), e);
    }
}
