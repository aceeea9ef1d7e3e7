//! One table, end to end
//!
//! ```text
//! producer task --batches--> normalize + serialize --artifacts--> upload task
//! ```
//!
//! Both hops are bounded channels, so a slow destination throttles the
//! source instead of filling the disk. Batches are normalized and written in
//! extraction order.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CoercionFailurePolicy;
use crate::error::ExtractError;
use crate::extract::Extractor;
use crate::introspect::Introspector;
use crate::model::{Checkpoint, TableRef};
use crate::normalize::{NormalizedSchema, Normalizer, Stamps};
use crate::report::{JobStage, TableJob, TableReport};
use crate::retry::RetryPolicy;
use crate::serialize::{Artifact, ArtifactNaming, ArtifactWriter};
use crate::source::SourceDatabase;
use crate::upload::{ObjectBackend, UploadDispatcher, UploadResult};

/// Effective per-table settings after tenant overrides
#[derive(Debug, Clone)]
pub struct TableSettings {
    pub batch_size: usize,
    pub channel_capacity: usize,
    pub max_artifact_bytes: u64,
    pub work_dir: PathBuf,
    pub on_coercion_error: CoercionFailurePolicy,
    pub retry: RetryPolicy,
}

/// Everything a tenant's table jobs share
pub struct TablePipeline {
    pub tenant: String,
    pub prefix: Option<String>,
    pub source: Arc<dyn SourceDatabase>,
    /// Every artifact goes to each of these
    pub backends: Vec<Arc<dyn ObjectBackend>>,
    pub normalizer: Arc<Normalizer>,
    pub stamps: Stamps,
    pub uploads: UploadDispatcher,
    pub settings: TableSettings,
    pub run_started: DateTime<Utc>,
    pub cancel: CancellationToken,
}

type StageError = (JobStage, ExtractError);

impl TablePipeline {
    /// Run one table job; failures end up in the report, never as an error
    pub async fn run(&self, table: &TableRef) -> TableReport {
        let start = Instant::now();
        let mut job = TableJob::new();
        let mut report = TableReport::new(table.to_string());

        info!("Starting table {} for tenant {}", table, self.tenant);

        if let Err((stage, e)) = self.drive(table, &mut job, &mut report).await {
            error!(
                "Table {} of tenant {} failed while {}: {}",
                table, self.tenant, stage, e
            );
            job.fail_at(stage, &e);
        }
        job.complete();

        report.state = job.state().clone();
        report.duration_secs = start.elapsed().as_secs_f64();

        if report.is_completed() {
            info!(
                "Completed table {} for tenant {}: {} rows in {} artifact(s) in {:.2}s",
                table,
                self.tenant,
                report.rows_written,
                report.artifacts.len(),
                report.duration_secs
            );
        }
        report
    }

    async fn drive(&self, table: &TableRef, job: &mut TableJob, report: &mut TableReport) -> Result<(), StageError> {
        job.enter(JobStage::Describing);
        let introspector = Introspector::new(Arc::clone(&self.source), self.settings.retry, self.cancel.clone());
        let descriptor = introspector
            .describe(table)
            .await
            .map_err(|e| (JobStage::Describing, e))?;

        let schema = self
            .normalizer
            .plan(&descriptor, &self.stamps)
            .map(Arc::new)
            .map_err(|e| (JobStage::Normalizing, e))?;

        let naming = ArtifactNaming::new(
            self.prefix.as_deref(),
            &self.tenant,
            table.to_string(),
            self.run_started,
        );
        let writer = ArtifactWriter::new(
            naming,
            Arc::clone(&schema),
            &self.settings.work_dir,
            self.settings.max_artifact_bytes,
        )
        .map_err(|e| (JobStage::Serializing, e))?;

        job.enter(JobStage::Extracting);
        let producer_cancel = self.cancel.child_token();
        let extractor = Extractor::new(
            Arc::clone(&self.source),
            self.settings.batch_size,
            self.settings.retry,
            producer_cancel.clone(),
        );
        let (batches, producer) =
            extractor.spawn(Arc::new(descriptor), Checkpoint::start(), self.settings.channel_capacity);

        let (artifact_tx, artifact_rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let uploader = tokio::spawn(upload_all(
            self.uploads.clone(),
            self.backends.clone(),
            artifact_rx,
            self.settings.channel_capacity.max(1),
        ));

        let streamed = self
            .stream_batches(&schema, batches, writer, artifact_tx, job, report)
            .await;
        if streamed.is_err() {
            producer_cancel.cancel();
        }

        report.checkpoint = producer.await.unwrap_or_default();
        for delivery in uploader.await.unwrap_or_default() {
            if delivery.results.iter().all(UploadResult::is_uploaded) {
                report.rows_written += delivery.rows;
            }
            report.artifacts.extend(delivery.results);
        }
        streamed?;

        job.enter(JobStage::Uploading);
        if let Some(e) = report.artifacts.iter().find_map(UploadResult::to_error) {
            return Err((JobStage::Uploading, e));
        }
        Ok(())
    }

    async fn stream_batches(
        &self,
        schema: &Arc<NormalizedSchema>,
        mut batches: mpsc::Receiver<crate::error::Result<crate::model::RecordBatch>>,
        mut writer: ArtifactWriter,
        artifacts: mpsc::Sender<Artifact>,
        job: &mut TableJob,
        report: &mut TableReport,
    ) -> Result<(), StageError> {
        let policy = self.settings.on_coercion_error;

        while let Some(next) = batches.recv().await {
            let batch = next.map_err(|e| (JobStage::Extracting, e))?;
            report.rows_extracted += batch.len() as u64;

            job.enter(JobStage::Normalizing);
            let sequence = batch.sequence;
            let normalized = match self.normalizer.normalize(schema, batch, policy) {
                Ok(normalized) => normalized,
                Err(e @ ExtractError::Coercion { .. }) if policy == CoercionFailurePolicy::FailBatch => {
                    warn!("{}: dropping batch {}: {}", schema.table, sequence, e);
                    report.batches_dropped += 1;
                    continue;
                },
                Err(e) => return Err((JobStage::Normalizing, e)),
            };
            report.rows_skipped += normalized.skipped_rows;
            report.values_truncated += normalized.truncated_values;

            job.enter(JobStage::Serializing);
            if let Some(artifact) = writer.write(&normalized).map_err(|e| (JobStage::Serializing, e))? {
                send_artifact(&artifacts, artifact).await?;
            }
        }

        if let Some(artifact) = writer.finish().map_err(|e| (JobStage::Serializing, e))? {
            send_artifact(&artifacts, artifact).await?;
        }
        Ok(())
    }
}

async fn send_artifact(artifacts: &mpsc::Sender<Artifact>, artifact: Artifact) -> Result<(), StageError> {
    artifacts.send(artifact).await.map_err(|_| {
        (
            JobStage::Uploading,
            ExtractError::Serialization("upload task stopped before all artifacts were handed over".into()),
        )
    })
}

/// One artifact's rows and its result at every destination
#[derive(Debug)]
struct Delivery {
    rows: u64,
    results: Vec<UploadResult>,
}

/// Upload artifacts as they arrive, keeping at most `in_flight` per table
async fn upload_all(
    uploads: UploadDispatcher,
    backends: Vec<Arc<dyn ObjectBackend>>,
    artifacts: mpsc::Receiver<Artifact>,
    in_flight: usize,
) -> Vec<Delivery> {
    let backends = Arc::new(backends);
    stream::unfold(artifacts, |mut rx| async move { rx.recv().await.map(|a| (a, rx)) })
        .map(|artifact| {
            let uploads = uploads.clone();
            let backends = Arc::clone(&backends);
            async move {
                Delivery {
                    rows: artifact.rows,
                    results: uploads.upload_to_all(&artifact, &backends).await,
                }
            }
        })
        .buffered(in_flight)
        .collect()
        .await
}
