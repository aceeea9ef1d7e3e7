//! Tenant orchestration
//!
//! Tenants are processed with bounded parallelism (sequential by default) and
//! are isolated from each other: whatever happens to one tenant ends up in
//! its [`TenantReport`] and never stops the others. Within a tenant, table
//! jobs fan out with `buffered`, so reports keep configuration order.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{RunSettings, TenantConfig};
use crate::connector::TenantConnector;
use crate::dictionary::TypeDictionary;
use crate::error::{ExtractError, Result};
use crate::introspect::Introspector;
use crate::model::TableRef;
use crate::normalize::{NormalizedBatch, NormalizedSchema, Normalizer, Stamps};
use crate::pipeline::{TablePipeline, TableSettings};
use crate::report::{RunReport, TenantReport, TenantStatus};
use crate::serialize::{ArtifactNaming, ArtifactWriter};
use crate::source::SourceDatabase;
use crate::upload::{ObjectBackend, UploadDispatcher, UploadResult};

/// Table name under which the completion marker is written
pub const MARKER_TABLE: &str = "_marker";

/// Marker column holding the run start
pub const MARKER_RUN_COLUMN: &str = "run_timestamp";

/// Marker column holding the tenant's company id
pub const MARKER_COMPANY_COLUMN: &str = "company_id";

pub struct Orchestrator {
    settings: RunSettings,
    dictionary: Arc<TypeDictionary>,
    connector: Arc<dyn TenantConnector>,
    cancel: CancellationToken,
    run_started: DateTime<Utc>,
    table_filter: Vec<TableRef>,
}

impl Orchestrator {
    pub fn new(settings: RunSettings, dictionary: Arc<TypeDictionary>, connector: Arc<dyn TenantConnector>) -> Self {
        Self {
            settings,
            dictionary,
            connector,
            cancel: CancellationToken::new(),
            run_started: Utc::now(),
            table_filter: Vec::new(),
        }
    }

    /// Share an externally owned token, e.g. one cancelled on Ctrl-C
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fix the run timestamp used in keys and stamps
    pub fn with_run_started(mut self, run_started: DateTime<Utc>) -> Self {
        self.run_started = run_started;
        self
    }

    /// Only run tables matching one of `tables`
    pub fn with_table_filter(mut self, tables: Vec<TableRef>) -> Self {
        self.table_filter = tables;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_started(&self) -> DateTime<Utc> {
        self.run_started
    }

    /// Process every tenant and report on all of them
    pub async fn run(&self, tenants: &[TenantConfig]) -> RunReport {
        let concurrency = self.settings.max_concurrent_tenants.max(1);
        let uploads = UploadDispatcher::new(
            self.settings.max_concurrent_uploads,
            self.settings.retry,
            self.cancel.clone(),
        );

        info!(
            "Starting run {} for {} tenants (concurrency={})",
            self.run_started.format("%Y-%m-%dT%H:%M:%SZ"),
            tenants.len(),
            concurrency
        );

        let reports = stream::iter(tenants.iter().enumerate())
            .map(|(index, tenant)| {
                let uploads = uploads.clone();
                async move {
                    info!(
                        "Starting tenant {} ({} / {})",
                        tenant.name,
                        index + 1,
                        tenants.len()
                    );
                    self.run_tenant(tenant, uploads).await
                }
            })
            .buffered(concurrency)
            .collect::<Vec<_>>()
            .await;

        RunReport {
            started_at: self.run_started,
            finished_at: Utc::now(),
            tenants: reports,
        }
    }

    async fn run_tenant(&self, tenant: &TenantConfig, uploads: UploadDispatcher) -> TenantReport {
        let start = Instant::now();
        let max_tables = tenant.max_concurrent_tables(&self.settings).max(1);

        let (source, backends, tables) = match self.prepare(tenant, max_tables).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Tenant {} failed before extraction: {}", tenant.name, e);
                return TenantReport::failed(&tenant.name, &e, start.elapsed().as_secs_f64());
            },
        };

        let targets = backends.iter().map(|b| b.describe()).collect::<Vec<_>>().join(", ");
        info!(
            "Tenant {}: {} tables to {} (concurrency={})",
            tenant.name,
            tables.len(),
            targets,
            max_tables
        );

        let pipeline = TablePipeline {
            tenant: tenant.name.clone(),
            prefix: tenant.prefix.clone(),
            source,
            backends: backends.clone(),
            normalizer: Arc::new(Normalizer::new(Arc::clone(&self.dictionary), self.settings.datetime)),
            stamps: Stamps::for_tenant(tenant, self.run_started),
            uploads: uploads.clone(),
            settings: TableSettings {
                batch_size: tenant.batch_size(&self.settings),
                channel_capacity: self.settings.channel_capacity,
                max_artifact_bytes: self.settings.max_artifact_bytes,
                work_dir: self.settings.work_dir.clone(),
                on_coercion_error: tenant.coercion_policy(&self.settings),
                retry: self.settings.retry,
            },
            run_started: self.run_started,
            cancel: self.cancel.clone(),
        };

        let table_reports = stream::iter(tables.iter())
            .map(|table| pipeline.run(table))
            .buffered(max_tables)
            .collect::<Vec<_>>()
            .await;

        let mut report = TenantReport::from_tables(&tenant.name, table_reports, 0.0);

        if tenant.publish_marker && report.status == TenantStatus::Succeeded {
            let markers = self.publish_marker(tenant, &uploads, &backends).await;
            if let Some(e) = markers.iter().find_map(UploadResult::to_error) {
                warn!("Tenant {}: completion marker not published: {}", tenant.name, e);
                report.status = TenantStatus::Partial;
                report.error = Some(e.to_string());
                report.error_kind = Some(e.kind());
            }
            report.markers = markers;
        }

        report.duration_secs = start.elapsed().as_secs_f64();
        info!(
            "Finished tenant {} ({:?}) in {:.2}s",
            tenant.name, report.status, report.duration_secs
        );
        report
    }

    /// Connect, build the destinations, and decide which tables to run
    async fn prepare(
        &self,
        tenant: &TenantConfig,
        max_tables: usize,
    ) -> Result<(Arc<dyn SourceDatabase>, Vec<Arc<dyn ObjectBackend>>, Vec<TableRef>)> {
        let pool_size = u32::try_from(max_tables).unwrap_or(u32::MAX);
        let connector = &self.connector;
        let operation = format!("connect tenant {}", tenant.name);
        let source = self
            .settings
            .retry
            .run(&operation, &self.cancel, |_| async move {
                let source = connector.source(tenant, pool_size).await?;
                source.ping().await?;
                Ok(source)
            })
            .await?;
        info!("Tenant {}: connected to {}", tenant.name, source.describe_location());

        let backends = self.connector.backends(tenant).await?;
        if backends.is_empty() {
            return Err(ExtractError::Config(format!("tenant '{}' has no destination", tenant.name)));
        }

        let introspector = Introspector::new(Arc::clone(&source), self.settings.retry, self.cancel.clone());
        let mut tables = introspector.resolve_tables(&tenant.tables).await?;
        if !self.table_filter.is_empty() {
            tables.retain(|t| self.table_filter.iter().any(|f| f.matches(t)));
        }

        Ok((source, backends, tables))
    }

    /// One-row artifact announcing that every table of the tenant landed
    async fn publish_marker(
        &self,
        tenant: &TenantConfig,
        uploads: &UploadDispatcher,
        backends: &[Arc<dyn ObjectBackend>],
    ) -> Vec<UploadResult> {
        match self.write_marker(tenant) {
            Ok(artifact) => {
                let results = uploads.upload_to_all(&artifact, backends).await;
                for result in results.iter().filter(|r| r.is_uploaded()) {
                    info!(
                        "Tenant {}: published completion marker {} to {}",
                        tenant.name,
                        result.key(),
                        result.destination()
                    );
                }
                results
            },
            Err(e) => backends
                .iter()
                .map(|backend| UploadResult::Failed {
                    key: MARKER_TABLE.to_string(),
                    destination: backend.describe(),
                    local_path: self.settings.work_dir.clone(),
                    attempts: 0,
                    error: e.to_string(),
                    kind: e.kind(),
                })
                .collect(),
        }
    }

    fn write_marker(&self, tenant: &TenantConfig) -> Result<crate::serialize::Artifact> {
        let mut stamps = Stamps::new().timestamp(MARKER_RUN_COLUMN, self.run_started.naive_utc());
        if let Some(company_id) = &tenant.company_id {
            stamps = stamps.text(MARKER_COMPANY_COLUMN, company_id);
        }
        let schema = Arc::new(NormalizedSchema::constants(MARKER_TABLE, &stamps, self.settings.datetime));

        let naming = ArtifactNaming::new(tenant.prefix.as_deref(), &tenant.name, MARKER_TABLE, self.run_started);
        let mut writer = ArtifactWriter::new(
            naming,
            Arc::clone(&schema),
            &self.settings.work_dir,
            self.settings.max_artifact_bytes,
        )?;

        let batch = NormalizedBatch {
            rows: vec![schema.constant_row()],
            schema,
            sequence: 0,
            offset: 0,
            skipped_rows: 0,
            truncated_values: 0,
        };
        match writer.write(&batch)? {
            Some(artifact) => Ok(artifact),
            None => writer
                .finish()?
                .ok_or_else(|| ExtractError::Serialization("marker artifact was not written".into())),
        }
    }
}
