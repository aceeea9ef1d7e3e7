//! Table job state machine and run reports

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::process::ExitCode;
use tracing::{error, info, warn};

use crate::error::{ErrorKind, ExtractError};
use crate::model::Checkpoint;
use crate::upload::UploadResult;

/// Non-terminal stages of a table job, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Pending,
    Describing,
    Extracting,
    Normalizing,
    Serializing,
    Uploading,
}

impl JobStage {
    fn next(self) -> Option<JobStage> {
        match self {
            JobStage::Pending => Some(JobStage::Describing),
            JobStage::Describing => Some(JobStage::Extracting),
            JobStage::Extracting => Some(JobStage::Normalizing),
            JobStage::Normalizing => Some(JobStage::Serializing),
            JobStage::Serializing => Some(JobStage::Uploading),
            JobStage::Uploading => None,
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStage::Pending => "pending",
            JobStage::Describing => "describing",
            JobStage::Extracting => "extracting",
            JobStage::Normalizing => "normalizing",
            JobStage::Serializing => "serializing",
            JobStage::Uploading => "uploading",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Running { stage: JobStage },
    Completed,
    Failed {
        stage: JobStage,
        kind: ErrorKind,
        message: String,
    },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running { .. })
    }

    pub fn failed_stage(&self) -> Option<JobStage> {
        match self {
            JobState::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// One table's progress through the pipeline
///
/// Stages only move forward. Any non-terminal state can fail; terminal
/// states are final and later transitions are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableJob {
    state: JobState,
}

impl Default for TableJob {
    fn default() -> Self {
        Self::new()
    }
}

impl TableJob {
    pub fn new() -> Self {
        Self {
            state: JobState::Running {
                stage: JobStage::Pending,
            },
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn stage(&self) -> Option<JobStage> {
        match &self.state {
            JobState::Running { stage } => Some(*stage),
            JobState::Failed { stage, .. } => Some(*stage),
            JobState::Completed => None,
        }
    }

    /// Move to `stage` if it lies ahead of the current one
    pub fn enter(&mut self, stage: JobStage) {
        if let JobState::Running { stage: current } = self.state {
            if stage > current {
                self.state = JobState::Running { stage };
            }
        }
    }

    /// Step to the following stage
    pub fn advance(&mut self) {
        if let JobState::Running { stage } = self.state {
            if let Some(next) = stage.next() {
                self.state = JobState::Running { stage: next };
            }
        }
    }

    /// Only reachable from the last stage
    pub fn complete(&mut self) {
        if self.state == (JobState::Running { stage: JobStage::Uploading }) {
            self.state = JobState::Completed;
        }
    }

    /// Fail at the current stage
    pub fn fail(&mut self, err: &ExtractError) {
        if let JobState::Running { stage } = self.state {
            self.fail_at(stage, err);
        }
    }

    /// Fail, attributing the error to `stage`
    pub fn fail_at(&mut self, stage: JobStage, err: &ExtractError) {
        if !self.state.is_terminal() {
            self.state = JobState::Failed {
                stage,
                kind: err.kind(),
                message: err.to_string(),
            };
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: String,
    #[serde(flatten)]
    pub state: JobState,
    pub rows_extracted: u64,
    /// Rows in artifacts that reached every destination
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub values_truncated: u64,
    pub batches_dropped: u64,
    pub checkpoint: Checkpoint,
    pub artifacts: Vec<UploadResult>,
    pub duration_secs: f64,
}

impl TableReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            state: JobState::Running {
                stage: JobStage::Pending,
            },
            rows_extracted: 0,
            rows_written: 0,
            rows_skipped: 0,
            values_truncated: 0,
            batches_dropped: 0,
            checkpoint: Checkpoint::start(),
            artifacts: Vec::new(),
            duration_secs: 0.0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    pub fn artifacts_failed(&self) -> usize {
        self.artifacts.iter().filter(|a| !a.is_uploaded()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Succeeded,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantReport {
    pub tenant: String,
    pub status: TenantStatus,
    /// Failure that stopped the tenant before or outside its table jobs
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub tables: Vec<TableReport>,
    /// Completion marker, one result per destination
    pub markers: Vec<UploadResult>,
    pub duration_secs: f64,
}

impl TenantReport {
    /// Tenant that never reached its tables
    pub fn failed(tenant: impl Into<String>, err: &ExtractError, duration_secs: f64) -> Self {
        Self {
            tenant: tenant.into(),
            status: TenantStatus::Failed,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            tables: Vec::new(),
            markers: Vec::new(),
            duration_secs,
        }
    }

    /// Status from table outcomes; no table completing means the tenant failed
    pub fn from_tables(tenant: impl Into<String>, tables: Vec<TableReport>, duration_secs: f64) -> Self {
        let completed = tables.iter().filter(|t| t.is_completed()).count();
        let status = if completed == tables.len() {
            TenantStatus::Succeeded
        } else if completed > 0 {
            TenantStatus::Partial
        } else {
            TenantStatus::Failed
        };
        Self {
            tenant: tenant.into(),
            status,
            error: None,
            error_kind: None,
            tables,
            markers: Vec::new(),
            duration_secs,
        }
    }

    pub fn failed_tables(&self) -> impl Iterator<Item = &TableReport> {
        self.tables.iter().filter(|t| !t.is_completed())
    }
}

/// What to re-run after a partial run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTenant {
    pub tenant: String,
    /// Empty when the whole tenant failed
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    PartialFailure,
    Fatal,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Fatal => 1,
            ExitStatus::PartialFailure => 2,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tenants: Vec<TenantReport>,
}

impl RunReport {
    pub fn failed_subset(&self) -> Vec<FailedTenant> {
        self.tenants
            .iter()
            .filter(|t| t.status != TenantStatus::Succeeded)
            .map(|t| FailedTenant {
                tenant: t.tenant.clone(),
                tables: t.failed_tables().map(|table| table.table.clone()).collect(),
            })
            .collect()
    }

    /// Success only when every tenant succeeded; fatal when none got anywhere
    pub fn exit_status(&self) -> ExitStatus {
        let succeeded = self
            .tenants
            .iter()
            .filter(|t| t.status == TenantStatus::Succeeded)
            .count();
        let partial = self
            .tenants
            .iter()
            .filter(|t| t.status == TenantStatus::Partial)
            .count();

        if succeeded == self.tenants.len() {
            ExitStatus::Success
        } else if succeeded + partial == 0 {
            ExitStatus::Fatal
        } else {
            ExitStatus::PartialFailure
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.tenants
            .iter()
            .flat_map(|t| &t.tables)
            .map(|t| t.rows_written)
            .sum()
    }

    pub fn log_summary(&self) {
        for tenant in &self.tenants {
            match tenant.status {
                TenantStatus::Succeeded => info!(
                    "Tenant {} succeeded: {} tables in {:.2}s",
                    tenant.tenant,
                    tenant.tables.len(),
                    tenant.duration_secs
                ),
                TenantStatus::Partial => warn!(
                    "Tenant {} partially failed: {} of {} tables failed",
                    tenant.tenant,
                    tenant.failed_tables().count(),
                    tenant.tables.len()
                ),
                TenantStatus::Failed => error!(
                    "Tenant {} failed: {}",
                    tenant.tenant,
                    tenant.error.as_deref().unwrap_or("no table completed")
                ),
            }
            for table in tenant.failed_tables() {
                if let JobState::Failed { stage, kind, message } = &table.state {
                    error!(
                        "  {} failed while {} ({:?}): {}",
                        table.table, stage, kind, message
                    );
                }
            }
        }
        info!(
            "Run finished with {:?}: {} tenants, {} rows written",
            self.exit_status(),
            self.tenants.len(),
            self.rows_written()
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn table(name: &str, completed: bool) -> TableReport {
        let mut report = TableReport::new(name);
        report.state = if completed {
            JobState::Completed
        } else {
            JobState::Failed {
                stage: JobStage::Describing,
                kind: ErrorKind::SchemaNotFound,
                message: "missing".into(),
            }
        };
        report
    }

    fn run(tenants: Vec<TenantReport>) -> RunReport {
        RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            tenants,
        }
    }

    #[test]
    fn test_job_walks_stages_in_order() {
        let mut job = TableJob::new();
        for expected in [
            JobStage::Describing,
            JobStage::Extracting,
            JobStage::Normalizing,
            JobStage::Serializing,
            JobStage::Uploading,
        ] {
            job.advance();
            assert_eq!(job.stage(), Some(expected));
        }
        job.complete();
        assert_eq!(job.state(), &JobState::Completed);

        job.fail(&ExtractError::Cancelled);
        assert_eq!(job.state(), &JobState::Completed);
    }

    #[test]
    fn test_job_never_moves_backwards_or_completes_early() {
        let mut job = TableJob::new();
        job.enter(JobStage::Serializing);
        job.enter(JobStage::Extracting);
        assert_eq!(job.stage(), Some(JobStage::Serializing));

        job.complete();
        assert!(!job.state().is_terminal());
    }

    #[test]
    fn test_failure_records_stage_and_kind() {
        let mut job = TableJob::new();
        job.enter(JobStage::Describing);
        job.fail(&ExtractError::SchemaNotFound("dbo.Missing".into()));

        match job.state() {
            JobState::Failed { stage, kind, .. } => {
                assert_eq!(*stage, JobStage::Describing);
                assert_eq!(*kind, ErrorKind::SchemaNotFound);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tenant_status_from_tables() {
        let ok = TenantReport::from_tables("a", vec![table("x", true), table("y", true)], 0.0);
        assert_eq!(ok.status, TenantStatus::Succeeded);

        let partial = TenantReport::from_tables("b", vec![table("x", true), table("y", false)], 0.0);
        assert_eq!(partial.status, TenantStatus::Partial);

        let failed = TenantReport::from_tables("c", vec![table("x", false)], 0.0);
        assert_eq!(failed.status, TenantStatus::Failed);
    }

    #[test]
    fn test_exit_status_mapping() {
        let ok = || TenantReport::from_tables("a", vec![table("x", true)], 0.0);
        let down = || TenantReport::failed("b", &ExtractError::Connection("refused".into()), 0.0);

        assert_eq!(run(vec![ok(), ok()]).exit_status(), ExitStatus::Success);
        assert_eq!(run(vec![ok(), down()]).exit_status(), ExitStatus::PartialFailure);
        assert_eq!(run(vec![down(), down()]).exit_status(), ExitStatus::Fatal);
        assert_eq!(ExitStatus::PartialFailure.code(), 2);
    }

    #[test]
    fn test_failed_subset_lists_tables_to_retry() {
        let report = run(vec![
            TenantReport::from_tables("a", vec![table("dbo.X", true)], 0.0),
            TenantReport::from_tables("b", vec![table("dbo.X", true), table("dbo.Y", false)], 0.0),
            TenantReport::failed("c", &ExtractError::Connection("refused".into()), 0.0),
        ]);

        assert_eq!(
            report.failed_subset(),
            vec![
                FailedTenant {
                    tenant: "b".into(),
                    tables: vec!["dbo.Y".into()],
                },
                FailedTenant {
                    tenant: "c".into(),
                    tables: vec![],
                },
            ]
        );
    }

    #[test]
    fn test_report_serializes_state_inline() {
        let json = serde_json::to_value(table("dbo.Y", false)).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["stage"], "describing");
        assert_eq!(json["kind"], "schema_not_found");
    }
}
