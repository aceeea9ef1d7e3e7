//! Orchestrator scenarios over in-memory sources and backends
//!
//! Covers tenant isolation, per-table failure reporting, upload retry
//! accounting, the completion marker and exit status mapping.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use pgl_extractor::error::{BackendErrorKind, ErrorKind};
use pgl_extractor::model::{ColumnDescriptor, TableDescriptor, TableRef};
use pgl_extractor::report::{JobStage, JobState, TenantStatus};
use pgl_extractor::source::MemorySource;
use pgl_extractor::upload::{MemoryBackend, UploadResult};
use pgl_extractor::{ExitStatus, StaticConnector};
use std::sync::Arc;

// ============================================================================
// Table failures
// ============================================================================

#[tokio::test]
async fn test_missing_table_makes_tenant_partial() {
    let dir = tempfile::tempdir().unwrap();
    let (source, backend) = memory_pair(MemorySource::new("erp").with_table(vendas(), vendas_rows(5)));
    let connector = StaticConnector::new().with_tenant("drogaria-sul", source, backend.clone());

    let tenants = vec![tenant("drogaria-sul", &["dbo.Vendas", "dbo.NaoExiste"], false)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    let tenant = &report.tenants[0];
    assert_eq!(tenant.status, TenantStatus::Partial);
    assert_eq!(tenant.tables[0].table, "dbo.Vendas");
    assert_eq!(tenant.tables[0].state, JobState::Completed);
    assert_eq!(tenant.tables[0].rows_written, 5);

    match &tenant.tables[1].state {
        JobState::Failed { stage, kind, .. } => {
            assert_eq!(*stage, JobStage::Describing);
            assert_eq!(*kind, ErrorKind::SchemaNotFound);
        },
        other => panic!("unexpected state {:?}", other),
    }

    assert_eq!(report.exit_status(), ExitStatus::PartialFailure);
    let retry = report.failed_subset();
    assert_eq!(retry[0].tables, vec!["dbo.NaoExiste".to_string()]);
}

#[tokio::test]
async fn test_unknown_type_fails_only_its_table() {
    let dir = tempfile::tempdir().unwrap();
    let geo = TableDescriptor::new(
        TableRef::new("dbo", "Lojas"),
        vec![
            ColumnDescriptor::new("Id", "int").not_null(),
            ColumnDescriptor::new("Local", "geography"),
        ],
    )
    .with_ordering_key(["Id"]);
    let source = MemorySource::new("erp")
        .with_table(vendas(), vendas_rows(3))
        .with_table(geo, vec![]);
    let (source, backend) = memory_pair(source);
    let connector = StaticConnector::new().with_tenant("drogaria-sul", source, backend.clone());

    let tenants = vec![tenant("drogaria-sul", &["dbo.Lojas", "dbo.Vendas"], false)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    let tables = &report.tenants[0].tables;
    match &tables[0].state {
        JobState::Failed { stage, kind, message } => {
            assert_eq!(*stage, JobStage::Normalizing);
            assert_eq!(*kind, ErrorKind::UnknownType);
            assert!(message.contains("Local"), "{}", message);
        },
        other => panic!("unexpected state {:?}", other),
    }
    assert_eq!(tables[1].state, JobState::Completed);
    assert!(backend.keys().iter().all(|k| k.contains("dbo.Vendas")));
}

// ============================================================================
// Uploads
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_throttled_uploads_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new("erp").with_table(clientes(), clientes_rows(3)));
    let backend = Arc::new(MemoryBackend::new("lake"));
    backend.fail_next(BackendErrorKind::Throttled, 3);
    let connector = StaticConnector::new().with_tenant("farma-norte", source, backend.clone());

    let tenants = vec![tenant("farma-norte", &["dbo.Clientes"], false)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    let table = &report.tenants[0].tables[0];
    assert_eq!(table.state, JobState::Completed);
    match &table.artifacts[0] {
        UploadResult::Uploaded { attempts, retries, .. } => {
            assert_eq!(*attempts, 4);
            assert_eq!(*retries, 3);
        },
        other => panic!("unexpected upload result {:?}", other),
    }
    assert_eq!(backend.put_calls(), 4);
    assert_eq!(report.exit_status(), ExitStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_upload_fails_table_and_keeps_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new("erp").with_table(clientes(), clientes_rows(3)));
    let backend = Arc::new(MemoryBackend::new("lake"));
    backend.fail_next(BackendErrorKind::Transient, 10);
    let connector = StaticConnector::new().with_tenant("farma-norte", source, backend.clone());

    let tenants = vec![tenant("farma-norte", &["dbo.Clientes"], false)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    let table = &report.tenants[0].tables[0];
    assert_eq!(table.state.failed_stage(), Some(JobStage::Uploading));
    match &table.artifacts[0] {
        UploadResult::Failed { attempts, local_path, .. } => {
            assert_eq!(*attempts, 5);
            assert!(local_path.exists());
        },
        other => panic!("unexpected upload result {:?}", other),
    }
    assert_eq!(report.tenants[0].status, TenantStatus::Failed);
    assert_eq!(report.exit_status(), ExitStatus::Fatal);
}

#[tokio::test]
async fn test_artifacts_land_in_every_destination() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new("erp").with_table(vendas(), vendas_rows(3)));
    let s3 = Arc::new(MemoryBackend::new("s3"));
    let azure = Arc::new(MemoryBackend::new("azure"));
    let connector = StaticConnector::new()
        .with_tenant("drogaria-sul", source, s3.clone())
        .with_destination("drogaria-sul", azure.clone());

    let tenants = vec![tenant("drogaria-sul", &["dbo.Vendas"], true)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    let tenant = &report.tenants[0];
    assert_eq!(tenant.status, TenantStatus::Succeeded);
    let table = &tenant.tables[0];
    let destinations: Vec<&str> = table.artifacts.iter().map(UploadResult::destination).collect();
    assert_eq!(destinations, vec!["memory://s3", "memory://azure"]);
    assert_eq!(table.rows_written, 3);
    assert_eq!(s3.keys(), azure.keys());
    assert_eq!(tenant.markers.len(), 2);
    assert!(azure.keys().iter().any(|k| k.contains("_marker")));
}

#[tokio::test(start_paused = true)]
async fn test_one_failing_destination_fails_the_table() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemorySource::new("erp").with_table(clientes(), clientes_rows(2)));
    let s3 = Arc::new(MemoryBackend::new("s3"));
    let azure = Arc::new(MemoryBackend::new("azure"));
    azure.fail_next(BackendErrorKind::Permanent, 1);
    let connector = StaticConnector::new()
        .with_tenant("farma-norte", source, s3.clone())
        .with_destination("farma-norte", azure.clone());

    let tenants = vec![tenant("farma-norte", &["dbo.Clientes"], true)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    let table = &report.tenants[0].tables[0];
    assert_eq!(table.state.failed_stage(), Some(JobStage::Uploading));
    assert_eq!(table.rows_written, 0);
    match &table.artifacts[1] {
        UploadResult::Failed { destination, local_path, .. } => {
            assert_eq!(destination, "memory://azure");
            assert!(local_path.exists());
        },
        other => panic!("unexpected upload result {:?}", other),
    }
    assert_eq!(s3.keys().len(), 1);
    assert!(azure.keys().is_empty());
    assert!(report.tenants[0].markers.is_empty());
}

// ============================================================================
// Tenants
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unreachable_tenant_does_not_stop_others() {
    let dir = tempfile::tempdir().unwrap();
    let healthy = Arc::new(MemorySource::new("sul").with_table(vendas(), vendas_rows(4)));
    let down = Arc::new(MemorySource::unreachable("norte"));
    let connector = StaticConnector::new()
        .with_tenant("drogaria-sul", healthy, Arc::new(MemoryBackend::new("sul")))
        .with_tenant("farma-norte", down, Arc::new(MemoryBackend::new("norte")));

    let tenants = vec![
        tenant("farma-norte", &["dbo.Vendas"], false),
        tenant("drogaria-sul", &["dbo.Vendas"], false),
    ];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    assert_eq!(report.tenants[0].tenant, "farma-norte");
    assert_eq!(report.tenants[0].status, TenantStatus::Failed);
    assert_eq!(report.tenants[0].error_kind, Some(ErrorKind::Connection));
    assert_eq!(report.tenants[1].status, TenantStatus::Succeeded);
    assert_eq!(report.exit_status(), ExitStatus::PartialFailure);
}

#[tokio::test(start_paused = true)]
async fn test_all_tenants_unreachable_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let connector = StaticConnector::new().with_tenant(
        "farma-norte",
        Arc::new(MemorySource::unreachable("norte")),
        Arc::new(MemoryBackend::new("norte")),
    );

    let tenants = vec![tenant("farma-norte", &["dbo.Vendas"], false)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    assert_eq!(report.exit_status(), ExitStatus::Fatal);
    assert_eq!(report.failed_subset()[0].tenant, "farma-norte");
}

#[tokio::test]
async fn test_table_filter_limits_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemorySource::new("erp")
        .with_table(vendas(), vendas_rows(2))
        .with_table(clientes(), clientes_rows(2));
    let (source, backend) = memory_pair(source);
    let connector = StaticConnector::new().with_tenant("drogaria-sul", source, backend.clone());

    let tenants = vec![tenant("drogaria-sul", &["dbo.Vendas", "dbo.Clientes"], false)];
    let report = orchestrator(settings(dir.path()), connector)
        .with_table_filter(vec!["clientes".parse().unwrap()])
        .run(&tenants)
        .await;

    let tables = &report.tenants[0].tables;
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].table, "dbo.Clientes");
}

// ============================================================================
// Completion marker
// ============================================================================

#[tokio::test]
async fn test_marker_published_after_full_success() {
    let dir = tempfile::tempdir().unwrap();
    let (source, backend) = memory_pair(MemorySource::new("erp").with_table(vendas(), vendas_rows(3)));
    let connector = StaticConnector::new().with_tenant("drogaria-sul", source, backend.clone());

    let tenants = vec![tenant("drogaria-sul", &["dbo.Vendas"], true)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    let tenant = &report.tenants[0];
    assert_eq!(tenant.status, TenantStatus::Succeeded);
    assert_eq!(tenant.markers.len(), 1);
    let marker = &tenant.markers[0];
    assert!(marker.is_uploaded());
    assert_eq!(marker.key(), "drogaria-sul/_marker/20250301T020000Z-00000.parquet");
    assert!(backend.object(marker.key()).is_some());
}

#[tokio::test]
async fn test_marker_withheld_when_a_table_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (source, backend) = memory_pair(MemorySource::new("erp").with_table(vendas(), vendas_rows(3)));
    let connector = StaticConnector::new().with_tenant("drogaria-sul", source, backend.clone());

    let tenants = vec![tenant("drogaria-sul", &["dbo.Vendas", "dbo.NaoExiste"], true)];
    let report = orchestrator(settings(dir.path()), connector).run(&tenants).await;

    assert!(report.tenants[0].markers.is_empty());
    assert!(backend.keys().iter().all(|k| !k.contains("_marker")));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancelled_run_uploads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (source, backend) = memory_pair(MemorySource::new("erp").with_table(vendas(), vendas_rows(10)));
    let connector = StaticConnector::new().with_tenant("drogaria-sul", source, backend.clone());

    let orchestrator = orchestrator(settings(dir.path()), connector);
    orchestrator.cancellation_token().cancel();

    let tenants = vec![tenant("drogaria-sul", &["dbo.Vendas"], false)];
    let report = orchestrator.run(&tenants).await;

    assert_eq!(report.tenants[0].status, TenantStatus::Failed);
    assert_eq!(report.tenants[0].error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(backend.put_calls(), 0);
}
