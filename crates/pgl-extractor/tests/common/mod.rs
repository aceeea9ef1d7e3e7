//! Shared fixtures for the pipeline integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use pgl_extractor::config::{RunSettings, TenantConfig};
use pgl_extractor::model::{ColumnDescriptor, TableDescriptor, TableRef, Value};
use pgl_extractor::retry::RetryPolicy;
use pgl_extractor::source::MemorySource;
use pgl_extractor::upload::MemoryBackend;
use pgl_extractor::{Orchestrator, RunConfig, StaticConnector, TypeDictionary};
use std::path::Path;
use std::sync::Arc;

pub const STOCK_DICTIONARY: &str = include_str!("../../config/type_dictionary.json");

pub fn dictionary() -> Arc<TypeDictionary> {
    Arc::new(TypeDictionary::from_json_str(STOCK_DICTIONARY).unwrap())
}

pub fn run_started() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap()
}

/// Tenant entry with the given tables; endpoints come from a `StaticConnector`
pub fn tenant(name: &str, tables: &[&str], publish_marker: bool) -> TenantConfig {
    let tables = tables
        .iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(", ");
    let toml = format!(
        r#"
        [[tenants]]
        name = "{name}"
        company_id = "1042"
        tables = [{tables}]
        publish_marker = {publish_marker}
        stamp_columns = [{{ name = "idEmpresa", value = "1042" }}]

        [tenants.source]
        host = "localhost"
        database = "ERP"
        user = "sa"
        password = "x"

        [tenants.destination]
        backend = "s3"
        bucket = "pgl-test"
        "#
    );
    RunConfig::from_toml_str(&toml).unwrap().tenants.remove(0)
}

/// Fast settings: tiny batches, no real backoff when time is paused
pub fn settings(work_dir: &Path) -> RunSettings {
    RunSettings {
        work_dir: work_dir.to_path_buf(),
        batch_size: 2,
        channel_capacity: 2,
        max_artifact_bytes: 64 * 1024 * 1024,
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 100,
        },
        ..RunSettings::default()
    }
}

pub fn vendas() -> TableDescriptor {
    TableDescriptor::new(
        TableRef::new("dbo", "Vendas"),
        vec![
            ColumnDescriptor::new("Id", "int").not_null(),
            ColumnDescriptor::new("Produto", "nvarchar").with_max_length(40),
            ColumnDescriptor::new("Valor", "decimal").with_precision(12, 2),
            ColumnDescriptor::new("DataVenda", "datetime2"),
        ],
    )
    .with_ordering_key(["Id"])
}

pub fn vendas_rows(count: i64) -> Vec<Vec<Value>> {
    let base = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap().and_hms_opt(9, 30, 0).unwrap();
    (1..=count)
        .map(|i| {
            vec![
                Value::Int(i),
                Value::Text(format!("Dipirona {}mg", i * 100)),
                Value::Decimal {
                    value: i128::from(i) * 1_999,
                    scale: 2,
                },
                Value::Timestamp(base + chrono::Duration::minutes(i)),
            ]
        })
        .collect()
}

pub fn clientes() -> TableDescriptor {
    TableDescriptor::new(
        TableRef::new("dbo", "Clientes"),
        vec![
            ColumnDescriptor::new("Id", "bigint").not_null(),
            ColumnDescriptor::new("Nome", "varchar").with_max_length(10),
            ColumnDescriptor::new("Ativo", "bit"),
        ],
    )
    .with_ordering_key(["Id"])
}

pub fn clientes_rows(count: i64) -> Vec<Vec<Value>> {
    (1..=count)
        .map(|i| vec![Value::Int(i), Value::Text(format!("Cliente {}", i)), Value::Bool(i % 2 == 0)])
        .collect()
}

pub fn orchestrator(settings: RunSettings, connector: StaticConnector) -> Orchestrator {
    Orchestrator::new(settings, dictionary(), Arc::new(connector)).with_run_started(run_started())
}

pub fn memory_pair(source: MemorySource) -> (Arc<MemorySource>, Arc<MemoryBackend>) {
    (Arc::new(source), Arc::new(MemoryBackend::new("lake")))
}
