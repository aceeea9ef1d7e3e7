//! Run configuration
//!
//! A run is described by one TOML file: a `[run]` table with global settings
//! and one `[[tenants]]` entry per whitelabel. Any run-level key can be
//! overridden from the environment with the `PGL__` prefix, e.g.
//! `PGL__RUN__BATCH_SIZE=5000`. A `.env` file in the working directory is
//! loaded first.
//!
//! ```toml
//! [run]
//! dictionary_path = "config/type_dictionary.json"
//! max_concurrent_uploads = 8
//!
//! [[tenants]]
//! name = "drogaria-sul"
//! company_id = "1042"
//! tables = ["dbo.Vendas", "dbo.Produtos"]
//!
//! [tenants.source]
//! host = "10.0.0.12"
//! database = "ERP"
//! user = "extractor"
//! password_env = "DROGARIA_SUL_DB_PASSWORD"
//!
//! [tenants.destination]
//! backend = "s3"
//! bucket = "pgl-landing"
//! region = "sa-east-1"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ExtractError, Result};
use crate::model::TableRef;
use crate::retry::RetryPolicy;

// ============================================================================
// Run Defaults
// ============================================================================

/// Default type dictionary location, relative to the working directory.
pub const DEFAULT_DICTIONARY_PATH: &str = "config/type_dictionary.json";

/// Default directory for artifacts awaiting upload.
pub const DEFAULT_WORK_DIR: &str = "./work";

/// Default rows per extracted batch.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Default batches buffered between pipeline stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;

/// Default size at which an artifact is split (128 MiB).
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 128 * 1024 * 1024;

/// Tenants run one after another unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENT_TENANTS: usize = 1;

/// Default tables extracted in parallel per tenant.
pub const DEFAULT_MAX_CONCURRENT_TABLES: usize = 4;

/// Default uploads in flight across all tenants.
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 8;

// ============================================================================
// Source Defaults
// ============================================================================

/// Default SQL Server port.
pub const DEFAULT_SQLSERVER_PORT: u16 = 1433;

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default S3 region.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PGL";

/// A credential that never shows up in logs or `Debug` output
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// Inline secret first, then the named environment variable
fn resolve_secret(inline: &mut Option<Secret>, env_var: Option<&str>, what: &str) -> Result<()> {
    if inline.is_some() {
        return Ok(());
    }
    if let Some(var) = env_var {
        let value = std::env::var(var).map_err(|_| {
            ExtractError::Config(format!("{} references unset environment variable {}", what, var))
        })?;
        *inline = Some(Secret(value));
    }
    Ok(())
}

/// How timestamps are stored in artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateTimePolicy {
    /// Wall-clock values as stored in the source, no zone attached
    #[default]
    Naive,
    /// Annotated as UTC
    Utc,
}

/// What a coercion failure costs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoercionFailurePolicy {
    /// Drop the offending row and keep going
    SkipRow,
    /// Drop the whole batch and keep going
    FailBatch,
    /// Fail the table
    #[default]
    FailTable,
}

/// Global settings shared by every tenant
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub dictionary_path: PathBuf,
    pub work_dir: PathBuf,
    pub batch_size: usize,
    pub channel_capacity: usize,
    pub max_artifact_bytes: u64,
    pub max_concurrent_tenants: usize,
    pub max_concurrent_tables: usize,
    pub max_concurrent_uploads: usize,
    pub datetime: DateTimePolicy,
    pub on_coercion_error: CoercionFailurePolicy,
    pub retry: RetryPolicy,
    /// JSON run report destination
    pub report_path: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            dictionary_path: PathBuf::from(DEFAULT_DICTIONARY_PATH),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            max_concurrent_tenants: DEFAULT_MAX_CONCURRENT_TENANTS,
            max_concurrent_tables: DEFAULT_MAX_CONCURRENT_TABLES,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            datetime: DateTimePolicy::default(),
            on_coercion_error: CoercionFailurePolicy::default(),
            retry: RetryPolicy::default(),
            report_path: None,
        }
    }
}

/// SQL Server connection parameters
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub password_env: Option<String>,
    /// Accept the server certificate without validation
    #[serde(default)]
    pub trust_cert: bool,
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_SQLSERVER_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_region() -> String {
    DEFAULT_S3_REGION.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Destination {
    /// Bucket name; an `s3://bucket/...` form is accepted
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, Ceph)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default)]
    pub access_key: Option<Secret>,
    #[serde(default)]
    pub access_key_env: Option<String>,
    #[serde(default)]
    pub secret_key: Option<Secret>,
    #[serde(default)]
    pub secret_key_env: Option<String>,
}

impl S3Destination {
    /// `s3://pgl-landing/raw` -> `pgl-landing`
    pub fn bucket_name(&self) -> &str {
        let trimmed = self.bucket.trim();
        let without_scheme = trimmed.strip_prefix("s3://").unwrap_or(trimmed);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureDestination {
    pub account: String,
    pub container: String,
    #[serde(default)]
    pub access_key: Option<Secret>,
    #[serde(default)]
    pub access_key_env: Option<String>,
    /// Target the local Azurite emulator
    #[serde(default)]
    pub use_emulator: bool,
}

/// Where a tenant's artifacts go
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum DestinationConfig {
    S3(S3Destination),
    AzureBlob(AzureDestination),
}

impl DestinationConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            DestinationConfig::S3(_) => "s3",
            DestinationConfig::AzureBlob(_) => "azure-blob",
        }
    }

    fn resolve_secrets(&mut self, tenant: &str) -> Result<()> {
        match self {
            DestinationConfig::S3(s3) => {
                let what = format!("tenant '{}' S3 access key", tenant);
                resolve_secret(&mut s3.access_key, s3.access_key_env.as_deref(), &what)?;
                let what = format!("tenant '{}' S3 secret key", tenant);
                resolve_secret(&mut s3.secret_key, s3.secret_key_env.as_deref(), &what)
            },
            DestinationConfig::AzureBlob(azure) => {
                let what = format!("tenant '{}' Azure access key", tenant);
                resolve_secret(&mut azure.access_key, azure.access_key_env.as_deref(), &what)
            },
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            DestinationConfig::S3(s3) => {
                if s3.bucket_name().is_empty() {
                    return Err("S3 bucket is required".to_string());
                }
                if s3.access_key.is_some() != s3.secret_key.is_some() {
                    return Err("S3 access_key and secret_key must be set together".to_string());
                }
            },
            DestinationConfig::AzureBlob(azure) => {
                if azure.container.trim().is_empty() {
                    return Err("Azure container is required".to_string());
                }
                if !azure.use_emulator && azure.account.trim().is_empty() {
                    return Err("Azure account is required".to_string());
                }
            },
        }
        Ok(())
    }
}

/// Every place a tenant's artifacts are uploaded to; never empty
///
/// Accepts a single `[tenants.destination]` table or an array of them, so
/// one tenant can land in S3 and Azure Blob at the same time.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "DestinationsRepr")]
pub struct Destinations(Vec<DestinationConfig>);

#[derive(Deserialize)]
#[serde(untagged)]
enum DestinationsRepr {
    One(DestinationConfig),
    Many(Vec<DestinationConfig>),
}

impl TryFrom<DestinationsRepr> for Destinations {
    type Error = String;

    fn try_from(repr: DestinationsRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            DestinationsRepr::One(destination) => Ok(Destinations(vec![destination])),
            DestinationsRepr::Many(list) if list.is_empty() => {
                Err("at least one destination is required".to_string())
            },
            DestinationsRepr::Many(list) => Ok(Destinations(list)),
        }
    }
}

impl Destinations {
    pub fn iter(&self) -> std::slice::Iter<'_, DestinationConfig> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<DestinationConfig> for Destinations {
    fn from(destination: DestinationConfig) -> Self {
        Destinations(vec![destination])
    }
}

/// `"all"` or an explicit table list
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "TableSelectionRepr")]
pub enum TableSelection {
    #[default]
    All,
    Listed(Vec<TableRef>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TableSelectionRepr {
    Keyword(String),
    List(Vec<String>),
}

impl TryFrom<TableSelectionRepr> for TableSelection {
    type Error = String;

    fn try_from(repr: TableSelectionRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            TableSelectionRepr::Keyword(k) if k.trim().eq_ignore_ascii_case("all") => {
                Ok(TableSelection::All)
            },
            TableSelectionRepr::Keyword(k) => Err(format!(
                "tables must be \"all\" or a list of table names, got \"{}\"",
                k
            )),
            TableSelectionRepr::List(names) => names
                .iter()
                .map(|n| n.parse::<TableRef>().map_err(|e| e.to_string()))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(TableSelection::Listed),
        }
    }
}

/// A constant column appended to every extracted row
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StampColumn {
    pub name: String,
    pub value: String,
}

/// One whitelabel client
#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    /// Unique tenant name; first segment of every artifact key
    pub name: String,
    #[serde(default)]
    pub company_id: Option<String>,
    pub source: SourceConfig,
    #[serde(default)]
    pub tables: TableSelection,
    #[serde(alias = "destinations")]
    pub destination: Destinations,
    /// Leading key segment, e.g. the portal name
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_concurrent_tables: Option<usize>,
    #[serde(default)]
    pub on_coercion_error: Option<CoercionFailurePolicy>,
    #[serde(default)]
    pub stamp_columns: Vec<StampColumn>,
    /// Column that receives the run's start time on every row
    #[serde(default)]
    pub run_timestamp_column: Option<String>,
    /// Upload a `_marker` artifact once every table completed
    #[serde(default)]
    pub publish_marker: bool,
}

impl TenantConfig {
    pub fn batch_size(&self, run: &RunSettings) -> usize {
        self.batch_size.unwrap_or(run.batch_size)
    }

    pub fn max_concurrent_tables(&self, run: &RunSettings) -> usize {
        self.max_concurrent_tables.unwrap_or(run.max_concurrent_tables)
    }

    pub fn coercion_policy(&self, run: &RunSettings) -> CoercionFailurePolicy {
        self.on_coercion_error.unwrap_or(run.on_coercion_error)
    }

    /// Pull `*_env` secrets from the environment
    pub fn resolve_secrets(&mut self) -> Result<()> {
        let what = format!("tenant '{}' source password", self.name);
        resolve_secret(&mut self.source.password, self.source.password_env.as_deref(), &what)?;

        for destination in &mut self.destination.0 {
            destination.resolve_secrets(&self.name)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ExtractError::Config(format!("tenant '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() || self.name.contains('/') {
            return Err(ExtractError::Config(format!(
                "invalid tenant name '{}' (must be non-empty, without '/')",
                self.name
            )));
        }
        if self.source.host.trim().is_empty() || self.source.database.trim().is_empty() {
            return invalid("source host and database are required".to_string());
        }
        if self.batch_size == Some(0) {
            return invalid("batch_size must be greater than 0".to_string());
        }
        if self.max_concurrent_tables == Some(0) {
            return invalid("max_concurrent_tables must be greater than 0".to_string());
        }
        if let TableSelection::Listed(tables) = &self.tables {
            if tables.is_empty() {
                return invalid("table list is empty".to_string());
            }
        }
        for destination in self.destination.iter() {
            destination.validate().or_else(invalid)?;
        }
        let mut stamp_names = HashSet::new();
        for stamp in &self.stamp_columns {
            if !stamp_names.insert(stamp.name.to_lowercase()) {
                return invalid(format!("duplicate stamp column '{}'", stamp.name));
            }
        }
        Ok(())
    }
}

/// Full run configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl RunConfig {
    /// Load from a TOML file with `PGL__*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ExtractError::Config(format!("{}: {}", path.display(), e)))?;

        let config = Self::from_settings(settings)?;
        info!(
            "Loaded configuration from {} ({} tenants)",
            path.display(),
            config.tenants.len()
        );
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .map_err(|e| ExtractError::Config(e.to_string()))?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: config::Config) -> Result<Self> {
        let mut config: RunConfig = settings
            .try_deserialize()
            .map_err(|e| ExtractError::Config(e.to_string()))?;
        for tenant in &mut config.tenants {
            tenant.resolve_secrets()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let run = &self.run;
        let positive = [
            ("batch_size", run.batch_size),
            ("channel_capacity", run.channel_capacity),
            ("max_concurrent_tenants", run.max_concurrent_tenants),
            ("max_concurrent_tables", run.max_concurrent_tables),
            ("max_concurrent_uploads", run.max_concurrent_uploads),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ExtractError::Config(format!("run.{} must be greater than 0", name)));
            }
        }
        if run.max_artifact_bytes < 1024 {
            return Err(ExtractError::Config(
                "run.max_artifact_bytes must be at least 1024".to_string(),
            ));
        }
        if run.retry.max_attempts == 0 {
            return Err(ExtractError::Config(
                "run.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.tenants.is_empty() {
            return Err(ExtractError::Config("no tenants configured".to_string()));
        }

        let mut names = HashSet::new();
        for tenant in &self.tenants {
            tenant.validate()?;
            if !names.insert(tenant.name.as_str()) {
                return Err(ExtractError::Config(format!(
                    "duplicate tenant name '{}'",
                    tenant.name
                )));
            }
        }

        debug!("Configuration validated");
        Ok(())
    }

    /// Keep only the named tenants; unknown names are an error
    pub fn select_tenants(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = names.iter().find(|n| !self.tenants.iter().any(|t| &t.name == *n)) {
            return Err(ExtractError::Config(format!("unknown tenant '{}'", unknown)));
        }
        self.tenants.retain(|t| names.contains(&t.name));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [run]
        batch_size = 500
        on_coercion_error = "skip-row"
        datetime = "utc"

        [run.retry]
        max_attempts = 3

        [[tenants]]
        name = "drogaria-sul"
        company_id = "1042"
        prefix = "portal-sul"
        tables = ["Vendas", "fin.Contas"]
        publish_marker = true
        run_timestamp_column = "DataHoraAtualizacao"
        stamp_columns = [{ name = "idEmpresa", value = "1042" }]

        [tenants.source]
        host = "10.0.0.12"
        database = "ERP"
        user = "extractor"
        password = "hunter2"

        [tenants.destination]
        backend = "s3"
        bucket = "s3://pgl-landing/raw"

        [[tenants]]
        name = "farma-norte"
        tables = "all"
        max_concurrent_tables = 2

        [tenants.source]
        host = "db.norte.local"
        port = 14330
        database = "Retaguarda"
        user = "sa"
        password = "x"
        trust_cert = true

        [tenants.destination]
        backend = "azure-blob"
        account = "pglstorage"
        container = "landing"
        access_key = "a2V5"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.run.batch_size, 500);
        assert_eq!(config.run.on_coercion_error, CoercionFailurePolicy::SkipRow);
        assert_eq!(config.run.datetime, DateTimePolicy::Utc);
        assert_eq!(config.run.retry.max_attempts, 3);
        assert_eq!(config.run.retry.base_delay_ms, crate::retry::DEFAULT_BASE_DELAY_MS);
        assert_eq!(config.run.max_concurrent_tenants, DEFAULT_MAX_CONCURRENT_TENANTS);
        assert_eq!(config.tenants.len(), 2);

        let sul = &config.tenants[0];
        assert_eq!(sul.source.port, DEFAULT_SQLSERVER_PORT);
        assert_eq!(
            sul.tables,
            TableSelection::Listed(vec![TableRef::new("dbo", "Vendas"), TableRef::new("fin", "Contas")])
        );
        assert_eq!(sul.stamp_columns[0].name, "idEmpresa");
        assert_eq!(sul.batch_size(&config.run), 500);
        assert_eq!(sul.destination.len(), 1);
        match sul.destination.iter().next() {
            Some(DestinationConfig::S3(s3)) => {
                assert_eq!(s3.bucket_name(), "pgl-landing");
                assert_eq!(s3.region, DEFAULT_S3_REGION);
            },
            other => panic!("unexpected destination {:?}", other),
        }

        let norte = &config.tenants[1];
        assert_eq!(norte.tables, TableSelection::All);
        assert_eq!(norte.max_concurrent_tables(&config.run), 2);
        assert!(norte.source.trust_cert);
        let backends: Vec<_> = norte.destination.iter().map(DestinationConfig::backend_name).collect();
        assert_eq!(backends, vec!["azure-blob"]);
    }

    #[test]
    fn test_tenant_with_several_destinations() {
        let toml = SAMPLE.replace(
            r#"[tenants.destination]
        backend = "s3"
        bucket = "s3://pgl-landing/raw""#,
            r#"[[tenants.destinations]]
        backend = "s3"
        bucket = "pgl-landing"

        [[tenants.destinations]]
        backend = "azure-blob"
        account = "pglstorage"
        container = "landing-sul"
        access_key_env = "PGL_TEST_AZURE_KEY""#,
        );
        std::env::set_var("PGL_TEST_AZURE_KEY", "c2Vj");
        let config = RunConfig::from_toml_str(&toml).unwrap();

        let sul = &config.tenants[0];
        let backends: Vec<_> = sul.destination.iter().map(DestinationConfig::backend_name).collect();
        assert_eq!(backends, vec!["s3", "azure-blob"]);
        match sul.destination.iter().nth(1) {
            Some(DestinationConfig::AzureBlob(azure)) => {
                assert_eq!(azure.access_key.as_ref().unwrap().expose(), "c2Vj");
            },
            other => panic!("unexpected destination {:?}", other),
        }

        let empty = SAMPLE
            .replace(
                r#"[tenants.destination]
        backend = "s3"
        bucket = "s3://pgl-landing/raw""#,
                "",
            )
            .replace("publish_marker = true", "publish_marker = true\n        destinations = []");
        assert!(RunConfig::from_toml_str(&empty).is_err());
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = format!("{:?}", config.tenants[0].source);
        assert!(!rendered.contains("hunter2"));
        assert_eq!(config.tenants[0].source.password.as_ref().unwrap().expose(), "hunter2");
    }

    #[test]
    fn test_password_from_env() {
        std::env::set_var("PGL_TEST_DB_PASSWORD", "from-env");
        let toml = SAMPLE.replace("password = \"hunter2\"", "password_env = \"PGL_TEST_DB_PASSWORD\"");
        let config = RunConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.tenants[0].source.password.as_ref().unwrap().expose(), "from-env");
    }

    #[test]
    fn test_missing_env_secret_fails() {
        let toml = SAMPLE.replace("password = \"hunter2\"", "password_env = \"PGL_TEST_UNSET_VARIABLE\"");
        let err = RunConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("PGL_TEST_UNSET_VARIABLE"));
    }

    #[test]
    fn test_validation_failures() {
        let zero_batch = SAMPLE.replace("batch_size = 500", "batch_size = 0");
        assert!(RunConfig::from_toml_str(&zero_batch).is_err());

        let duplicate = SAMPLE.replace("name = \"farma-norte\"", "name = \"drogaria-sul\"");
        assert!(RunConfig::from_toml_str(&duplicate).is_err());

        let bad_tables = SAMPLE.replace("tables = \"all\"", "tables = \"some\"");
        assert!(RunConfig::from_toml_str(&bad_tables).is_err());

        let bad_backend = SAMPLE.replace("backend = \"s3\"", "backend = \"gcs\"");
        assert!(RunConfig::from_toml_str(&bad_backend).is_err());

        assert!(RunConfig::from_toml_str("[run]\nbatch_size = 10\n").is_err());
    }

    #[test]
    fn test_select_tenants() {
        let mut config = RunConfig::from_toml_str(SAMPLE).unwrap();
        config.select_tenants(&["farma-norte".to_string()]).unwrap();
        assert_eq!(config.tenants.len(), 1);
        assert!(config.select_tenants(&["nope".to_string()]).is_err());
    }
}
