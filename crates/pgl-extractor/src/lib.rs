//! PGLoader SQL Server Extractor
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Pulls tables out of each tenant's SQL Server, normalizes column types
//! through an external type dictionary, writes Parquet artifacts and uploads
//! them to the tenant's S3 bucket or Azure Blob container.
//!
//! # Pipeline
//!
//! - **dictionary**: source SQL type to target type and coercion rule
//! - **introspect**: table listing and description
//! - **extract**: paginated, checkpointed batch reads
//! - **normalize**: per-column coercion with null, overflow and datetime policies
//! - **serialize**: size-bounded Parquet parts
//! - **upload**: bounded, retried puts to an [`upload::ObjectBackend`]
//! - **orchestrator**: per-tenant and per-table jobs, run reports
//!
//! # Example
//!
//! ```no_run
//! use pgl_extractor::{LiveConnector, Orchestrator, RunConfig, TypeDictionary};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::load("config/pgl.toml")?;
//!     let dictionary = Arc::new(TypeDictionary::from_path(&config.run.dictionary_path)?);
//!     let orchestrator = Orchestrator::new(config.run.clone(), dictionary, Arc::new(LiveConnector));
//!     let report = orchestrator.run(&config.tenants).await;
//!     std::process::exit(i32::from(report.exit_status().code()));
//! }
//! ```

pub mod config;
pub mod connector;
pub mod dictionary;
pub mod error;
pub mod extract;
pub mod introspect;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod serialize;
pub mod source;
pub mod upload;

pub use config::{RunConfig, RunSettings, TenantConfig};
pub use connector::{LiveConnector, StaticConnector, TenantConnector};
pub use dictionary::TypeDictionary;
pub use error::{ErrorKind, ExtractError, Result};
pub use orchestrator::Orchestrator;
pub use report::{ExitStatus, RunReport};
