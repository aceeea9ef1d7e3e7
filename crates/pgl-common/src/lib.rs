//! PGLoader Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the PGLoader workspace members:
//!
//! - **Logging**: one place that wires `tracing-subscriber` for every binary
//! - **Checksums**: SHA-256 digests of extracted artifacts
//! - **Errors**: the error type returned by the helpers in this crate
//!
//! # Example
//!
//! ```no_run
//! use pgl_common::checksum::compute_file_checksum;
//! use pgl_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> pgl_common::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let digest = compute_file_checksum("out/part-00000.parquet")?;
//!     tracing::info!(%digest, "artifact written");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
