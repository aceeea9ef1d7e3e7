//! Source database abstraction
//!
//! The pipeline only talks to [`SourceDatabase`]. [`SqlServerSource`] is the
//! production implementation; [`MemorySource`] serves tests and dry runs.

mod memory;
mod sqlserver;

pub use memory::MemorySource;
pub use sqlserver::SqlServerSource;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Row, TableDescriptor, TableRef};

#[async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Human-readable location, for logs
    fn describe_location(&self) -> String;

    /// Cheap round trip proving the source is reachable
    async fn ping(&self) -> Result<()>;

    /// Base tables visible to the configured user
    async fn list_tables(&self) -> Result<Vec<TableRef>>;

    /// Ordered columns and primary key of `table`
    ///
    /// Fails with `SchemaNotFound` when the table does not exist.
    async fn describe(&self, table: &TableRef) -> Result<TableDescriptor>;

    /// Up to `limit` rows starting at `offset`, in `ordering_key` order
    ///
    /// Returns fewer than `limit` rows only at the end of the table.
    async fn fetch_page(&self, table: &TableDescriptor, offset: u64, limit: usize) -> Result<Vec<Row>>;
}
