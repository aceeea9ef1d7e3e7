//! Table discovery and description with connection retry

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TableSelection;
use crate::dictionary::normalize_type_name;
use crate::error::Result;
use crate::model::{TableDescriptor, TableRef};
use crate::retry::RetryPolicy;
use crate::source::SourceDatabase;

/// Types SQL Server refuses in ORDER BY
const UNORDERABLE_TYPES: &[&str] = &[
    "text", "ntext", "image", "xml", "geography", "geometry", "sql_variant",
];

pub fn is_orderable(source_type: &str) -> bool {
    !UNORDERABLE_TYPES.contains(&normalize_type_name(source_type).as_str())
}

pub struct Introspector {
    source: Arc<dyn SourceDatabase>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Introspector {
    pub fn new(source: Arc<dyn SourceDatabase>, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            source,
            retry,
            cancel,
        }
    }

    /// Describe `table`, filling in an ordering key when it has no primary key
    pub async fn describe(&self, table: &TableRef) -> Result<TableDescriptor> {
        let source = &self.source;
        let operation = format!("describe {}", table);
        let descriptor = self
            .retry
            .run(&operation, &self.cancel, |_| source.describe(table))
            .await?;

        Ok(with_fallback_ordering(descriptor))
    }

    /// Expand the selection into concrete tables
    pub async fn resolve_tables(&self, selection: &TableSelection) -> Result<Vec<TableRef>> {
        match selection {
            TableSelection::Listed(tables) => Ok(tables.clone()),
            TableSelection::All => {
                let source = &self.source;
                let tables = self
                    .retry
                    .run("list tables", &self.cancel, |_| source.list_tables())
                    .await?;
                info!(
                    "Resolved \"all\" to {} tables on {}",
                    tables.len(),
                    source.describe_location()
                );
                Ok(tables)
            },
        }
    }
}

/// Without a primary key, order by every orderable column
pub fn with_fallback_ordering(mut descriptor: TableDescriptor) -> TableDescriptor {
    if descriptor.ordering_key.is_empty() {
        descriptor.ordering_key = descriptor
            .columns
            .iter()
            .filter(|c| is_orderable(&c.source_type))
            .map(|c| c.name.clone())
            .collect();
        warn!(
            "{} has no primary key; paging ordered by [{}]",
            descriptor.table,
            descriptor.ordering_key.join(", ")
        );
    }
    descriptor
}
