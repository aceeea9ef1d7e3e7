//! In-process source for tests and dry runs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use super::SourceDatabase;
use crate::error::{ExtractError, Result};
use crate::model::{Row, TableDescriptor, TableRef};

struct MemoryTable {
    descriptor: TableDescriptor,
    rows: Vec<Row>,
}

/// Tables held in memory, with scriptable failures
///
/// Failures are injected per `(table, offset)` page so tests can interrupt an
/// extraction at an exact point and watch it resume.
#[derive(Default)]
pub struct MemorySource {
    name: String,
    tables: RwLock<Vec<MemoryTable>>,
    page_failures: Mutex<HashMap<(String, u64), u32>>,
    unreachable: bool,
    page_reads: AtomicU64,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Every call fails with a connection error
    pub fn unreachable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn with_table(self, descriptor: TableDescriptor, rows: Vec<Row>) -> Self {
        self.add_table(descriptor, rows);
        self
    }

    pub fn add_table(&self, descriptor: TableDescriptor, rows: Vec<Row>) {
        if let Ok(mut tables) = self.tables.write() {
            tables.retain(|t| !t.descriptor.table.matches(&descriptor.table));
            tables.push(MemoryTable { descriptor, rows });
        }
    }

    /// Fail the next `times` reads of the page starting at `offset`
    pub fn fail_page(&self, table: &TableRef, offset: u64, times: u32) {
        if let Ok(mut failures) = self.page_failures.lock() {
            failures.insert((table.to_string().to_lowercase(), offset), times);
        }
    }

    /// Total `fetch_page` calls, including failed ones
    pub fn page_reads(&self) -> u64 {
        self.page_reads.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(ExtractError::Connection(format!(
                "{}: connection refused",
                self.name
            )));
        }
        Ok(())
    }

    fn take_failure(&self, table: &TableRef, offset: u64) -> bool {
        let Ok(mut failures) = self.page_failures.lock() else {
            return false;
        };
        let key = (table.to_string().to_lowercase(), offset);
        match failures.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            },
            _ => false,
        }
    }

    fn poisoned() -> ExtractError {
        ExtractError::Query("memory source lock poisoned".to_string())
    }
}

#[async_trait]
impl SourceDatabase for MemorySource {
    fn describe_location(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn list_tables(&self) -> Result<Vec<TableRef>> {
        self.check_reachable()?;
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.iter().map(|t| t.descriptor.table.clone()).collect())
    }

    async fn describe(&self, table: &TableRef) -> Result<TableDescriptor> {
        self.check_reachable()?;
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        tables
            .iter()
            .find(|t| t.descriptor.table.matches(table))
            .map(|t| t.descriptor.clone())
            .ok_or_else(|| ExtractError::SchemaNotFound(table.to_string()))
    }

    async fn fetch_page(&self, table: &TableDescriptor, offset: u64, limit: usize) -> Result<Vec<Row>> {
        self.page_reads.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        if self.take_failure(&table.table, offset) {
            return Err(ExtractError::Connection(format!(
                "{}: connection reset while reading {} at offset {}",
                self.name, table.table, offset
            )));
        }

        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        let stored = tables
            .iter()
            .find(|t| t.descriptor.table.matches(&table.table))
            .ok_or_else(|| ExtractError::SchemaNotFound(table.table.to_string()))?;

        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(stored.rows.len());
        let end = start.saturating_add(limit).min(stored.rows.len());
        Ok(stored.rows[start..end].to_vec())
    }
}
