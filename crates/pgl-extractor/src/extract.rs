//! Paginated, checkpointed extraction
//!
//! A [`BatchCursor`] walks one table page by page. Each page read that fails
//! with a transient error is retried from the cursor's checkpoint, so an
//! interruption never restarts the table and never skips or repeats rows.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ExtractError, Result};
use crate::model::{Checkpoint, RecordBatch, TableDescriptor};
use crate::retry::RetryPolicy;
use crate::source::SourceDatabase;

#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn SourceDatabase>,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Extractor {
    pub fn new(
        source: Arc<dyn SourceDatabase>,
        batch_size: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            retry,
            cancel,
        }
    }

    /// Lazy cursor starting at `from`
    pub fn cursor(&self, descriptor: Arc<TableDescriptor>, from: Checkpoint) -> BatchCursor {
        BatchCursor {
            source: Arc::clone(&self.source),
            descriptor,
            batch_size: self.batch_size,
            retry: self.retry,
            cancel: self.cancel.clone(),
            checkpoint: from,
            exhausted: false,
        }
    }

    /// Run a cursor as a producer task feeding a bounded channel
    ///
    /// The channel yields batches in order and ends after the last batch or
    /// after the first error. The task returns the final checkpoint. Dropping
    /// the receiver stops the producer at its next send.
    pub fn spawn(
        &self,
        descriptor: Arc<TableDescriptor>,
        from: Checkpoint,
        capacity: usize,
    ) -> (mpsc::Receiver<Result<RecordBatch>>, JoinHandle<Checkpoint>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut cursor = self.cursor(descriptor, from);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ExtractError::Cancelled),
                    next = cursor.next_batch() => next,
                };

                match next {
                    Ok(Some(batch)) => {
                        if tx.send(Ok(batch)).await.is_err() {
                            debug!("{} consumer went away, stopping", cursor.table());
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    },
                }
            }
            cursor.checkpoint()
        });

        (rx, handle)
    }
}

pub struct BatchCursor {
    source: Arc<dyn SourceDatabase>,
    descriptor: Arc<TableDescriptor>,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    checkpoint: Checkpoint,
    exhausted: bool,
}

impl BatchCursor {
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn table(&self) -> &crate::model::TableRef {
        &self.descriptor.table
    }

    /// Next page, or `None` once the table is exhausted
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        if self.exhausted {
            return Ok(None);
        }

        let offset = self.checkpoint.next_offset;
        let limit = self.batch_size;
        let source = &self.source;
        let descriptor = &self.descriptor;
        let operation = format!("read {} at offset {}", descriptor.table, offset);

        let rows = self
            .retry
            .run(&operation, &self.cancel, |attempt| {
                if attempt > 1 {
                    info!(
                        "Resuming {} from checkpoint offset {}",
                        descriptor.table, offset
                    );
                }
                source.fetch_page(descriptor, offset, limit)
            })
            .await?;

        if rows.len() < limit {
            self.exhausted = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let batch = RecordBatch {
            table: Arc::clone(&self.descriptor),
            sequence: self.checkpoint.batches_delivered,
            offset,
            rows,
        };
        self.checkpoint.advance(batch.len());
        debug!(
            "{}: batch {} with {} rows (next offset {})",
            batch.table.table,
            batch.sequence,
            batch.len(),
            self.checkpoint.next_offset
        );

        Ok(Some(batch))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{ColumnDescriptor, TableRef, Value};
    use crate::source::MemorySource;

    fn table() -> TableDescriptor {
        TableDescriptor::new(
            TableRef::new("dbo", "Vendas"),
            vec![ColumnDescriptor::new("Id", "int")],
        )
        .with_ordering_key(["Id"])
    }

    fn source(rows: i64) -> Arc<MemorySource> {
        let data = (0..rows).map(|i| vec![Value::Int(i)]).collect();
        Arc::new(MemorySource::new("erp").with_table(table(), data))
    }

    #[tokio::test]
    async fn test_cursor_pages_through_table() {
        let extractor = Extractor::new(source(25), 10, RetryPolicy::none(), CancellationToken::new());
        let mut cursor = extractor.cursor(Arc::new(table()), Checkpoint::start());

        let mut sizes = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            sizes.push((batch.sequence, batch.offset, batch.len()));
        }

        assert_eq!(sizes, vec![(0, 0, 10), (1, 10, 10), (2, 20, 5)]);
        assert_eq!(cursor.checkpoint().next_offset, 25);
        assert!(cursor.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exact_multiple_needs_one_empty_read() {
        let source = source(20);
        let extractor = Extractor::new(source.clone(), 10, RetryPolicy::none(), CancellationToken::new());
        let mut cursor = extractor.cursor(Arc::new(table()), Checkpoint::start());

        let mut batches = 0;
        while cursor.next_batch().await.unwrap().is_some() {
            batches += 1;
        }
        assert_eq!(batches, 2);
        assert_eq!(source.page_reads(), 3);
    }

    #[tokio::test]
    async fn test_empty_table_yields_nothing() {
        let extractor = Extractor::new(source(0), 10, RetryPolicy::none(), CancellationToken::new());
        let mut cursor = extractor.cursor(Arc::new(table()), Checkpoint::start());
        assert!(cursor.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawned_producer_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let extractor = Extractor::new(source(25), 10, RetryPolicy::none(), cancel);
        let (mut rx, handle) = extractor.spawn(Arc::new(table()), Checkpoint::start(), 1);

        assert!(matches!(rx.recv().await, Some(Err(ExtractError::Cancelled))));
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.await.unwrap(), Checkpoint::start());
    }
}
