//! Async range scans.
//!
//! A traversal blocks on lock waits and page fetches, so it runs on tokio's
//! blocking pool. Pairs are forwarded to the async side in batches over a
//! bounded channel. Dropping the consumer makes the next send fail, which the
//! callback turns into a stop: the traversal releases its locks and ends.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::btree::{
    BTreeSlice, DEFAULT_BATCH_SIZE, Direction, KeyRange, TraversalCallback, TraversalError,
    TraversalOptions, TraversalOutcome,
};
use crate::storage::{BufferCache, Transaction};

/// Batches buffered between the traversal and the consumer.
///
/// Once this many batches are waiting, the traversal blocks inside its
/// callback, still holding the read lock on the current leaf.
const SCAN_CHANNEL_DEPTH: usize = 4;

/// Owned pairs delivered to the consumer.
pub type ScanBatch = Vec<(Vec<u8>, Vec<u8>)>;

/// What to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub range: KeyRange,
    pub direction: Direction,
    /// Stop after this many pairs.
    pub limit: Option<usize>,
    /// Pairs per delivered batch (minimum 1).
    pub batch_size: usize,
}

impl ScanPlan {
    /// Scan all of `range` in `direction`.
    #[must_use]
    pub const fn new(range: KeyRange, direction: Direction) -> Self {
        Self {
            range,
            direction,
            limit: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Stop after `limit` pairs.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Deliver `batch_size` pairs per batch.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// A running scan. Yields batches as a [`Stream`].
///
/// The traversal sends each batch while it holds the read lock on the leaf
/// the batch came from. A consumer that stops polling without dropping the
/// handle therefore keeps writers off that leaf until it resumes. Consumers
/// that await slow work between batches should copy out what they need and
/// keep polling, or call [`ScanHandle::finish`] to release the leaf.
#[derive(Debug)]
pub struct ScanHandle {
    receiver: mpsc::Receiver<ScanBatch>,
    task: JoinHandle<Result<TraversalOutcome, TraversalError>>,
}

impl ScanHandle {
    /// Start scanning `slice` on the blocking pool, in a transaction of its
    /// own.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(cache: Arc<BufferCache>, slice: BTreeSlice, plan: ScanPlan) -> Self {
        let (sender, receiver) = mpsc::channel(SCAN_CHANNEL_DEPTH);
        let task = tokio::task::spawn_blocking(move || run_scan(&cache, slice, &plan, &sender));
        Self { receiver, task }
    }

    /// Wait for the next batch; `None` once the scan has ended.
    pub async fn next_batch(&mut self) -> Option<ScanBatch> {
        self.receiver.recv().await
    }

    /// Stop consuming and wait for the traversal to end.
    ///
    /// Batches not yet received are discarded. If the traversal was still
    /// running it observes the closed channel and stops.
    pub async fn finish(self) -> Result<TraversalOutcome, ScanError> {
        drop(self.receiver);
        self.task.await.map_err(ScanError::Join)?.map_err(ScanError::Traversal)
    }
}

impl Stream for ScanHandle {
    type Item = ScanBatch;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

fn run_scan(
    cache: &Arc<BufferCache>,
    slice: BTreeSlice,
    plan: &ScanPlan,
    sender: &mpsc::Sender<ScanBatch>,
) -> Result<TraversalOutcome, TraversalError> {
    if plan.limit == Some(0) {
        return Ok(TraversalOutcome::Stopped);
    }

    let txn = Transaction::begin(cache);
    let batch_size = plan.batch_size.max(1);
    let mut sink = ChannelSink {
        sender,
        buffer: Vec::with_capacity(batch_size),
        batch_size,
        remaining: plan.limit,
    };
    let options = TraversalOptions { batch_size };
    let outcome = slice.traverse_with(&txn, &plan.range, plan.direction, &mut sink, &options)?;
    // A final partial batch; a closed channel here changes nothing.
    sink.flush();
    tracing::debug!(
        txn = txn.id(),
        ?outcome,
        locks_acquired = txn.locks_acquired(),
        "scan finished"
    );
    Ok(outcome)
}

/// Traversal callback that forwards pairs over the scan channel.
struct ChannelSink<'s> {
    sender: &'s mpsc::Sender<ScanBatch>,
    buffer: ScanBatch,
    batch_size: usize,
    remaining: Option<usize>,
}

impl ChannelSink<'_> {
    /// Send the buffered pairs. Returns false if the consumer is gone.
    fn flush(&mut self) -> bool {
        if self.buffer.is_empty() {
            return true;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        self.sender.blocking_send(batch).is_ok()
    }
}

impl TraversalCallback for ChannelSink<'_> {
    fn handle_pair(&mut self, key: &[u8], value: &[u8]) -> bool {
        self.buffer.push((key.to_vec(), value.to_vec()));
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        let limit_reached = self.remaining == Some(0);

        let batch_full = self.buffer.len() >= self.batch_size;
        if (batch_full || limit_reached) && !self.flush() {
            tracing::debug!("scan consumer dropped, stopping traversal");
            return false;
        }
        !limit_reached
    }
}

/// Errors that can end an async scan.
#[derive(Debug)]
pub enum ScanError {
    /// The blocking task panicked or was cancelled.
    Join(tokio::task::JoinError),
    /// The traversal failed.
    Traversal(TraversalError),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Join(e) => write!(f, "scan task failed: {e}"),
            Self::Traversal(e) => write!(f, "traversal error: {e}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Join(e) => Some(e),
            Self::Traversal(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::btree::LoadOptions;
    use crate::testing::{key_of, sample_tree};

    fn numbered_tree(count: usize) -> (Arc<BufferCache>, BTreeSlice) {
        let keys: Vec<String> = (0..count).map(key_of).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let options = LoadOptions {
            max_leaf_entries: 8,
            max_fanout: 4,
        };
        let (cache, sb) = sample_tree(&key_refs, &options);
        (cache, BTreeSlice::new(sb))
    }

    #[tokio::test]
    async fn test_stream_delivers_everything_in_order() {
        let (cache, slice) = numbered_tree(100);
        let plan = ScanPlan::new(KeyRange::universe(), Direction::Forward).with_batch_size(7);
        let mut handle = ScanHandle::spawn(cache, slice, plan);

        let mut keys = Vec::new();
        while let Some(batch) = handle.next().await {
            assert!(batch.len() <= 7);
            keys.extend(batch.into_iter().map(|(k, _)| k));
        }
        let expected: Vec<Vec<u8>> = (0..100).map(|i| key_of(i).into_bytes()).collect();
        assert_eq!(keys, expected);
        assert_eq!(
            handle.finish().await.expect("finish"),
            TraversalOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_limit_stops_scan() {
        let (cache, slice) = numbered_tree(100);
        let plan = ScanPlan::new(KeyRange::universe(), Direction::Backward)
            .with_limit(5)
            .with_batch_size(2);
        let mut handle = ScanHandle::spawn(cache, slice, plan);

        let mut keys = Vec::new();
        while let Some(batch) = handle.next_batch().await {
            keys.extend(batch.into_iter().map(|(k, _)| k));
        }
        let expected: Vec<Vec<u8>> = (95..100).rev().map(|i| key_of(i).into_bytes()).collect();
        assert_eq!(keys, expected);
        assert_eq!(
            handle.finish().await.expect("finish"),
            TraversalOutcome::Stopped
        );
    }

    #[tokio::test]
    async fn test_dropping_consumer_stops_traversal() {
        let (cache, slice) = numbered_tree(500);
        let plan = ScanPlan::new(KeyRange::universe(), Direction::Forward).with_batch_size(5);
        let mut handle = ScanHandle::spawn(Arc::clone(&cache), slice, plan);

        let first = handle.next_batch().await.expect("first batch");
        assert_eq!(first.len(), 5);
        assert_eq!(
            handle.finish().await.expect("finish"),
            TraversalOutcome::Stopped
        );

        // The stopped traversal released its locks: a writer can get in.
        let txn = Transaction::begin(&cache);
        let _lock = txn
            .acquire(slice.superblock_id(), crate::storage::LockMode::Write)
            .expect("write lock");
    }

    #[tokio::test]
    async fn test_lagging_consumer_holds_leaf_until_drained() {
        // One leaf, one pair per batch: the traversal outruns the channel.
        let (cache, slice) = numbered_tree(8);
        let plan = ScanPlan::new(KeyRange::universe(), Direction::Forward).with_batch_size(1);
        let mut handle = ScanHandle::spawn(Arc::clone(&cache), slice, plan);
        let first = handle.next_batch().await.expect("first batch");

        let leaf = {
            let txn = Transaction::begin(&cache);
            slice.superblock(&txn).expect("superblock").root_block_id
        };
        let writer_cache = Arc::clone(&cache);
        let writer = tokio::task::spawn_blocking(move || {
            let txn = Transaction::begin(&writer_cache);
            txn.acquire(leaf, crate::storage::LockMode::Write).map(drop)
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!writer.is_finished(), "writer got past a leaf still being scanned");

        let mut delivered = first.len();
        while let Some(batch) = handle.next_batch().await {
            delivered += batch.len();
        }
        assert_eq!(delivered, 8);
        writer.await.expect("join").expect("write lock");
        assert_eq!(
            handle.finish().await.expect("finish"),
            TraversalOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_traversal_error_surfaces_from_finish() {
        let (cache, _) = numbered_tree(10);
        let missing = BTreeSlice::new(10_000);
        let plan = ScanPlan::new(KeyRange::universe(), Direction::Forward);
        let handle = ScanHandle::spawn(cache, missing, plan);

        assert!(matches!(
            handle.finish().await,
            Err(ScanError::Traversal(TraversalError::BlockNotFound(10_000)))
        ));
    }
}
