//! Storage collaborator interface.
//!
//! The execution blocks never touch documents directly; they go through a
//! [`Transaction`] obtained from a [`Storage`]. Reads are served by batched
//! [`DocumentCursor`]s, writes are staged in the transaction and only become
//! visible on [`Transaction::commit`]. A transaction that is dropped without
//! committing rolls back.
//!
//! [`memory::InMemoryStorage`] is the reference implementation used by the
//! tests, the benchmarks and the command line front end.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::query::metadata::MetadataProvider;
use crate::types::Result;

/// In-memory reference storage.
pub mod memory;

pub use memory::{InMemoryStorage, InMemoryStorageBuilder};

/// A source of transactions plus the metadata of its collections.
pub trait Storage: MetadataProvider {
    /// Opens a transaction. All reads and writes of one query go through it.
    fn begin(&self) -> Result<Arc<dyn Transaction>>;

    /// Access counters of this storage.
    fn stats(&self) -> StorageStatsSnapshot;
}

/// One storage transaction.
///
/// Methods take `&self` so that shard workers can share the transaction of
/// their query. Reads observe the state committed before the transaction
/// started; writes observe earlier writes of the same transaction.
pub trait Transaction: Send + Sync {
    /// Fetches a full document by key from any shard.
    fn fetch(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Iterates the documents of a collection, or of one shard of it, in key order.
    fn scan(&self, collection: &str, shard: Option<u32>) -> Result<Box<dyn DocumentCursor>>;

    /// Iterates an index within the given ranges.
    fn index_scan(
        &self,
        collection: &str,
        shard: Option<u32>,
        request: IndexScanRequest,
    ) -> Result<Box<dyn DocumentCursor>>;

    /// Inserts a document and returns it as stored (with `_key`).
    fn insert(&self, collection: &str, document: Value) -> Result<Value>;

    /// Merges `patch` into the document with `key`; returns `(old, new)`.
    fn update(&self, collection: &str, key: &str, patch: Value) -> Result<(Value, Value)>;

    /// Replaces the document with `key`; returns `(old, new)`.
    fn replace(&self, collection: &str, key: &str, document: Value) -> Result<(Value, Value)>;

    /// Removes the document with `key` and returns it.
    fn remove(&self, collection: &str, key: &str) -> Result<Value>;

    /// Makes every staged write visible.
    fn commit(&self) -> Result<()>;

    /// Discards every staged write.
    fn rollback(&self) -> Result<()>;

    /// Number of writes staged so far.
    fn pending_writes(&self) -> usize;
}

/// Batched iterator over documents.
pub trait DocumentCursor: Send {
    /// Pushes up to `max` documents into `out`, returning `true` while more
    /// data remains and `false` once the cursor is exhausted.
    fn next_batch(&mut self, out: &mut Vec<Value>, max: usize) -> Result<bool>;

    /// Advances past up to `count` documents without fetching them.
    fn skip(&mut self, count: usize) -> Result<usize>;
}

/// Key range over one index field, after a prefix of fixed leading values.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexRange {
    /// Values of the leading index fields.
    pub prefix: Vec<Value>,
    /// Lower bound on the field after the prefix.
    pub lower: Bound<Value>,
    /// Upper bound on the field after the prefix.
    pub upper: Bound<Value>,
}

impl IndexRange {
    /// Range matching every entry.
    pub fn full() -> Self {
        Self {
            prefix: Vec::new(),
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Range fixing the leading fields only.
    pub fn prefix(values: Vec<Value>) -> Self {
        Self {
            prefix: values,
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }
}

/// Parameters of an index scan.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexScanRequest {
    /// Index id.
    pub index: String,
    /// Union of ranges to visit; an empty list visits nothing.
    pub ranges: Vec<IndexRange>,
    /// Return partial documents built from index key data instead of fetching.
    pub covering: bool,
    /// Iterate in descending order.
    pub reverse: bool,
}

/// Point-in-time copy of [`StorageStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStatsSnapshot {
    /// Documents read from the document store.
    pub documents_fetched: u64,
    /// Full collection scans opened.
    pub full_scans: u64,
    /// Index scans opened.
    pub index_scans: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back.
    pub rollbacks: u64,
}

/// Thread-safe access counters.
#[derive(Debug, Default)]
pub struct StorageStats {
    documents_fetched: AtomicU64,
    full_scans: AtomicU64,
    index_scans: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl StorageStats {
    pub(crate) fn document_fetched(&self) {
        self.documents_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn full_scan(&self) {
        self.full_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn index_scan(&self) {
        self.index_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn committed(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rolled_back(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            documents_fetched: self.documents_fetched.load(Ordering::Relaxed),
            full_scans: self.full_scans.load(Ordering::Relaxed),
            index_scans: self.index_scans.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.documents_fetched,
            &self.full_scans,
            &self.index_scans,
            &self.commits,
            &self.rollbacks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
