use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::{
    DocumentCursor, IndexRange, IndexScanRequest, Storage, StorageStats, StorageStatsSnapshot,
    Transaction,
};
use crate::cluster::routing::{shard_for_document, shard_for_key};
use crate::query::logical::AttributePath;
use crate::query::metadata::{CollectionInfo, IndexDescriptor, IndexKind, MetadataProvider};
use crate::query::value::{compare_values, get_path, set_path, KEY_ATTRIBUTE};
use crate::types::{AqlError, Result};

const MAX_KEY_LENGTH: usize = 254;

/// Index entry: key values followed by the document key as tie breaker.
#[derive(Clone, Debug)]
struct IndexKey {
    values: Vec<Value>,
    key: String,
}

impl IndexKey {
    fn cmp_values(&self, other: &[Value]) -> Ordering {
        compare_value_lists(&self.values, other)
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_value_lists(&self.values, &other.values).then_with(|| self.key.cmp(&other.key))
    }
}

fn compare_value_lists(lhs: &[Value], rhs: &[Value]) -> Ordering {
    for (l, r) in lhs.iter().zip(rhs) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    lhs.len().cmp(&rhs.len())
}

#[derive(Clone, Debug, Default)]
struct ShardData {
    documents: BTreeMap<String, Value>,
    /// Aligned with `CollectionInfo::indexes`.
    indexes: Vec<BTreeSet<IndexKey>>,
}

#[derive(Clone, Debug)]
struct CollectionState {
    info: CollectionInfo,
    shards: Vec<ShardData>,
}

impl CollectionState {
    fn new(info: CollectionInfo) -> Self {
        let shards = (0..info.number_of_shards.max(1))
            .map(|_| ShardData {
                documents: BTreeMap::new(),
                indexes: vec![BTreeSet::new(); info.indexes.len()],
            })
            .collect();
        Self { info, shards }
    }

    fn locate(&self, key: &str) -> Option<(u32, &Value)> {
        if let Some(shard) = shard_for_key(&self.info, key) {
            return self
                .shards
                .get(shard as usize)
                .and_then(|s| s.documents.get(key))
                .map(|doc| (shard, doc));
        }
        self.shards
            .iter()
            .enumerate()
            .find_map(|(idx, s)| s.documents.get(key).map(|doc| (idx as u32, doc)))
    }

    fn remove_document(&mut self, shard: u32, key: &str) {
        let Some(data) = self.shards.get_mut(shard as usize) else {
            return;
        };
        if let Some(old) = data.documents.remove(key) {
            for (index, entries) in self.info.indexes.iter().zip(data.indexes.iter_mut()) {
                if let Some(values) = index_values(index, &old) {
                    entries.remove(&IndexKey {
                        values,
                        key: key.to_owned(),
                    });
                }
            }
        }
    }

    fn put_document(&mut self, shard: u32, key: &str, document: Value) {
        let Some(data) = self.shards.get_mut(shard as usize) else {
            return;
        };
        for (index, entries) in self.info.indexes.iter().zip(data.indexes.iter_mut()) {
            if let Some(values) = index_values(index, &document) {
                entries.insert(IndexKey {
                    values,
                    key: key.to_owned(),
                });
            }
        }
        data.documents.insert(key.to_owned(), document);
    }

    fn refresh_count(&mut self) {
        self.info.document_count = self.shards.iter().map(|s| s.documents.len() as u64).sum();
    }
}

/// Key values of `document` in `index`; `None` when a sparse index skips it.
fn index_values(index: &IndexDescriptor, document: &Value) -> Option<Vec<Value>> {
    let values: Vec<Value> = index
        .fields
        .iter()
        .map(|path| get_path(document, path.steps()).clone())
        .collect();
    if index.sparse && values.iter().any(Value::is_null) {
        return None;
    }
    Some(values)
}

struct StorageInner {
    collections: RwLock<BTreeMap<String, Arc<CollectionState>>>,
    stats: StorageStats,
    next_key: AtomicU64,
}

/// Document store kept entirely in memory.
///
/// Collections are split into shards by [`shard_for_document`]. Committed
/// state is copy-on-write: a transaction reads the collection snapshot that
/// was current when its cursor was opened and a commit swaps in new
/// snapshots atomically.
#[derive(Clone)]
pub struct InMemoryStorage {
    inner: Arc<StorageInner>,
}

impl InMemoryStorage {
    /// Starts a builder.
    pub fn builder() -> InMemoryStorageBuilder {
        InMemoryStorageBuilder::default()
    }

    /// Names of every collection.
    pub fn collection_names(&self) -> Vec<String> {
        self.inner.collections.read().keys().cloned().collect()
    }

    /// All committed documents of a collection in key order.
    pub fn documents(&self, collection: &str) -> Result<Vec<Value>> {
        let state = self.state(collection)?;
        let mut docs: Vec<(&String, &Value)> = state
            .shards
            .iter()
            .flat_map(|s| s.documents.iter())
            .collect();
        docs.sort_by(|a, b| a.0.cmp(b.0));
        Ok(docs.into_iter().map(|(_, doc)| doc.clone()).collect())
    }

    /// Committed documents of one shard in key order.
    pub fn shard_documents(&self, collection: &str, shard: u32) -> Result<Vec<Value>> {
        let state = self.state(collection)?;
        Ok(state
            .shards
            .get(shard as usize)
            .map(|s| s.documents.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Adds an index to a collection and indexes its documents.
    pub fn create_index(&self, collection: &str, index: IndexDescriptor) -> Result<()> {
        let mut collections = self.inner.collections.write();
        let state = collections
            .get_mut(collection)
            .ok_or_else(|| AqlError::CollectionNotFound(collection.to_owned()))?;
        if state.info.index(&index.id).is_some() {
            return Err(AqlError::Storage(format!(
                "duplicate index id '{}' in collection '{collection}'",
                index.id
            )));
        }
        let next = Arc::make_mut(state);
        for shard in &mut next.shards {
            let mut entries = BTreeSet::new();
            for (key, doc) in &shard.documents {
                if let Some(values) = index_values(&index, doc) {
                    entries.insert(IndexKey {
                        values,
                        key: key.clone(),
                    });
                }
            }
            shard.indexes.push(entries);
        }
        debug!(collection, index = %index, "index created");
        next.info.indexes.push(index);
        Ok(())
    }

    /// Drops a secondary index.
    pub fn drop_index(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.inner.collections.write();
        let state = collections
            .get_mut(collection)
            .ok_or_else(|| AqlError::CollectionNotFound(collection.to_owned()))?;
        let pos = state
            .info
            .indexes
            .iter()
            .position(|idx| idx.id == id && idx.kind != IndexKind::Primary)
            .ok_or_else(|| AqlError::IndexNotFound(format!("{collection}/{id}")))?;
        let next = Arc::make_mut(state);
        next.info.indexes.remove(pos);
        for shard in &mut next.shards {
            shard.indexes.remove(pos);
        }
        Ok(())
    }

    /// Shared access counters.
    pub fn counters(&self) -> &StorageStats {
        &self.inner.stats
    }

    fn state(&self, collection: &str) -> Result<Arc<CollectionState>> {
        self.inner.state(collection)
    }
}

impl StorageInner {
    fn state(&self, collection: &str) -> Result<Arc<CollectionState>> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| AqlError::CollectionNotFound(collection.to_owned()))
    }
}

impl MetadataProvider for InMemoryStorage {
    fn collection(&self, name: &str) -> Result<CollectionInfo> {
        self.state(name).map(|state| state.info.clone())
    }
}

impl Storage for InMemoryStorage {
    fn begin(&self) -> Result<Arc<dyn Transaction>> {
        trace!("transaction started");
        Ok(Arc::new(InMemoryTransaction {
            storage: Arc::clone(&self.inner),
            state: Mutex::new(TxnState::default()),
        }))
    }

    fn stats(&self) -> StorageStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

/// Builds an [`InMemoryStorage`] from collection definitions and documents.
#[derive(Default)]
pub struct InMemoryStorageBuilder {
    collections: Vec<(CollectionInfo, Vec<Value>)>,
}

impl InMemoryStorageBuilder {
    /// Adds a collection with initial documents. Documents without `_key`
    /// get a generated one.
    pub fn collection(mut self, info: CollectionInfo, documents: Vec<Value>) -> Self {
        self.collections.push((info, documents));
        self
    }

    /// Builds the storage, loading every document through a committed
    /// transaction so that keys and unique indexes are checked.
    pub fn build(self) -> Result<InMemoryStorage> {
        let storage = InMemoryStorage {
            inner: Arc::new(StorageInner {
                collections: RwLock::new(BTreeMap::new()),
                stats: StorageStats::default(),
                next_key: AtomicU64::new(1),
            }),
        };
        {
            let mut collections = storage.inner.collections.write();
            for (info, _) in &self.collections {
                let mut info = info.clone();
                if !info.indexes.iter().any(|idx| idx.kind == IndexKind::Primary) {
                    info.indexes.insert(0, IndexDescriptor::primary());
                }
                info.document_count = 0;
                collections.insert(info.name.clone(), Arc::new(CollectionState::new(info)));
            }
        }
        let txn = storage.begin()?;
        for (info, documents) in self.collections {
            for document in documents {
                txn.insert(&info.name, document)?;
            }
        }
        txn.commit()?;
        storage.inner.stats.reset();
        Ok(storage)
    }
}

#[derive(Clone, Debug)]
struct Staged {
    shard: u32,
    document: Option<Value>,
}

#[derive(Default)]
struct TxnState {
    staged: BTreeMap<String, BTreeMap<String, Staged>>,
    writes: usize,
    finished: bool,
}

/// Transaction over an [`InMemoryStorage`]. Rolls back when dropped uncommitted.
pub struct InMemoryTransaction {
    storage: Arc<StorageInner>,
    state: Mutex<TxnState>,
}

impl InMemoryTransaction {
    /// Current document for `key`: staged writes first, then committed state.
    fn current(
        txn: &TxnState,
        committed: &CollectionState,
        collection: &str,
        key: &str,
    ) -> Option<(u32, Value)> {
        if let Some(staged) = txn.staged.get(collection).and_then(|m| m.get(key)) {
            return staged.document.clone().map(|doc| (staged.shard, doc));
        }
        committed.locate(key).map(|(shard, doc)| (shard, doc.clone()))
    }

    fn check_open(txn: &TxnState) -> Result<()> {
        if txn.finished {
            return Err(AqlError::internal("transaction already finished"));
        }
        Ok(())
    }

    fn check_unique(
        txn: &TxnState,
        committed: &CollectionState,
        collection: &str,
        key: &str,
        document: &Value,
    ) -> Result<()> {
        let staged = txn.staged.get(collection);
        for (pos, index) in committed.info.indexes.iter().enumerate() {
            if !index.unique || index.kind == IndexKind::Primary {
                continue;
            }
            let Some(values) = index_values(index, document) else {
                continue;
            };
            let lower = IndexKey {
                values: values.clone(),
                key: String::new(),
            };
            let committed_conflict = committed.shards.iter().find_map(|shard| {
                shard.indexes.get(pos).and_then(|entries| {
                    entries
                        .range(lower.clone()..)
                        .take_while(|entry| entry.cmp_values(&values) == Ordering::Equal)
                        .find(|entry| {
                            entry.key != key
                                && staged.map_or(true, |m| !m.contains_key(&entry.key))
                        })
                        .map(|entry| entry.key.clone())
                })
            });
            let staged_conflict = staged.and_then(|m| {
                m.iter().find_map(|(other_key, entry)| {
                    let doc = entry.document.as_ref()?;
                    (other_key != key
                        && index_values(index, doc)
                            .is_some_and(|v| compare_value_lists(&v, &values) == Ordering::Equal))
                    .then(|| other_key.clone())
                })
            });
            if let Some(conflict) = committed_conflict.or(staged_conflict) {
                return Err(unique_violation(index, conflict));
            }
        }
        Ok(())
    }

    fn stage(txn: &mut TxnState, collection: &str, key: &str, shard: u32, document: Option<Value>) {
        txn.staged
            .entry(collection.to_owned())
            .or_default()
            .insert(key.to_owned(), Staged { shard, document });
        txn.writes += 1;
    }

    fn generate_key(&self, txn: &TxnState, committed: &CollectionState, collection: &str) -> String {
        loop {
            let key = self
                .storage
                .next_key
                .fetch_add(1, AtomicOrdering::Relaxed)
                .to_string();
            if Self::current(txn, committed, collection, &key).is_none() {
                return key;
            }
        }
    }
}

fn unique_violation(index: &IndexDescriptor, key: String) -> AqlError {
    let fields: Vec<String> = index.fields.iter().map(ToString::to_string).collect();
    AqlError::UniqueConstraint {
        index: index.id.clone(),
        kind: index.kind.name().to_owned(),
        fields: fields.join(", "),
        key,
    }
}

/// Checks the shape of a document key.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-:.@()+,=;$!*'%".contains(c));
    if valid {
        Ok(())
    } else {
        Err(AqlError::DocumentKeyBad(key.to_owned()))
    }
}

fn require_object(document: Value) -> Result<Map<String, Value>> {
    match document {
        Value::Object(map) => Ok(map),
        other => Err(AqlError::DocumentTypeInvalid(format!(
            "expecting an object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursively merges `patch` into `base`; `_key` is never changed.
fn merge_objects(base: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (name, value) in patch {
        if name == KEY_ATTRIBUTE {
            continue;
        }
        match (base.get_mut(&name), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_objects(existing, nested)
            }
            (_, value) => {
                base.insert(name, value);
            }
        }
    }
}

impl Transaction for InMemoryTransaction {
    fn fetch(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let committed = self.storage.state(collection)?;
        let found = committed.locate(key).map(|(_, doc)| doc.clone());
        if found.is_some() {
            self.storage.stats.document_fetched();
        }
        Ok(found)
    }

    fn scan(&self, collection: &str, shard: Option<u32>) -> Result<Box<dyn DocumentCursor>> {
        let committed = self.storage.state(collection)?;
        self.storage.stats.full_scan();
        let mut entries: Vec<CursorEntry> = committed
            .shards
            .iter()
            .enumerate()
            .filter(|(idx, _)| shard.map_or(true, |s| s as usize == *idx))
            .flat_map(|(idx, data)| {
                data.documents.keys().map(move |key| CursorEntry {
                    shard: idx as u32,
                    key: key.clone(),
                    values: Vec::new(),
                })
            })
            .collect();
        if shard.is_none() {
            entries.sort_by(|a, b| a.key.cmp(&b.key));
        }
        Ok(Box::new(SnapshotCursor {
            state: committed,
            entries,
            pos: 0,
            covering: None,
            storage: Arc::clone(&self.storage),
        }))
    }

    fn index_scan(
        &self,
        collection: &str,
        shard: Option<u32>,
        request: IndexScanRequest,
    ) -> Result<Box<dyn DocumentCursor>> {
        let committed = self.storage.state(collection)?;
        let pos = committed
            .info
            .indexes
            .iter()
            .position(|idx| idx.id == request.index)
            .ok_or_else(|| AqlError::IndexNotFound(format!("{collection}/{}", request.index)))?;
        self.storage.stats.index_scan();
        let mut matched: Vec<(u32, &IndexKey)> = Vec::new();
        for (idx, data) in committed.shards.iter().enumerate() {
            if shard.is_some_and(|s| s as usize != idx) {
                continue;
            }
            let Some(entries) = data.indexes.get(pos) else {
                continue;
            };
            for entry in entries {
                if request.ranges.iter().any(|range| in_range(range, &entry.values)) {
                    matched.push((idx as u32, entry));
                }
            }
        }
        matched.sort_by(|a, b| a.1.cmp(b.1));
        matched.dedup_by(|a, b| a.1.key == b.1.key);
        if request.reverse {
            matched.reverse();
        }
        let entries = matched
            .into_iter()
            .map(|(shard, entry)| CursorEntry {
                shard,
                key: entry.key.clone(),
                values: entry.values.clone(),
            })
            .collect();
        let covering = request
            .covering
            .then(|| committed.info.indexes[pos].fields.clone());
        Ok(Box::new(SnapshotCursor {
            state: committed,
            entries,
            pos: 0,
            covering,
            storage: Arc::clone(&self.storage),
        }))
    }

    fn insert(&self, collection: &str, document: Value) -> Result<Value> {
        let committed = self.storage.state(collection)?;
        let mut txn = self.state.lock();
        Self::check_open(&txn)?;
        let mut map = require_object(document)?;
        let key = match map.get(KEY_ATTRIBUTE) {
            Some(Value::String(key)) => {
                validate_key(key)?;
                key.clone()
            }
            Some(other) => return Err(AqlError::DocumentKeyBad(other.to_string())),
            None => {
                let key = self.generate_key(&txn, &committed, collection);
                map.insert(KEY_ATTRIBUTE.to_owned(), Value::String(key.clone()));
                key
            }
        };
        if Self::current(&txn, &committed, collection, &key).is_some() {
            return Err(unique_violation(&IndexDescriptor::primary(), key));
        }
        let document = Value::Object(map);
        Self::check_unique(&txn, &committed, collection, &key, &document)?;
        let shard = shard_for_document(&committed.info, &document);
        Self::stage(&mut txn, collection, &key, shard, Some(document.clone()));
        Ok(document)
    }

    fn update(&self, collection: &str, key: &str, patch: Value) -> Result<(Value, Value)> {
        let committed = self.storage.state(collection)?;
        let mut txn = self.state.lock();
        Self::check_open(&txn)?;
        let patch = require_object(patch)?;
        let (shard, old) = Self::current(&txn, &committed, collection, key)
            .ok_or_else(|| AqlError::DocumentNotFound(format!("{collection}/{key}")))?;
        let mut next = require_object(old.clone())?;
        merge_objects(&mut next, patch);
        let new = Value::Object(next);
        Self::check_unique(&txn, &committed, collection, key, &new)?;
        Self::stage(&mut txn, collection, key, shard, Some(new.clone()));
        Ok((old, new))
    }

    fn replace(&self, collection: &str, key: &str, document: Value) -> Result<(Value, Value)> {
        let committed = self.storage.state(collection)?;
        let mut txn = self.state.lock();
        Self::check_open(&txn)?;
        let mut next = require_object(document)?;
        let (shard, old) = Self::current(&txn, &committed, collection, key)
            .ok_or_else(|| AqlError::DocumentNotFound(format!("{collection}/{key}")))?;
        next.insert(KEY_ATTRIBUTE.to_owned(), Value::String(key.to_owned()));
        let new = Value::Object(next);
        Self::check_unique(&txn, &committed, collection, key, &new)?;
        Self::stage(&mut txn, collection, key, shard, Some(new.clone()));
        Ok((old, new))
    }

    fn remove(&self, collection: &str, key: &str) -> Result<Value> {
        let committed = self.storage.state(collection)?;
        let mut txn = self.state.lock();
        Self::check_open(&txn)?;
        let (shard, old) = Self::current(&txn, &committed, collection, key)
            .ok_or_else(|| AqlError::DocumentNotFound(format!("{collection}/{key}")))?;
        Self::stage(&mut txn, collection, key, shard, None);
        Ok(old)
    }

    fn commit(&self) -> Result<()> {
        let mut txn = self.state.lock();
        Self::check_open(&txn)?;
        let staged = std::mem::take(&mut txn.staged);
        let mut collections = self.storage.collections.write();
        for (name, writes) in staged {
            let state = collections
                .get_mut(&name)
                .ok_or_else(|| AqlError::CollectionNotFound(name.clone()))?;
            let next = Arc::make_mut(state);
            for (key, entry) in writes {
                let located = next.locate(&key).map(|(shard, _)| shard);
                if let Some(shard) = located {
                    next.remove_document(shard, &key);
                }
                if let Some(document) = entry.document {
                    next.put_document(entry.shard, &key, document);
                }
            }
            next.refresh_count();
        }
        txn.finished = true;
        self.storage.stats.committed();
        debug!(writes = txn.writes, "transaction committed");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut txn = self.state.lock();
        Self::check_open(&txn)?;
        txn.staged.clear();
        txn.finished = true;
        self.storage.stats.rolled_back();
        debug!(discarded = txn.writes, "transaction rolled back");
        Ok(())
    }

    fn pending_writes(&self) -> usize {
        let txn = self.state.lock();
        if txn.finished {
            0
        } else {
            txn.writes
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        let finished = self.state.get_mut().finished;
        if !finished {
            let _ = self.rollback();
        }
    }
}

fn in_range(range: &IndexRange, values: &[Value]) -> bool {
    let fixed = range.prefix.len();
    if values.len() < fixed
        || compare_value_lists(&values[..fixed], &range.prefix) != Ordering::Equal
    {
        return false;
    }
    let unbounded = matches!(
        (&range.lower, &range.upper),
        (Bound::Unbounded, Bound::Unbounded)
    );
    if unbounded {
        return true;
    }
    let Some(value) = values.get(fixed) else {
        return false;
    };
    let above = match &range.lower {
        Bound::Unbounded => true,
        Bound::Included(low) => compare_values(value, low) != Ordering::Less,
        Bound::Excluded(low) => compare_values(value, low) == Ordering::Greater,
    };
    let below = match &range.upper {
        Bound::Unbounded => true,
        Bound::Included(high) => compare_values(value, high) != Ordering::Greater,
        Bound::Excluded(high) => compare_values(value, high) == Ordering::Less,
    };
    above && below
}

struct CursorEntry {
    shard: u32,
    key: String,
    values: Vec<Value>,
}

/// Cursor over a pinned collection snapshot. Documents are only fetched
/// when they are returned, and never for covering scans.
struct SnapshotCursor {
    state: Arc<CollectionState>,
    entries: Vec<CursorEntry>,
    pos: usize,
    covering: Option<Vec<AttributePath>>,
    storage: Arc<StorageInner>,
}

impl DocumentCursor for SnapshotCursor {
    fn next_batch(&mut self, out: &mut Vec<Value>, max: usize) -> Result<bool> {
        let end = (self.pos + max).min(self.entries.len());
        for entry in &self.entries[self.pos..end] {
            match &self.covering {
                Some(fields) => {
                    let mut partial = Value::Object(Map::new());
                    set_path(
                        &mut partial,
                        &[KEY_ATTRIBUTE.to_owned()],
                        Value::String(entry.key.clone()),
                    );
                    for (path, value) in fields.iter().zip(&entry.values) {
                        set_path(&mut partial, path.steps(), value.clone());
                    }
                    out.push(partial);
                }
                None => {
                    let doc = self
                        .state
                        .shards
                        .get(entry.shard as usize)
                        .and_then(|s| s.documents.get(&entry.key))
                        .ok_or_else(|| {
                            AqlError::Storage(format!("dangling index entry '{}'", entry.key))
                        })?;
                    self.storage.stats.document_fetched();
                    out.push(doc.clone());
                }
            }
        }
        self.pos = end;
        Ok(self.pos < self.entries.len())
    }

    fn skip(&mut self, count: usize) -> Result<usize> {
        let skipped = count.min(self.entries.len() - self.pos);
        self.pos += skipped;
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> InMemoryStorage {
        InMemoryStorage::builder()
            .collection(
                CollectionInfo::new("c", 0)
                    .with_index(IndexDescriptor::new("by_a", IndexKind::Sorted, &["a"]))
                    .with_index(
                        IndexDescriptor::new("by_u", IndexKind::Hash, &["u"])
                            .unique()
                            .sparse(),
                    ),
                (0..10)
                    .map(|i| json!({"_key": format!("k{i}"), "a": i % 5, "b": i}))
                    .collect(),
            )
            .build()
            .expect("storage")
    }

    fn drain(mut cursor: Box<dyn DocumentCursor>) -> Vec<Value> {
        let mut out = Vec::new();
        while cursor.next_batch(&mut out, 3).expect("batch") {}
        out
    }

    #[test]
    fn metadata_reports_counts_and_primary_index() {
        let info = storage().collection("c").expect("info");
        assert_eq!(info.document_count, 10);
        assert_eq!(info.indexes[0].kind, IndexKind::Primary);
    }

    #[test]
    fn range_scan_is_ordered_and_reversible() {
        let storage = storage();
        let txn = storage.begin().expect("txn");
        let request = |reverse| IndexScanRequest {
            index: "by_a".into(),
            ranges: vec![IndexRange {
                prefix: vec![],
                lower: Bound::Included(json!(3)),
                upper: Bound::Unbounded,
            }],
            covering: false,
            reverse,
        };
        let forward = drain(txn.index_scan("c", None, request(false)).expect("scan"));
        let values: Vec<i64> = forward.iter().map(|d| d["a"].as_i64().unwrap_or(-1)).collect();
        assert_eq!(values, [3, 3, 4, 4]);
        let backward = drain(txn.index_scan("c", None, request(true)).expect("scan"));
        assert_eq!(backward[0]["a"], json!(4));
    }

    #[test]
    fn covering_scans_never_fetch() {
        let storage = storage();
        let txn = storage.begin().expect("txn");
        let docs = drain(
            txn.index_scan(
                "c",
                None,
                IndexScanRequest {
                    index: "by_a".into(),
                    ranges: vec![IndexRange::prefix(vec![json!(1)])],
                    covering: true,
                    reverse: false,
                },
            )
            .expect("scan"),
        );
        assert_eq!(docs, [json!({"_key": "k1", "a": 1}), json!({"_key": "k6", "a": 1})]);
        assert_eq!(storage.stats().documents_fetched, 0);
        drain(txn.scan("c", None).expect("scan"));
        assert_eq!(storage.stats().documents_fetched, 10);
    }

    #[test]
    fn skipping_does_not_fetch() {
        let storage = storage();
        let txn = storage.begin().expect("txn");
        let mut cursor = txn.scan("c", None).expect("scan");
        assert_eq!(cursor.skip(8).expect("skip"), 8);
        assert_eq!(cursor.skip(8).expect("skip"), 2);
        assert_eq!(storage.stats().documents_fetched, 0);
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let storage = storage();
        let txn = storage.begin().expect("txn");
        txn.insert("c", json!({"_key": "new", "a": 9})).expect("insert");
        txn.remove("c", "k0").expect("remove");
        assert_eq!(storage.documents("c").expect("docs").len(), 10);
        txn.commit().expect("commit");
        let docs = storage.documents("c").expect("docs");
        assert_eq!(docs.len(), 10);
        assert!(docs.iter().any(|d| d["_key"] == "new"));
        assert!(!docs.iter().any(|d| d["_key"] == "k0"));
        assert_eq!(storage.collection("c").expect("info").document_count, 10);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let storage = storage();
        {
            let txn = storage.begin().expect("txn");
            txn.update("c", "k1", json!({"a": 100})).expect("update");
        }
        assert_eq!(storage.documents("c").expect("docs")[1]["a"], json!(1));
        assert_eq!(storage.stats().rollbacks, 1);
    }

    #[test]
    fn document_errors_carry_codes() {
        let storage = storage();
        let txn = storage.begin().expect("txn");
        assert_eq!(txn.insert("c", json!({"_key": "k1"})).unwrap_err().code(), 1210);
        assert_eq!(txn.insert("c", json!({"_key": "bad key"})).unwrap_err().code(), 1221);
        assert_eq!(txn.insert("c", json!([1])).unwrap_err().code(), 1227);
        assert_eq!(txn.remove("c", "nope").unwrap_err().code(), 1202);
        txn.insert("c", json!({"u": 1})).expect("first");
        assert_eq!(txn.insert("c", json!({"u": 1})).unwrap_err().code(), 1210);
        txn.insert("c", json!({"v": 1})).expect("sparse index skips missing");
        txn.insert("c", json!({"v": 2})).expect("sparse index skips missing");
    }

    #[test]
    fn update_merges_nested_objects() {
        let storage = InMemoryStorage::builder()
            .collection(
                CollectionInfo::new("c", 0),
                vec![json!({"_key": "a", "n": {"x": 1, "y": 2}})],
            )
            .build()
            .expect("storage");
        let txn = storage.begin().expect("txn");
        let (old, new) = txn
            .update("c", "a", json!({"_key": "zzz", "n": {"y": 3}, "m": true}))
            .expect("update");
        assert_eq!(old, json!({"_key": "a", "n": {"x": 1, "y": 2}}));
        assert_eq!(new, json!({"_key": "a", "n": {"x": 1, "y": 3}, "m": true}));
    }

    #[test]
    fn documents_land_on_routed_shards() {
        let info = CollectionInfo::new("s", 0).with_shards(3, &[]);
        let docs: Vec<Value> = (0..30).map(|i| json!({"_key": format!("d{i}")})).collect();
        let storage = InMemoryStorage::builder()
            .collection(info.clone(), docs)
            .build()
            .expect("storage");
        let mut total = 0;
        for shard in 0..3 {
            let docs = storage.shard_documents("s", shard).expect("shard");
            for doc in &docs {
                assert_eq!(shard_for_document(&info, doc), shard);
            }
            total += docs.len();
        }
        assert_eq!(total, 30);
        let txn = storage.begin().expect("txn");
        assert_eq!(
            drain(txn.scan("s", Some(1)).expect("scan")).len(),
            storage.shard_documents("s", 1).expect("shard").len()
        );
    }

    #[test]
    fn created_index_is_backfilled() {
        let storage = storage();
        storage
            .create_index("c", IndexDescriptor::new("by_b", IndexKind::Sorted, &["b"]))
            .expect("create");
        let txn = storage.begin().expect("txn");
        let docs = drain(
            txn.index_scan(
                "c",
                None,
                IndexScanRequest {
                    index: "by_b".into(),
                    ranges: vec![IndexRange::prefix(vec![json!(7)])],
                    covering: false,
                    reverse: false,
                },
            )
            .expect("scan"),
        );
        assert_eq!(docs.len(), 1);
        storage.drop_index("c", "by_b").expect("drop");
        assert!(storage.collection("c").expect("info").index("by_b").is_none());
    }
}
