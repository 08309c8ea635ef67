//! Collection and index metadata consumed by the planner and compiler.
//!
//! Planning reads metadata through [`MetadataProvider`]. Each query takes a
//! [`MetadataSnapshot`] once, before optimization; the optimizer, the explain
//! output and the block compiler all work off that snapshot so index changes
//! made by other transactions never leak into a running query.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::query::logical::{AttributePath, Plan};
use crate::query::value::KEY_ATTRIBUTE;
use crate::types::{AqlError, Result};

/// Index implementation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Implicit primary-key index on `_key`.
    Primary,
    /// Equality-only hash index; usable when every field is matched.
    Hash,
    /// Sorted index supporting equality prefixes, ranges and ordered iteration.
    Sorted,
    /// Edge index on `_from` / `_to`.
    Edge,
    /// Geo index; only used by geo functions.
    Geo,
    /// Full-text index; only used by full-text functions.
    Fulltext,
}

impl IndexKind {
    /// Kind name.
    pub fn name(self) -> &'static str {
        match self {
            IndexKind::Primary => "primary",
            IndexKind::Hash => "hash",
            IndexKind::Sorted => "sorted",
            IndexKind::Edge => "edge",
            IndexKind::Geo => "geo",
            IndexKind::Fulltext => "fulltext",
        }
    }

    /// True when the index can answer range lookups and provides a native order.
    pub fn is_sorted(self) -> bool {
        matches!(self, IndexKind::Primary | IndexKind::Sorted)
    }

    /// True when the index can answer attribute comparisons at all.
    pub fn supports_comparisons(self) -> bool {
        !matches!(self, IndexKind::Geo | IndexKind::Fulltext)
    }
}

/// Description of one index of a collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index identifier, unique per collection.
    pub id: String,
    /// Implementation kind.
    pub kind: IndexKind,
    /// Indexed attribute paths, in order.
    pub fields: Vec<AttributePath>,
    /// Rejects duplicate key tuples.
    #[serde(default)]
    pub unique: bool,
    /// Omits documents where an indexed attribute is null or missing.
    #[serde(default)]
    pub sparse: bool,
    /// Estimated number of distinct key tuples, when known.
    #[serde(default)]
    pub distinct_estimate: Option<u64>,
}

impl IndexDescriptor {
    /// Implicit primary index.
    pub fn primary() -> Self {
        Self {
            id: "primary".to_owned(),
            kind: IndexKind::Primary,
            fields: vec![AttributePath(vec![KEY_ATTRIBUTE.to_owned()])],
            unique: true,
            sparse: false,
            distinct_estimate: None,
        }
    }

    /// Secondary index over dotted field names.
    pub fn new(id: impl Into<String>, kind: IndexKind, fields: &[&str]) -> Self {
        Self {
            id: id.into(),
            kind,
            fields: fields.iter().map(|f| AttributePath::parse(f)).collect(),
            unique: false,
            sparse: false,
            distinct_estimate: None,
        }
    }

    /// Marks the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the index sparse.
    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// True if `path` can be served from the index key data alone.
    pub fn covers(&self, path: &AttributePath) -> bool {
        matches!(path.steps(), [only] if only == KEY_ATTRIBUTE)
            || self.fields.iter().any(|f| f.is_prefix_of(path))
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<String> = self.fields.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{} ({}{}{}) [{}]",
            self.id,
            self.kind.name(),
            if self.unique { ", unique" } else { "" },
            if self.sparse { ", sparse" } else { "" },
            fields.join(", ")
        )
    }
}

/// Planning-relevant facts about one collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Collection name.
    pub name: String,
    /// Current document count.
    pub document_count: u64,
    /// Index set in declaration order; the primary index always comes first.
    pub indexes: Vec<IndexDescriptor>,
    /// Number of shards; one means not sharded.
    pub number_of_shards: u32,
    /// Shard key attributes.
    pub shard_keys: Vec<AttributePath>,
}

impl CollectionInfo {
    /// Unsharded collection with only the primary index.
    pub fn new(name: impl Into<String>, document_count: u64) -> Self {
        Self {
            name: name.into(),
            document_count,
            indexes: vec![IndexDescriptor::primary()],
            number_of_shards: 1,
            shard_keys: vec![AttributePath(vec![KEY_ATTRIBUTE.to_owned()])],
        }
    }

    /// Adds a secondary index.
    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    /// Sets the shard layout.
    pub fn with_shards(mut self, shards: u32, keys: &[&str]) -> Self {
        self.number_of_shards = shards.max(1);
        if !keys.is_empty() {
            self.shard_keys = keys.iter().map(|k| AttributePath::parse(k)).collect();
        }
        self
    }

    /// True when the collection is split across more than one shard.
    pub fn is_sharded(&self) -> bool {
        self.number_of_shards > 1
    }

    /// Looks up an index by id.
    pub fn index(&self, id: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|idx| idx.id == id)
    }
}

/// Read-only access to collection metadata.
pub trait MetadataProvider: Send + Sync {
    /// Returns the current metadata of `name`.
    fn collection(&self, name: &str) -> Result<CollectionInfo>;
}

/// Copy of the metadata of every collection a plan touches, taken once per query.
#[derive(Clone, Debug, Default)]
pub struct MetadataSnapshot {
    collections: BTreeMap<String, Arc<CollectionInfo>>,
}

impl MetadataSnapshot {
    /// Snapshots every collection referenced by `plan`.
    pub fn capture(provider: &dyn MetadataProvider, plan: &Plan) -> Result<Self> {
        let mut collections = BTreeMap::new();
        for name in plan.collections() {
            let info = provider.collection(&name)?;
            collections.insert(name, Arc::new(info));
        }
        Ok(Self { collections })
    }

    /// Builds a snapshot from explicit entries.
    pub fn from_collections(infos: impl IntoIterator<Item = CollectionInfo>) -> Self {
        Self {
            collections: infos
                .into_iter()
                .map(|info| (info.name.clone(), Arc::new(info)))
                .collect(),
        }
    }

    /// Metadata of `name`.
    pub fn get(&self, name: &str) -> Result<&Arc<CollectionInfo>> {
        self.collections
            .get(name)
            .ok_or_else(|| AqlError::CollectionNotFound(name.to_owned()))
    }

    /// Iterates all captured collections.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CollectionInfo>> {
        self.collections.values()
    }
}

impl MetadataProvider for MetadataSnapshot {
    fn collection(&self, name: &str) -> Result<CollectionInfo> {
        self.get(name).map(|info| info.as_ref().clone())
    }
}
