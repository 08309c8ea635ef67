use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Bound;

use serde_json::{Map, Value};
use tracing::trace;

use crate::exec::block::{BlockCall, ExecContext, ExecutionBlock, Step, Upstream};
use crate::exec::blocks::expect_rows;
use crate::exec::row::{Extended, Row};
use crate::primitives::fault::points;
use crate::query::expr::{Bindings, Expression};
use crate::query::logical::{FieldLookup, IndexCondition, ProjectionSet, RangeBound, VariableId};
use crate::query::metadata::IndexDescriptor;
use crate::query::value::{compare_values, get_path, is_truthy, set_path};
use crate::storage::{DocumentCursor, IndexRange, IndexScanRequest};
use crate::types::{AqlError, Result};

/// Where a [`ScanBlock`] reads its documents from.
pub enum ScanSource {
    /// Every document of the collection, in key order.
    Collection,
    /// Documents matching an index condition, in index order.
    Index {
        /// Index snapshot taken at planning time.
        index: IndexDescriptor,
        /// Lookups evaluated per input row.
        condition: IndexCondition,
        /// Serve projections from index key data.
        covering: bool,
        /// Iterate in descending order.
        reverse: bool,
    },
}

struct OpenCursor {
    row: Row,
    cursor: Box<dyn DocumentCursor>,
}

/// EnumerateCollection and IndexScan: for every input row, iterates the
/// matching documents and emits one row per document.
pub struct ScanBlock {
    collection: String,
    source: ScanSource,
    out: VariableId,
    projections: ProjectionSet,
    filter: Option<Expression>,
    shard: Option<u32>,
    pending: VecDeque<Row>,
    current: Option<OpenCursor>,
    upstream_done: bool,
    fetched: u64,
}

impl ScanBlock {
    /// Scan of `collection`, restricted to one shard when `shard` is set.
    pub fn new(
        collection: impl Into<String>,
        source: ScanSource,
        out: VariableId,
        projections: ProjectionSet,
        filter: Option<Expression>,
        shard: Option<u32>,
    ) -> Self {
        Self {
            collection: collection.into(),
            source,
            out,
            projections,
            filter,
            shard,
            pending: VecDeque::new(),
            current: None,
            upstream_done: false,
            fetched: 0,
        }
    }

    fn covering(&self) -> bool {
        matches!(self.source, ScanSource::Index { covering: true, .. })
    }

    fn open(&self, row: &Row, ctx: &ExecContext) -> Result<Box<dyn DocumentCursor>> {
        match &self.source {
            ScanSource::Collection => {
                ctx.check_fault(points::ENUMERATE_SCAN)?;
                ctx.txn().scan(&self.collection, self.shard)
            }
            ScanSource::Index {
                index,
                condition,
                covering,
                reverse,
            } => {
                ctx.check_fault(points::INDEX_OPEN_ITERATOR)?;
                let info = ctx.metadata().get(&self.collection)?;
                if info.index(&index.id).is_none() {
                    return Err(AqlError::IndexNotFound(format!(
                        "{}/{}",
                        self.collection, index.id
                    )));
                }
                let ranges = index_ranges(condition, row)?;
                trace!(index = %index.id, ranges = ranges.len(), "open index cursor");
                ctx.txn().index_scan(
                    &self.collection,
                    self.shard,
                    IndexScanRequest {
                        index: index.id.clone(),
                        ranges,
                        covering: *covering,
                        reverse: *reverse,
                    },
                )
            }
        }
    }

    fn accepts(&self, row: &Row, doc: &Value) -> Result<bool> {
        let Some(filter) = &self.filter else {
            return Ok(true);
        };
        let bindings = Extended {
            row,
            var: self.out,
            value: doc,
        };
        Ok(is_truthy(&filter.evaluate(&bindings)?))
    }

    fn project(&self, doc: Value) -> Value {
        if self.projections.is_empty() || self.covering() {
            return doc;
        }
        let mut partial = Value::Object(Map::new());
        for path in self.projections.paths() {
            set_path(&mut partial, path.steps(), get_path(&doc, path.steps()).clone());
        }
        partial
    }
}

impl ExecutionBlock for ScanBlock {
    fn kind(&self) -> &'static str {
        match self.source {
            ScanSource::Collection => "EnumerateCollection",
            ScanSource::Index { .. } => "IndexScan",
        }
    }

    fn step(&mut self, call: BlockCall, input: Option<Upstream>, ctx: &ExecContext) -> Result<Step> {
        if let Some((rows, done)) = expect_rows(self.kind(), input)? {
            self.pending.extend(rows);
            self.upstream_done = done;
        }
        let wanted = call.count();
        let skipping = matches!(call, BlockCall::Skip(_));
        let mut produced: Vec<Row> = Vec::new();
        let mut skipped = 0usize;
        while produced.len() + skipped < wanted {
            let Some(open) = self.current.as_mut() else {
                match self.pending.pop_front() {
                    Some(row) => {
                        let cursor = self.open(&row, ctx)?;
                        self.current = Some(OpenCursor { row, cursor });
                        continue;
                    }
                    None if self.upstream_done => break,
                    None if produced.is_empty() && skipped == 0 => {
                        return Ok(Step::Pull(BlockCall::Get(ctx.batch_size())));
                    }
                    None => break,
                }
            };
            let remaining = wanted - produced.len() - skipped;
            if skipping && self.filter.is_none() {
                let advanced = open.cursor.skip(remaining)?;
                skipped += advanced;
                if advanced < remaining {
                    self.current = None;
                }
                continue;
            }
            let mut docs = Vec::with_capacity(remaining);
            let more = open.cursor.next_batch(&mut docs, remaining)?;
            let row = open.row.clone();
            if !more {
                self.current = None;
            }
            if !self.covering() {
                self.fetched += docs.len() as u64;
            }
            for doc in docs {
                if !self.accepts(&row, &doc)? {
                    continue;
                }
                if skipping {
                    skipped += 1;
                } else {
                    produced.push(row.with(self.out, self.project(doc)));
                }
            }
        }
        let done = self.current.is_none() && self.pending.is_empty() && self.upstream_done;
        Ok(if skipping {
            Step::Skipped {
                count: skipped,
                done,
            }
        } else {
            Step::Rows {
                rows: produced,
                done,
            }
        })
    }

    fn reset(&mut self, _seed: &Row) {
        self.pending.clear();
        self.current = None;
        self.upstream_done = false;
    }

    fn documents_fetched(&self) -> u64 {
        self.fetched
    }
}

/// Evaluates the lookups of `condition` against `bindings` into index ranges.
///
/// Equality and IN lookups on the leading fields expand into the cartesian
/// product of their values; a trailing range lookup bounds the next field.
/// An IN over a non-array or an empty array matches nothing.
pub(crate) fn index_ranges(condition: &IndexCondition, bindings: &dyn Bindings) -> Result<Vec<IndexRange>> {
    let mut prefixes: Vec<Vec<Value>> = vec![Vec::new()];
    let mut lower = Bound::Unbounded;
    let mut upper = Bound::Unbounded;
    for lookup in &condition.lookups {
        match lookup {
            FieldLookup::Eq { value } => {
                let value = value.evaluate(bindings)?;
                for prefix in &mut prefixes {
                    prefix.push(value.clone());
                }
            }
            FieldLookup::In { values } => {
                let mut choices = match values.evaluate(bindings)? {
                    Value::Array(items) => items,
                    _ => Vec::new(),
                };
                choices.sort_by(compare_values);
                choices.dedup_by(|a, b| compare_values(a, b) == Ordering::Equal);
                prefixes = prefixes
                    .iter()
                    .flat_map(|prefix| {
                        choices.iter().map(move |choice| {
                            let mut next = prefix.clone();
                            next.push(choice.clone());
                            next
                        })
                    })
                    .collect();
            }
            FieldLookup::Range {
                lower: low,
                upper: high,
            } => {
                lower = bound(low.as_ref(), bindings)?;
                upper = bound(high.as_ref(), bindings)?;
                break;
            }
        }
    }
    Ok(prefixes
        .into_iter()
        .map(|prefix| IndexRange {
            prefix,
            lower: lower.clone(),
            upper: upper.clone(),
        })
        .collect())
}

fn bound(bound: Option<&RangeBound>, bindings: &dyn Bindings) -> Result<Bound<Value>> {
    let Some(bound) = bound else {
        return Ok(Bound::Unbounded);
    };
    let value = bound.value.evaluate(bindings)?;
    Ok(if bound.inclusive {
        Bound::Included(value)
    } else {
        Bound::Excluded(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing;
    use crate::query::logical::{AttributePath, RangeBound};
    use crate::query::metadata::{CollectionInfo, IndexKind};
    use crate::storage::{InMemoryStorage, Storage};
    use serde_json::json;

    const DOC: VariableId = VariableId(1);

    fn storage() -> InMemoryStorage {
        testing::storage(vec![(
            CollectionInfo::new("c", 0).with_index(IndexDescriptor::new("by_a", IndexKind::Sorted, &["a"])),
            (0..20)
                .map(|i| json!({"_key": format!("k{i:02}"), "a": i, "b": i % 3}))
                .collect(),
        )])
    }

    fn by_a(condition: IndexCondition, covering: bool) -> ScanSource {
        ScanSource::Index {
            index: IndexDescriptor::new("by_a", IndexKind::Sorted, &["a"]),
            condition,
            covering,
            reverse: false,
        }
    }

    fn drive(block: &mut ScanBlock, call: BlockCall, ctx: &ExecContext) -> Step {
        match block.step(call, None, ctx).expect("first step") {
            Step::Pull(_) => block
                .step(
                    call,
                    Some(Upstream::Rows {
                        rows: vec![Row::new()],
                        done: true,
                    }),
                    ctx,
                )
                .expect("second step"),
            other => other,
        }
    }

    #[test]
    fn full_scan_applies_filter_and_projection() {
        let storage = storage();
        let ctx = testing::context(&storage);
        let filter = Expression::compare(
            crate::query::expr::CompareOp::Eq,
            Expression::attribute(DOC, "b"),
            Expression::value(json!(0)),
        );
        let mut block = ScanBlock::new(
            "c",
            ScanSource::Collection,
            DOC,
            ProjectionSet::new(vec![AttributePath::parse("a")]),
            Some(filter),
            None,
        );
        match drive(&mut block, BlockCall::Get(100), &ctx) {
            Step::Rows { rows, done } => {
                assert!(done);
                assert_eq!(rows.len(), 7);
                assert_eq!(rows[0].get(DOC), Some(&json!({"a": 0})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn range_lookup_and_skip_without_fetching() {
        let storage = storage();
        let ctx = testing::context(&storage);
        let condition = IndexCondition {
            lookups: vec![FieldLookup::Range {
                lower: Some(RangeBound {
                    value: Expression::value(json!(5)),
                    inclusive: true,
                }),
                upper: None,
            }],
            covered: vec![],
        };
        let mut block = ScanBlock::new("c", by_a(condition, false), DOC, ProjectionSet::default(), None, None);
        match drive(&mut block, BlockCall::Skip(10), &ctx) {
            Step::Skipped { count, done } => assert_eq!((count, done), (10, false)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(storage.stats().documents_fetched, 0);
        match block.step(BlockCall::Get(100), None, &ctx).expect("rest") {
            Step::Rows { rows, done } => {
                assert!(done);
                let a: Vec<_> = rows.iter().map(|r| r.get(DOC).and_then(|d| d.get("a")).cloned()).collect();
                assert_eq!(a, (15..20).map(|i| Some(json!(i))).collect::<Vec<_>>());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(block.documents_fetched(), 5);
    }

    #[test]
    fn covering_scan_never_fetches() {
        let storage = storage();
        let ctx = testing::context(&storage);
        let mut block = ScanBlock::new(
            "c",
            by_a(IndexCondition::default(), true),
            DOC,
            ProjectionSet::new(vec![AttributePath::parse("a")]),
            None,
            None,
        );
        match drive(&mut block, BlockCall::Get(100), &ctx) {
            Step::Rows { rows, .. } => assert_eq!(rows.len(), 20),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(storage.stats().documents_fetched, 0);
        assert_eq!(block.documents_fetched(), 0);
    }

    #[test]
    fn in_lookup_expands_sorted_unique_values() {
        let condition = IndexCondition {
            lookups: vec![FieldLookup::In {
                values: Expression::value(json!([7, 3, 7])),
            }],
            covered: vec![],
        };
        let ranges = index_ranges(&condition, &Row::new()).expect("ranges");
        let prefixes: Vec<_> = ranges.iter().map(|r| r.prefix.clone()).collect();
        assert_eq!(prefixes, vec![vec![json!(3)], vec![json!(7)]]);
    }

    #[test]
    fn open_iterator_fault() {
        let storage = storage();
        let ctx = testing::context(&storage);
        ctx.faults().arm(points::INDEX_OPEN_ITERATOR);
        let mut block = ScanBlock::new(
            "c",
            by_a(IndexCondition::default(), false),
            DOC,
            ProjectionSet::default(),
            None,
            None,
        );
        block.step(BlockCall::Get(1), None, &ctx).expect("pull");
        let err = block
            .step(
                BlockCall::Get(1),
                Some(Upstream::Rows {
                    rows: vec![Row::new()],
                    done: true,
                }),
                &ctx,
            )
            .expect_err("fault");
        assert_eq!(err.code(), 22);
    }

    #[test]
    fn dropped_index_is_reported() {
        let storage = storage();
        let ctx = testing::context(&storage);
        let mut block = ScanBlock::new(
            "c",
            ScanSource::Index {
                index: IndexDescriptor::new("gone", IndexKind::Sorted, &["a"]),
                condition: IndexCondition::default(),
                covering: false,
                reverse: false,
            },
            DOC,
            ProjectionSet::default(),
            None,
            None,
        );
        block.step(BlockCall::Get(1), None, &ctx).expect("pull");
        let err = block
            .step(
                BlockCall::Get(1),
                Some(Upstream::Rows {
                    rows: vec![Row::new()],
                    done: true,
                }),
                &ctx,
            )
            .expect_err("missing index");
        assert_eq!(err.code(), 1212);
    }
}
