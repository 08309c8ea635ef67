use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::routing::shard_for_route;
use crate::cluster::transport::ShardStream;
use crate::exec::block::{BlockCall, ExecContext, ExecutionBlock, Step, Upstream};
use crate::exec::blocks::{compare_rows, emit, expect_rows, RowTransform, TransformBlock};
use crate::exec::compiler::compile_fragment;
use crate::exec::row::Row;
use crate::primitives::fault::points;
use crate::query::logical::{NodeId, PlanNode, SortElement, VariableId};
use crate::query::metadata::CollectionInfo;
use crate::query::value::NULL;
use crate::types::{AqlError, Result};

/// Tags rows with the shard they must be sent to.
pub struct Scatter {
    info: Arc<CollectionInfo>,
    route: Option<VariableId>,
}

impl RowTransform for Scatter {
    fn kind(&self) -> &'static str {
        "Scatter"
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, _ctx: &ExecContext) -> Result<()> {
        for mut row in rows {
            let shard = self
                .route
                .map(|var| shard_for_route(&self.info, row.get(var).unwrap_or(&NULL)));
            row.set_route(shard);
            out.push_back(row);
        }
        Ok(())
    }
}

/// Scatter node over a sharded collection.
pub type ScatterBlock = TransformBlock<Scatter>;

impl TransformBlock<Scatter> {
    /// Routes by the shard key of `route`; broadcasts when `None`.
    pub fn new(info: Arc<CollectionInfo>, route: Option<VariableId>) -> Self {
        Self::from_transform(Scatter { info, route })
    }
}

/// Leaf of a shard-side tree: the rows the coordinator sent to this shard.
pub struct RemoteBlock {
    rows: VecDeque<Row>,
}

impl RemoteBlock {
    /// Leaf emitting `rows`.
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into() }
    }
}

impl ExecutionBlock for RemoteBlock {
    fn kind(&self) -> &'static str {
        "Remote"
    }

    fn step(&mut self, call: BlockCall, _input: Option<Upstream>, _ctx: &ExecContext) -> Result<Step> {
        Ok(emit(call, &mut self.rows, true))
    }
}

/// Nodes between a Remote and its Gather, run once per shard.
#[derive(Clone, Debug)]
pub struct Fragment {
    /// The Remote node.
    pub remote: NodeId,
    /// Shard-side nodes after the Remote.
    pub nodes: Vec<Arc<PlanNode>>,
    /// Sharded collection.
    pub info: Arc<CollectionInfo>,
    /// Query-level ignore-errors option.
    pub ignore_errors: bool,
}

struct ShardCursor {
    stream: ShardStream,
    buffer: VecDeque<Row>,
    finished: bool,
}

impl ShardCursor {
    /// Reads until a row is buffered or the shard is finished.
    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.finished {
            let (rows, done) = self.stream.recv()?;
            self.buffer.extend(rows);
            self.finished = done;
        }
        Ok(())
    }

    fn exhausted(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }
}

enum Phase {
    Collecting,
    Merging(Vec<ShardCursor>),
}

/// Coordinator side of a distributed part.
///
/// Collects every upstream row, routes it to its shard (untagged rows go to
/// all shards), runs the fragment on each shard and merges the results. With
/// sort elements the merge keeps that order, otherwise shards are drained in
/// shard order.
pub struct GatherBlock {
    fragment: Arc<Fragment>,
    sort: Vec<SortElement>,
    per_shard: Vec<Vec<Row>>,
    phase: Phase,
}

impl GatherBlock {
    /// Gather over `fragment`.
    pub fn new(fragment: Fragment, sort: Vec<SortElement>) -> Self {
        let shards = fragment.info.number_of_shards.max(1) as usize;
        Self {
            fragment: Arc::new(fragment),
            sort,
            per_shard: vec![Vec::new(); shards],
            phase: Phase::Collecting,
        }
    }

    fn route(&mut self, rows: Vec<Row>) -> Result<()> {
        let shards = self.per_shard.len();
        for mut row in rows {
            match row.route() {
                Some(shard) => {
                    let target = self.per_shard.get_mut(shard as usize).ok_or_else(|| {
                        AqlError::internal(format!("row routed to shard {shard} of {shards}"))
                    })?;
                    row.set_route(None);
                    target.push(row);
                }
                None => {
                    for target in &mut self.per_shard {
                        target.push(row.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, ctx: &ExecContext) -> Result<Vec<ShardCursor>> {
        ctx.check_fault(points::GATHER_DISPATCH)?;
        let transport = ctx.transport()?;
        let shard_ctx = ctx.for_shard();
        let mut cursors = Vec::with_capacity(self.per_shard.len());
        for (shard, rows) in self.per_shard.iter_mut().enumerate() {
            let shard = shard as u32;
            let rows = std::mem::take(rows);
            debug!(
                collection = %self.fragment.info.name,
                shard,
                rows = rows.len(),
                "dispatching fragment"
            );
            let mut tree = compile_fragment(&self.fragment, shard, rows, ctx.metadata())?;
            let ctx = shard_ctx.clone();
            let stream = transport.dispatch(shard, move |sender| loop {
                match tree.execute(BlockCall::Get(ctx.batch_size()), &ctx)? {
                    Upstream::Rows { rows, done } => {
                        sender.send(rows, done)?;
                        if done {
                            return Ok(());
                        }
                    }
                    Upstream::Skipped { .. } => {
                        return Err(AqlError::internal("shard tree answered a get with a skip"));
                    }
                }
            })?;
            cursors.push(ShardCursor {
                stream,
                buffer: VecDeque::new(),
                finished: false,
            });
        }
        info!(
            collection = %self.fragment.info.name,
            shards = cursors.len(),
            "fragment dispatched"
        );
        Ok(cursors)
    }

    fn next_unsorted(cursors: &mut [ShardCursor], wanted: usize, out: &mut Vec<Row>) -> Result<()> {
        for cursor in cursors.iter_mut() {
            while out.len() < wanted {
                cursor.fill()?;
                if cursor.buffer.is_empty() {
                    break;
                }
                let take = (wanted - out.len()).min(cursor.buffer.len());
                out.extend(cursor.buffer.drain(..take));
            }
            if out.len() == wanted {
                break;
            }
        }
        Ok(())
    }

    fn next_sorted(
        sort: &[SortElement],
        cursors: &mut [ShardCursor],
        wanted: usize,
        out: &mut Vec<Row>,
    ) -> Result<()> {
        while out.len() < wanted {
            for cursor in cursors.iter_mut() {
                cursor.fill()?;
            }
            let mut best: Option<usize> = None;
            for (idx, cursor) in cursors.iter().enumerate() {
                let Some(front) = cursor.buffer.front() else {
                    continue;
                };
                let better = match best.and_then(|b| cursors[b].buffer.front()) {
                    Some(current) => compare_rows(sort, front, current) == Ordering::Less,
                    None => true,
                };
                if better {
                    best = Some(idx);
                }
            }
            let Some(idx) = best else {
                break;
            };
            if let Some(row) = cursors[idx].buffer.pop_front() {
                out.push(row);
            }
        }
        Ok(())
    }
}

impl ExecutionBlock for GatherBlock {
    fn kind(&self) -> &'static str {
        "Gather"
    }

    fn step(&mut self, call: BlockCall, input: Option<Upstream>, ctx: &ExecContext) -> Result<Step> {
        if let Some((rows, done)) = expect_rows(self.kind(), input)? {
            self.route(rows)?;
            if done {
                let cursors = self.dispatch(ctx)?;
                self.phase = Phase::Merging(cursors);
            }
        }
        let cursors = match &mut self.phase {
            Phase::Collecting => return Ok(Step::Pull(BlockCall::Get(ctx.batch_size()))),
            Phase::Merging(cursors) => cursors,
        };
        let wanted = call.count();
        let mut rows = Vec::with_capacity(wanted.min(ctx.batch_size()));
        if self.sort.is_empty() {
            Self::next_unsorted(cursors, wanted, &mut rows)?;
        } else {
            Self::next_sorted(&self.sort, cursors, wanted, &mut rows)?;
        }
        let done = cursors.iter().all(ShardCursor::exhausted);
        Ok(match call {
            BlockCall::Get(_) => Step::Rows { rows, done },
            BlockCall::Skip(_) => Step::Skipped {
                count: rows.len(),
                done,
            },
        })
    }

    fn reset(&mut self, _seed: &Row) {
        for target in &mut self.per_shard {
            target.clear();
        }
        self.phase = Phase::Collecting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::routing::shard_for_document;
    use crate::exec::driver::BlockTree;
    use crate::exec::blocks::{ReturnBlock, ScanBlock, ScanSource, SingletonBlock};
    use crate::exec::testing;
    use crate::query::logical::{NodeKind, ProjectionSet};
    use crate::storage::Storage;
    use serde_json::json;

    const DOC: VariableId = VariableId(0);

    fn sharded(shards: u32) -> crate::storage::InMemoryStorage {
        let docs = (0..40).map(|n| json!({"_key": format!("k{n}"), "n": n})).collect();
        testing::storage(vec![(CollectionInfo::new("c", 0).with_shards(shards, &[]), docs)])
    }

    fn fragment(info: Arc<CollectionInfo>) -> Fragment {
        Fragment {
            remote: NodeId(2),
            nodes: vec![Arc::new(PlanNode {
                id: NodeId(3),
                kind: NodeKind::EnumerateCollection {
                    collection: "c".into(),
                    out: DOC,
                    projections: ProjectionSet::default(),
                    filter: None,
                },
            })],
            info,
            ignore_errors: false,
        }
    }

    fn gather_tree(info: Arc<CollectionInfo>, sort: Vec<SortElement>) -> BlockTree {
        let mut tree = BlockTree::new();
        tree.push(NodeId(1), Box::new(SingletonBlock::new()));
        tree.push(NodeId(4), Box::new(GatherBlock::new(fragment(info), sort)));
        tree.push(NodeId(5), Box::new(ReturnBlock::new()));
        tree.set_result_var(Some(DOC));
        tree
    }

    #[test]
    fn scatter_tags_rows_with_their_shard() {
        let storage = sharded(4);
        let ctx = testing::context(&storage);
        let info = ctx.metadata().get("c").expect("info").clone();
        let mut block = ScatterBlock::new(info.clone(), Some(DOC));
        let doc = json!({"_key": "k7"});
        let step = block
            .step(
                BlockCall::Get(10),
                Some(Upstream::Rows {
                    rows: vec![Row::new().with(DOC, doc.clone())],
                    done: true,
                }),
                &ctx,
            )
            .expect("scatter");
        match step {
            Step::Rows { rows, .. } => {
                assert_eq!(rows[0].route(), Some(shard_for_document(&info, &doc)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unsorted_gather_returns_every_shard_row() {
        let storage = sharded(4);
        let ctx = testing::context(&storage).with_batch_size(7);
        let info = ctx.metadata().get("c").expect("info").clone();
        let mut tree = gather_tree(info, vec![]);
        let docs = tree.run_to_end(&ctx).expect("gather");
        let mut ns: Vec<i64> = docs.iter().filter_map(|d| d["n"].as_i64()).collect();
        ns.sort_unstable();
        assert_eq!(ns, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn sorted_gather_merges_in_order() {
        let storage = sharded(3);
        let ctx = testing::context(&storage).with_batch_size(5);
        let info = ctx.metadata().get("c").expect("info").clone();
        let n = VariableId(1);
        let mut tree = BlockTree::new();
        tree.push(NodeId(1), Box::new(SingletonBlock::new()));
        let mut frag = fragment(info);
        frag.nodes.push(Arc::new(PlanNode {
            id: NodeId(6),
            kind: NodeKind::Calculation {
                out: n,
                expression: crate::query::expr::Expression::attribute(DOC, "n"),
            },
        }));
        frag.nodes.push(Arc::new(PlanNode {
            id: NodeId(7),
            kind: NodeKind::Sort {
                elements: vec![SortElement {
                    variable: n,
                    ascending: false,
                }],
            },
        }));
        let sort = vec![SortElement {
            variable: n,
            ascending: false,
        }];
        tree.push(NodeId(4), Box::new(GatherBlock::new(frag, sort)));
        tree.push(NodeId(5), Box::new(ReturnBlock::new()));
        tree.set_result_var(Some(n));
        let values = tree.run_to_end(&ctx).expect("gather");
        let expected: Vec<_> = (0..40).rev().map(|n| json!(n)).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn dispatch_fault_aborts_before_any_shard_runs() {
        let storage = sharded(2);
        let ctx = testing::context(&storage);
        ctx.faults().arm(points::GATHER_DISPATCH);
        let info = ctx.metadata().get("c").expect("info").clone();
        let mut tree = gather_tree(info, vec![]);
        assert_eq!(tree.run_to_end(&ctx).expect_err("fault").code(), 22);
        assert_eq!(storage.stats().documents_fetched, 0);
    }

    #[test]
    fn shard_errors_surface_on_the_coordinator() {
        let storage = sharded(2);
        let ctx = testing::context(&storage);
        ctx.faults().arm(points::ENUMERATE_SCAN);
        let info = ctx.metadata().get("c").expect("info").clone();
        let mut tree = gather_tree(info, vec![]);
        assert_eq!(tree.run_to_end(&ctx).expect_err("shard fault").code(), 22);
    }

    #[test]
    fn remote_leaf_emits_its_rows() {
        let storage = sharded(1);
        let ctx = testing::context(&storage);
        let mut tree = BlockTree::new();
        tree.push(
            NodeId(2),
            Box::new(RemoteBlock::new(vec![
                Row::new().with(DOC, json!(1)),
                Row::new().with(DOC, json!(2)),
            ])),
        );
        tree.push(
            NodeId(3),
            Box::new(ScanBlock::new(
                "c",
                ScanSource::Collection,
                VariableId(1),
                ProjectionSet::default(),
                None,
                Some(0),
            )),
        );
        tree.push(NodeId(4), Box::new(ReturnBlock::new()));
        tree.set_result_var(Some(DOC));
        let values = tree.run_to_end(&ctx).expect("run");
        assert_eq!(values.len(), 80);
    }
}
