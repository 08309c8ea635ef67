use std::sync::Arc;

use tracing::debug;

use crate::cluster::blocks::{Fragment, GatherBlock, RemoteBlock, ScatterBlock};
use crate::exec::block::ExecutionBlock;
use crate::exec::blocks::{
    CalculationBlock, CollectBlock, EnumerateListBlock, FilterBlock, LimitBlock, MaterializeBlock,
    ModifyBlock, NoResultsBlock, PassThroughBlock, ReturnBlock, ScanBlock, ScanSource,
    SingletonBlock, SortBlock, SubqueryBlock,
};
use crate::exec::driver::BlockTree;
use crate::exec::row::Row;
use crate::query::logical::{NodeKind, Plan, PlanNode};
use crate::query::metadata::MetadataSnapshot;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::types::{AqlError, Result};

/// Compiles a validated plan into its block tree.
///
/// Every node gets one block. A Remote/Gather pair over a sharded collection
/// becomes a single [`GatherBlock`] on the coordinator that compiles the
/// nodes in between once per shard at dispatch time.
pub fn compile(plan: &Plan, metadata: &MetadataSnapshot, ignore_errors: bool) -> Result<BlockTree> {
    let start = profile_timer();
    let compiler = Compiler {
        metadata,
        ignore_errors,
        shard: None,
    };
    let tree = compiler.pipeline(plan.root().nodes());
    record_profile_timer(QueryProfileKind::Compile, start);
    let tree = tree?;
    debug!(blocks = tree.len(), kinds = ?tree.kinds(), "plan compiled");
    Ok(tree)
}

/// Compiles the shard-side tree of `fragment` for `shard`, fed with `rows`.
pub(crate) fn compile_fragment(
    fragment: &Fragment,
    shard: u32,
    rows: Vec<Row>,
    metadata: &MetadataSnapshot,
) -> Result<BlockTree> {
    let compiler = Compiler {
        metadata,
        ignore_errors: fragment.ignore_errors,
        shard: Some(shard),
    };
    let mut tree = BlockTree::new();
    tree.push(fragment.remote, Box::new(RemoteBlock::new(rows)));
    compiler.extend(&mut tree, &fragment.nodes)?;
    Ok(tree)
}

struct Compiler<'a> {
    metadata: &'a MetadataSnapshot,
    ignore_errors: bool,
    shard: Option<u32>,
}

impl Compiler<'_> {
    fn pipeline(&self, nodes: &[Arc<PlanNode>]) -> Result<BlockTree> {
        let mut tree = BlockTree::new();
        self.extend(&mut tree, nodes)?;
        if let Some(NodeKind::Return { input }) = nodes.last().map(|n| &n.kind) {
            tree.set_result_var(Some(*input));
        }
        Ok(tree)
    }

    fn extend(&self, tree: &mut BlockTree, nodes: &[Arc<PlanNode>]) -> Result<()> {
        let mut idx = 0;
        while idx < nodes.len() {
            let node = &nodes[idx];
            match &node.kind {
                NodeKind::Scatter { collection, route } if self.distributed(collection)? => {
                    let info = self.metadata.get(collection)?.clone();
                    tree.push(node.id, Box::new(ScatterBlock::new(info, *route)));
                }
                NodeKind::Remote { collection } if self.distributed(collection)? => {
                    let end = nodes[idx..]
                        .iter()
                        .position(|n| matches!(n.kind, NodeKind::Gather { .. }))
                        .map(|offset| idx + offset)
                        .ok_or_else(|| AqlError::invalid_plan("Remote without matching Gather"))?;
                    let NodeKind::Gather { sort, .. } = &nodes[end].kind else {
                        return Err(AqlError::internal("Gather position mismatch"));
                    };
                    let fragment = Fragment {
                        remote: node.id,
                        nodes: nodes[idx + 1..end].to_vec(),
                        info: self.metadata.get(collection)?.clone(),
                        ignore_errors: self.ignore_errors,
                    };
                    tree.push(nodes[end].id, Box::new(GatherBlock::new(fragment, sort.clone())));
                    idx = end + 1;
                    continue;
                }
                _ => {
                    let block = self.block(node)?;
                    tree.push(node.id, block);
                }
            }
            idx += 1;
        }
        Ok(())
    }

    /// True when the cluster nodes over `collection` need real dispatch.
    fn distributed(&self, collection: &str) -> Result<bool> {
        Ok(self.shard.is_none() && self.metadata.get(collection)?.is_sharded())
    }

    fn scan_shard(&self, collection: &str) -> Result<Option<u32>> {
        match self.shard {
            Some(shard) if self.metadata.get(collection)?.is_sharded() => Ok(Some(shard)),
            _ => Ok(None),
        }
    }

    fn block(&self, node: &PlanNode) -> Result<Box<dyn ExecutionBlock>> {
        let block: Box<dyn ExecutionBlock> = match &node.kind {
            NodeKind::Singleton => Box::new(SingletonBlock::new()),
            NodeKind::NoResults => Box::new(NoResultsBlock),
            NodeKind::EnumerateCollection {
                collection,
                out,
                projections,
                filter,
            } => Box::new(ScanBlock::new(
                collection.clone(),
                ScanSource::Collection,
                *out,
                projections.clone(),
                filter.clone(),
                self.scan_shard(collection)?,
            )),
            NodeKind::IndexScan {
                collection,
                index,
                condition,
                out,
                projections,
                covering,
                filter,
                reverse,
            } => Box::new(ScanBlock::new(
                collection.clone(),
                ScanSource::Index {
                    index: index.clone(),
                    condition: condition.clone(),
                    covering: *covering,
                    reverse: *reverse,
                },
                *out,
                projections.clone(),
                filter.clone(),
                self.scan_shard(collection)?,
            )),
            NodeKind::Calculation { out, expression } => {
                Box::new(CalculationBlock::new(*out, expression.clone()))
            }
            NodeKind::Filter { input } => Box::new(FilterBlock::new(*input)),
            NodeKind::Sort { elements } => Box::new(SortBlock::new(elements.clone())),
            NodeKind::Limit { offset, count } => Box::new(LimitBlock::new(*offset, *count)),
            NodeKind::Collect {
                groups,
                aggregates,
                count,
            } => Box::new(CollectBlock::new(groups.clone(), aggregates.clone(), *count)),
            NodeKind::EnumerateList { input, out } => Box::new(EnumerateListBlock::new(*input, *out)),
            NodeKind::Subquery { subquery, out } => {
                let inner = self.pipeline(subquery.nodes())?;
                Box::new(SubqueryBlock::new(inner, *out))
            }
            NodeKind::Modify {
                op,
                collection,
                input,
                key,
                options,
                old,
                new,
            } => Box::new(ModifyBlock::new(
                *op,
                collection.clone(),
                *input,
                *key,
                options.ignore_errors || self.ignore_errors,
                *old,
                *new,
            )),
            NodeKind::Return { .. } => Box::new(ReturnBlock::new()),
            NodeKind::Materialize {
                collection,
                input,
                out,
            } => Box::new(MaterializeBlock::new(collection.clone(), *input, *out)),
            NodeKind::Scatter { .. } => Box::new(PassThroughBlock::pass_through("Scatter")),
            NodeKind::Remote { .. } => Box::new(PassThroughBlock::pass_through("Remote")),
            NodeKind::Gather { .. } => Box::new(PassThroughBlock::pass_through("Gather")),
        };
        Ok(block)
    }
}
