use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::exec::block::{BlockCall, BlockState, ExecContext, ExecutionBlock, Step, Upstream};
use crate::exec::row::Row;
use crate::primitives::fault::points;
use crate::query::logical::{NodeId, VariableId};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::types::{AqlError, Result};

/// Call statistics of one block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    /// Plan node the block was compiled from.
    pub node: u32,
    /// Block kind.
    pub kind: &'static str,
    /// `getSome` calls answered.
    pub get_calls: u64,
    /// `skipSome` calls answered.
    pub skip_calls: u64,
    /// Rows returned.
    pub rows_produced: u64,
    /// Rows skipped.
    pub rows_skipped: u64,
    /// Documents fetched from storage.
    pub documents_fetched: u64,
}

struct BlockSlot {
    node: NodeId,
    block: Box<dyn ExecutionBlock>,
    upstream: Option<usize>,
    state: BlockState,
    stats: BlockStats,
}

/// Blocks of one pipeline, stored as an arena with upstream links.
///
/// Calls are driven by an explicit frame stack instead of recursion, so the
/// depth of the pipeline never bounds the call stack.
pub struct BlockTree {
    slots: Vec<BlockSlot>,
    result_var: Option<VariableId>,
}

impl BlockTree {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            result_var: None,
        }
    }

    /// Appends a block fed by the previously added one and returns its slot.
    pub(crate) fn push(&mut self, node: NodeId, block: Box<dyn ExecutionBlock>) -> usize {
        let upstream = self.slots.len().checked_sub(1);
        let kind = block.kind();
        self.slots.push(BlockSlot {
            node,
            block,
            upstream,
            state: BlockState::Initial,
            stats: BlockStats {
                node: node.0,
                kind,
                ..BlockStats::default()
            },
        });
        self.slots.len() - 1
    }

    pub(crate) fn set_result_var(&mut self, var: Option<VariableId>) {
        self.result_var = var;
    }

    /// Variable emitted by the Return block, if the pipeline has one.
    pub fn result_var(&self) -> Option<VariableId> {
        self.result_var
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True for an empty tree.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Block kinds from the leaf to the root.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.slots.iter().map(|slot| slot.block.kind()).collect()
    }

    /// State of every block from the leaf to the root.
    pub fn states(&self) -> Vec<BlockState> {
        self.slots.iter().map(|slot| slot.state).collect()
    }

    /// Call statistics of every block from the leaf to the root.
    pub fn stats(&self) -> Vec<BlockStats> {
        self.slots
            .iter()
            .map(|slot| BlockStats {
                documents_fetched: slot.block.documents_fetched(),
                ..slot.stats.clone()
            })
            .collect()
    }

    /// Returns every block to its initial state; the leaf starts from `seed`.
    pub fn reset(&mut self, seed: &Row) {
        for slot in &mut self.slots {
            slot.block.reset(seed);
            slot.state = BlockState::Initial;
        }
    }

    /// Runs `call` against the root block.
    pub fn execute(&mut self, call: BlockCall, ctx: &ExecContext) -> Result<Upstream> {
        let start = profile_timer();
        let root = self
            .slots
            .len()
            .checked_sub(1)
            .ok_or_else(|| AqlError::internal("empty block tree"))?;
        let answer = self.drive(root, call, ctx);
        let kind = match call {
            BlockCall::Get(_) => QueryProfileKind::BlockGet,
            BlockCall::Skip(_) => QueryProfileKind::BlockSkip,
        };
        record_profile_timer(kind, start);
        answer
    }

    /// Pulls every remaining row and returns the values of the result variable.
    pub fn run_to_end(&mut self, ctx: &ExecContext) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        loop {
            match self.execute(BlockCall::Get(ctx.batch_size()), ctx)? {
                Upstream::Rows { rows, done } => {
                    if let Some(var) = self.result_var {
                        values.extend(
                            rows.iter()
                                .map(|row| row.get(var).cloned().unwrap_or(Value::Null)),
                        );
                    }
                    if done {
                        return Ok(values);
                    }
                }
                Upstream::Skipped { .. } => {
                    return Err(AqlError::internal("skip answer to a get call"));
                }
            }
        }
    }

    fn drive(&mut self, root: usize, call: BlockCall, ctx: &ExecContext) -> Result<Upstream> {
        let mut frames: Vec<(usize, BlockCall)> = vec![(root, call)];
        let mut input: Option<Upstream> = None;
        while let Some(&(idx, call)) = frames.last() {
            let slot = self
                .slots
                .get_mut(idx)
                .ok_or_else(|| AqlError::internal(format!("missing block slot {idx}")))?;
            let step = if input.is_none() && slot.state == BlockState::Done {
                Step::finished(call)
            } else {
                if input.is_none() {
                    ctx.check_alive()?;
                    ctx.check_fault(points::BLOCK_GET_OR_SKIP)?;
                    match call {
                        BlockCall::Get(_) => slot.stats.get_calls += 1,
                        BlockCall::Skip(_) => slot.stats.skip_calls += 1,
                    }
                }
                slot.block.step(call, input.take(), ctx)?
            };
            let answer = match step {
                Step::Pull(upstream_call) => {
                    let upstream = slot.upstream.ok_or_else(|| {
                        AqlError::internal(format!("{} has no upstream", slot.block.kind()))
                    })?;
                    slot.state = BlockState::Fetching;
                    trace!(block = slot.block.kind(), ?upstream_call, "pull");
                    frames.push((upstream, upstream_call));
                    continue;
                }
                Step::Rows { rows, done } => {
                    slot.stats.rows_produced += rows.len() as u64;
                    slot.state = if done {
                        BlockState::Done
                    } else {
                        BlockState::Returning
                    };
                    Upstream::Rows { rows, done }
                }
                Step::Skipped { count, done } => {
                    slot.stats.rows_skipped += count as u64;
                    slot.state = if done {
                        BlockState::Done
                    } else {
                        BlockState::Returning
                    };
                    Upstream::Skipped { count, done }
                }
            };
            frames.pop();
            if frames.is_empty() {
                return Ok(answer);
            }
            input = Some(answer);
        }
        Err(AqlError::internal("block driver lost its frames"))
    }
}
