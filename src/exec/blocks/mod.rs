//! Execution blocks, one per plan node kind.
//!
//! Blocks that map each input batch to output rows without looking at later
//! batches share [`TransformBlock`], which owns the output buffer and the
//! get/skip bookkeeping. Blocks that must see all input first (Sort, Collect)
//! or that control how much they pull (Limit, scans) implement
//! [`ExecutionBlock`] directly.

use std::collections::VecDeque;

use crate::exec::block::{BlockCall, ExecContext, ExecutionBlock, Step, Upstream};
use crate::exec::row::Row;
use crate::types::{AqlError, Result};

mod basic;
mod calculation;
mod collect;
mod list;
mod modify;
mod scan;
mod sort;

pub use basic::{NoResultsBlock, PassThroughBlock, ReturnBlock, SingletonBlock};
pub use calculation::{CalculationBlock, FilterBlock};
pub use collect::CollectBlock;
pub use list::{EnumerateListBlock, SubqueryBlock};
pub use modify::{MaterializeBlock, ModifyBlock};
pub use scan::{ScanBlock, ScanSource};
pub use sort::{LimitBlock, SortBlock};

pub(crate) use sort::compare_rows;

/// Per-batch row mapping run inside a [`TransformBlock`].
pub trait RowTransform: Send {
    /// Kind name of the block.
    fn kind(&self) -> &'static str;

    /// Processes one upstream batch and appends the resulting rows to `out`.
    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, ctx: &ExecContext)
        -> Result<()>;

    /// Rows map 1:1 and skipping them needs no processing, so a skip can be
    /// forwarded upstream.
    fn skips_through(&self) -> bool {
        false
    }

    /// Clears per-run state.
    fn reset(&mut self) {}

    /// Documents fetched from storage so far.
    fn documents_fetched(&self) -> u64 {
        0
    }
}

/// Block driving a [`RowTransform`].
pub struct TransformBlock<T> {
    inner: T,
    buffer: VecDeque<Row>,
    upstream_done: bool,
    skipped_from_buffer: usize,
}

impl<T: RowTransform> TransformBlock<T> {
    /// Wraps a transform.
    pub fn from_transform(inner: T) -> Self {
        Self {
            inner,
            buffer: VecDeque::new(),
            upstream_done: false,
            skipped_from_buffer: 0,
        }
    }

    /// The wrapped transform.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: RowTransform> ExecutionBlock for TransformBlock<T> {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn step(&mut self, call: BlockCall, input: Option<Upstream>, ctx: &ExecContext) -> Result<Step> {
        match input {
            Some(Upstream::Rows { rows, done }) => {
                self.upstream_done = done;
                self.inner.process(rows, &mut self.buffer, ctx)?;
            }
            Some(Upstream::Skipped { count, done }) => {
                self.upstream_done = done;
                let count = count + std::mem::take(&mut self.skipped_from_buffer);
                return Ok(Step::Skipped {
                    count,
                    done: done && self.buffer.is_empty(),
                });
            }
            None => {}
        }
        let wanted = call.count();
        match call {
            BlockCall::Get(_) => {
                if self.buffer.is_empty() && !self.upstream_done {
                    return Ok(Step::Pull(BlockCall::Get(wanted)));
                }
                Ok(emit(call, &mut self.buffer, self.upstream_done))
            }
            BlockCall::Skip(_) if self.inner.skips_through() => {
                let dropped = wanted.min(self.buffer.len());
                self.buffer.drain(..dropped);
                if dropped == wanted || self.upstream_done {
                    return Ok(Step::Skipped {
                        count: dropped,
                        done: self.upstream_done && self.buffer.is_empty(),
                    });
                }
                self.skipped_from_buffer = dropped;
                Ok(Step::Pull(BlockCall::Skip(wanted - dropped)))
            }
            BlockCall::Skip(_) => {
                if self.buffer.is_empty() && !self.upstream_done {
                    return Ok(Step::Pull(BlockCall::Get(wanted)));
                }
                Ok(emit(call, &mut self.buffer, self.upstream_done))
            }
        }
    }

    fn reset(&mut self, _seed: &Row) {
        self.inner.reset();
        self.buffer.clear();
        self.upstream_done = false;
        self.skipped_from_buffer = 0;
    }

    fn documents_fetched(&self) -> u64 {
        self.inner.documents_fetched()
    }
}

/// Answers `call` from `buffer`. `finished` means nothing will be added to
/// the buffer any more.
pub(crate) fn emit(call: BlockCall, buffer: &mut VecDeque<Row>, finished: bool) -> Step {
    let take = call.count().min(buffer.len());
    match call {
        BlockCall::Get(_) => {
            let rows: Vec<Row> = buffer.drain(..take).collect();
            Step::Rows {
                rows,
                done: finished && buffer.is_empty(),
            }
        }
        BlockCall::Skip(_) => {
            buffer.drain(..take);
            Step::Skipped {
                count: take,
                done: finished && buffer.is_empty(),
            }
        }
    }
}

/// Unpacks an upstream answer to a get request.
pub(crate) fn expect_rows(kind: &str, input: Option<Upstream>) -> Result<Option<(Vec<Row>, bool)>> {
    match input {
        None => Ok(None),
        Some(Upstream::Rows { rows, done }) => Ok(Some((rows, done))),
        Some(Upstream::Skipped { .. }) => Err(AqlError::internal(format!(
            "{kind} received a skip answer to a get request"
        ))),
    }
}
