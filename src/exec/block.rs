use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::cluster::transport::LocalTransport;
use crate::exec::row::Row;
use crate::exec::summary::WriteSummary;
use crate::primitives::fault::{FaultPoint, FaultRegistry};
use crate::query::metadata::MetadataSnapshot;
use crate::storage::Transaction;
use crate::types::{AqlError, Result};

/// Request made to a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockCall {
    /// `getSome`: return at most this many rows.
    Get(usize),
    /// `skipSome`: advance past at most this many rows without returning them.
    Skip(usize),
}

impl BlockCall {
    /// Requested row count.
    pub fn count(self) -> usize {
        match self {
            BlockCall::Get(n) | BlockCall::Skip(n) => n,
        }
    }
}

/// Answer of an upstream block to a [`BlockCall`].
#[derive(Debug)]
pub enum Upstream {
    /// Rows returned by `getSome`.
    Rows {
        /// Returned rows.
        rows: Vec<Row>,
        /// Upstream has nothing more to return.
        done: bool,
    },
    /// Count returned by `skipSome`.
    Skipped {
        /// Rows skipped.
        count: usize,
        /// Upstream has nothing more to return.
        done: bool,
    },
}

/// What a block wants after one step.
///
/// A block never answers with zero rows unless it is done, so every answer
/// that is not `done` makes progress.
#[derive(Debug)]
pub enum Step {
    /// Run this call on the upstream block and step again with its answer.
    Pull(BlockCall),
    /// Answer to `Get`.
    Rows {
        /// Returned rows.
        rows: Vec<Row>,
        /// Nothing more will be returned.
        done: bool,
    },
    /// Answer to `Skip`.
    Skipped {
        /// Rows skipped.
        count: usize,
        /// Nothing more will be returned.
        done: bool,
    },
}

impl Step {
    /// Empty final answer to `call`.
    pub fn finished(call: BlockCall) -> Step {
        match call {
            BlockCall::Get(_) => Step::Rows {
                rows: Vec::new(),
                done: true,
            },
            BlockCall::Skip(_) => Step::Skipped {
                count: 0,
                done: true,
            },
        }
    }
}

/// Runtime counterpart of one plan node.
///
/// Blocks are stepped by the driver: a block that needs input returns
/// [`Step::Pull`], the driver runs the upstream block and steps the block
/// again with the same call and the upstream answer. A block holds at most
/// one such request in flight.
pub trait ExecutionBlock: Send {
    /// Kind name, matching the plan node kind.
    fn kind(&self) -> &'static str;

    /// Advances the block for `call`. `input` is the upstream answer to the
    /// block's previous [`Step::Pull`], if any.
    fn step(&mut self, call: BlockCall, input: Option<Upstream>, ctx: &ExecContext)
        -> Result<Step>;

    /// Clears all state so the block can run again. A Singleton starts
    /// emitting `seed`; other blocks ignore it.
    fn reset(&mut self, _seed: &Row) {}

    /// Documents fetched from storage by this block so far.
    fn documents_fetched(&self) -> u64 {
        0
    }
}

/// Lifecycle of a block inside its tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Not called yet.
    Initial,
    /// Waiting for upstream rows.
    Fetching,
    /// Returned rows and may return more.
    Returning,
    /// Returned its last rows.
    Done,
}

#[derive(Clone, Debug)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

/// Per-query state shared by every block, including the shard workers.
#[derive(Clone)]
pub struct ExecContext {
    txn: Arc<dyn Transaction>,
    faults: Arc<FaultRegistry>,
    metadata: Arc<MetadataSnapshot>,
    transport: Option<Arc<LocalTransport>>,
    summary: Arc<Mutex<WriteSummary>>,
    batch_size: usize,
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Deadline>,
}

impl ExecContext {
    /// Context over an open transaction.
    pub fn new(
        txn: Arc<dyn Transaction>,
        faults: Arc<FaultRegistry>,
        metadata: Arc<MetadataSnapshot>,
        transport: Arc<LocalTransport>,
    ) -> Self {
        Self {
            txn,
            faults,
            metadata,
            transport: Some(transport),
            summary: Arc::new(Mutex::new(WriteSummary::default())),
            batch_size: 1000,
            cancel: None,
            deadline: None,
        }
    }

    /// Sets the rows requested per pull.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Attaches a cancel flag.
    pub fn with_cancel(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets a deadline `limit` from now.
    pub fn with_max_runtime(mut self, limit: Option<Duration>) -> Self {
        self.deadline = limit.map(|limit| Deadline {
            at: Instant::now() + limit,
            limit,
        });
        self
    }

    /// Storage transaction of the query.
    pub fn txn(&self) -> &Arc<dyn Transaction> {
        &self.txn
    }

    /// Metadata snapshot taken when the query was planned.
    pub fn metadata(&self) -> &Arc<MetadataSnapshot> {
        &self.metadata
    }

    /// Shard dispatch transport. Shard-side contexts have none.
    pub fn transport(&self) -> Result<&Arc<LocalTransport>> {
        self.transport
            .as_ref()
            .ok_or_else(|| AqlError::BackendUnavailable("no shard transport in this context".into()))
    }

    /// Context handed to shard workers: same transaction, limits and write
    /// summary, without the transport.
    pub(crate) fn for_shard(&self) -> ExecContext {
        ExecContext {
            transport: None,
            ..self.clone()
        }
    }

    /// Rows requested per pull.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Accumulated write results.
    pub fn summary(&self) -> &Arc<Mutex<WriteSummary>> {
        &self.summary
    }

    /// Fault registry of the engine.
    pub fn faults(&self) -> &Arc<FaultRegistry> {
        &self.faults
    }

    /// Fails if `point` is armed.
    pub fn check_fault(&self, point: FaultPoint) -> Result<()> {
        self.faults.check(point)
    }

    /// Fails once the query was cancelled or ran past its deadline.
    pub fn check_alive(&self) -> Result<()> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::SeqCst) {
                info!("query cancelled");
                return Err(AqlError::Killed);
            }
        }
        if let Some(deadline) = &self.deadline {
            if Instant::now() >= deadline.at {
                info!(limit_ms = deadline.limit.as_millis() as u64, "query deadline exceeded");
                return Err(AqlError::Timeout(deadline.limit.as_millis() as u64));
            }
        }
        Ok(())
    }
}
