//! Query entry points: optimize, compile, run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cluster::transport::LocalTransport;
use crate::config::{EngineConfig, QueryOptions};
use crate::exec::block::{BlockCall, ExecContext, Upstream};
use crate::exec::compiler::compile;
use crate::exec::driver::{BlockStats, BlockTree};
use crate::exec::summary::WriteSummary;
use crate::primitives::fault::FaultRegistry;
use crate::query::estimator::{Estimator, PlanEstimate};
use crate::query::explain::PlanExplain;
use crate::query::logical::{NodeKind, Plan};
use crate::query::metadata::{CollectionInfo, MetadataProvider, MetadataSnapshot};
use crate::query::optimizer::{Optimizer, OptimizerOutput};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::value::NULL;
use crate::storage::{Storage, Transaction};
use crate::types::{AqlError, Result};

/// Materialised result returned by [`Executor::execute`].
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Values of the Return node, in output order. Empty for write queries
    /// without a Return.
    pub rows: Vec<Value>,
    /// Write counts, for plans containing a Modify node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes: Option<WriteSummary>,
    /// Per-block call statistics, when profiling was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Vec<BlockStats>>,
}

struct StorageMetadata<'a>(&'a dyn Storage);

impl MetadataProvider for StorageMetadata<'_> {
    fn collection(&self, name: &str) -> Result<CollectionInfo> {
        self.0.collection(name)
    }
}

struct Prepared {
    plan: Plan,
    snapshot: MetadataSnapshot,
    optimized: Option<OptimizerOutput>,
    estimate: PlanEstimate,
}

/// Runs plans against a storage.
pub struct Executor {
    storage: Arc<dyn Storage>,
    config: EngineConfig,
    faults: Arc<FaultRegistry>,
    transport: Arc<LocalTransport>,
}

impl Executor {
    /// Executor over `storage`. Fault points named in the configuration or
    /// the fault environment variable start armed.
    pub fn new(storage: Arc<dyn Storage>, config: EngineConfig) -> Self {
        let faults = Arc::new(FaultRegistry::from_env_and(&config.execution.faults));
        let transport = Arc::new(LocalTransport::new(config.execution.shard_workers));
        Self {
            storage,
            config,
            faults,
            transport,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fault registry shared by every query of this executor.
    pub fn faults(&self) -> &Arc<FaultRegistry> {
        &self.faults
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn prepare(&self, plan: &Plan, options: &QueryOptions) -> Result<Prepared> {
        plan.validate()?;
        let snapshot = MetadataSnapshot::capture(&StorageMetadata(self.storage.as_ref()), plan)?;
        if options.optimize {
            let start = profile_timer();
            let output = Optimizer::new(&self.config, &snapshot).optimize(plan);
            record_profile_timer(QueryProfileKind::Optimize, start);
            let output = output?;
            debug!(
                rules = ?output.rules,
                plans = output.plans_considered,
                sweeps = output.sweeps,
                cost = output.estimate.cost,
                "plan optimized"
            );
            return Ok(Prepared {
                plan: output.plan.clone(),
                estimate: output.estimate.clone(),
                snapshot,
                optimized: Some(output),
            });
        }
        let estimate = Estimator::new(&self.config.estimator, &snapshot).estimate_plan(plan)?;
        Ok(Prepared {
            plan: plan.clone(),
            snapshot,
            optimized: None,
            estimate,
        })
    }

    /// Optimizes `plan` (unless disabled in `options`) and describes the
    /// result without running it.
    pub fn explain(&self, plan: &Plan, options: &QueryOptions) -> Result<PlanExplain> {
        let prepared = self.prepare(plan, options)?;
        Ok(match &prepared.optimized {
            Some(output) => PlanExplain::from_output(output),
            None => PlanExplain::from_plan(&prepared.plan, &prepared.estimate),
        })
    }

    /// Starts `plan` and returns a lazy stream over its results.
    pub fn stream(&self, plan: &Plan, options: QueryOptions) -> Result<ResultStream> {
        let prepared = self.prepare(plan, &options)?;
        let tree = compile(&prepared.plan, &prepared.snapshot, options.ignore_errors)?;
        let writes = prepared
            .plan
            .root()
            .nodes()
            .iter()
            .any(|node| matches!(node.kind, NodeKind::Modify { .. }));
        let txn = self.storage.begin()?;
        let max_runtime = options.max_runtime.or_else(|| {
            (self.config.execution.max_runtime_ms > 0)
                .then(|| Duration::from_millis(self.config.execution.max_runtime_ms))
        });
        let ctx = ExecContext::new(
            Arc::clone(&txn),
            Arc::clone(&self.faults),
            Arc::new(prepared.snapshot),
            Arc::clone(&self.transport),
        )
        .with_batch_size(options.batch_size.unwrap_or(self.config.execution.batch_size))
        .with_cancel(options.cancel_token.clone())
        .with_max_runtime(max_runtime);
        info!(
            blocks = tree.len(),
            batch_size = ctx.batch_size(),
            cost = prepared.estimate.cost,
            "query started"
        );
        Ok(ResultStream {
            tree,
            ctx,
            txn,
            pending: VecDeque::new(),
            state: StreamState::Running,
            writes,
        })
    }

    /// Runs `plan` to completion.
    pub fn execute(&self, plan: &Plan, options: QueryOptions) -> Result<QueryResult> {
        let profile = options.profile;
        let mut stream = self.stream(plan, options)?;
        let mut rows = Vec::new();
        while let Some(batch) = stream.next_batch()? {
            rows.extend(batch);
        }
        Ok(QueryResult {
            rows,
            writes: stream.writes.then(|| stream.write_summary()),
            profile: profile.then(|| stream.block_stats()),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Running,
    Committed,
    Failed,
}

/// Lazy, batch-at-a-time handle over the results of one query.
///
/// The query transaction commits once the last batch was pulled. An error
/// or dropping the stream early rolls it back.
pub struct ResultStream {
    tree: BlockTree,
    ctx: ExecContext,
    txn: Arc<dyn Transaction>,
    pending: VecDeque<Value>,
    state: StreamState,
    writes: bool,
}

impl ResultStream {
    /// Next batch of result values, `None` once the query is finished.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.drain(..).collect()));
        }
        loop {
            match self.state {
                StreamState::Committed | StreamState::Failed => return Ok(None),
                StreamState::Running => {}
            }
            let (values, done) = match self.pull() {
                Ok(batch) => batch,
                Err(err) => {
                    self.fail();
                    warn!(code = err.code(), %err, "query failed");
                    return Err(err);
                }
            };
            if done {
                self.finish()?;
            }
            if !values.is_empty() {
                return Ok(Some(values));
            }
        }
    }

    fn pull(&mut self) -> Result<(Vec<Value>, bool)> {
        let call = BlockCall::Get(self.ctx.batch_size());
        match self.tree.execute(call, &self.ctx)? {
            Upstream::Rows { rows, done } => {
                let values = match self.tree.result_var() {
                    Some(var) => rows
                        .iter()
                        .map(|row| row.get(var).unwrap_or(&NULL).clone())
                        .collect(),
                    None => Vec::new(),
                };
                Ok((values, done))
            }
            Upstream::Skipped { .. } => Err(AqlError::internal("root block answered a get with a skip")),
        }
    }

    fn finish(&mut self) -> Result<()> {
        if let Err(err) = self.txn.commit() {
            self.fail();
            return Err(err);
        }
        self.state = StreamState::Committed;
        let summary = self.write_summary();
        info!(
            written = summary.written,
            ignored = summary.ignored,
            "query finished"
        );
        Ok(())
    }

    fn fail(&mut self) {
        self.state = StreamState::Failed;
        if let Err(err) = self.txn.rollback() {
            warn!(%err, "rollback failed");
        }
    }

    /// Writes applied and ignored so far.
    pub fn write_summary(&self) -> WriteSummary {
        self.ctx.summary().lock().clone()
    }

    /// Per-block call statistics so far.
    pub fn block_stats(&self) -> Vec<BlockStats> {
        self.tree.stats()
    }

    /// True once the transaction was committed.
    pub fn is_committed(&self) -> bool {
        self.state == StreamState::Committed
    }
}

impl Iterator for ResultStream {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(value) = self.pending.pop_front() {
            return Some(Ok(value));
        }
        match self.next_batch() {
            Ok(Some(batch)) => {
                self.pending.extend(batch);
                self.pending.pop_front().map(Ok)
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if self.state == StreamState::Running {
            debug!("result stream dropped before exhaustion");
            self.fail();
        }
    }
}
