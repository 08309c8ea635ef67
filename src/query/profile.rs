use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Environment variable that enables the process-wide counters.
pub const PROFILE_ENV: &str = "AQUEDUCT_PROFILE";

/// A snapshot of process-wide query profiling metrics.
///
/// Profiling is enabled via the `AQUEDUCT_PROFILE` environment variable and
/// accumulates across every query run by the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent in the optimizer.
    pub optimize_ns: u64,
    /// Number of optimizer runs.
    pub optimize_count: u64,
    /// Total nanoseconds spent compiling block trees.
    pub compile_ns: u64,
    /// Number of compiled block trees.
    pub compile_count: u64,
    /// Total nanoseconds spent inside block `getSome` calls.
    pub block_get_ns: u64,
    /// Number of block `getSome` calls.
    pub block_get_count: u64,
    /// Total nanoseconds spent inside block `skipSome` calls.
    pub block_skip_ns: u64,
    /// Number of block `skipSome` calls.
    pub block_skip_count: u64,
    /// Total nanoseconds spent dispatching to shards and waiting for them.
    pub shard_ns: u64,
    /// Number of shard batches received.
    pub shard_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    optimize_ns: AtomicU64,
    optimize_count: AtomicU64,
    compile_ns: AtomicU64,
    compile_count: AtomicU64,
    block_get_ns: AtomicU64,
    block_get_count: AtomicU64,
    block_skip_ns: AtomicU64,
    block_skip_count: AtomicU64,
    shard_ns: AtomicU64,
    shard_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os(PROFILE_ENV).is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    /// Whole optimizer run.
    Optimize,
    /// Block tree compilation.
    Compile,
    /// One `getSome` call on a block.
    BlockGet,
    /// One `skipSome` call on a block.
    BlockSkip,
    /// One batch received from a shard.
    Shard,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Optimize => (&counters.optimize_ns, &counters.optimize_count),
        QueryProfileKind::Compile => (&counters.compile_ns, &counters.compile_count),
        QueryProfileKind::BlockGet => (&counters.block_get_ns, &counters.block_get_count),
        QueryProfileKind::BlockSkip => (&counters.block_skip_ns, &counters.block_skip_count),
        QueryProfileKind::Shard => (&counters.shard_ns, &counters.shard_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of the process-wide counters.
///
/// Returns `None` when `AQUEDUCT_PROFILE` is not set. With `reset` the
/// counters are zeroed while being read.
///
/// ```no_run
/// use aqueduct::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(false) {
///     println!("optimizer time: {}ns", snapshot.optimize_ns);
/// }
/// ```
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        optimize_ns: load(&counters.optimize_ns),
        optimize_count: load(&counters.optimize_count),
        compile_ns: load(&counters.compile_ns),
        compile_count: load(&counters.compile_count),
        block_get_ns: load(&counters.block_get_ns),
        block_get_count: load(&counters.block_get_count),
        block_skip_ns: load(&counters.block_skip_ns),
        block_skip_count: load(&counters.block_skip_count),
        shard_ns: load(&counters.shard_ns),
        shard_count: load(&counters.shard_count),
    })
}
