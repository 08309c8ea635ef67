use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::exec::row::Row;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::types::{AqlError, Result};

/// Batches buffered per shard before the worker waits for the coordinator.
const SHARD_CHANNEL_CAPACITY: usize = 4;

type ShardMessage = Result<(Vec<Row>, bool)>;

/// In-process stand-in for the coordinator/DB-server network hop.
///
/// Each shard job runs on the blocking pool of a private tokio runtime and
/// streams its result batches back over a bounded channel. The coordinator
/// side reads with blocking receives, so it must not run inside an async
/// task.
pub struct LocalTransport {
    workers: usize,
    runtime: Mutex<Option<Runtime>>,
}

impl LocalTransport {
    /// Transport whose runtime uses `workers` async worker threads. The
    /// runtime is started on first dispatch.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            runtime: Mutex::new(None),
        }
    }

    fn handle(&self) -> Result<Handle> {
        let mut guard = self.runtime.lock();
        if let Some(runtime) = guard.as_ref() {
            return Ok(runtime.handle().clone());
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.workers)
            .thread_name("aqueduct-shard")
            .enable_time()
            .build()
            .map_err(|err| AqlError::BackendUnavailable(format!("shard runtime: {err}")))?;
        debug!(workers = self.workers, "shard runtime started");
        let handle = runtime.handle().clone();
        *guard = Some(runtime);
        Ok(handle)
    }

    /// Starts `job` for `shard` and returns the stream of its batches.
    ///
    /// An error returned by the job is delivered as the last stream item.
    pub fn dispatch<F>(&self, shard: u32, job: F) -> Result<ShardStream>
    where
        F: FnOnce(&ShardSender) -> Result<()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
        let sender = ShardSender { shard, sender };
        self.handle()?.spawn_blocking(move || {
            if let Err(err) = job(&sender) {
                // The coordinator may be gone already; nothing left to tell.
                let _ = sender.sender.blocking_send(Err(err));
            }
        });
        Ok(ShardStream { shard, receiver })
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// Shard side of a dispatch.
pub struct ShardSender {
    shard: u32,
    sender: mpsc::Sender<ShardMessage>,
}

impl ShardSender {
    /// Shard this sender belongs to.
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Sends one batch, waiting while the channel is full. Fails once the
    /// coordinator stopped reading.
    pub fn send(&self, rows: Vec<Row>, done: bool) -> Result<()> {
        self.sender
            .blocking_send(Ok((rows, done)))
            .map_err(|_| AqlError::ShardGone(format!("coordinator stopped reading shard {}", self.shard)))
    }
}

/// Coordinator side of a dispatch.
pub struct ShardStream {
    shard: u32,
    receiver: mpsc::Receiver<ShardMessage>,
}

impl ShardStream {
    /// Shard this stream reads from.
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Next batch and whether it is the last one.
    pub fn recv(&mut self) -> Result<(Vec<Row>, bool)> {
        let start = profile_timer();
        let message = self.receiver.blocking_recv();
        record_profile_timer(QueryProfileKind::Shard, start);
        match message {
            Some(batch) => batch,
            None => {
                warn!(shard = self.shard, "shard stream closed early");
                Err(AqlError::ShardGone(format!(
                    "shard {} closed its stream before finishing",
                    self.shard
                )))
            }
        }
    }
}
