//! Worker launch and supervision (C5, runtime half): spawns a configurable number of
//! consumer-group members per role and shuts them down gracefully on cancellation
//! rather than killing them mid-message.

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::error::RuntimeError;
use crate::generator::FieldGenerator;
use crate::resolver::OutputAggregator;
use crate::splitter::Splitter;

/// Common shape every role (splitter, field generator, output aggregator) presents to
/// the supervisor: set up its consumer group(s), then repeatedly drain a batch.
#[async_trait]
pub trait StreamWorker: Send + Sync {
    async fn prepare(&self) -> Result<(), RuntimeError>;
    async fn run_once(&self, count: usize, block_ms: u64) -> Result<usize, RuntimeError>;
    /// Claims and reprocesses entries left pending by a crashed worker, idle for at
    /// least `min_idle_ms`.
    async fn reclaim(&self, min_idle_ms: u64) -> Result<usize, RuntimeError>;
    fn name(&self) -> &str;
}

#[async_trait]
impl StreamWorker for Splitter {
    async fn prepare(&self) -> Result<(), RuntimeError> {
        Splitter::prepare(self).await
    }
    async fn run_once(&self, count: usize, block_ms: u64) -> Result<usize, RuntimeError> {
        Splitter::run_once(self, count, block_ms).await
    }
    async fn reclaim(&self, min_idle_ms: u64) -> Result<usize, RuntimeError> {
        Splitter::reclaim(self, min_idle_ms).await
    }
    fn name(&self) -> &str {
        Splitter::name(self)
    }
}

#[async_trait]
impl StreamWorker for FieldGenerator {
    async fn prepare(&self) -> Result<(), RuntimeError> {
        FieldGenerator::prepare(self).await
    }
    async fn run_once(&self, count: usize, block_ms: u64) -> Result<usize, RuntimeError> {
        FieldGenerator::run_once(self, count, block_ms).await
    }
    async fn reclaim(&self, min_idle_ms: u64) -> Result<usize, RuntimeError> {
        FieldGenerator::reclaim(self, min_idle_ms).await
    }
    fn name(&self) -> &str {
        FieldGenerator::name(self)
    }
}

#[async_trait]
impl StreamWorker for OutputAggregator {
    async fn prepare(&self) -> Result<(), RuntimeError> {
        OutputAggregator::prepare(self).await
    }
    async fn run_once(&self, count: usize, block_ms: u64) -> Result<usize, RuntimeError> {
        OutputAggregator::run_once(self, count, block_ms).await
    }
    async fn reclaim(&self, min_idle_ms: u64) -> Result<usize, RuntimeError> {
        OutputAggregator::reclaim(self, min_idle_ms).await
    }
    fn name(&self) -> &str {
        OutputAggregator::name(self)
    }
}

/// Tuning knobs for a worker's drain loop; defaults match what the splitter, generator,
/// and aggregator all use unless a deployment overrides them.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub block_ms: u64,
    /// An entry claimed back from a dead consumer must have sat unacked for at least
    /// this long (§8 scenario 5: a worker crash must not lose or duplicate its message).
    pub reclaim_idle_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            block_ms: 1000,
            reclaim_idle_ms: 30_000,
        }
    }
}

/// Reads `DEFAULT_WORKERS` from the environment, falling back to 1 if it is absent or
/// not a positive integer.
pub fn default_worker_count() -> usize {
    std::env::var("DEFAULT_WORKERS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
}

/// Runs one worker's drain loop until `token` is cancelled. A transient broker error
/// backs off and retries; any other error is treated as fatal to this worker instance
/// (the supervisor does not restart it - a crash loop on a bad model is a configuration
/// problem, not a transient one).
pub async fn run_worker_loop<W: StreamWorker>(worker: W, token: CancellationToken, config: WorkerConfig) {
    if let Err(e) = worker.prepare().await {
        error!(worker = worker.name(), error = %e, "failed to prepare consumer group, worker will not start");
        return;
    }

    let mut backoff = Backoff::default();
    loop {
        if let Err(e) = worker.reclaim(config.reclaim_idle_ms).await {
            warn!(worker = worker.name(), error = %e, "stale-entry reclaim failed, continuing");
        }

        tokio::select! {
            _ = token.cancelled() => {
                info!(worker = worker.name(), "worker shutting down");
                break;
            }
            result = worker.run_once(config.batch_size, config.block_ms) => {
                match result {
                    Ok(_) => backoff.reset(),
                    Err(e) if e.is_retryable() => {
                        let delay = backoff.next_delay();
                        warn!(worker = worker.name(), error = %e, delay_ms = delay.as_millis() as u64, "transient broker error, backing off");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        error!(worker = worker.name(), error = %e, "fatal error, stopping worker");
                        break;
                    }
                }
            }
        }
    }
}

/// Owns the shared cancellation signal and the join handles for every worker task it
/// spawned, so a caller can bring the whole fleet down with one `shutdown()` call and
/// wait for every worker to finish its current batch with `join_all()`.
pub struct WorkerRuntime {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns `replicas` workers, constructing each with `make(replica_index)` so every
    /// replica gets a distinct consumer name within the shared consumer group.
    pub fn spawn<W, F>(&mut self, replicas: usize, config: WorkerConfig, make: F)
    where
        W: StreamWorker + 'static,
        F: Fn(usize) -> W,
    {
        for i in 0..replicas {
            let worker = make(i);
            let token = self.token.clone();
            self.handles.push(tokio::spawn(run_worker_loop(worker, token, config)));
        }
    }

    /// Signals every spawned worker to stop after its in-flight batch.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Waits for every spawned worker task to finish.
    pub async fn join_all(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

impl Default for WorkerRuntime {
    fn default() -> Self {
        Self::new()
    }
}
