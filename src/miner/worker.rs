//! The contract between the miner manager and its compute engines.
//!
//! A worker owns an input channel of [`MineRequest`]s, writes
//! [`MineResponse`]s to the shared response channel, raises a ready signal
//! after one-time initialization and answers exactly once per request. GPU
//! workers compare only the 32-bit target prefix; the coordinator remains the
//! authoritative validator for the full 256 bits.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::MinerError;
use crate::rom::{Kernel, RomCache, SearchJob};
use crate::wallet::PoolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Gpu,
    Cpu,
}

impl WorkerKind {
    /// Each GPU worker owns its own pool; all CPU workers share one.
    pub fn pool_id(&self, worker_id: u32) -> PoolId {
        match self {
            WorkerKind::Gpu => PoolId::Gpu(worker_id),
            WorkerKind::Cpu => PoolId::Cpu,
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Gpu => write!(f, "GPU"),
            WorkerKind::Cpu => write!(f, "CPU"),
        }
    }
}

/// One mining assignment.
#[derive(Debug, Clone)]
pub struct MineJob {
    pub id: u64,
    pub rom_key: String,
    pub salt_prefix: Vec<u8>,
    pub target: [u8; 32],
    pub start_nonce: u64,
}

#[derive(Debug)]
pub enum MineRequest {
    Mine(Box<MineJob>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct MineResponse {
    pub request_id: u64,
    pub found: bool,
    pub nonce: Option<u64>,
    pub hash: Option<String>,
    pub hashes: u64,
    pub duration: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub kind: WorkerKind,
    pub worker_id: u32,
    pub response: MineResponse,
}

/// Per-worker engine parameters.
pub struct WorkerConfig {
    pub kernel: Arc<dyn Kernel>,
    pub rom_size: usize,
    pub rom_cache_capacity: usize,
    pub batch: u64,
    pub prefix_only: bool,
}

pub struct WorkerHandle {
    pub kind: WorkerKind,
    pub id: u32,
    request_tx: mpsc::Sender<MineRequest>,
    ready_rx: watch::Receiver<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn send(&self, request: MineRequest) -> bool {
        self.request_tx.send(request).await.is_ok()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Block until the worker's one-time initialization finished.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), MinerError> {
        match tokio::time::timeout(timeout, self.ready_rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(MinerError::WorkerInit(format!(
                "{} worker {} not ready within {:?}",
                self.kind, self.id, timeout
            ))),
        }
    }

    /// Send the shutdown sentinel and wait for the task to drain.
    pub async fn shutdown(self) {
        let _ = self.request_tx.send(MineRequest::Shutdown).await;
        if let Err(e) = self.join.await {
            error!("{} worker {} shutdown error: {}", self.kind, self.id, e);
        }
    }
}

/// Spawn a worker task bound to `response_tx`. `stop` interrupts in-flight
/// searches early; the worker still responds once per request.
pub fn spawn_worker(
    kind: WorkerKind,
    worker_id: u32,
    config: WorkerConfig,
    response_tx: mpsc::Sender<WorkerResponse>,
    stop: Arc<AtomicBool>,
) -> WorkerHandle {
    let (request_tx, mut request_rx) = mpsc::channel::<MineRequest>(4);
    let (ready_tx, ready_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        let mut rom_cache = RomCache::new(config.rom_cache_capacity, config.rom_size);
        // One-time initialization done; accelerator backends would compile
        // kernels here before signalling.
        let _ = ready_tx.send(true);
        info!("{} worker {} started", kind, worker_id);

        while let Some(request) = request_rx.recv().await {
            let job = match request {
                MineRequest::Shutdown => {
                    debug!("{} worker {} received shutdown", kind, worker_id);
                    break;
                }
                MineRequest::Mine(job) => job,
            };

            let response = execute_job(&config, &mut rom_cache, *job, &stop).await;
            if response_tx
                .send(WorkerResponse {
                    kind,
                    worker_id,
                    response,
                })
                .await
                .is_err()
            {
                break;
            }
        }
        info!("{} worker {} shutting down", kind, worker_id);
    });

    WorkerHandle {
        kind,
        id: worker_id,
        request_tx,
        ready_rx,
        join,
    }
}

async fn execute_job(
    config: &WorkerConfig,
    rom_cache: &mut RomCache,
    job: MineJob,
    stop: &Arc<AtomicBool>,
) -> MineResponse {
    let request_id = job.id;

    // ROM builds take seconds; keep them off the async executor.
    let rom = match rom_cache.get(&job.rom_key) {
        Some(rom) => rom,
        None => {
            let key = job.rom_key.clone();
            let size = config.rom_size;
            match tokio::task::spawn_blocking(move || {
                Arc::new(crate::rom::Rom::build(&key, size))
            })
            .await
            {
                Ok(rom) => {
                    rom_cache.insert(Arc::clone(&rom));
                    rom
                }
                Err(e) => return error_response(request_id, format!("ROM build failed: {}", e)),
            }
        }
    };

    let kernel = Arc::clone(&config.kernel);
    let stop = Arc::clone(stop);
    let search = SearchJob {
        salt_prefix: job.salt_prefix,
        target: job.target,
        start_nonce: job.start_nonce,
        batch: config.batch,
        prefix_only: config.prefix_only,
    };

    match tokio::task::spawn_blocking(move || kernel.search(&rom, &search, &stop)).await {
        Ok(outcome) => {
            let (found, nonce, hash) = match outcome.found {
                Some((nonce, digest)) => (true, Some(nonce), Some(digest)),
                None => (false, None, None),
            };
            MineResponse {
                request_id,
                found,
                nonce,
                hash,
                hashes: outcome.hashes,
                duration: outcome.duration,
                error: None,
            }
        }
        Err(e) => error_response(request_id, format!("search task failed: {}", e)),
    }
}

fn error_response(request_id: u64, error: String) -> MineResponse {
    MineResponse {
        request_id,
        found: false,
        nonce: None,
        hash: None,
        hashes: 0,
        duration: 0.0,
        error: Some(error),
    }
}
