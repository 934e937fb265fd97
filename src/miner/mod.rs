//! Miner manager: owns the worker pools, the dispatch loop and the
//! background tasks (challenge poller, submission queue, status task).

pub mod coordinator;
pub mod response;
pub mod util;
pub mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, Timelike, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::api::{submission, CoordinatorApi};
use crate::challenge::ChallengeCache;
use crate::config::Config;
use crate::constants::{
    CHALLENGE_POLL_INTERVAL, CPU_SEARCH_BATCH, DEFAULT_ROM_SIZE, GPU_SEARCH_BATCH,
    HOURLY_WAKE_MARGIN_SECS, MIN_REMAINING_HOURS, RECENT_ROM_KEYS, RETRY_CHECK_FREQUENCY,
    STARTUP_TIMEOUT, WORKER_READY_TIMEOUT,
};
use crate::retry::{RetryDisposition, RetryManager};
use crate::rom::SoftwareKernel;
use crate::solutions::SolutionStore;
use crate::stats::{spawn_status_task, SessionStats};
use crate::wallet::{DevFeeManager, PoolId, WalletPool};

pub use coordinator::{Dispatch, MiningCoordinator};
pub use response::{ResponseContext, ResponseProcessor};
pub use worker::{
    spawn_worker, MineJob, MineRequest, MineResponse, WorkerConfig, WorkerHandle, WorkerKind,
    WorkerResponse,
};

/// Bookkeeping for an in-flight request, keyed by request id.
struct ActiveRequest {
    kind: WorkerKind,
    worker_id: u32,
    wallet_address: String,
    challenge_id: String,
    difficulty: String,
    is_dev: bool,
}

pub struct MinerManager {
    config: Config,
    api: Arc<dyn CoordinatorApi>,
    pool: Arc<WalletPool>,
    cache: Arc<ChallengeCache>,
    store: Arc<SolutionStore>,
    stats: Arc<SessionStats>,
    dev_fee: DevFeeManager,
    shutdown: Arc<AtomicBool>,
}

impl MinerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        api: Arc<dyn CoordinatorApi>,
        pool: Arc<WalletPool>,
        cache: Arc<ChallengeCache>,
        store: Arc<SolutionStore>,
        stats: Arc<SessionStats>,
        dev_fee: DevFeeManager,
    ) -> Self {
        Self {
            config,
            api,
            pool,
            cache,
            store,
            stats,
            dev_fee,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with every background task; setting it unwinds the run
    /// loop and all workers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting miner manager...");

        let gpu_count = if self.config.gpu.is_enabled() {
            detect_gpu_count()
        } else {
            0
        };
        let cpu_count = if self.config.cpu.enabled {
            self.config.cpu.workers.max(1)
        } else {
            0
        };
        if gpu_count == 0 && cpu_count == 0 {
            bail!("no compute available: no CUDA devices detected and CPU mining disabled");
        }
        info!(
            "Compute: {} GPU worker(s), {} CPU worker(s)",
            gpu_count, cpu_count
        );
        self.stats.set_active_workers(gpu_count + cpu_count).await;

        // Workers and the shared response channel.
        let (response_tx, mut response_rx) = mpsc::channel::<WorkerResponse>(64);
        let mut workers: Vec<WorkerHandle> = Vec::new();
        for gpu_id in 0..gpu_count {
            workers.push(spawn_worker(
                WorkerKind::Gpu,
                gpu_id as u32,
                WorkerConfig {
                    kernel: Arc::new(SoftwareKernel),
                    rom_size: DEFAULT_ROM_SIZE,
                    rom_cache_capacity: RECENT_ROM_KEYS,
                    batch: GPU_SEARCH_BATCH,
                    prefix_only: true,
                },
                response_tx.clone(),
                Arc::clone(&self.shutdown),
            ));
        }
        for cpu_id in 0..cpu_count {
            workers.push(spawn_worker(
                WorkerKind::Cpu,
                cpu_id as u32,
                WorkerConfig {
                    kernel: Arc::new(SoftwareKernel),
                    rom_size: DEFAULT_ROM_SIZE,
                    rom_cache_capacity: RECENT_ROM_KEYS,
                    batch: CPU_SEARCH_BATCH,
                    prefix_only: false,
                },
                response_tx.clone(),
                Arc::clone(&self.shutdown),
            ));
        }

        self.wait_for_workers(&mut workers).await;
        self.prepare_pools(gpu_count, cpu_count).await;

        // Background services.
        let poller = spawn_challenge_poller(
            Arc::clone(&self.api),
            Arc::clone(&self.cache),
            Arc::clone(&self.shutdown),
        );
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (submitter, submission_task) = submission::spawn(
            Arc::clone(&self.api),
            Arc::clone(&self.store),
            events_tx,
            Arc::clone(&self.shutdown),
        );
        let status_task = spawn_status_task(Arc::clone(&self.stats), Arc::clone(&self.shutdown));

        let processor = ResponseProcessor::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.store),
            Arc::clone(&self.stats),
            submitter,
        );
        let mut coordinator = MiningCoordinator::new(Arc::clone(&self.pool));
        let mut retry = RetryManager::new();

        self.dispatch_loop(
            &workers,
            &mut response_rx,
            &mut events_rx,
            &mut coordinator,
            &mut retry,
            &processor,
            gpu_count,
            cpu_count,
        )
        .await;

        // Orderly shutdown: sentinel every worker, then join the services.
        info!("Stopping miner manager...");
        for handle in workers {
            handle.shutdown().await;
        }
        self.pool.shutdown();
        let _ = poller.await;
        let _ = submission_task.await;
        let _ = status_task.await;
        info!("Miner manager stopped");
        Ok(())
    }

    /// Ready barrier: every worker gets up to the startup budget to finish
    /// one-time initialization. After the hard timeout the manager proceeds
    /// in a degraded state and surfaces a banner.
    async fn wait_for_workers(&self, workers: &mut [WorkerHandle]) {
        let started = Instant::now();
        let mut forced = false;

        for handle in workers.iter_mut() {
            let elapsed = started.elapsed();
            if elapsed >= STARTUP_TIMEOUT {
                forced = true;
                break;
            }
            let budget = WORKER_READY_TIMEOUT.min(STARTUP_TIMEOUT - elapsed);
            if let Err(e) = handle.wait_ready(budget).await {
                error!("{}", e);
                forced = true;
            }
        }

        if forced {
            self.stats
                .set_startup_banner(Some(
                    "Startup forced: some workers never reported ready".to_string(),
                ))
                .await;
            warn!("Startup force-completed in a degraded state");
        } else {
            info!("All workers ready");
            self.stats.set_startup_banner(None).await;
        }
    }

    /// Startup pool hygiene: clear stale allocations, top up GPU pools and
    /// kick off consolidation passes.
    async fn prepare_pools(&self, gpu_count: usize, cpu_count: usize) {
        let wallets_per_gpu = self.config.wallet.wallets_per_gpu;

        let mut pool_ids: Vec<PoolId> = (0..gpu_count).map(|id| PoolId::Gpu(id as u32)).collect();
        if cpu_count > 0 {
            pool_ids.push(PoolId::Cpu);
        }

        for pool_id in pool_ids {
            if let Err(e) = self.pool.reset_state(pool_id).await {
                error!("Could not reset pool {}: {}", pool_id, e);
            }
            if pool_id.is_gpu() {
                if let Err(e) = self.pool.ensure_wallets(pool_id, wallets_per_gpu).await {
                    error!("Could not top up pool {}: {}", pool_id, e);
                }
            }
            Arc::clone(&self.pool).start_consolidation(pool_id);

            match self.pool.get_stats(pool_id).await {
                Ok(stats) => info!(
                    "Pool {}: {} wallets ({} available)",
                    pool_id, stats.total, stats.available
                ),
                Err(e) => warn!("Could not read stats for pool {}: {}", pool_id, e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_loop(
        &self,
        workers: &[WorkerHandle],
        response_rx: &mut mpsc::Receiver<WorkerResponse>,
        events_rx: &mut mpsc::UnboundedReceiver<submission::SubmissionEvent>,
        coordinator: &mut MiningCoordinator,
        retry: &mut RetryManager,
        processor: &ResponseProcessor,
        gpu_count: usize,
        cpu_count: usize,
    ) {
        let mut req_id: u64 = 0;
        let mut active: HashMap<u64, ActiveRequest> = HashMap::new();
        let mut busy: HashMap<(WorkerKind, u32), u64> = HashMap::new();
        let mut last_maintenance: Option<u64> = None;

        while !self.shutdown.load(Ordering::Relaxed) {
            // 1. Current challenge set; wait when nothing is mineable.
            let challenges = match self
                .cache
                .valid_challenges(chrono::Duration::hours(MIN_REMAINING_HOURS))
                .await
            {
                Ok(challenges) => challenges,
                Err(e) => {
                    error!("Could not read challenge cache: {}", e);
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if challenges.is_empty() {
                warn!("Waiting for challenge...");
                sleep(Duration::from_secs(1)).await;
                continue;
            }
            if let Some(newest) = challenges.iter().max_by_key(|c| c.discovered_at) {
                self.stats
                    .set_current_challenge(newest.id(), &newest.challenge.difficulty)
                    .await;
            }

            // 2./4. Periodic maintenance, once per RETRY_CHECK_FREQUENCY
            // dispatches.
            if req_id % RETRY_CHECK_FREQUENCY == 0 && last_maintenance != Some(req_id) {
                last_maintenance = Some(req_id);
                if let Err(e) = self
                    .cache
                    .cleanup_expired(chrono::Duration::hours(MIN_REMAINING_HOURS))
                    .await
                {
                    error!("Challenge cleanup failed: {}", e);
                }
                retry.load_persistent(req_id, &self.store).await;
            }

            // 3. Drain one immediate retry.
            if let Some(disposition) = retry.process_one(self.api.as_ref(), &self.store).await {
                if let RetryDisposition::Succeeded(item) = disposition {
                    self.stats
                        .record_solution(&item.wallet_address, item.is_dev)
                        .await;
                }
            }

            // Settle terminal submission outcomes.
            while let Ok(event) = events_rx.try_recv() {
                processor.process_submission_event(event).await;
            }

            // 5./6. Fill free workers, GPUs first.
            let mut progressed = false;
            for kind in [WorkerKind::Gpu, WorkerKind::Cpu] {
                for handle in workers.iter().filter(|w| w.kind == kind) {
                    if busy.contains_key(&(handle.kind, handle.id)) {
                        continue;
                    }
                    let use_dev = self.dev_fee.should_use_dev_wallet();
                    let cached_keys = coordinator.recent_rom_keys();
                    let Some(dispatch) = coordinator
                        .dispatch(handle.kind, handle.id, &challenges, req_id, use_dev, &cached_keys)
                        .await
                    else {
                        break;
                    };

                    let request = MineRequest::Mine(Box::new(dispatch.job));
                    if !handle.send(request).await {
                        error!("{} worker {} unreachable, releasing wallet", handle.kind, handle.id);
                        if let Err(e) = self
                            .pool
                            .release(
                                handle.kind.pool_id(handle.id),
                                &dispatch.wallet_address,
                                Some(&dispatch.challenge_id),
                                false,
                            )
                            .await
                        {
                            error!("Release after send failure also failed: {}", e);
                        }
                        continue;
                    }

                    active.insert(
                        req_id,
                        ActiveRequest {
                            kind: handle.kind,
                            worker_id: handle.id,
                            wallet_address: dispatch.wallet_address,
                            challenge_id: dispatch.challenge_id,
                            difficulty: dispatch.difficulty,
                            is_dev: dispatch.is_dev,
                        },
                    );
                    busy.insert((handle.kind, handle.id), req_id);
                    req_id += 1;
                    progressed = true;
                }
            }

            // 7. Non-blocking response drain.
            while let Ok(worker_response) = response_rx.try_recv() {
                progressed = true;
                busy.remove(&(worker_response.kind, worker_response.worker_id));
                let Some(request) = active.remove(&worker_response.response.request_id) else {
                    warn!(
                        "Response for unknown request {} from {} {}",
                        worker_response.response.request_id,
                        worker_response.kind,
                        worker_response.worker_id
                    );
                    continue;
                };

                let keep_wallet_on_fail = coordinator.is_sticky_wallet(
                    request.kind,
                    request.worker_id,
                    &request.wallet_address,
                );
                let num_workers = match request.kind {
                    WorkerKind::Gpu => gpu_count,
                    WorkerKind::Cpu => cpu_count,
                };
                processor
                    .process_response(
                        ResponseContext {
                            kind: request.kind,
                            worker_id: request.worker_id,
                            wallet_address: request.wallet_address,
                            challenge_id: request.challenge_id,
                            difficulty: request.difficulty,
                            is_dev: request.is_dev,
                            keep_wallet_on_fail,
                            num_workers,
                        },
                        worker_response.response,
                    )
                    .await;
            }

            // 8. Back off briefly when everything is busy or the pass made
            // no progress (e.g. no wallet could be paired).
            if busy.len() == workers.len() || !progressed {
                sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Count CUDA devices without initializing CUDA in this process. The count
/// is repeated per device, so only the first line matters. On failure the
/// manager runs without GPU workers.
fn detect_gpu_count() -> usize {
    match std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=count", "--format=csv,noheader"])
        .output()
    {
        Ok(output) if output.status.success() => {
            let count = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .and_then(|line| line.trim().parse::<usize>().ok())
                .unwrap_or(0);
            info!("Detected {} CUDA devices via nvidia-smi", count);
            count
        }
        Ok(output) => {
            warn!(
                "nvidia-smi failed ({}), running without GPU workers",
                output.status
            );
            0
        }
        Err(e) => {
            warn!(
                "Failed to detect CUDA devices via nvidia-smi: {}, running without GPU workers",
                e
            );
            0
        }
    }
}

/// Poll the coordinator for the current challenge and register it.
fn spawn_challenge_poller(
    api: Arc<dyn CoordinatorApi>,
    cache: Arc<ChallengeCache>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Challenge poller started");
        while !shutdown.load(Ordering::Relaxed) {
            match api.fetch_challenge().await {
                Ok(Some(challenge)) => {
                    if let Err(e) = cache.register(&challenge).await {
                        error!("Could not register challenge: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => error!("Challenge polling error: {}", e),
            }

            let has_valid = cache
                .valid_challenges(chrono::Duration::hours(MIN_REMAINING_HOURS))
                .await
                .map(|v| !v.is_empty())
                .unwrap_or(false);
            let secs = poll_sleep_seconds(has_valid, Utc::now());
            // Sleep in one-second steps so shutdown stays responsive.
            for _ in 0..secs {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                sleep(Duration::from_secs(1)).await;
            }
        }
    })
}

/// Hourly-aligned adaptive sleep: with a valid challenge in hand and the
/// next hour boundary more than a minute away, wake shortly before the
/// boundary (new challenges are issued hourly); otherwise poll normally.
fn poll_sleep_seconds(has_valid_challenge: bool, now: DateTime<Utc>) -> u64 {
    let into_hour = (now.minute() * 60 + now.second()) as i64;
    let to_boundary = 3600 - into_hour;
    if has_valid_challenge && to_boundary > 60 {
        (to_boundary - HOURLY_WAKE_MARGIN_SECS).max(1) as u64
    } else {
        CHALLENGE_POLL_INTERVAL.as_secs()
    }
}
