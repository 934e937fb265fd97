//! Session statistics shared between the run loop, the response processor
//! and the periodic status task. Full terminal rendering is out of scope;
//! the status task logs a compact summary line instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::constants::HASHRATE_EMA_WEIGHT_OLD;
use crate::miner::worker::WorkerKind;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub gpu_hashrate: f64,
    pub cpu_hashrate: f64,
    pub session_solutions: u64,
    pub dev_session_solutions: u64,
    pub wallet_solutions: HashMap<String, u64>,
    pub active_workers: usize,
    pub current_challenge: Option<String>,
    pub current_difficulty: Option<String>,
    pub startup_banner: Option<String>,
}

impl SessionSnapshot {
    pub fn total_hashrate(&self) -> f64 {
        self.gpu_hashrate + self.cpu_hashrate
    }
}

#[derive(Default)]
pub struct SessionStats {
    inner: RwLock<SessionSnapshot>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one worker report into the per-type EMA. The instantaneous value
    /// is scaled by the worker count of that type to estimate total
    /// throughput; the first sample replaces a zero EMA.
    pub async fn update_hashrate(
        &self,
        kind: WorkerKind,
        hashes: u64,
        duration: f64,
        num_workers: usize,
    ) {
        if duration <= 0.0 || hashes == 0 {
            return;
        }
        let total = (hashes as f64 / duration) * num_workers as f64;

        let mut snapshot = self.inner.write().await;
        let slot = match kind {
            WorkerKind::Gpu => &mut snapshot.gpu_hashrate,
            WorkerKind::Cpu => &mut snapshot.cpu_hashrate,
        };
        *slot = if *slot == 0.0 {
            total
        } else {
            HASHRATE_EMA_WEIGHT_OLD * *slot + (1.0 - HASHRATE_EMA_WEIGHT_OLD) * total
        };
    }

    pub async fn record_solution(&self, wallet_address: &str, is_dev: bool) {
        let mut snapshot = self.inner.write().await;
        if is_dev {
            snapshot.dev_session_solutions += 1;
        } else {
            snapshot.session_solutions += 1;
            *snapshot
                .wallet_solutions
                .entry(wallet_address.to_string())
                .or_insert(0) += 1;
        }
    }

    pub async fn set_current_challenge(&self, challenge_id: &str, difficulty: &str) {
        let mut snapshot = self.inner.write().await;
        snapshot.current_challenge = Some(challenge_id.to_string());
        snapshot.current_difficulty = Some(difficulty.to_string());
    }

    pub async fn set_active_workers(&self, count: usize) {
        self.inner.write().await.active_workers = count;
    }

    pub async fn set_startup_banner(&self, banner: Option<String>) {
        self.inner.write().await.startup_banner = banner;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().await.clone()
    }
}

const STATUS_LOG_EVERY_TICKS: u32 = 30;

/// 1 Hz status task; logs a summary line every 30 ticks.
pub fn spawn_status_task(stats: Arc<SessionStats>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = 0u32;
        while !shutdown.load(Ordering::Relaxed) {
            sleep(Duration::from_secs(1)).await;
            tick = tick.wrapping_add(1);
            if tick % STATUS_LOG_EVERY_TICKS != 0 {
                continue;
            }

            let snapshot = stats.snapshot().await;
            if let Some(banner) = &snapshot.startup_banner {
                warn!("{}", banner);
            }
            info!(
                "Status: {:.2} MH/s (gpu {:.2}, cpu {:.2}) | solutions {} | workers {} | challenge {}",
                snapshot.total_hashrate() / 1_000_000.0,
                snapshot.gpu_hashrate / 1_000_000.0,
                snapshot.cpu_hashrate / 1_000_000.0,
                snapshot.session_solutions,
                snapshot.active_workers,
                snapshot.current_challenge.as_deref().unwrap_or("waiting...")
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashrate_ema_replaces_zero_then_smooths() {
        let stats = SessionStats::new();

        stats.update_hashrate(WorkerKind::Cpu, 1_000, 1.0, 2).await;
        assert_eq!(stats.snapshot().await.cpu_hashrate, 2_000.0);

        stats.update_hashrate(WorkerKind::Cpu, 2_000, 1.0, 2).await;
        // 0.9 * 2000 + 0.1 * 4000
        assert!((stats.snapshot().await.cpu_hashrate - 2_200.0).abs() < 1e-6);

        // Zero-duration reports are ignored.
        stats.update_hashrate(WorkerKind::Cpu, 500, 0.0, 2).await;
        assert!((stats.snapshot().await.cpu_hashrate - 2_200.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn session_totals_split_user_and_dev() {
        let stats = SessionStats::new();
        stats.record_solution("addr1a", false).await;
        stats.record_solution("addr1a", false).await;
        stats.record_solution("addr1b", false).await;
        stats.record_solution("addr1dev", true).await;

        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot.session_solutions, 3);
        assert_eq!(snapshot.dev_session_solutions, 1);
        assert_eq!(snapshot.wallet_solutions["addr1a"], 2);
        assert_eq!(snapshot.wallet_solutions["addr1b"], 1);
        // Per-wallet counts add up to the user session total.
        let per_wallet: u64 = snapshot.wallet_solutions.values().sum();
        assert_eq!(per_wallet, snapshot.session_solutions);
    }
}
