//! Dispatch policy: turn a free worker into a queued mining request.
//!
//! The policy fights wallet explosion: every valid challenge is tried
//! against the existing wallets before any wallet is created, workers stick
//! to their last wallet to avoid re-paying switch overhead, and challenges
//! whose ROM is already cached are preferred within a priority tier.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::util;
use super::worker::{MineJob, WorkerKind};
use crate::challenge::{truncated, CachedChallenge};
use crate::constants::{GPU_WALLET_BATCH, RECENT_ROM_KEYS};
use crate::wallet::{PoolId, Wallet, WalletPool};

/// A dispatchable assignment: the job for the worker plus the bookkeeping
/// the manager needs to route the response.
#[derive(Debug)]
pub struct Dispatch {
    pub job: MineJob,
    pub wallet_address: String,
    pub challenge_id: String,
    pub difficulty: String,
    pub is_dev: bool,
}

#[derive(Debug, Default, Clone)]
struct WorkerState {
    sticky_wallet: Option<String>,
    pending_dev_fee: bool,
    current_challenge: Option<String>,
}

pub struct MiningCoordinator {
    pool: Arc<WalletPool>,
    workers: HashMap<(WorkerKind, u32), WorkerState>,
    recent_rom_keys: VecDeque<String>,
    last_logged: HashMap<(WorkerKind, u32), (String, String)>,
}

impl MiningCoordinator {
    pub fn new(pool: Arc<WalletPool>) -> Self {
        Self {
            pool,
            workers: HashMap::new(),
            recent_rom_keys: VecDeque::new(),
            last_logged: HashMap::new(),
        }
    }

    /// ROM keys recently dispatched, newest last. Workers cache ROMs by key,
    /// so these are the keys most likely to be resident.
    pub fn recent_rom_keys(&self) -> HashSet<String> {
        self.recent_rom_keys.iter().cloned().collect()
    }

    /// Whether `address` is the sticky wallet of the given worker; the
    /// response processor keeps such wallets allocated on a fruitless batch.
    pub fn is_sticky_wallet(&self, kind: WorkerKind, worker_id: u32, address: &str) -> bool {
        self.workers
            .get(&(kind, worker_id))
            .and_then(|s| s.sticky_wallet.as_deref())
            == Some(address)
    }

    pub fn clear_sticky(&mut self, kind: WorkerKind, worker_id: u32) {
        if let Some(state) = self.workers.get_mut(&(kind, worker_id)) {
            if state.sticky_wallet.take().is_some() {
                debug!("Cleared sticky wallet for {} {}", kind, worker_id);
            }
            state.pending_dev_fee = false;
        }
    }

    /// One dispatch pass for a free worker. Returns `None` when no wallet
    /// could be paired with any valid challenge.
    pub async fn dispatch(
        &mut self,
        kind: WorkerKind,
        worker_id: u32,
        available: &[CachedChallenge],
        req_id: u64,
        use_dev: bool,
        cached_rom_keys: &HashSet<String>,
    ) -> Option<Dispatch> {
        if available.is_empty() {
            return None;
        }
        let pool_id = kind.pool_id(worker_id);

        let state = self
            .workers
            .entry((kind, worker_id))
            .or_default()
            .clone();
        let mut sticky = state.sticky_wallet.clone();
        let current_challenge = state.current_challenge.clone();

        let mut desired_dev = use_dev || state.pending_dev_fee;
        let mut defer_dev = false;
        if desired_dev {
            if let Some(address) = sticky.clone() {
                // Cannot swap wallets mid-stream; the dev fee waits until the
                // sticky wallet rotates, i.e. it has solved every challenge
                // still on the table.
                let rotates = match self.pool.get(pool_id, &address).await {
                    Ok(Some(wallet)) => available.iter().all(|c| wallet.has_solved(c.id())),
                    Ok(None) => true,
                    Err(e) => {
                        warn!("Sticky wallet lookup failed: {}", e);
                        false
                    }
                };
                if rotates {
                    sticky = None;
                    if let Some(state) = self.workers.get_mut(&(kind, worker_id)) {
                        state.sticky_wallet = None;
                    }
                } else {
                    defer_dev = true;
                    desired_dev = false;
                }
            }
        }

        let (scan_order, fallback) = order_challenges(available, cached_rom_keys);

        // Try every challenge against existing wallets before creating any.
        let mut selected: Option<(Wallet, bool, CachedChallenge)> = None;
        for challenge in &scan_order {
            if let Some((wallet, is_dev)) = self
                .select_wallet(
                    pool_id,
                    challenge,
                    desired_dev,
                    sticky.as_deref(),
                    current_challenge.as_deref(),
                    false,
                )
                .await
            {
                selected = Some((wallet, is_dev, challenge.clone()));
                break;
            }
        }

        // Only now allow creation, against the oldest eligible challenge.
        if selected.is_none() {
            if let Some((wallet, is_dev)) = self
                .select_wallet(
                    pool_id,
                    &fallback,
                    desired_dev,
                    sticky.as_deref(),
                    current_challenge.as_deref(),
                    true,
                )
                .await
            {
                selected = Some((wallet, is_dev, fallback.clone()));
            }
        }

        let dev_was_wanted = use_dev || state.pending_dev_fee || defer_dev;
        let Some((wallet, is_dev, challenge)) = selected else {
            // Keep a deferred dev fee pending for the next rotation.
            let state = self.workers.entry((kind, worker_id)).or_default();
            state.pending_dev_fee = dev_was_wanted;
            return None;
        };

        let challenge_id = challenge.id().to_string();
        let target = match challenge.challenge.target() {
            Ok(target) => target,
            Err(e) => {
                error!("Undispatchable challenge {}: {}", challenge_id, e);
                if let Err(e) = self
                    .pool
                    .release(pool_id, &wallet.address, Some(&challenge_id), false)
                    .await
                {
                    warn!("Could not release wallet after bad challenge: {}", e);
                }
                return None;
            }
        };

        {
            let state = self.workers.entry((kind, worker_id)).or_default();
            state.current_challenge = Some(challenge_id.clone());
            if is_dev {
                state.pending_dev_fee = false;
            } else {
                state.pending_dev_fee = dev_was_wanted;
                if state.sticky_wallet.as_deref() != Some(wallet.address.as_str()) {
                    debug!(
                        "Assigned sticky wallet {} to {} {}",
                        wallet.short_address(),
                        kind,
                        worker_id
                    );
                }
                state.sticky_wallet = Some(wallet.address.clone());
            }
        }

        self.remember_rom_key(challenge.rom_key());
        self.log_mining_start(kind, worker_id, &challenge, &wallet);

        let job = MineJob {
            id: req_id,
            rom_key: challenge.rom_key().to_string(),
            salt_prefix: util::build_salt_prefix(&wallet.address, &challenge.challenge),
            target,
            start_nonce: util::random_start_nonce(),
        };

        Some(Dispatch {
            job,
            wallet_address: wallet.address,
            challenge_id,
            difficulty: challenge.challenge.difficulty.clone(),
            is_dev,
        })
    }

    async fn select_wallet(
        &self,
        pool_id: PoolId,
        challenge: &CachedChallenge,
        desired_dev: bool,
        sticky: Option<&str>,
        current_challenge: Option<&str>,
        allow_creation: bool,
    ) -> Option<(Wallet, bool)> {
        if desired_dev {
            if let Some(wallet) = self
                .allocate_dev_wallet(pool_id, challenge.id(), current_challenge, allow_creation)
                .await
            {
                return Some((wallet, true));
            }
            if !allow_creation {
                return None;
            }
            // Dev pool busy or creation refused; don't let the worker idle.
            debug!(
                "Dev wallet unavailable for pool {}; using user wallet instead",
                pool_id
            );
        }

        self.allocate_user_wallet(pool_id, challenge.id(), sticky, allow_creation)
            .await
            .map(|wallet| (wallet, false))
    }

    /// Dev allocation keeps the worker's current ROM loaded when it can and
    /// refuses to grow the dev pool while existing dev wallets are busy.
    async fn allocate_dev_wallet(
        &self,
        pool_id: PoolId,
        challenge_id: &str,
        current_challenge: Option<&str>,
        allow_creation: bool,
    ) -> Option<Wallet> {
        if current_challenge == Some(challenge_id) {
            if let Some(wallet) = self.try_allocate(pool_id, challenge_id, true).await {
                debug!(
                    "Dev wallet allocated for current challenge {} (same ROM)",
                    truncated(challenge_id, 8)
                );
                return Some(wallet);
            }
        }

        if let Some(wallet) = self.try_allocate(pool_id, challenge_id, true).await {
            return Some(wallet);
        }

        if !allow_creation {
            return None;
        }

        let stats = match self.pool.get_stats(pool_id).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Could not read pool stats for {}: {}", pool_id, e);
                return None;
            }
        };
        if stats.dev_total > 0 && stats.dev_available == 0 {
            debug!(
                "Pool {}: {} dev wallets exist but none available for {}, not creating more",
                pool_id,
                stats.dev_total,
                truncated(challenge_id, 8)
            );
            return None;
        }

        info!(
            "Creating new dev wallet for pool {} (challenge {})",
            pool_id,
            truncated(challenge_id, 8)
        );
        match self.pool.create(pool_id, true).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                error!("Failed to create dev wallet for pool {}", pool_id);
                return None;
            }
            Err(e) => {
                error!("Failed to create dev wallet for pool {}: {}", pool_id, e);
                return None;
            }
        }

        let wallet = self.try_allocate(pool_id, challenge_id, true).await;
        if wallet.is_none() {
            warn!("Dev wallet created but could not be allocated for pool {}", pool_id);
        }
        wallet
    }

    async fn allocate_user_wallet(
        &self,
        pool_id: PoolId,
        challenge_id: &str,
        sticky: Option<&str>,
        allow_creation: bool,
    ) -> Option<Wallet> {
        if let Some(sticky_address) = sticky {
            match self.pool.get(pool_id, sticky_address).await {
                Ok(Some(mut wallet)) => {
                    if wallet.has_solved(challenge_id) {
                        debug!(
                            "Sticky wallet {} already solved {}, allocating fresh",
                            &sticky_address[..sticky_address.len().min(8)],
                            truncated(challenge_id, 8)
                        );
                    } else {
                        if wallet.current_challenge.as_deref() != Some(challenge_id) {
                            match self.pool.reuse(pool_id, sticky_address, challenge_id).await {
                                Ok(true) => {}
                                Ok(false) => return None,
                                Err(e) => {
                                    warn!("Sticky reuse failed: {}", e);
                                    return None;
                                }
                            }
                            wallet.current_challenge = Some(challenge_id.to_string());
                            wallet.in_use = true;
                        }
                        return Some(wallet);
                    }
                }
                Ok(None) => {
                    warn!(
                        "Sticky wallet {} not found in pool {}",
                        &sticky_address[..sticky_address.len().min(8)],
                        pool_id
                    );
                }
                Err(e) => {
                    warn!("Sticky wallet lookup failed: {}", e);
                    return None;
                }
            }
        }

        if let Some(wallet) = self.try_allocate(pool_id, challenge_id, false).await {
            return Some(wallet);
        }
        if !allow_creation {
            return None;
        }

        if pool_id.is_gpu() {
            // Batch creation keeps the ROM loaded across wallet switches.
            match self.pool.create_batch(pool_id, GPU_WALLET_BATCH, false).await {
                Ok(created) if created > 0 => {
                    info!(
                        "Created batch of {} wallets for {}, reducing ROM switching",
                        created, pool_id
                    );
                    Arc::clone(&self.pool).start_consolidation(pool_id);
                    self.try_allocate(pool_id, challenge_id, false).await
                }
                Ok(_) => None,
                Err(e) => {
                    error!("Batch wallet creation failed for {}: {}", pool_id, e);
                    None
                }
            }
        } else {
            match self.pool.create(pool_id, false).await {
                Ok(Some(_)) => self.try_allocate(pool_id, challenge_id, false).await,
                Ok(None) => None,
                Err(e) => {
                    error!("Wallet creation failed for {}: {}", pool_id, e);
                    None
                }
            }
        }
    }

    async fn try_allocate(
        &self,
        pool_id: PoolId,
        challenge_id: &str,
        require_dev: bool,
    ) -> Option<Wallet> {
        match self.pool.allocate(pool_id, challenge_id, require_dev).await {
            Ok(wallet) => wallet,
            Err(e) => {
                // Lock timeouts drop this dispatch; the next tick retries.
                warn!("Allocation failed on pool {}: {}", pool_id, e);
                None
            }
        }
    }

    fn remember_rom_key(&mut self, rom_key: &str) {
        if let Some(pos) = self.recent_rom_keys.iter().position(|k| k == rom_key) {
            self.recent_rom_keys.remove(pos);
        }
        self.recent_rom_keys.push_back(rom_key.to_string());
        while self.recent_rom_keys.len() > RECENT_ROM_KEYS {
            self.recent_rom_keys.pop_front();
        }
    }

    fn log_mining_start(
        &mut self,
        kind: WorkerKind,
        worker_id: u32,
        challenge: &CachedChallenge,
        wallet: &Wallet,
    ) {
        let combo = (challenge.id().to_string(), wallet.address.clone());
        if self.last_logged.get(&(kind, worker_id)) == Some(&combo) {
            return;
        }

        let dev_indicator = if wallet.is_dev_wallet { "[DEV] " } else { "" };
        info!(
            "{} {} mining {}... with {}wallet {}...",
            kind,
            worker_id,
            truncated(challenge.id(), 8),
            dev_indicator,
            wallet.short_address()
        );
        self.last_logged.insert((kind, worker_id), combo);
    }
}

/// Order challenges for the reuse scan and pick the creation fallback.
///
/// Base order is discovery time. When the newest challenge is harder than
/// the oldest (a difficulty spike), the challenges matching the oldest
/// challenge's difficulty are placed first: pre-spike challenges are worth
/// finishing before they expire. A difficulty decrease keeps plain
/// discovery order. Within a tier, challenges whose ROM is already cached
/// come first; the creation fallback ignores cache affinity and is simply
/// the head of the tiered order.
fn order_challenges(
    available: &[CachedChallenge],
    cached_rom_keys: &HashSet<String>,
) -> (Vec<CachedChallenge>, CachedChallenge) {
    let mut sorted: Vec<CachedChallenge> = available.to_vec();
    sorted.sort_by(|a, b| a.discovered_at.cmp(&b.discovered_at));

    let targets: Vec<[u8; 32]> = sorted
        .iter()
        .map(|c| c.challenge.target().unwrap_or([0xff; 32]))
        .collect();
    // Spike = the newest-discovered challenge is harder than the oldest.
    // Big-endian byte order makes the array comparison numeric.
    let oldest = targets.first().copied().unwrap_or([0xff; 32]);
    let newest = targets.last().copied().unwrap_or([0xff; 32]);
    let spike = newest > oldest;
    if spike {
        debug!("Difficulty spike detected - prioritizing lower difficulty challenges");
    }
    // Two tiers: challenges at the oldest (pre-spike) difficulty, then the
    // rest in discovery order.
    let tier = |i: usize| u8::from(spike && targets[i] != oldest);

    let mut indexed: Vec<(usize, CachedChallenge)> = sorted.into_iter().enumerate().collect();
    indexed.sort_by_key(|(i, _)| (tier(*i), *i));
    let fallback = indexed[0].1.clone();

    indexed.sort_by_key(|(i, c)| (tier(*i), !cached_rom_keys.contains(c.rom_key()), *i));
    let scan = indexed.into_iter().map(|(_, c)| c).collect();

    (scan, fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CoordinatorApi, SubmitOutcome};
    use crate::challenge::Challenge;
    use crate::error::MinerError;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    struct MockApi;

    #[async_trait]
    impl CoordinatorApi for MockApi {
        async fn fetch_challenge(&self) -> Result<Option<Challenge>, MinerError> {
            Ok(None)
        }
        async fn register_wallet(&self, _: &str, _: &str, _: &str) -> bool {
            true
        }
        async fn submit_solution(&self, _: &str, _: &str, _: &str) -> SubmitOutcome {
            SubmitOutcome::Accepted
        }
        async fn consolidate_wallet(&self, _: &str, _: &str, _: &str) -> bool {
            true
        }
        fn terms(&self) -> &str {
            "terms"
        }
    }

    fn cached(id: &str, difficulty: &str, rom: &str, age_hours: i64) -> CachedChallenge {
        let discovered = Utc::now() - Duration::hours(age_hours);
        CachedChallenge {
            challenge: Challenge {
                challenge_id: id.to_string(),
                difficulty: difficulty.to_string(),
                no_pre_mine: rom.to_string(),
                latest_submission: String::new(),
                no_pre_mine_hour: String::new(),
            },
            discovered_at: discovered,
            expires_at: discovered + Duration::hours(24),
        }
    }

    fn test_pool(dir: &std::path::Path) -> Arc<WalletPool> {
        Arc::new(WalletPool::new(
            dir,
            Arc::new(MockApi),
            Some("addr1consolidate".to_string()),
            "addr1dev".to_string(),
        ))
    }

    #[tokio::test]
    async fn empty_challenge_set_dispatches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = MiningCoordinator::new(test_pool(dir.path()));
        let dispatch = coordinator
            .dispatch(WorkerKind::Cpu, 0, &[], 1, false, &HashSet::new())
            .await;
        assert!(dispatch.is_none());
    }

    #[tokio::test]
    async fn dispatch_builds_exact_salt_and_target() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        let mut coordinator = MiningCoordinator::new(Arc::clone(&pool));

        let mut challenge = cached("abc12345", "0000ffff", "R1", 1);
        challenge.challenge.difficulty.push_str(&"0".repeat(56));

        let dispatch = coordinator
            .dispatch(WorkerKind::Cpu, 0, &[challenge.clone()], 9, false, &HashSet::new())
            .await
            .unwrap();

        let mut expected_salt = dispatch.wallet_address.clone();
        expected_salt.push_str("abc12345");
        expected_salt.push_str(&challenge.challenge.difficulty);
        expected_salt.push_str("R1");
        assert_eq!(dispatch.job.salt_prefix, expected_salt.into_bytes());
        assert_eq!(dispatch.job.id, 9);
        assert_eq!(dispatch.job.rom_key, "R1");
        assert_eq!(dispatch.job.target[2], 0xff);
        assert_eq!(dispatch.job.target[3], 0xff);
        assert!(!dispatch.is_dev);
    }

    #[tokio::test]
    async fn sticky_worker_reuses_its_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        let mut coordinator = MiningCoordinator::new(Arc::clone(&pool));

        let challenge = cached("c1", "00ff", "R1", 1);
        let first = coordinator
            .dispatch(WorkerKind::Cpu, 0, &[challenge.clone()], 1, false, &HashSet::new())
            .await
            .unwrap();
        // Worker reports no solution; the wallet stays allocated (sticky).
        let second = coordinator
            .dispatch(WorkerKind::Cpu, 0, &[challenge.clone()], 2, false, &HashSet::new())
            .await
            .unwrap();

        assert_eq!(first.wallet_address, second.wallet_address);
        let wallet = pool
            .get(PoolId::Cpu, &first.wallet_address)
            .await
            .unwrap()
            .unwrap();
        // Never toggled free between the calls.
        assert!(wallet.in_use);
    }

    #[tokio::test]
    async fn exhausted_wallet_moves_to_unsolved_challenge_without_creation() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        let wallet = pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        pool.release(PoolId::Cpu, &wallet.address, Some("c1"), true)
            .await
            .unwrap();
        let mut coordinator = MiningCoordinator::new(Arc::clone(&pool));

        let challenges = vec![cached("c1", "00ff", "R1", 2), cached("c2", "00ff", "R2", 1)];
        let dispatch = coordinator
            .dispatch(WorkerKind::Cpu, 0, &challenges, 1, false, &HashSet::new())
            .await
            .unwrap();

        assert_eq!(dispatch.challenge_id, "c2");
        assert_eq!(dispatch.wallet_address, wallet.address);
        // No second wallet appeared.
        assert_eq!(pool.get_stats(PoolId::Cpu).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn difficulty_spike_prioritizes_pre_spike_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        let mut coordinator = MiningCoordinator::new(Arc::clone(&pool));

        let old = cached("c-old", "00000100", "R1", 5);
        let new = cached("c-new", "00001000", "R2", 1);
        let dispatch = coordinator
            .dispatch(
                WorkerKind::Cpu,
                0,
                &[new.clone(), old.clone()],
                1,
                false,
                &HashSet::new(),
            )
            .await
            .unwrap();

        assert_eq!(dispatch.challenge_id, "c-old");
    }

    #[test]
    fn difficulty_decrease_keeps_discovery_order() {
        // Newest challenge is easier than the oldest: not a spike, so the
        // plain discovery order stands.
        let old = cached("c-old", "00001000", "R1", 5);
        let new = cached("c-new", "00000100", "R2", 1);

        let (scan, fallback) = order_challenges(&[new, old], &HashSet::new());
        let ids: Vec<&str> = scan.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["c-old", "c-new"]);
        assert_eq!(fallback.id(), "c-old");
    }

    #[test]
    fn spike_partitions_on_the_oldest_difficulty() {
        // The oldest challenge does not have the smallest target; the
        // pre-spike tier is still defined by its difficulty, not the
        // set-wide minimum.
        let a = cached("c-a", "00000200", "R1", 5);
        let b = cached("c-b", "00000100", "R2", 3);
        let c = cached("c-c", "00001000", "R3", 1);

        let (scan, fallback) = order_challenges(&[c, b, a], &HashSet::new());
        let ids: Vec<&str> = scan.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["c-a", "c-b", "c-c"]);
        assert_eq!(fallback.id(), "c-a");
    }

    #[tokio::test]
    async fn cache_affinity_prefers_resident_rom_within_tier() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        let mut coordinator = MiningCoordinator::new(Arc::clone(&pool));

        let challenges = vec![cached("c1", "00ff", "R1", 3), cached("c2", "00ff", "R2", 2)];
        let cached_keys: HashSet<String> = ["R2".to_string()].into_iter().collect();
        let dispatch = coordinator
            .dispatch(WorkerKind::Cpu, 0, &challenges, 1, false, &cached_keys)
            .await
            .unwrap();

        assert_eq!(dispatch.challenge_id, "c2");
    }

    #[tokio::test]
    async fn dev_fee_is_deferred_while_sticky_then_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        pool.create(PoolId::Cpu, true).await.unwrap().unwrap();
        let mut coordinator = MiningCoordinator::new(Arc::clone(&pool));

        let c1 = cached("c1", "00ff", "R1", 2);
        // Establish stickiness.
        let first = coordinator
            .dispatch(WorkerKind::Cpu, 0, &[c1.clone()], 1, false, &HashSet::new())
            .await
            .unwrap();
        assert!(!first.is_dev);

        // Dev fee drawn while sticky: deferred, user wallet keeps mining.
        let second = coordinator
            .dispatch(WorkerKind::Cpu, 0, &[c1.clone()], 2, true, &HashSet::new())
            .await
            .unwrap();
        assert!(!second.is_dev);
        assert_eq!(second.wallet_address, first.wallet_address);

        // The sticky wallet solves every challenge on the table, so the next
        // dispatch rotates it and the pending dev fee is consumed.
        pool.release(PoolId::Cpu, &first.wallet_address, Some("c1"), true)
            .await
            .unwrap();
        let third = coordinator
            .dispatch(WorkerKind::Cpu, 0, &[c1], 3, false, &HashSet::new())
            .await
            .unwrap();
        assert!(third.is_dev);
    }

    #[tokio::test]
    async fn dev_pool_does_not_explode_while_busy() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        let dev = pool.create(PoolId::Cpu, true).await.unwrap().unwrap();
        // The only dev wallet is busy on another worker.
        pool.allocate(PoolId::Cpu, "other", true).await.unwrap();
        let mut coordinator = MiningCoordinator::new(Arc::clone(&pool));

        let c1 = cached("c1", "00ff", "R1", 1);
        let dispatch = coordinator
            .dispatch(WorkerKind::Cpu, 0, &[c1], 1, true, &HashSet::new())
            .await
            .unwrap();

        // Fell back to a user wallet (created), no second dev wallet.
        assert!(!dispatch.is_dev);
        let stats = pool.get_stats(PoolId::Cpu).await.unwrap();
        assert_eq!(stats.dev_total, 1);
        assert_ne!(dispatch.wallet_address, dev.address);
    }

    #[tokio::test]
    async fn empty_gpu_pool_creates_a_batch() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        let mut coordinator = MiningCoordinator::new(Arc::clone(&pool));

        let c1 = cached("c1", "00ff", "R1", 1);
        let dispatch = coordinator
            .dispatch(WorkerKind::Gpu, 0, &[c1], 1, false, &HashSet::new())
            .await
            .unwrap();
        assert!(!dispatch.is_dev);

        // GPU pools are topped up in batches so the ROM survives wallet
        // switches; one wallet is allocated right away.
        let stats = pool.get_stats(PoolId::Gpu(0)).await.unwrap();
        assert_eq!(stats.total, GPU_WALLET_BATCH);
        assert_eq!(stats.in_use, 1);
    }

    #[test]
    fn ordering_keeps_discovery_order_without_spike() {
        let challenges = vec![
            cached("b", "00ff", "R1", 1),
            cached("a", "00ff", "R2", 3),
            cached("c", "00ff", "R3", 2),
        ];
        let (scan, fallback) = order_challenges(&challenges, &HashSet::new());
        let ids: Vec<&str> = scan.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(fallback.id(), "a");
    }
}
