//! Per-device wallet pools backed by JSON files.
//!
//! Every pool is guarded by an in-process mutex and an inter-process file
//! lock, taken in that order. The file is the source of truth: state is
//! reloaded under the locks before every mutation, so multiple miner
//! processes can share pool files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{keys, PoolId, Wallet};
use crate::api::CoordinatorApi;
use crate::constants::{API_RATE_LIMIT_PAUSE, POOL_LOCK_TIMEOUT};
use crate::error::MinerError;
use crate::lockfile;

#[derive(Debug, Serialize, Deserialize)]
struct PoolFile {
    pool_id: PoolId,
    wallets: Vec<Wallet>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub dev_total: usize,
    pub dev_available: usize,
    pub dev_in_use: usize,
}

pub struct WalletPool {
    base_dir: PathBuf,
    api: Arc<dyn CoordinatorApi>,
    consolidate_address: Option<String>,
    dev_consolidate_address: String,
    locks: StdMutex<HashMap<PoolId, Arc<Mutex<()>>>>,
    stop_consolidation: Arc<AtomicBool>,
}

impl WalletPool {
    pub fn new<P: AsRef<Path>>(
        base_dir: P,
        api: Arc<dyn CoordinatorApi>,
        consolidate_address: Option<String>,
        dev_consolidate_address: String,
    ) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            api,
            consolidate_address,
            dev_consolidate_address,
            locks: StdMutex::new(HashMap::new()),
            stop_consolidation: Arc::new(AtomicBool::new(false)),
        }
    }

    fn pool_path(&self, pool_id: PoolId) -> PathBuf {
        self.base_dir.join(pool_id.file_name())
    }

    fn lock_path(&self, pool_id: PoolId) -> PathBuf {
        self.base_dir.join(format!("{}.lock", pool_id.file_name()))
    }

    fn pool_lock(&self, pool_id: PoolId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("pool lock map poisoned");
        locks
            .entry(pool_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load_pool(&self, pool_id: PoolId) -> PoolFile {
        let path = self.pool_path(pool_id);
        if !path.exists() {
            return PoolFile {
                pool_id,
                wallets: Vec::new(),
            };
        }

        let mut pool = match std::fs::read_to_string(&path)
            .map_err(MinerError::from)
            .and_then(|s| serde_json::from_str::<PoolFile>(&s).map_err(MinerError::from))
        {
            Ok(pool) => pool,
            Err(e) => {
                error!("Error loading wallet pool {}: {}", pool_id, e);
                return PoolFile {
                    pool_id,
                    wallets: Vec::new(),
                };
            }
        };

        // Files written by older versions may carry duplicate entries; merge
        // them on sight so the uniqueness invariant holds from here on.
        if dedup_merge(&mut pool.wallets) {
            info!("Removed duplicate wallets from pool {}", pool_id);
            self.save_pool(pool_id, &pool);
        }
        pool
    }

    fn save_pool(&self, pool_id: PoolId, pool: &PoolFile) {
        match serde_json::to_string_pretty(pool) {
            Ok(json) => {
                if let Err(e) = std::fs::write(self.pool_path(pool_id), json) {
                    error!("Error saving wallet pool {}: {}", pool_id, e);
                }
            }
            Err(e) => error!("Error serializing wallet pool {}: {}", pool_id, e),
        }
    }

    /// Run `f` with both pool locks held; persists when `f` reports a change.
    async fn with_pool<R>(
        &self,
        pool_id: PoolId,
        f: impl FnOnce(&mut PoolFile) -> (bool, R),
    ) -> Result<R, MinerError> {
        let lock = self.pool_lock(pool_id);
        let _guard = lock.lock().await;
        let _file_guard = lockfile::acquire(&self.lock_path(pool_id), POOL_LOCK_TIMEOUT).await?;

        let mut pool = self.load_pool(pool_id);
        let (changed, result) = f(&mut pool);
        if changed {
            self.save_pool(pool_id, &pool);
        }
        Ok(result)
    }

    async fn read_pool(&self, pool_id: PoolId) -> Result<PoolFile, MinerError> {
        let _file_guard = lockfile::acquire(&self.lock_path(pool_id), POOL_LOCK_TIMEOUT).await?;
        Ok(self.load_pool(pool_id))
    }

    /// Allocate an available wallet that has not solved `challenge_id`,
    /// filtered by the dev flag. Pure selection: first match in file order.
    pub async fn allocate(
        &self,
        pool_id: PoolId,
        challenge_id: &str,
        require_dev: bool,
    ) -> Result<Option<Wallet>, MinerError> {
        self.with_pool(pool_id, |pool| {
            for wallet in pool.wallets.iter_mut() {
                if wallet.is_dev_wallet != require_dev {
                    continue;
                }
                if wallet.in_use || wallet.has_solved(challenge_id) {
                    continue;
                }

                wallet.in_use = true;
                wallet.current_challenge = Some(challenge_id.to_string());
                wallet.allocated_at = Some(Utc::now());

                let label = if require_dev { "DEV" } else { "USER" };
                debug!(
                    "Allocated {} wallet {} for {}",
                    label,
                    wallet.short_address(),
                    &challenge_id[..challenge_id.len().min(8)]
                );
                return (true, Some(wallet.clone()));
            }
            (false, None)
        })
        .await
    }

    /// Snapshot read of a single wallet.
    pub async fn get(&self, pool_id: PoolId, address: &str) -> Result<Option<Wallet>, MinerError> {
        let pool = self.read_pool(pool_id).await?;
        Ok(pool.wallets.into_iter().find(|w| w.address == address))
    }

    /// Re-stamp a wallet's current challenge without a free/take cycle
    /// (sticky affinity). Fails when the wallet is missing.
    pub async fn reuse(
        &self,
        pool_id: PoolId,
        address: &str,
        challenge_id: &str,
    ) -> Result<bool, MinerError> {
        self.with_pool(pool_id, |pool| {
            if let Some(wallet) = pool.wallets.iter_mut().find(|w| w.address == address) {
                wallet.in_use = true;
                wallet.current_challenge = Some(challenge_id.to_string());
                wallet.allocated_at = Some(Utc::now());
                (true, true)
            } else {
                warn!("reuse: wallet {} not found in pool {}", address, pool_id);
                (false, false)
            }
        })
        .await
    }

    /// Clear the allocation state; with `solved` the challenge is added to the
    /// wallet's solved set (idempotent).
    pub async fn release(
        &self,
        pool_id: PoolId,
        address: &str,
        challenge_id: Option<&str>,
        solved: bool,
    ) -> Result<(), MinerError> {
        self.with_pool(pool_id, |pool| {
            if let Some(wallet) = pool.wallets.iter_mut().find(|w| w.address == address) {
                wallet.in_use = false;
                wallet.current_challenge = None;
                wallet.allocated_at = None;
                if solved {
                    if let Some(cid) = challenge_id {
                        wallet.solved_challenges.insert(cid.to_string());
                        info!(
                            "Released wallet {}... (solved: {}...)",
                            wallet.short_address(),
                            &cid[..cid.len().min(8)]
                        );
                    }
                } else {
                    debug!("Released wallet {}... (not solved)", wallet.short_address());
                }
                (true, ())
            } else {
                warn!("release: wallet {} not found in pool {}", address, pool_id);
                (false, ())
            }
        })
        .await
    }

    /// Generate, sign and register a fresh wallet, then append it to the pool.
    /// Registration failure aborts creation with no pool write.
    pub async fn create(
        &self,
        pool_id: PoolId,
        is_dev_wallet: bool,
    ) -> Result<Option<Wallet>, MinerError> {
        let wallet = match self.build_registered_wallet(is_dev_wallet).await {
            Ok(wallet) => wallet,
            Err(e) => {
                error!("Wallet creation aborted: {}", e);
                return Ok(None);
            }
        };

        let inserted = self
            .with_pool(pool_id, |pool| {
                let ok = insert_unique(pool, wallet.clone());
                (ok, ok)
            })
            .await?;
        if !inserted {
            return Ok(None);
        }

        let label = if is_dev_wallet { "dev" } else { "user" };
        info!(
            "Created new {} wallet for pool {}: {}...",
            label,
            pool_id,
            &wallet.address[..wallet.address.len().min(20)]
        );

        // Consolidate right away, outside the pool locks.
        if self.consolidate_wallet(&wallet).await {
            self.mark_consolidated(pool_id, &wallet.address).await?;
        }

        Ok(Some(wallet))
    }

    /// Create up to `count` wallets with a single pool write. Amortizes file
    /// I/O for GPU pools; consolidation of the new wallets is left to the
    /// background task.
    pub async fn create_batch(
        &self,
        pool_id: PoolId,
        count: usize,
        is_dev_wallet: bool,
    ) -> Result<usize, MinerError> {
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            match self.build_registered_wallet(is_dev_wallet).await {
                Ok(wallet) => batch.push(wallet),
                Err(e) => error!("Skipping wallet in batch: {}", e),
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let appended = self
            .with_pool(pool_id, |pool| {
                let mut appended = 0;
                for wallet in batch {
                    if insert_unique(pool, wallet) {
                        appended += 1;
                    }
                }
                (appended > 0, appended)
            })
            .await?;

        if appended > 0 {
            info!("Created batch of {} wallets for pool {}", appended, pool_id);
        }
        Ok(appended)
    }

    async fn build_registered_wallet(&self, is_dev_wallet: bool) -> Result<Wallet, MinerError> {
        let generated = keys::generate()?;
        let signature = keys::cose_sign1(
            &generated.signing_key,
            &generated.address,
            self.api.terms(),
        )?;

        if !self
            .api
            .register_wallet(&generated.address, &signature, &generated.pubkey)
            .await
        {
            return Err(MinerError::RegistrationFailed(generated.address));
        }

        Ok(Wallet {
            address: generated.address,
            pubkey: generated.pubkey,
            signing_key: generated.signing_key,
            signature: Some(signature),
            created_at: Utc::now(),
            is_consolidated: false,
            is_dev_wallet,
            in_use: false,
            current_challenge: None,
            allocated_at: None,
            solved_challenges: Default::default(),
        })
    }

    async fn ensure_wallet_type(
        &self,
        pool_id: PoolId,
        count: usize,
        is_dev_wallet: bool,
    ) -> Result<(), MinerError> {
        let current = {
            let pool = self.read_pool(pool_id).await?;
            pool.wallets
                .iter()
                .filter(|w| w.is_dev_wallet == is_dev_wallet)
                .count()
        };
        if current >= count {
            return Ok(());
        }

        let needed = count - current;
        let label = if is_dev_wallet { "dev" } else { "user" };
        info!(
            "Creating {} new {} wallets for pool {}...",
            needed, label, pool_id
        );
        for _ in 0..needed {
            self.create(pool_id, is_dev_wallet).await?;
            sleep(API_RATE_LIMIT_PAUSE).await;
        }
        Ok(())
    }

    /// Idempotent top-up of user wallets.
    pub async fn ensure_wallets(&self, pool_id: PoolId, count: usize) -> Result<(), MinerError> {
        self.ensure_wallet_type(pool_id, count, false).await
    }

    /// Idempotent top-up of dev wallets.
    pub async fn ensure_dev_wallets(&self, pool_id: PoolId, count: usize) -> Result<(), MinerError> {
        self.ensure_wallet_type(pool_id, count, true).await
    }

    pub async fn get_stats(&self, pool_id: PoolId) -> Result<PoolStats, MinerError> {
        let pool = self.read_pool(pool_id).await?;
        let mut stats = PoolStats::default();
        for wallet in &pool.wallets {
            if wallet.is_dev_wallet {
                stats.dev_total += 1;
                if wallet.in_use {
                    stats.dev_in_use += 1;
                } else {
                    stats.dev_available += 1;
                }
            } else {
                stats.total += 1;
                if wallet.in_use {
                    stats.in_use += 1;
                } else {
                    stats.available += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Clear `in_use` on every wallet. Startup recovery after a crash that
    /// left allocations dangling.
    pub async fn reset_state(&self, pool_id: PoolId) -> Result<(), MinerError> {
        self.with_pool(pool_id, |pool| {
            let mut reset = 0;
            for wallet in pool.wallets.iter_mut() {
                if wallet.in_use {
                    wallet.in_use = false;
                    wallet.current_challenge = None;
                    wallet.allocated_at = None;
                    reset += 1;
                }
            }
            if reset > 0 {
                info!("Reset {} stuck wallets in pool {}", reset, pool_id);
            }
            (reset > 0, ())
        })
        .await
    }

    fn consolidate_target(&self, wallet: &Wallet) -> Option<String> {
        if wallet.is_dev_wallet {
            Some(self.dev_consolidate_address.clone())
        } else {
            self.consolidate_address.clone()
        }
    }

    async fn consolidate_wallet(&self, wallet: &Wallet) -> bool {
        if wallet.is_consolidated {
            return true;
        }
        let destination = match self.consolidate_target(wallet) {
            Some(destination) => destination,
            None => return false,
        };

        let message = format!("Assign accumulated Scavenger rights to: {}", destination);
        let signature = match keys::cose_sign1(&wallet.signing_key, &wallet.address, &message) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(
                    "Failed to sign consolidation for {}...: {}",
                    wallet.short_address(),
                    e
                );
                return false;
            }
        };

        self.api
            .consolidate_wallet(&destination, &wallet.address, &signature)
            .await
    }

    async fn mark_consolidated(&self, pool_id: PoolId, address: &str) -> Result<(), MinerError> {
        self.with_pool(pool_id, |pool| {
            if let Some(wallet) = pool.wallets.iter_mut().find(|w| w.address == address) {
                wallet.is_consolidated = true;
                (true, ())
            } else {
                warn!(
                    "Could not find wallet {}... to update consolidation status",
                    &address[..address.len().min(8)]
                );
                (false, ())
            }
        })
        .await
    }

    /// Spawn a background pass that consolidates every unconsolidated wallet
    /// in the pool, rate-limited to one coordinator call per second. The
    /// locks are held only while reading the snapshot and flipping flags,
    /// never across API calls.
    pub fn start_consolidation(self: Arc<Self>, pool_id: PoolId) -> JoinHandle<()> {
        let pool = self;
        let stop = Arc::clone(&pool.stop_consolidation);
        info!("Started background consolidation task for pool {}", pool_id);

        tokio::spawn(async move {
            let candidates = match pool.read_pool(pool_id).await {
                Ok(snapshot) => snapshot
                    .wallets
                    .into_iter()
                    .filter(|w| !w.is_consolidated && pool.consolidate_target(w).is_some())
                    .collect::<Vec<_>>(),
                Err(e) => {
                    error!("Error loading pool {} for consolidation: {}", pool_id, e);
                    return;
                }
            };
            if candidates.is_empty() {
                return;
            }

            info!(
                "Consolidating {} wallets for pool {}...",
                candidates.len(),
                pool_id
            );
            let mut consolidated = 0;
            for wallet in candidates {
                if stop.load(Ordering::Relaxed) {
                    info!("Consolidation for pool {} interrupted by shutdown", pool_id);
                    return;
                }
                if pool.consolidate_wallet(&wallet).await {
                    if let Err(e) = pool.mark_consolidated(pool_id, &wallet.address).await {
                        error!("Error updating consolidation status: {}", e);
                    } else {
                        consolidated += 1;
                    }
                }
                sleep(API_RATE_LIMIT_PAUSE).await;
            }
            if consolidated > 0 {
                info!(
                    "Finished consolidating {} wallets for pool {}",
                    consolidated, pool_id
                );
            }
        })
    }

    /// Ask background consolidation passes to stop at the next item boundary.
    pub fn shutdown(&self) {
        self.stop_consolidation.store(true, Ordering::Relaxed);
    }
}

/// Append a wallet, enforcing address uniqueness at insertion time.
fn insert_unique(pool: &mut PoolFile, wallet: Wallet) -> bool {
    if pool.wallets.iter().any(|w| w.address == wallet.address) {
        warn!(
            "Refusing duplicate wallet {} in pool {}",
            wallet.address, pool.pool_id
        );
        return false;
    }
    pool.wallets.push(wallet);
    true
}

/// Merge duplicate entries sharing an address: flags are OR-ed, solved sets
/// are unioned, the first non-empty allocation wins. Returns whether
/// anything was merged.
fn dedup_merge(wallets: &mut Vec<Wallet>) -> bool {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut merged = Vec::with_capacity(wallets.len());
    let mut had_duplicates = false;

    for wallet in wallets.drain(..) {
        match seen.get(&wallet.address) {
            None => {
                seen.insert(wallet.address.clone(), merged.len());
                merged.push(wallet);
            }
            Some(&idx) => {
                had_duplicates = true;
                let existing: &mut Wallet = &mut merged[idx];
                existing.is_consolidated |= wallet.is_consolidated;
                existing.in_use |= wallet.in_use;
                existing.is_dev_wallet |= wallet.is_dev_wallet;
                existing
                    .solved_challenges
                    .extend(wallet.solved_challenges.into_iter());
                if existing.current_challenge.is_none() && wallet.current_challenge.is_some() {
                    existing.current_challenge = wallet.current_challenge;
                    existing.allocated_at = wallet.allocated_at;
                }
            }
        }
    }

    *wallets = merged;
    had_duplicates
}
