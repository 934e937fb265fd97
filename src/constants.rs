//! Tuning knobs shared across the mining subsystems.

use std::time::Duration;

/// How long a challenge stays mineable after discovery.
pub const CHALLENGE_VALIDITY_HOURS: i64 = 24;

/// Challenges with less remaining validity than this are not dispatched.
pub const MIN_REMAINING_HOURS: i64 = 1;

/// Poll interval when no hourly alignment is possible.
pub const CHALLENGE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Wake up this many seconds before the next hour boundary.
pub const HOURLY_WAKE_MARGIN_SECS: i64 = 45;

/// Cap on attempts in the in-memory retry queue before an item goes back
/// to persistent storage.
pub const MAX_IMMEDIATE_RETRIES: u32 = 5;

/// Persistent retries and cache cleanup run every N-th dispatch.
pub const RETRY_CHECK_FREQUENCY: u64 = 100;

/// Failed solutions older than this are discarded.
pub const SOLUTION_RETRY_EXPIRY_HOURS: i64 = 24;

/// Minimum spacing between retries of the same persistent entry.
pub const PERSISTENT_RETRY_SPACING_HOURS: i64 = 1;

/// Delay before the submission queue retries a transient failure.
pub const SUBMISSION_RETRY_DELAY: Duration = Duration::from_secs(300);

pub const API_MAX_RETRIES: u32 = 3;
pub const API_RETRY_BACKOFF_BASE: u64 = 1;
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const WALLET_REGISTRATION_MAX_RETRIES: u32 = 10;
pub const CONSOLIDATION_MAX_RETRIES: u32 = 5;

/// Share of dispatches routed to dev wallets.
pub const DEV_FEE_PERCENTAGE: f64 = 0.05;

/// Wallets created at once for a GPU pool. ROM state survives wallet
/// switches only if enough wallets exist for the current challenge.
pub const GPU_WALLET_BATCH: usize = 20;

pub const DEFAULT_WALLETS_PER_GPU: usize = 10;

/// Spacing between coordinator calls in wallet creation/consolidation loops.
pub const API_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(1);

/// Advisory file locks give up after this long.
pub const POOL_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-worker ready barrier during startup.
pub const WORKER_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// After this, startup force-completes in a degraded state.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(300);

/// EMA weight of the previous hashrate sample.
pub const HASHRATE_EMA_WEIGHT_OLD: f64 = 0.9;

/// ROM keys remembered for cache-affinity dispatch.
pub const RECENT_ROM_KEYS: usize = 10;

/// Nonces scanned per request by GPU-class workers.
pub const GPU_SEARCH_BATCH: u64 = 250_000;

/// Nonces scanned per request by CPU workers.
pub const CPU_SEARCH_BATCH: u64 = 1_000;

/// Default size of the software kernel's derived ROM.
pub const DEFAULT_ROM_SIZE: usize = 16 * 1024 * 1024;
