// Library exports for scavenger_miner

pub mod api;
pub mod challenge;
pub mod config;
pub mod constants;
pub mod error;
pub mod lockfile;
pub mod miner;
pub mod retry;
pub mod rom;
pub mod solutions;
pub mod stats;
pub mod wallet;

// Re-export main types for convenience
pub use api::{ApiClient, CoordinatorApi, SubmitOutcome};
pub use challenge::{CachedChallenge, Challenge, ChallengeCache};
pub use config::Config;
pub use error::MinerError;
pub use miner::{MinerManager, MiningCoordinator, WorkerKind};
pub use solutions::SolutionStore;
pub use stats::SessionStats;
pub use wallet::{DevFeeManager, PoolId, Wallet, WalletPool};
