//! Wallet model and the per-device wallet pools.

pub mod dev_fee;
pub mod keys;
pub mod pool;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use dev_fee::DevFeeManager;
pub use pool::{PoolStats, WalletPool};

/// A long-lived compute identity. `in_use`, `current_challenge` and
/// `allocated_at` are transient allocation state; everything else is fixed at
/// creation apart from `is_consolidated` and `solved_challenges`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    pub pubkey: String,
    pub signing_key: String,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_consolidated: bool,
    #[serde(default)]
    pub is_dev_wallet: bool,
    #[serde(default)]
    pub in_use: bool,
    #[serde(default)]
    pub current_challenge: Option<String>,
    #[serde(default)]
    pub allocated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub solved_challenges: BTreeSet<String>,
}

impl Wallet {
    pub fn has_solved(&self, challenge_id: &str) -> bool {
        self.solved_challenges.contains(challenge_id)
    }

    pub fn short_address(&self) -> &str {
        &self.address[..self.address.len().min(10)]
    }
}

/// Pool identity: each GPU worker owns its own pool, all CPU workers share
/// one. Per-device pools remove allocation contention on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolId {
    Gpu(u32),
    Cpu,
}

impl PoolId {
    pub fn file_name(&self) -> String {
        match self {
            PoolId::Gpu(id) => format!("wallets_gpu_{}.json", id),
            PoolId::Cpu => "wallets_cpu.json".to_string(),
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, PoolId::Gpu(_))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolId::Gpu(id) => write!(f, "gpu {}", id),
            PoolId::Cpu => write!(f, "cpu"),
        }
    }
}

// Persisted as the bare device id for GPU pools and the string "cpu" for the
// shared CPU pool.
impl Serialize for PoolId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PoolId::Gpu(id) => serializer.serialize_u32(*id),
            PoolId::Cpu => serializer.serialize_str("cpu"),
        }
    }
}

impl<'de> Deserialize<'de> for PoolId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Device(u32),
            Name(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Device(id) => Ok(PoolId::Gpu(id)),
            Raw::Name(s) if s == "cpu" => Ok(PoolId::Cpu),
            Raw::Name(other) => Err(D::Error::custom(format!("unknown pool id {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_round_trips_through_json() {
        let gpu = serde_json::to_string(&PoolId::Gpu(2)).unwrap();
        assert_eq!(gpu, "2");
        assert_eq!(serde_json::from_str::<PoolId>(&gpu).unwrap(), PoolId::Gpu(2));

        let cpu = serde_json::to_string(&PoolId::Cpu).unwrap();
        assert_eq!(cpu, "\"cpu\"");
        assert_eq!(serde_json::from_str::<PoolId>(&cpu).unwrap(), PoolId::Cpu);
    }

    #[test]
    fn pool_file_names() {
        assert_eq!(PoolId::Gpu(0).file_name(), "wallets_gpu_0.json");
        assert_eq!(PoolId::Cpu.file_name(), "wallets_cpu.json");
    }
}
