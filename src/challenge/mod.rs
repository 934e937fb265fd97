//! Challenge types and the 24 h challenge cache.
//!
//! The cache stores the complete challenge object, not a summary: salt
//! reconstruction must be bit-identical after a restart, and every field of
//! the original challenge participates in the salt.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::constants::{CHALLENGE_VALIDITY_HOURS, POOL_LOCK_TIMEOUT};
use crate::error::MinerError;
use crate::lockfile;

/// A challenge as issued by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub challenge_id: String,
    /// Hex string encoding a 256-bit target; a solution is valid when its
    /// hash is numerically at most the target.
    pub difficulty: String,
    /// Selects the precomputed ROM used by the hash.
    #[serde(default)]
    pub no_pre_mine: String,
    #[serde(default)]
    pub latest_submission: String,
    #[serde(default)]
    pub no_pre_mine_hour: String,
}

impl Challenge {
    pub fn rom_key(&self) -> &str {
        &self.no_pre_mine
    }

    pub fn target(&self) -> Result<[u8; 32], MinerError> {
        parse_target(&self.difficulty)
    }
}

/// Parse a difficulty hex string into a full 256-bit target, right-padding
/// with `'0'` to 64 hex characters.
pub fn parse_target(difficulty: &str) -> Result<[u8; 32], MinerError> {
    let clean = difficulty.trim().trim_start_matches("0x").to_lowercase();
    if clean.is_empty() || clean.len() > 64 || !clean.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MinerError::BadDifficulty(difficulty.to_string()));
    }

    let mut padded = clean;
    while padded.len() < 64 {
        padded.push('0');
    }

    let bytes = hex::decode(&padded).map_err(|_| MinerError::BadDifficulty(difficulty.to_string()))?;
    let mut target = [0u8; 32];
    target.copy_from_slice(&bytes);
    Ok(target)
}

/// The 32-bit prefix GPU kernels compare against.
pub fn target_prefix(target: &[u8; 32]) -> u32 {
    u32::from_be_bytes([target[0], target[1], target[2], target[3]])
}

/// A challenge with its discovery bookkeeping, as persisted in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedChallenge {
    #[serde(flatten)]
    pub challenge: Challenge,
    pub discovered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedChallenge {
    pub fn id(&self) -> &str {
        &self.challenge.challenge_id
    }

    pub fn rom_key(&self) -> &str {
        self.challenge.rom_key()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    challenges: Vec<CachedChallenge>,
}

/// JSON-backed challenge store with a validity window. The file is the source
/// of truth; it is reloaded under the lock before every operation.
pub struct ChallengeCache {
    cache_path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

impl ChallengeCache {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        let cache_path = base_dir.as_ref().join("challenges.json");
        let lock_path = base_dir.as_ref().join("challenges.json.lock");
        Self {
            cache_path,
            lock_path,
            lock: Mutex::new(()),
        }
    }

    /// Insert a challenge if its id is new, stamping discovery and expiry.
    /// Returns whether the challenge was actually added.
    pub async fn register(&self, challenge: &Challenge) -> Result<bool, MinerError> {
        let _guard = self.lock.lock().await;
        let _file_guard = lockfile::acquire(&self.lock_path, POOL_LOCK_TIMEOUT).await?;

        let mut data = self.load();
        if data
            .challenges
            .iter()
            .any(|c| c.challenge.challenge_id == challenge.challenge_id)
        {
            return Ok(false);
        }

        let now = Utc::now();
        data.challenges.push(CachedChallenge {
            challenge: challenge.clone(),
            discovered_at: now,
            expires_at: now + Duration::hours(CHALLENGE_VALIDITY_HOURS),
        });
        self.save(&data);

        info!(
            "Registered challenge {}... (difficulty: {}...)",
            truncated(&challenge.challenge_id, 8),
            truncated(&challenge.difficulty, 10)
        );
        Ok(true)
    }

    /// Challenges with at least `min_remaining` of validity left.
    pub async fn valid_challenges(
        &self,
        min_remaining: Duration,
    ) -> Result<Vec<CachedChallenge>, MinerError> {
        let _guard = self.lock.lock().await;
        let _file_guard = lockfile::acquire(&self.lock_path, POOL_LOCK_TIMEOUT).await?;

        let data = self.load();
        let cutoff = Utc::now() + min_remaining;
        let valid: Vec<CachedChallenge> = data
            .challenges
            .into_iter()
            .filter(|c| c.expires_at > cutoff)
            .collect();

        debug!("Found {} valid challenges", valid.len());
        Ok(valid)
    }

    /// Drop everything expired or expiring within `min_remaining`. Returns the
    /// number of entries removed.
    pub async fn cleanup_expired(&self, min_remaining: Duration) -> Result<usize, MinerError> {
        let _guard = self.lock.lock().await;
        let _file_guard = lockfile::acquire(&self.lock_path, POOL_LOCK_TIMEOUT).await?;

        let mut data = self.load();
        let cutoff = Utc::now() + min_remaining;
        let before = data.challenges.len();
        data.challenges.retain(|c| c.expires_at > cutoff);
        let removed = before - data.challenges.len();

        if removed > 0 {
            self.save(&data);
            info!("Removed {} expired challenges from cache", removed);
        }
        Ok(removed)
    }

    fn load(&self) -> CacheFile {
        if !self.cache_path.exists() {
            return CacheFile::default();
        }
        match std::fs::read_to_string(&self.cache_path)
            .map_err(MinerError::from)
            .and_then(|s| serde_json::from_str(&s).map_err(MinerError::from))
        {
            Ok(data) => data,
            Err(e) => {
                error!("Error loading challenge cache: {}", e);
                CacheFile::default()
            }
        }
    }

    fn save(&self, data: &CacheFile) {
        match serde_json::to_string_pretty(data) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.cache_path, json) {
                    error!("Error saving challenge cache: {}", e);
                }
            }
            Err(e) => error!("Error serializing challenge cache: {}", e),
        }
    }
}

pub(crate) fn truncated(s: &str, len: usize) -> &str {
    &s[..s.len().min(len)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(id: &str, difficulty: &str) -> Challenge {
        Challenge {
            challenge_id: id.to_string(),
            difficulty: difficulty.to_string(),
            no_pre_mine: "R1".to_string(),
            latest_submission: String::new(),
            no_pre_mine_hour: String::new(),
        }
    }

    #[test]
    fn target_right_pads_to_64_chars() {
        let target = parse_target("0000ffff").unwrap();
        assert_eq!(target[0], 0x00);
        assert_eq!(target[1], 0x00);
        assert_eq!(target[2], 0xff);
        assert_eq!(target[3], 0xff);
        assert!(target[4..].iter().all(|&b| b == 0));
        assert_eq!(target_prefix(&target), 0x0000ffff);
    }

    #[test]
    fn target_accepts_0x_prefix_and_rejects_garbage() {
        assert!(parse_target("0x0000ff00").is_ok());
        assert!(parse_target("zz00").is_err());
        assert!(parse_target("").is_err());
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChallengeCache::new(dir.path());

        let c = challenge("abc12345", "0000ffff");
        assert!(cache.register(&c).await.unwrap());
        assert!(!cache.register(&c).await.unwrap());

        let valid = cache.valid_challenges(Duration::hours(1)).await.unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(
            valid[0].expires_at,
            valid[0].discovered_at + Duration::hours(24)
        );
    }

    #[tokio::test]
    async fn cleanup_drops_entries_expiring_soon() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChallengeCache::new(dir.path());

        cache.register(&challenge("keep", "00ff")).await.unwrap();
        // Rewrite the stored entry so it expires in 30 minutes.
        let mut data: CacheFile = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("challenges.json")).unwrap(),
        )
        .unwrap();
        data.challenges.push(CachedChallenge {
            challenge: challenge("stale", "00ff"),
            discovered_at: Utc::now() - Duration::hours(23),
            expires_at: Utc::now() + Duration::minutes(30),
        });
        std::fs::write(
            dir.path().join("challenges.json"),
            serde_json::to_string(&data).unwrap(),
        )
        .unwrap();

        let removed = cache.cleanup_expired(Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
        let valid = cache.valid_challenges(Duration::hours(1)).await.unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].id(), "keep");
    }
}
