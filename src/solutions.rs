//! Solution history and the persistent failed-solution store.
//!
//! Accepted/rejected outcomes live in a bounded in-memory log; solutions that
//! failed with a transient error are persisted to `failed_solutions.json` so
//! a restart within 24 hours loses nothing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::constants::{
    PERSISTENT_RETRY_SPACING_HOURS, POOL_LOCK_TIMEOUT, SOLUTION_RETRY_EXPIRY_HOURS,
};
use crate::error::MinerError;
use crate::lockfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionStatus {
    Submitted,
    Accepted,
    Rejected,
    FailedMaxRetries,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionRecord {
    pub challenge_id: String,
    pub nonce: String,
    pub wallet_address: String,
    pub difficulty: String,
    pub is_dev_solution: bool,
    pub timestamp: DateTime<Utc>,
    pub status: SolutionStatus,
}

/// A solution awaiting retry after transient submission failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedSolution {
    pub wallet_address: String,
    pub challenge_id: String,
    pub nonce: String,
    pub difficulty: String,
    pub is_dev_solution: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry: Option<DateTime<Utc>>,
}

impl FailedSolution {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.timestamp > Duration::hours(SOLUTION_RETRY_EXPIRY_HOURS)
    }

    fn due(&self, now: DateTime<Utc>) -> bool {
        match self.last_retry {
            None => true,
            Some(last) => now - last >= Duration::hours(PERSISTENT_RETRY_SPACING_HOURS),
        }
    }
}

pub struct SolutionStore {
    failed_path: PathBuf,
    failed_lock_path: PathBuf,
    solutions: Mutex<Vec<SolutionRecord>>,
}

const SOLUTION_LOG_CAP: usize = 10_000;
const SOLUTION_LOG_TRIM: usize = 5_000;

impl SolutionStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            failed_path: base_dir.as_ref().join("failed_solutions.json"),
            failed_lock_path: base_dir.as_ref().join("failed_solutions.json.lock"),
            solutions: Mutex::new(Vec::new()),
        }
    }

    pub async fn add_solution(
        &self,
        challenge_id: &str,
        nonce: &str,
        wallet_address: &str,
        difficulty: &str,
        is_dev_solution: bool,
    ) {
        let mut solutions = self.solutions.lock().await;
        solutions.push(SolutionRecord {
            challenge_id: challenge_id.to_string(),
            nonce: nonce.to_string(),
            wallet_address: wallet_address.to_string(),
            difficulty: difficulty.to_string(),
            is_dev_solution,
            timestamp: Utc::now(),
            status: SolutionStatus::Submitted,
        });
        if solutions.len() > SOLUTION_LOG_CAP {
            let excess = solutions.len() - SOLUTION_LOG_TRIM;
            solutions.drain(..excess);
        }
    }

    /// Update the most recent record for `(challenge_id, nonce)`.
    pub async fn update_status(&self, challenge_id: &str, nonce: &str, status: SolutionStatus) {
        let mut solutions = self.solutions.lock().await;
        if let Some(record) = solutions
            .iter_mut()
            .rev()
            .find(|s| s.challenge_id == challenge_id && s.nonce == nonce)
        {
            record.status = status;
        }
    }

    pub async fn status_of(&self, challenge_id: &str, nonce: &str) -> Option<SolutionStatus> {
        let solutions = self.solutions.lock().await;
        solutions
            .iter()
            .rev()
            .find(|s| s.challenge_id == challenge_id && s.nonce == nonce)
            .map(|s| s.status)
    }

    pub async fn total_solutions(&self) -> usize {
        self.solutions.lock().await.len()
    }

    // --- failed-solution persistence ---

    fn load_failed(&self) -> Vec<FailedSolution> {
        if !self.failed_path.exists() {
            return Vec::new();
        }
        let entries: Vec<FailedSolution> = match std::fs::read_to_string(&self.failed_path)
            .map_err(MinerError::from)
            .and_then(|s| serde_json::from_str(&s).map_err(MinerError::from))
        {
            Ok(entries) => entries,
            Err(e) => {
                error!("Error loading failed solutions: {}", e);
                return Vec::new();
            }
        };

        let now = Utc::now();
        entries.into_iter().filter(|s| !s.expired(now)).collect()
    }

    fn save_failed(&self, entries: &[FailedSolution]) {
        match serde_json::to_string_pretty(entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.failed_path, json) {
                    error!("Error saving failed solutions: {}", e);
                }
            }
            Err(e) => error!("Error serializing failed solutions: {}", e),
        }
    }

    /// Persist a failed solution for later retry. Duplicate
    /// `(challenge_id, nonce)` entries are ignored.
    pub async fn add_failed(
        &self,
        wallet_address: &str,
        challenge_id: &str,
        nonce: &str,
        difficulty: &str,
        is_dev_solution: bool,
    ) -> Result<(), MinerError> {
        let _guard = lockfile::acquire(&self.failed_lock_path, POOL_LOCK_TIMEOUT).await?;
        let mut entries = self.load_failed();

        if entries
            .iter()
            .any(|s| s.challenge_id == challenge_id && s.nonce == nonce)
        {
            return Ok(());
        }

        entries.push(FailedSolution {
            wallet_address: wallet_address.to_string(),
            challenge_id: challenge_id.to_string(),
            nonce: nonce.to_string(),
            difficulty: difficulty.to_string(),
            is_dev_solution,
            timestamp: Utc::now(),
            retry_count: 0,
            last_retry: None,
        });
        self.save_failed(&entries);
        info!(
            "Persisted failed solution for retry: {}...",
            &challenge_id[..challenge_id.len().min(8)]
        );
        Ok(())
    }

    /// Entries due for another attempt: younger than 24 h and not retried
    /// within the last hour.
    pub async fn pending_retries(&self) -> Result<Vec<FailedSolution>, MinerError> {
        let _guard = lockfile::acquire(&self.failed_lock_path, POOL_LOCK_TIMEOUT).await?;
        let now = Utc::now();
        Ok(self.load_failed().into_iter().filter(|s| s.due(now)).collect())
    }

    /// Record a retry outcome: success removes the entry, failure stamps
    /// `last_retry` and bumps the count.
    pub async fn mark_retry(
        &self,
        challenge_id: &str,
        nonce: &str,
        success: bool,
    ) -> Result<(), MinerError> {
        let _guard = lockfile::acquire(&self.failed_lock_path, POOL_LOCK_TIMEOUT).await?;
        let mut entries = self.load_failed();

        if success {
            entries.retain(|s| !(s.challenge_id == challenge_id && s.nonce == nonce));
        } else if let Some(entry) = entries
            .iter_mut()
            .find(|s| s.challenge_id == challenge_id && s.nonce == nonce)
        {
            entry.last_retry = Some(Utc::now());
            entry.retry_count += 1;
        }
        self.save_failed(&entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_updates_track_latest_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SolutionStore::new(dir.path());

        store.add_solution("c1", "00ff", "addr1w", "0000ffff", false).await;
        assert_eq!(store.status_of("c1", "00ff").await, Some(SolutionStatus::Submitted));

        store.update_status("c1", "00ff", SolutionStatus::Accepted).await;
        assert_eq!(store.status_of("c1", "00ff").await, Some(SolutionStatus::Accepted));
        assert_eq!(store.total_solutions().await, 1);
    }

    #[tokio::test]
    async fn failed_solutions_dedup_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SolutionStore::new(dir.path());

        store.add_failed("addr1w", "c1", "00ff", "0000ffff", false).await.unwrap();
        store.add_failed("addr1w", "c1", "00ff", "0000ffff", false).await.unwrap();

        let pending = store.pending_retries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test]
    async fn recently_retried_entries_are_not_due() {
        let dir = tempfile::tempdir().unwrap();
        let store = SolutionStore::new(dir.path());

        store.add_failed("addr1w", "c1", "00ff", "0000ffff", false).await.unwrap();
        store.mark_retry("c1", "00ff", false).await.unwrap();

        assert!(store.pending_retries().await.unwrap().is_empty());

        store.mark_retry("c1", "00ff", true).await.unwrap();
        // Removed entirely after a successful retry.
        let raw = std::fs::read_to_string(dir.path().join("failed_solutions.json")).unwrap();
        let entries: Vec<FailedSolution> = serde_json::from_str(&raw).unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn entries_older_than_24h_are_discarded_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SolutionStore::new(dir.path());

        let entries = vec![
            FailedSolution {
                wallet_address: "addr1old".to_string(),
                challenge_id: "old".to_string(),
                nonce: "00".to_string(),
                difficulty: "ff".to_string(),
                is_dev_solution: false,
                timestamp: Utc::now() - Duration::hours(25),
                retry_count: 3,
                last_retry: None,
            },
            FailedSolution {
                wallet_address: "addr1new".to_string(),
                challenge_id: "new".to_string(),
                nonce: "01".to_string(),
                difficulty: "ff".to_string(),
                is_dev_solution: false,
                timestamp: Utc::now() - Duration::hours(2),
                retry_count: 0,
                last_retry: None,
            },
        ];
        std::fs::write(
            dir.path().join("failed_solutions.json"),
            serde_json::to_string(&entries).unwrap(),
        )
        .unwrap();

        let pending = store.pending_retries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].challenge_id, "new");
    }
}
