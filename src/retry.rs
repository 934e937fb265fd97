//! Two-tier retry handling for failed submissions.
//!
//! The immediate queue lives in memory and submits synchronously, one item
//! per dispatch tick. Items that keep failing move back to the persistent
//! failed-solution store, which is merged into the queue every
//! `RETRY_CHECK_FREQUENCY`-th dispatch.

use std::collections::VecDeque;

use tracing::{debug, error, info, warn};

use crate::api::{CoordinatorApi, SubmitOutcome};
use crate::constants::{MAX_IMMEDIATE_RETRIES, RETRY_CHECK_FREQUENCY};
use crate::solutions::{SolutionStatus, SolutionStore};

#[derive(Debug, Clone)]
pub struct RetryItem {
    pub wallet_address: String,
    pub challenge_id: String,
    pub nonce: String,
    pub difficulty: String,
    pub is_dev: bool,
    pub retry_count: u32,
}

/// What happened to the item processed this tick.
#[derive(Debug)]
pub enum RetryDisposition {
    Succeeded(RetryItem),
    Rejected(RetryItem),
    Requeued,
    MovedToPersistent,
}

#[derive(Default)]
pub struct RetryManager {
    immediate: VecDeque<RetryItem>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: RetryItem) {
        debug!(
            "Added to retry queue: {}... (attempt {}/{})",
            &item.challenge_id[..item.challenge_id.len().min(8)],
            item.retry_count + 1,
            MAX_IMMEDIATE_RETRIES
        );
        self.immediate.push_back(item);
    }

    pub fn queue_size(&self) -> usize {
        self.immediate.len()
    }

    /// Pop one item and submit it synchronously. Processing a single item per
    /// tick keeps the dispatch loop responsive.
    pub async fn process_one(
        &mut self,
        api: &dyn CoordinatorApi,
        store: &SolutionStore,
    ) -> Option<RetryDisposition> {
        let item = self.immediate.pop_front()?;

        info!(
            "Retrying submission for {}... (attempt {}/{})",
            &item.wallet_address[..item.wallet_address.len().min(8)],
            item.retry_count + 1,
            MAX_IMMEDIATE_RETRIES
        );

        match api
            .submit_solution(&item.wallet_address, &item.challenge_id, &item.nonce)
            .await
        {
            SubmitOutcome::Accepted => {
                info!("Retry successful");
                store
                    .update_status(&item.challenge_id, &item.nonce, SolutionStatus::Accepted)
                    .await;
                if let Err(e) = store.mark_retry(&item.challenge_id, &item.nonce, true).await {
                    error!("Could not clear retried solution: {}", e);
                }
                Some(RetryDisposition::Succeeded(item))
            }
            SubmitOutcome::Rejected => {
                error!("Retry failed fatally. Dropping.");
                store
                    .update_status(&item.challenge_id, &item.nonce, SolutionStatus::Rejected)
                    .await;
                if let Err(e) = store.mark_retry(&item.challenge_id, &item.nonce, true).await {
                    error!("Could not clear retried solution: {}", e);
                }
                Some(RetryDisposition::Rejected(item))
            }
            SubmitOutcome::Transient => {
                if item.retry_count + 1 < MAX_IMMEDIATE_RETRIES {
                    let mut item = item;
                    item.retry_count += 1;
                    warn!(
                        "Retry failed (transient). Re-queueing ({}/{})",
                        item.retry_count + 1,
                        MAX_IMMEDIATE_RETRIES
                    );
                    self.immediate.push_back(item);
                    Some(RetryDisposition::Requeued)
                } else {
                    error!("Max immediate retries reached. Leaving in persistent storage.");
                    store
                        .update_status(
                            &item.challenge_id,
                            &item.nonce,
                            SolutionStatus::FailedMaxRetries,
                        )
                        .await;
                    if let Err(e) = store.mark_retry(&item.challenge_id, &item.nonce, false).await {
                        error!("Could not stamp retried solution: {}", e);
                    }
                    Some(RetryDisposition::MovedToPersistent)
                }
            }
        }
    }

    /// Merge due persistent entries into the immediate queue. Runs only on
    /// every `RETRY_CHECK_FREQUENCY`-th dispatch; duplicates by
    /// `(challenge_id, nonce)` are skipped.
    pub async fn load_persistent(&mut self, req_id: u64, store: &SolutionStore) -> usize {
        if req_id % RETRY_CHECK_FREQUENCY != 0 {
            return 0;
        }

        let pending = match store.pending_retries().await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Could not load pending retries: {}", e);
                return 0;
            }
        };

        let mut loaded = 0;
        for entry in pending {
            let already_queued = self
                .immediate
                .iter()
                .any(|i| i.challenge_id == entry.challenge_id && i.nonce == entry.nonce);
            if already_queued {
                continue;
            }
            self.immediate.push_back(RetryItem {
                wallet_address: entry.wallet_address,
                challenge_id: entry.challenge_id,
                nonce: entry.nonce,
                difficulty: entry.difficulty,
                is_dev: entry.is_dev_solution,
                retry_count: entry.retry_count.min(MAX_IMMEDIATE_RETRIES - 1),
            });
            loaded += 1;
        }

        if loaded > 0 {
            info!("Loaded {} pending retries from persistent storage", loaded);
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::Challenge;
    use crate::error::MinerError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedApi {
        outcome: SubmitOutcome,
        calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(outcome: SubmitOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CoordinatorApi for ScriptedApi {
        async fn fetch_challenge(&self) -> Result<Option<Challenge>, MinerError> {
            Ok(None)
        }
        async fn register_wallet(&self, _: &str, _: &str, _: &str) -> bool {
            true
        }
        async fn submit_solution(&self, _: &str, _: &str, _: &str) -> SubmitOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
        async fn consolidate_wallet(&self, _: &str, _: &str, _: &str) -> bool {
            true
        }
        fn terms(&self) -> &str {
            "terms"
        }
    }

    fn item(count: u32) -> RetryItem {
        RetryItem {
            wallet_address: "addr1w".to_string(),
            challenge_id: "c1".to_string(),
            nonce: "00ff".to_string(),
            difficulty: "0000ffff".to_string(),
            is_dev: false,
            retry_count: count,
        }
    }

    #[tokio::test]
    async fn successful_retry_marks_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SolutionStore::new(dir.path());
        store.add_solution("c1", "00ff", "addr1w", "0000ffff", false).await;

        let api = ScriptedApi::new(SubmitOutcome::Accepted);
        let mut manager = RetryManager::new();
        manager.enqueue(item(0));

        let disposition = manager.process_one(&api, &store).await.unwrap();
        assert!(matches!(disposition, RetryDisposition::Succeeded(_)));
        assert_eq!(
            store.status_of("c1", "00ff").await,
            Some(SolutionStatus::Accepted)
        );
        assert_eq!(manager.queue_size(), 0);
    }

    #[tokio::test]
    async fn transient_retry_requeues_until_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = SolutionStore::new(dir.path());
        store.add_solution("c1", "00ff", "addr1w", "0000ffff", false).await;
        store
            .add_failed("addr1w", "c1", "00ff", "0000ffff", false)
            .await
            .unwrap();

        let api = ScriptedApi::new(SubmitOutcome::Transient);
        let mut manager = RetryManager::new();
        manager.enqueue(item(0));

        for _ in 0..(MAX_IMMEDIATE_RETRIES - 1) {
            let disposition = manager.process_one(&api, &store).await.unwrap();
            assert!(matches!(disposition, RetryDisposition::Requeued));
        }
        let last = manager.process_one(&api, &store).await.unwrap();
        assert!(matches!(last, RetryDisposition::MovedToPersistent));
        assert_eq!(manager.queue_size(), 0);
        assert_eq!(
            store.status_of("c1", "00ff").await,
            Some(SolutionStatus::FailedMaxRetries)
        );
        assert_eq!(api.calls.load(Ordering::SeqCst), MAX_IMMEDIATE_RETRIES as usize);
    }

    #[tokio::test]
    async fn load_persistent_respects_frequency_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let store = SolutionStore::new(dir.path());
        store
            .add_failed("addr1w", "c1", "00ff", "0000ffff", false)
            .await
            .unwrap();

        let mut manager = RetryManager::new();
        assert_eq!(manager.load_persistent(7, &store).await, 0);
        assert_eq!(manager.load_persistent(100, &store).await, 1);
        // Already queued: skipped.
        assert_eq!(manager.load_persistent(200, &store).await, 0);
        assert_eq!(manager.queue_size(), 1);
    }

    #[tokio::test]
    async fn empty_queue_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = SolutionStore::new(dir.path());
        let api = ScriptedApi::new(SubmitOutcome::Accepted);
        let mut manager = RetryManager::new();
        assert!(manager.process_one(&api, &store).await.is_none());
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }
}
