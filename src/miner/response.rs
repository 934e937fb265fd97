//! Response handling: worker results and eventual submission outcomes.
//!
//! Solutions are handed to the background submission queue and the wallet is
//! released as solved immediately, which guarantees the wallet never mines
//! the same challenge twice regardless of how the submission resolves. The
//! queue's terminal events then settle the recorded status: accepted,
//! rejected (the wallet stays marked solved so it cannot re-mine and
//! re-reject), or failed after the retry lifetime.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::util;
use super::worker::{MineResponse, WorkerKind};
use crate::api::submission::{PendingSubmission, SubmissionEvent, SubmissionQueue};
use crate::solutions::{SolutionStatus, SolutionStore};
use crate::stats::SessionStats;
use crate::wallet::WalletPool;

/// Context the manager recorded when it dispatched the request.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub kind: WorkerKind,
    pub worker_id: u32,
    pub wallet_address: String,
    pub challenge_id: String,
    pub difficulty: String,
    pub is_dev: bool,
    /// Sticky wallets stay allocated when the batch found nothing.
    pub keep_wallet_on_fail: bool,
    pub num_workers: usize,
}

pub struct ResponseProcessor {
    pool: Arc<WalletPool>,
    store: Arc<SolutionStore>,
    stats: Arc<SessionStats>,
    submitter: SubmissionQueue,
}

impl ResponseProcessor {
    pub fn new(
        pool: Arc<WalletPool>,
        store: Arc<SolutionStore>,
        stats: Arc<SessionStats>,
        submitter: SubmissionQueue,
    ) -> Self {
        Self {
            pool,
            store,
            stats,
            submitter,
        }
    }

    pub async fn process_response(&self, ctx: ResponseContext, response: MineResponse) {
        let pool_id = ctx.kind.pool_id(ctx.worker_id);

        if let Some(error) = &response.error {
            error!("{} {} error: {}", ctx.kind, ctx.worker_id, error);
            self.release(ctx.clone(), false).await;
            return;
        }

        if response.found {
            self.handle_solution(&ctx, &response).await;
        } else if !ctx.keep_wallet_on_fail {
            self.release(ctx.clone(), false).await;
        } else {
            debug!(
                "{} {} batch exhausted, keeping sticky wallet allocated on {}",
                ctx.kind, ctx.worker_id, pool_id
            );
        }

        self.stats
            .update_hashrate(ctx.kind, response.hashes, response.duration, ctx.num_workers)
            .await;
    }

    async fn handle_solution(&self, ctx: &ResponseContext, response: &MineResponse) {
        let nonce = match response.nonce {
            Some(nonce) => nonce,
            None => {
                error!("{} {} reported found without a nonce", ctx.kind, ctx.worker_id);
                self.release(ctx.clone(), false).await;
                return;
            }
        };
        let nonce_hex = util::format_nonce_hex(nonce);

        if !ctx.is_dev {
            info!(
                "{} {} SOLUTION FOUND! Nonce: {}",
                ctx.kind, ctx.worker_id, nonce
            );
        }

        let queued = self.submitter.enqueue(PendingSubmission::new(
            ctx.kind.pool_id(ctx.worker_id),
            ctx.wallet_address.clone(),
            ctx.challenge_id.clone(),
            nonce_hex.clone(),
            ctx.difficulty.clone(),
            ctx.is_dev,
        ));
        if !queued {
            error!("Submission queue is gone; dropping solution");
            self.release(ctx.clone(), false).await;
            return;
        }

        // Marking the wallet solved now prevents a second submission of the
        // same (wallet, challenge) pair while the queue works.
        self.release(ctx.clone(), true).await;
        self.store
            .add_solution(
                &ctx.challenge_id,
                &nonce_hex,
                &ctx.wallet_address,
                &ctx.difficulty,
                ctx.is_dev,
            )
            .await;
        self.stats
            .record_solution(&ctx.wallet_address, ctx.is_dev)
            .await;
    }

    /// Settle a terminal submission outcome from the background queue.
    pub async fn process_submission_event(&self, event: SubmissionEvent) {
        match event {
            SubmissionEvent::Accepted(submission) => {
                if !submission.is_dev {
                    info!("Solution submitted successfully!");
                }
                self.store
                    .update_status(
                        &submission.challenge_id,
                        &submission.nonce_hex,
                        SolutionStatus::Accepted,
                    )
                    .await;
            }
            SubmissionEvent::Rejected(submission) => {
                error!("Fatal error submitting solution (rejected). Marking as solved.");
                // Idempotent: keeps the solved mark even if the wallet was
                // reallocated and released in between.
                if let Err(e) = self
                    .pool
                    .release(
                        submission.pool_id,
                        &submission.wallet_address,
                        Some(&submission.challenge_id),
                        true,
                    )
                    .await
                {
                    error!("Could not release wallet after rejection: {}", e);
                }
                self.store
                    .update_status(
                        &submission.challenge_id,
                        &submission.nonce_hex,
                        SolutionStatus::Rejected,
                    )
                    .await;
            }
            SubmissionEvent::Expired(submission) => {
                error!(
                    "Solution for {}... expired unsubmitted",
                    &submission.challenge_id[..submission.challenge_id.len().min(8)]
                );
                self.store
                    .update_status(
                        &submission.challenge_id,
                        &submission.nonce_hex,
                        SolutionStatus::FailedMaxRetries,
                    )
                    .await;
            }
        }
    }

    async fn release(&self, ctx: ResponseContext, solved: bool) {
        let pool_id = ctx.kind.pool_id(ctx.worker_id);
        if let Err(e) = self
            .pool
            .release(
                pool_id,
                &ctx.wallet_address,
                Some(&ctx.challenge_id),
                solved,
            )
            .await
        {
            error!("Could not release wallet {}: {}", ctx.wallet_address, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CoordinatorApi, SubmitOutcome};
    use crate::challenge::Challenge;
    use crate::error::MinerError;
    use crate::wallet::PoolId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

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

    struct Fixture {
        pool: Arc<WalletPool>,
        store: Arc<SolutionStore>,
        stats: Arc<SessionStats>,
        processor: ResponseProcessor,
        shutdown: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let api: Arc<dyn CoordinatorApi> = Arc::new(MockApi);
        let pool = Arc::new(WalletPool::new(
            dir.path(),
            Arc::clone(&api),
            None,
            "addr1dev".to_string(),
        ));
        let store = Arc::new(SolutionStore::new(dir.path()));
        let stats = Arc::new(SessionStats::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (submitter, _join) = crate::api::submission::spawn(
            api,
            Arc::clone(&store),
            events_tx,
            Arc::clone(&shutdown),
        );
        let processor = ResponseProcessor::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&stats),
            submitter,
        );
        Fixture {
            pool,
            store,
            stats,
            processor,
            shutdown,
            _dir: dir,
        }
    }

    fn ctx(address: &str, keep: bool) -> ResponseContext {
        ResponseContext {
            kind: WorkerKind::Cpu,
            worker_id: 0,
            wallet_address: address.to_string(),
            challenge_id: "chal-1".to_string(),
            difficulty: "0000ffff".to_string(),
            is_dev: false,
            keep_wallet_on_fail: keep,
            num_workers: 1,
        }
    }

    fn found(nonce: u64) -> MineResponse {
        MineResponse {
            request_id: 1,
            found: true,
            nonce: Some(nonce),
            hash: Some("00".repeat(32)),
            hashes: 1000,
            duration: 2.0,
            error: None,
        }
    }

    fn not_found() -> MineResponse {
        MineResponse {
            request_id: 1,
            found: false,
            nonce: None,
            hash: None,
            hashes: 1000,
            duration: 2.0,
            error: None,
        }
    }

    #[tokio::test]
    async fn found_solution_releases_solved_and_records() {
        let f = fixture().await;
        let wallet = f.pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        f.pool.allocate(PoolId::Cpu, "chal-1", false).await.unwrap();

        f.processor
            .process_response(ctx(&wallet.address, false), found(0x0123456789abcdef))
            .await;

        let after = f.pool.get(PoolId::Cpu, &wallet.address).await.unwrap().unwrap();
        assert!(!after.in_use);
        assert!(after.has_solved("chal-1"));
        assert_eq!(
            f.store.status_of("chal-1", "0123456789abcdef").await,
            Some(SolutionStatus::Submitted)
        );
        let snapshot = f.stats.snapshot().await;
        assert_eq!(snapshot.session_solutions, 1);
        assert!(snapshot.cpu_hashrate > 0.0);

        f.shutdown.store(true, Ordering::Relaxed);
    }

    #[tokio::test]
    async fn worker_error_releases_without_solving() {
        let f = fixture().await;
        let wallet = f.pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        f.pool.allocate(PoolId::Cpu, "chal-1", false).await.unwrap();

        let response = MineResponse {
            request_id: 1,
            found: false,
            nonce: None,
            hash: None,
            hashes: 0,
            duration: 0.0,
            error: Some("kernel exploded".to_string()),
        };
        f.processor
            .process_response(ctx(&wallet.address, false), response)
            .await;

        let after = f.pool.get(PoolId::Cpu, &wallet.address).await.unwrap().unwrap();
        assert!(!after.in_use);
        assert!(!after.has_solved("chal-1"));
        // Errors do not contribute hashrate samples.
        assert_eq!(f.stats.snapshot().await.cpu_hashrate, 0.0);

        f.shutdown.store(true, Ordering::Relaxed);
    }

    #[tokio::test]
    async fn sticky_wallet_stays_allocated_on_miss() {
        let f = fixture().await;
        let wallet = f.pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        f.pool.allocate(PoolId::Cpu, "chal-1", false).await.unwrap();

        f.processor
            .process_response(ctx(&wallet.address, true), not_found())
            .await;
        let after = f.pool.get(PoolId::Cpu, &wallet.address).await.unwrap().unwrap();
        assert!(after.in_use);

        f.processor
            .process_response(ctx(&wallet.address, false), not_found())
            .await;
        let after = f.pool.get(PoolId::Cpu, &wallet.address).await.unwrap().unwrap();
        assert!(!after.in_use);

        f.shutdown.store(true, Ordering::Relaxed);
    }

    #[tokio::test]
    async fn rejection_event_marks_wallet_solved() {
        let f = fixture().await;
        let wallet = f.pool.create(PoolId::Cpu, false).await.unwrap().unwrap();
        f.store
            .add_solution("chal-1", "00ff", &wallet.address, "0000ffff", false)
            .await;

        let submission = PendingSubmission::new(
            PoolId::Cpu,
            wallet.address.clone(),
            "chal-1".to_string(),
            "00ff".to_string(),
            "0000ffff".to_string(),
            false,
        );
        f.processor
            .process_submission_event(SubmissionEvent::Rejected(submission))
            .await;

        // Marked solved so it will not re-mine and re-reject; no retry is
        // queued for fatal rejections.
        let after = f.pool.get(PoolId::Cpu, &wallet.address).await.unwrap().unwrap();
        assert!(after.has_solved("chal-1"));
        assert_eq!(
            f.store.status_of("chal-1", "00ff").await,
            Some(SolutionStatus::Rejected)
        );
        assert!(f.store.pending_retries().await.unwrap().is_empty());

        f.shutdown.store(true, Ordering::Relaxed);
    }
}
