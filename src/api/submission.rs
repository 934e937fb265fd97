//! Background single-flight solution submission.
//!
//! One task owns the in-flight set, so submissions for the same
//! `(address, challenge)` are serialized; across distinct keys no order is
//! guaranteed. Transient failures are rescheduled with an explicit
//! `next_attempt_at` and mirrored into the persistent failed-solution store,
//! which doubles as crash recovery: while this task is alive it keeps
//! stamping `last_retry`, holding the persistent tier off; after a crash the
//! stamps stop and the retry manager picks the entries up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::api::{CoordinatorApi, SubmitOutcome};
use crate::constants::{SOLUTION_RETRY_EXPIRY_HOURS, SUBMISSION_RETRY_DELAY};
use crate::solutions::SolutionStore;
use crate::wallet::PoolId;

#[derive(Debug, Clone)]
pub struct PendingSubmission {
    pub pool_id: PoolId,
    pub wallet_address: String,
    pub challenge_id: String,
    pub nonce_hex: String,
    pub difficulty: String,
    pub is_dev: bool,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub attempts: u32,
}

impl PendingSubmission {
    pub fn new(
        pool_id: PoolId,
        wallet_address: String,
        challenge_id: String,
        nonce_hex: String,
        difficulty: String,
        is_dev: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            pool_id,
            wallet_address,
            challenge_id,
            nonce_hex,
            difficulty,
            is_dev,
            created_at: now,
            next_attempt_at: now,
            attempts: 0,
        }
    }
}

/// Terminal outcomes reported back to the response processor.
#[derive(Debug)]
pub enum SubmissionEvent {
    Accepted(PendingSubmission),
    /// HTTP 400/409; the coordinator will never take this solution.
    Rejected(PendingSubmission),
    /// Still failing transiently after the retry lifetime.
    Expired(PendingSubmission),
}

#[derive(Clone)]
pub struct SubmissionQueue {
    tx: mpsc::UnboundedSender<PendingSubmission>,
}

impl SubmissionQueue {
    /// Queue a solution for background submission. Returns immediately;
    /// outcomes arrive on the event channel.
    pub fn enqueue(&self, submission: PendingSubmission) -> bool {
        debug!(
            "Solution queued: {}... nonce={}",
            &submission.challenge_id[..submission.challenge_id.len().min(8)],
            submission.nonce_hex
        );
        self.tx.send(submission).is_ok()
    }
}

/// Start the background task. `events` receives one terminal event per entry.
pub fn spawn(
    api: Arc<dyn CoordinatorApi>,
    store: Arc<SolutionStore>,
    events: mpsc::UnboundedSender<SubmissionEvent>,
    shutdown: Arc<AtomicBool>,
) -> (SubmissionQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PendingSubmission>();

    let join = tokio::spawn(async move {
        info!("Solution submission queue started");
        let mut inflight: Vec<PendingSubmission> = Vec::new();

        while !shutdown.load(Ordering::Relaxed) {
            // Pick up newly queued solutions without blocking the retry pass.
            while let Ok(submission) = rx.try_recv() {
                inflight.push(submission);
            }

            let now = Utc::now();
            let mut keep: Vec<PendingSubmission> = Vec::with_capacity(inflight.len());

            for mut submission in inflight.drain(..) {
                let age = now - submission.created_at;
                if age > chrono::Duration::hours(SOLUTION_RETRY_EXPIRY_HOURS) {
                    warn!(
                        "Solution expired after {}h, discarding: {}... nonce={}",
                        SOLUTION_RETRY_EXPIRY_HOURS,
                        &submission.challenge_id[..submission.challenge_id.len().min(8)],
                        submission.nonce_hex
                    );
                    let _ = events.send(SubmissionEvent::Expired(submission));
                    continue;
                }
                if now < submission.next_attempt_at {
                    keep.push(submission);
                    continue;
                }

                submission.attempts += 1;
                let outcome = api
                    .submit_solution(
                        &submission.wallet_address,
                        &submission.challenge_id,
                        &submission.nonce_hex,
                    )
                    .await;

                match outcome {
                    SubmitOutcome::Accepted => {
                        info!(
                            "Solution submitted successfully (attempt {}): {}... nonce={}",
                            submission.attempts,
                            &submission.challenge_id[..submission.challenge_id.len().min(8)],
                            submission.nonce_hex
                        );
                        clear_persistent(&store, &submission).await;
                        let _ = events.send(SubmissionEvent::Accepted(submission));
                    }
                    SubmitOutcome::Rejected => {
                        error!(
                            "Solution rejected (fatal): {}... nonce={}",
                            &submission.challenge_id[..submission.challenge_id.len().min(8)],
                            submission.nonce_hex
                        );
                        clear_persistent(&store, &submission).await;
                        let _ = events.send(SubmissionEvent::Rejected(submission));
                    }
                    SubmitOutcome::Transient => {
                        debug!(
                            "Solution submission failed (attempt {}), retrying in {}s",
                            submission.attempts,
                            SUBMISSION_RETRY_DELAY.as_secs()
                        );
                        mirror_to_persistent(&store, &submission).await;
                        submission.next_attempt_at =
                            Utc::now() + chrono::Duration::from_std(SUBMISSION_RETRY_DELAY)
                                .unwrap_or_else(|_| chrono::Duration::seconds(300));
                        keep.push(submission);
                    }
                }
            }

            inflight = keep;
            sleep(Duration::from_millis(100)).await;
        }
        info!("Solution submission queue stopped");
    });

    (SubmissionQueue { tx }, join)
}

/// Keep the crash-recovery copy current: ensure the entry exists, then stamp
/// `last_retry` so the persistent tier stays quiet while this task is alive.
async fn mirror_to_persistent(store: &SolutionStore, submission: &PendingSubmission) {
    if let Err(e) = store
        .add_failed(
            &submission.wallet_address,
            &submission.challenge_id,
            &submission.nonce_hex,
            &submission.difficulty,
            submission.is_dev,
        )
        .await
    {
        error!("Could not persist failed solution: {}", e);
        return;
    }
    if let Err(e) = store
        .mark_retry(&submission.challenge_id, &submission.nonce_hex, false)
        .await
    {
        error!("Could not stamp failed solution: {}", e);
    }
}

async fn clear_persistent(store: &SolutionStore, submission: &PendingSubmission) {
    if let Err(e) = store
        .mark_retry(&submission.challenge_id, &submission.nonce_hex, true)
        .await
    {
        error!("Could not clear failed solution: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::Challenge;
    use crate::error::MinerError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedApi {
        outcome: SubmitOutcome,
        calls: AtomicUsize,
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

    fn submission() -> PendingSubmission {
        PendingSubmission::new(
            PoolId::Cpu,
            "addr1w".to_string(),
            "chal-1".to_string(),
            "0123456789abcdef".to_string(),
            "0000ffff".to_string(),
            false,
        )
    }

    struct QueueFixture {
        dir: tempfile::TempDir,
        store: Arc<SolutionStore>,
        events: mpsc::UnboundedReceiver<SubmissionEvent>,
        shutdown: Arc<AtomicBool>,
        join: JoinHandle<()>,
    }

    async fn run_queue(outcome: SubmitOutcome) -> QueueFixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SolutionStore::new(dir.path()));

        let api = Arc::new(ScriptedApi {
            outcome,
            calls: AtomicUsize::new(0),
        });
        let (events_tx, events) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (queue, join) = spawn(api, Arc::clone(&store), events_tx, Arc::clone(&shutdown));

        assert!(queue.enqueue(submission()));
        QueueFixture {
            dir,
            store,
            events,
            shutdown,
            join,
        }
    }

    #[tokio::test]
    async fn accepted_submission_emits_event() {
        let mut fixture = run_queue(SubmitOutcome::Accepted).await;

        let event = tokio::time::timeout(Duration::from_secs(5), fixture.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SubmissionEvent::Accepted(_)));

        fixture.shutdown.store(true, Ordering::Relaxed);
        let _ = fixture.join.await;
    }

    #[tokio::test]
    async fn fatal_rejection_emits_rejected() {
        let mut fixture = run_queue(SubmitOutcome::Rejected).await;

        let event = tokio::time::timeout(Duration::from_secs(5), fixture.events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SubmissionEvent::Rejected(submission) => {
                assert_eq!(submission.challenge_id, "chal-1");
                assert_eq!(submission.attempts, 1);
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        fixture.shutdown.store(true, Ordering::Relaxed);
        let _ = fixture.join.await;
    }

    #[tokio::test]
    async fn transient_failure_is_mirrored_to_persistent_store() {
        let mut fixture = run_queue(SubmitOutcome::Transient).await;

        // No terminal event; the entry is rescheduled 300s out.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fixture.events.try_recv().is_err());

        // The crash-recovery copy exists in failed_solutions.json, freshly
        // stamped so the persistent tier does not consider it due yet.
        let raw = std::fs::read_to_string(fixture.dir.path().join("failed_solutions.json")).unwrap();
        let entries: Vec<crate::solutions::FailedSolution> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].challenge_id, "chal-1");
        assert!(entries[0].last_retry.is_some());
        assert!(fixture.store.pending_retries().await.unwrap().is_empty());

        fixture.shutdown.store(true, Ordering::Relaxed);
        let _ = fixture.join.await;
    }
}
