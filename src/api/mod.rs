//! HTTP client for the mining coordinator.
//!
//! All requests go through one retry-wrapped helper: client errors other than
//! 429 are returned immediately, server errors and network failures retry
//! with exponential backoff. Components that need the coordinator take the
//! [`CoordinatorApi`] trait so the wallet pool never depends on a
//! submission-level module and tests can substitute a mock.

pub mod submission;

use async_trait::async_trait;
use reqwest::Method;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::challenge::Challenge;
use crate::constants::{
    API_MAX_RETRIES, API_REQUEST_TIMEOUT, API_RETRY_BACKOFF_BASE, CONSOLIDATION_MAX_RETRIES,
    WALLET_REGISTRATION_MAX_RETRIES,
};
use crate::error::MinerError;

const TERMS: &str = "I agree to abide by the terms and conditions as described in version 1-0 \
of the Defensio DFO mining process: \
2da58cd94d6ccf3d933c4a55ebc720ba03b829b84033b4844aafc36828477cc0";

/// Outcome of a direct solution submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// HTTP 400/409: the coordinator will never accept this solution.
    Rejected,
    /// Anything else: worth retrying later.
    Transient,
}

/// The coordinator operations the mining subsystems rely on.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn fetch_challenge(&self) -> Result<Option<Challenge>, MinerError>;

    /// True on success or when the wallet was already registered.
    async fn register_wallet(&self, address: &str, signature: &str, pubkey: &str) -> bool;

    /// One direct submission attempt; retry policy lives with the caller.
    async fn submit_solution(&self, address: &str, challenge_id: &str, nonce_hex: &str)
        -> SubmitOutcome;

    /// True on success or when already consolidated (HTTP 409).
    async fn consolidate_wallet(&self, destination: &str, original: &str, signature_hex: &str)
        -> bool;

    fn terms(&self) -> &str;
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MinerError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("scavenger-miner/", env!("CARGO_PKG_VERSION")))
            .timeout(API_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MinerError::ApiTransient(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        max_retries: u32,
    ) -> Result<serde_json::Value, MinerError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut last_error = String::new();

        for attempt in 0..max_retries {
            match self.http.request(method.clone(), &url).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();

                    if status.is_success() {
                        return Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::Null));
                    }

                    // Client errors other than rate limiting are final.
                    if status.is_client_error() && status.as_u16() != 429 {
                        warn!("API client error {} on {}: {}", status, endpoint, body);
                        return Err(MinerError::ApiRejected {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    warn!(
                        "API error {} on {} (attempt {}/{})",
                        status,
                        endpoint,
                        attempt + 1,
                        max_retries
                    );
                    last_error = format!("HTTP {}", status);
                }
                Err(e) => {
                    warn!(
                        "API request error on {} (attempt {}/{}): {}",
                        endpoint,
                        attempt + 1,
                        max_retries,
                        e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt + 1 < max_retries {
                let delay = API_RETRY_BACKOFF_BASE.saturating_pow(attempt);
                debug!("Retrying {} in {}s...", endpoint, delay);
                sleep(std::time::Duration::from_secs(delay)).await;
            }
        }

        Err(MinerError::ApiTransient(format!(
            "{} failed after {} attempts: {}",
            endpoint, max_retries, last_error
        )))
    }
}

#[async_trait]
impl CoordinatorApi for ApiClient {
    async fn fetch_challenge(&self) -> Result<Option<Challenge>, MinerError> {
        let data = self.request(Method::GET, "/challenge", API_MAX_RETRIES).await?;
        match data.get("challenge") {
            Some(value) if !value.is_null() => {
                let challenge = serde_json::from_value(value.clone())?;
                Ok(Some(challenge))
            }
            _ => {
                warn!("API returned no challenge data");
                Ok(None)
            }
        }
    }

    async fn register_wallet(&self, address: &str, signature: &str, pubkey: &str) -> bool {
        let endpoint = format!("/register/{}/{}/{}", address, signature, pubkey);
        match self
            .request(Method::POST, &endpoint, WALLET_REGISTRATION_MAX_RETRIES)
            .await
        {
            Ok(_) => {
                info!("Wallet registered successfully: {}...", &address[..address.len().min(20)]);
                true
            }
            Err(MinerError::ApiRejected { body, .. }) if body.to_lowercase().contains("already") => {
                debug!("Wallet already registered: {}...", &address[..address.len().min(20)]);
                true
            }
            Err(e) => {
                error!("Failed to register wallet: {}", e);
                false
            }
        }
    }

    async fn submit_solution(
        &self,
        address: &str,
        challenge_id: &str,
        nonce_hex: &str,
    ) -> SubmitOutcome {
        let endpoint = format!("/solution/{}/{}/{}", address, challenge_id, nonce_hex);
        match self.request(Method::POST, &endpoint, 1).await {
            Ok(response) => {
                info!("Submission response: {}", response);
                SubmitOutcome::Accepted
            }
            Err(e) if e.is_fatal_rejection() => {
                debug!("Solution rejected: {}", e);
                SubmitOutcome::Rejected
            }
            Err(e) => {
                debug!("Solution submission error: {}", e);
                SubmitOutcome::Transient
            }
        }
    }

    async fn consolidate_wallet(
        &self,
        destination: &str,
        original: &str,
        signature_hex: &str,
    ) -> bool {
        let endpoint = format!("/donate_to/{}/{}/{}", destination, original, signature_hex);
        match self
            .request(Method::POST, &endpoint, CONSOLIDATION_MAX_RETRIES)
            .await
        {
            Ok(_) => {
                info!(
                    "Wallet consolidated: {}... -> {}...",
                    &original[..original.len().min(10)],
                    &destination[..destination.len().min(10)]
                );
                true
            }
            Err(MinerError::ApiRejected { status: 409, .. }) => {
                debug!("Wallet already consolidated: {}...", &original[..original.len().min(10)]);
                true
            }
            Err(e) => {
                error!("Failed to consolidate wallet: {}", e);
                false
            }
        }
    }

    fn terms(&self) -> &str {
        TERMS
    }
}
