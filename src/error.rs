use thiserror::Error;

/// Error kinds surfaced by the mining subsystems.
///
/// Recoverable errors stay inside the component that observed them and are
/// logged once; only shutdown unwinds the run loop.
#[derive(Debug, Error)]
pub enum MinerError {
    /// The coordinator answered with a client error; retrying is pointless.
    #[error("coordinator returned HTTP {status}: {body}")]
    ApiRejected { status: u16, body: String },

    /// Network-level or server-side failure; safe to retry later.
    #[error("coordinator unreachable: {0}")]
    ApiTransient(String),

    #[error("timed out acquiring lock on {0}")]
    LockTimeout(String),

    #[error("wallet registration failed for {0}")]
    RegistrationFailed(String),

    #[error("invalid difficulty string {0:?}")]
    BadDifficulty(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("worker initialization failed: {0}")]
    WorkerInit(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MinerError {
    /// Fatal submission rejections (HTTP 400/409) must not be retried.
    pub fn is_fatal_rejection(&self) -> bool {
        matches!(self, MinerError::ApiRejected { status: 400 | 409, .. })
    }
}
