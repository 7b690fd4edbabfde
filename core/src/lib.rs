// Anoverif Core — Request Mixing Engine
//
// "Can anyone watching the boundary tell which backend call answers
//  which client request?"
//
// If the answer is yes, the engine is not doing its job.

pub mod backend;
pub mod cache;
pub mod config;
pub mod hashing;
pub mod metrics;
pub mod mixing;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backend::{BackendClient, BackendError, HttpBackendClient};
pub use cache::{CacheError, HashCache};
pub use config::{ConfigError, MixerConfig};
pub use hashing::{hash, CorrelationHasher, CorrelationKey};
pub use metrics::{Metrics, MetricsSnapshot};
pub use mixing::{
    compute_jitter, JitterConfig, JitterDistribution, Mixer, MixingQueue, PendingRequest,
    PendingTable, ResultSlot, SlotError, SlotState, Submission, TimingJitter,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Per-request failure delivered through a [`ResultSlot`].
///
/// Nothing in the engine lets one of these escape a worker task; every
/// failure ends up in the slot of the request it belongs to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Invalid backend response: {0}")]
    BackendInvalidResponse(String),
    #[error("Correlation key collision")]
    CorrelationCollision,
    #[error("Request timed out")]
    RequestTimeout,
    #[error("Request cancelled")]
    Cancelled,
}

impl VerifyError {
    /// Stable identifier for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::MalformedRequest(_) => "malformed_request",
            VerifyError::BackendUnavailable(_) => "backend_unavailable",
            VerifyError::BackendInvalidResponse(_) => "backend_invalid_response",
            VerifyError::CorrelationCollision => "correlation_collision",
            VerifyError::RequestTimeout => "request_timeout",
            VerifyError::Cancelled => "cancelled",
        }
    }

    /// Message that is safe to hand back to a client.
    ///
    /// Backend detail strings stay server-side; only malformed-request
    /// messages are echoed because the client produced them.
    pub fn public_message(&self) -> String {
        match self {
            VerifyError::MalformedRequest(msg) => msg.clone(),
            VerifyError::BackendUnavailable(_) => "Backend API unavailable".to_string(),
            VerifyError::BackendInvalidResponse(_) => "Invalid backend response".to_string(),
            VerifyError::CorrelationCollision => "Internal error".to_string(),
            VerifyError::RequestTimeout => "Request timed out".to_string(),
            VerifyError::Cancelled => "Server shutting down".to_string(),
        }
    }
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// Outcome of one backend verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub result: bool,
}

impl Verification {
    pub fn new(result: bool) -> Self {
        Self { result }
    }
}
