//! Error taxonomy for the aggregator.
//!
//! Mirrors the kinds enumerated in the spec's error handling design:
//! per-event failures are contained (logged and dropped), transport
//! failures are split into retryable/fatal, and on-chain/deal failures
//! never escalate to process termination.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregatorError {
    /// An offer failed `Piece` conversion, or could not fit in a target
    /// aggregate even alone. Logged and discarded by the packing engine.
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    /// A transport error whose kind looks like a transient reset; the
    /// event subscriber reopens the subscription.
    #[error("retryable transport error: {0}")]
    TransportRetryable(String),

    /// A transport error that is not a reset; the worker exits and the
    /// aggregator shuts down.
    #[error("fatal transport error: {0}")]
    TransportFatal(String),

    /// `commitAggregate` failed to send or failed to be mined.
    #[error("on-chain commit failed: {0}")]
    OnChainTxFailure(String),

    /// The storage provider rejected the deal proposal.
    #[error("deal rejected: {0}")]
    DealRejected(String),

    /// The storage provider does not advertise the deal protocol.
    #[error("storage provider does not support protocol {0}")]
    UnsupportedProtocol(String),

    /// An HTTP transfer request named an id with no registered transfer.
    #[error("transfer id not found")]
    TransferNotFound,

    /// Startup-time configuration problem; fatal.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
