use thiserror::Error;

/// Errors returned by x402 operations.
///
/// Protocol-shape failures observed during settlement (recipient mismatch,
/// unsupported scheme, replayed nonce, on-chain failures) are normally
/// converted into terminal [`crate::PaymentCompleted`] records by the
/// facilitator rather than surfaced as `Err`; these variants reach callers
/// directly only from the builders, the chooser, and the negotiator.
#[derive(Debug, Error)]
pub enum X402Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("recipient mismatch: {0}")]
    RecipientMismatch(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("no payment options available")]
    NoPaymentOptions,

    #[error("replayed nonce: {0}")]
    ReplayedNonce(String),

    #[error("on-chain revert: {0}")]
    OnChainRevert(String),

    #[error("rpc timeout: {0}")]
    RpcTimeout(String),

    #[error("chain error: {0}")]
    Chain(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
