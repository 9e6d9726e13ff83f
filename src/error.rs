use thiserror::Error;

/// Every way a quote, balance or trade operation can go wrong.
///
/// Variants carry a human readable message; `Display` is what ends up in the
/// `Failed` trade status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradeError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{0}")]
    PreconditionNotMet(String),

    #[error("network error: {0}")]
    NetworkError(String),

    /// The pricing service answered `success: false`. The message is kept verbatim.
    #[error("{0}")]
    RemoteRejected(String),

    #[error("unsupported transaction format: {0} (only v0 transactions are supported)")]
    UnsupportedTransactionFormat(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("signature rejected: {0}")]
    SignatureRejected(String),

    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),

    #[error("transaction {signature} failed on-chain: {reason}")]
    TransactionFailed { signature: String, reason: String },

    #[error("transaction {signature} not confirmed after {attempts} checks")]
    ConfirmationTimeout { signature: String, attempts: u32 },

    #[error("illegal trade transition: {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
}

impl TradeError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionNotMet(msg.into())
    }

    /// Maps a collaborator failure (reqwest, RPC client, ...) onto `NetworkError`.
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl From<reqwest::Error> for TradeError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err)
    }
}
