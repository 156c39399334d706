//! Error types for chain dispatch.

/// Chain executor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Transport failure, 5xx or rate limiting from the RPC endpoint.
    #[error("rpc unavailable: {message}")]
    RpcUnavailable { message: String },

    /// JSON-RPC error object returned by the node.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The signing service could not be reached.
    #[error("signer unavailable: {message}")]
    SignerUnavailable { message: String },

    /// The signing service refused the request.
    #[error("signer rejected request: {message}")]
    SignerRejected { message: String },

    /// The signing service answered with something that is not a signature.
    #[error("invalid signer response: {message}")]
    SignerResponse { message: String },

    /// The node refused the raw transaction.
    #[error("broadcast rejected: {message}")]
    BroadcastRejected { message: String },

    /// The transaction nonce is already used on chain.
    #[error("stale nonce: {message}")]
    StaleNonce { message: String },

    /// The node already holds this exact signed transaction.
    #[error("transaction already known: {message}")]
    AlreadyKnown { message: String },

    #[error("unknown chain: {chain}")]
    UnknownChain { chain: String },

    #[error("unknown token {token} on {chain}")]
    UnknownToken { chain: String, token: String },

    /// The payment cannot be turned into a transfer.
    #[error("invalid payment: {message}")]
    InvalidPayment { message: String },

    #[error("no dispatch recorded for mandate {mandate_id}")]
    UnknownDispatch { mandate_id: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ChainError {
    /// Whether the error is retryable.
    ///
    /// Signer errors are never retryable: a retry could produce a second
    /// signature for the same nonce.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RpcUnavailable { .. })
    }

    pub fn is_signer_error(&self) -> bool {
        matches!(
            self,
            Self::SignerUnavailable { .. } | Self::SignerRejected { .. } | Self::SignerResponse { .. }
        )
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        Self::RpcUnavailable {
            message: err.to_string(),
        }
    }
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
