use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error taxonomy for the payment gateway.
///
/// Signature and decoding failures are distinct variants so callers can
/// refuse a lifecycle transition specifically on `SignatureMismatch` while
/// still logging `ProviderBusiness` for operational visibility. Messages
/// never contain key material or raw secrets.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Canonicalization error: {message}")]
    Canonicalization { message: String },

    #[error("Signature mismatch: {message}")]
    SignatureMismatch { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Wire decoding error: {message}")]
    WireDecoding { message: String },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderBusiness {
        provider: String,
        message: String,
        provider_code: Option<String>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },
}

impl GatewayError {
    /// Only transport failures are safe to retry, and only when the caller
    /// reuses the same order/refund id so provider idempotency applies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport { .. })
    }

    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Configuration { .. } => {
                "Payment provider is not configured".to_string()
            }
            GatewayError::Canonicalization { message } => message.clone(),
            GatewayError::SignatureMismatch { .. } => {
                "Payment message failed signature verification".to_string()
            }
            GatewayError::Transport { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            GatewayError::WireDecoding { .. } => {
                "Payment provider returned an unreadable response".to_string()
            }
            GatewayError::ProviderBusiness { message, .. } => message.clone(),
            GatewayError::Validation { message, .. } => message.clone(),
        }
    }
}
