use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Provider unavailable: provider={provider}, message={message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("Provider rejected request: provider={provider}, message={message}")]
    ProviderRejected {
        provider: String,
        message: String,
        provider_code: Option<String>,
    },

    #[error("Provider authentication failed: provider={provider}, message={message}")]
    AuthenticationError { provider: String, message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Invalid signature: {message}")]
    InvalidSignature { message: String },

    #[error("Malformed provider payload: {message}")]
    MalformedPayload { message: String },

    #[error("Operation {operation} is not supported by {provider}")]
    Unsupported { provider: String, operation: String },
}

impl PaymentError {
    pub fn unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        PaymentError::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        PaymentError::MalformedPayload {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::ProviderUnavailable { .. } => true,
            PaymentError::ProviderRejected { .. } => false,
            PaymentError::AuthenticationError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::InvalidSignature { .. } => false,
            PaymentError::MalformedPayload { .. } => false,
            PaymentError::Unsupported { .. } => false,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::ProviderUnavailable { .. } => 503,
            PaymentError::ProviderRejected { .. } => 502,
            PaymentError::AuthenticationError { .. } => 502,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::InvalidSignature { .. } => 401,
            PaymentError::MalformedPayload { .. } => 400,
            PaymentError::Unsupported { .. } => 404,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::ProviderUnavailable { .. } | PaymentError::AuthenticationError { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::ProviderRejected { .. } => {
                "Payment provider rejected the request".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment provider. Please retry shortly".to_string()
            }
            PaymentError::InvalidSignature { .. } => "Invalid webhook signature".to_string(),
            PaymentError::MalformedPayload { .. } => "Malformed provider payload".to_string(),
            PaymentError::Unsupported { operation, .. } => {
                format!("Operation '{}' is not supported for this provider", operation)
            }
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let kind = match err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidValue {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            PaymentError::InvalidSignature { .. } => {
                AppErrorKind::External(ExternalError::InvalidSignature {
                    provider: "webhook".to_string(),
                })
            }
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "payment provider".to_string(),
                retry_after: retry_after_seconds,
            }),
            other => {
                let provider = match &other {
                    PaymentError::ProviderUnavailable { provider, .. }
                    | PaymentError::ProviderRejected { provider, .. }
                    | PaymentError::AuthenticationError { provider, .. }
                    | PaymentError::Unsupported { provider, .. } => provider.clone(),
                    _ => "payments".to_string(),
                };
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider,
                    message: other.to_string(),
                    is_retryable: other.is_retryable(),
                })
            }
        };

        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_http_status_mapping_is_correct() {
        assert_eq!(
            PaymentError::ValidationError {
                message: "bad".to_string(),
                field: None
            }
            .http_status_code(),
            400
        );
        assert_eq!(
            PaymentError::InvalidSignature {
                message: "mismatch".to_string()
            }
            .http_status_code(),
            401
        );
        assert_eq!(
            PaymentError::unavailable("pesapal", "timeout").http_status_code(),
            503
        );
    }

    #[test]
    fn retryable_flags_are_set() {
        assert!(PaymentError::unavailable("airtel_money", "connection reset").is_retryable());
        assert!(!PaymentError::InvalidSignature {
            message: "mismatch".to_string()
        }
        .is_retryable());
        assert!(!PaymentError::ProviderRejected {
            provider: "stripe".to_string(),
            message: "card declined".to_string(),
            provider_code: Some("card_declined".to_string()),
        }
        .is_retryable());
    }
}
