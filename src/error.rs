//! Unified error handling for the payments backend
//!
//! Every layer converts its own error into `AppError`, which carries the HTTP
//! status, a machine-readable code and a message that is safe to show users.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "USER_NOT_FOUND")]
    UserNotFound,
    #[serde(rename = "INVALID_STATE_TRANSITION")]
    InvalidStateTransition,
    #[serde(rename = "DUPLICATE_PAYMENT")]
    DuplicatePayment,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "COMPLETION_IN_PROGRESS")]
    CompletionInProgress,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,
    #[serde(rename = "SUBSCRIPTION_EXTENSION_FAILED")]
    SubscriptionExtensionFailed,

    // External errors (401, 429, 502, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// No payment matches the id or reference
    PaymentNotFound { reference: String },
    /// The user referenced by a payment does not exist
    UserNotFound { user_id: String },
    /// The requested state change is not allowed from the current state
    InvalidStateTransition {
        payment_id: String,
        from: String,
        to: String,
    },
    /// A payment already exists for this (provider, external reference)
    DuplicatePayment { reference: String },
    /// Caller is not allowed to perform the operation
    Unauthorized { reason: String },
    /// Another worker holds the completion claim on this payment
    CompletionInProgress { payment_id: String },
}

#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Cache { message: String },
    Configuration { message: String },
    /// Payment was confirmed but the subscription could not be extended; the
    /// payment has been put back to pending.
    SubscriptionExtension { payment_id: String, reason: String },
}

/// Errors raised by payment providers
#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// Webhook signature did not verify
    InvalidSignature { provider: String },
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    Timeout { service: String, timeout_secs: u64 },
}

#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidValue { field: String, reason: String },
    InvalidAmount { amount: String, reason: String },
    MissingField { field: String },
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn payment_not_found(reference: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
            reference: reference.into(),
        }))
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::Unauthorized {
            reason: reason.into(),
        }))
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::MissingField {
            field: field.into(),
        }))
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::UserNotFound { .. } => 404,
                DomainError::InvalidStateTransition { .. } => 409,
                DomainError::DuplicatePayment { .. } => 409,
                DomainError::Unauthorized { .. } => 403,
                DomainError::CompletionInProgress { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502,
                ExternalError::InvalidSignature { .. } => 401,
                ExternalError::RateLimit { .. } => 429,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::UserNotFound { .. } => ErrorCode::UserNotFound,
                DomainError::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
                DomainError::DuplicatePayment { .. } => ErrorCode::DuplicatePayment,
                DomainError::Unauthorized { .. } => ErrorCode::Unauthorized,
                DomainError::CompletionInProgress { .. } => ErrorCode::CompletionInProgress,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::SubscriptionExtension { .. } => {
                    ErrorCode::SubscriptionExtensionFailed
                }
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::InvalidSignature { .. } => ErrorCode::InvalidSignature,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { reference } => {
                    format!("Payment '{}' not found", reference)
                }
                DomainError::UserNotFound { user_id } => format!("User '{}' not found", user_id),
                DomainError::InvalidStateTransition { from, to, .. } => {
                    format!("Payment cannot move from {} to {}", from, to)
                }
                DomainError::DuplicatePayment { reference } => {
                    format!("Payment '{}' already exists", reference)
                }
                DomainError::Unauthorized { reason } => format!("Not allowed: {}", reason),
                DomainError::CompletionInProgress { payment_id } => {
                    format!("Payment '{}' is being completed. Please retry shortly", payment_id)
                }
            },
            AppErrorKind::Infrastructure(InfrastructureError::SubscriptionExtension { .. }) => {
                "Payment received but the subscription could not be updated yet. It will be retried"
                    .to_string()
            }
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::InvalidSignature { .. } => "Invalid webhook signature".to_string(),
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidValue { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(err) => {
                matches!(err, DomainError::CompletionInProgress { .. })
            }
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::SubscriptionExtension { .. } => true,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::InvalidSignature { .. } => false,
                ExternalError::RateLimit { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError>, From<PaymentError> and the service error conversions
// live next to those types.

pub type AppResult<T> = Result<T, AppError>;
