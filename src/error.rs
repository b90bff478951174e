// Error handling module
// Defines the credential and token lifecycle error taxonomy

use thiserror::Error;

use crate::auth::{FailureKind, RefreshFailure, ValidationResult};

/// Errors surfaced by the credential and token lifecycle
///
/// Messages name credentials but never carry their values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Required credentials are absent or blank
    #[error("Missing required credential(s): {}", .names.join(", "))]
    MissingCredential { names: Vec<String> },

    /// Credentials are present but violate their declared rule
    #[error("Malformed credential(s): {}", .names.join(", "))]
    MalformedCredential { names: Vec<String> },

    /// Upstream token endpoint unreachable
    #[error("Token refresh network failure (will retry): {0}")]
    RefreshNetworkFailure(String),

    /// Upstream token endpoint throttled the request
    #[error("Token refresh rate limited (will retry): {0}")]
    RefreshRateLimited(String),

    /// Upstream token endpoint did not answer in time
    #[error("Token refresh timed out (will retry): {0}")]
    RefreshTimeout(String),

    /// Upstream rejected the API key/secret
    #[error("Token refresh rejected credentials (requires operator action): {0}")]
    RefreshInvalidCredential(String),

    /// No usable token and refresh is exhausted or fatal
    #[error("No valid access token available: {0}")]
    NoValidToken(String),

    /// Current token has expired and a refresh has not completed yet
    #[error("Access token expired, refresh pending")]
    TokenExpired,

    /// Secret store lookup failed
    #[error("Secret store error: {0}")]
    SecretStore(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether the failure is transient and handled by backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshNetworkFailure(_)
                | AuthError::RefreshRateLimited(_)
                | AuthError::RefreshTimeout(_)
                | AuthError::TokenExpired
        )
    }

    /// Whether an operator must fix configuration before things can recover
    pub fn requires_operator_action(&self) -> bool {
        matches!(
            self,
            AuthError::MissingCredential { .. }
                | AuthError::MalformedCredential { .. }
                | AuthError::RefreshInvalidCredential(_)
                | AuthError::Config(_)
        )
    }
}

impl From<&ValidationResult> for AuthError {
    fn from(result: &ValidationResult) -> Self {
        if !result.missing.is_empty() {
            AuthError::MissingCredential {
                names: result.missing.clone(),
            }
        } else {
            AuthError::MalformedCredential {
                names: result.malformed.iter().map(|m| m.name.clone()).collect(),
            }
        }
    }
}

impl From<&RefreshFailure> for AuthError {
    fn from(failure: &RefreshFailure) -> Self {
        let reason = failure.reason.clone();
        match failure.kind {
            FailureKind::Network => AuthError::RefreshNetworkFailure(reason),
            FailureKind::RateLimited => AuthError::RefreshRateLimited(reason),
            FailureKind::Timeout => AuthError::RefreshTimeout(reason),
            FailureKind::InvalidCredential => AuthError::RefreshInvalidCredential(reason),
            FailureKind::Unknown | FailureKind::Cancelled => AuthError::NoValidToken(reason),
        }
    }
}

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MalformedField;

    #[test]
    fn test_missing_credential_message_names_fields() {
        let err = AuthError::MissingCredential {
            names: vec!["API_SECRET".to_string(), "API_KEY".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Missing required credential(s): API_SECRET, API_KEY"
        );
        assert!(err.requires_operator_action());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_refresh_messages_distinguish_retry_from_operator_action() {
        let err = AuthError::RefreshRateLimited("429".to_string());
        assert!(err.to_string().contains("will retry"));
        assert!(err.is_retryable());

        let err = AuthError::RefreshInvalidCredential("401".to_string());
        assert!(err.to_string().contains("requires operator action"));
        assert!(err.requires_operator_action());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_result_prefers_missing() {
        let result = ValidationResult {
            missing: vec!["API_SECRET".to_string()],
            malformed: vec![MalformedField {
                name: "API_KEY".to_string(),
                rule: "min_len 8".to_string(),
            }],
        };
        assert_eq!(
            AuthError::from(&result),
            AuthError::MissingCredential {
                names: vec!["API_SECRET".to_string()]
            }
        );

        let result = ValidationResult {
            missing: vec![],
            malformed: vec![MalformedField {
                name: "API_KEY".to_string(),
                rule: "min_len 8".to_string(),
            }],
        };
        assert_eq!(
            AuthError::from(&result),
            AuthError::MalformedCredential {
                names: vec!["API_KEY".to_string()]
            }
        );
    }

    #[test]
    fn test_refresh_failure_conversion() {
        let failure = RefreshFailure::new(FailureKind::Timeout, "10s elapsed");
        assert_eq!(
            AuthError::from(&failure),
            AuthError::RefreshTimeout("10s elapsed".to_string())
        );

        let failure = RefreshFailure::new(FailureKind::Cancelled, "shutting down");
        assert_eq!(
            AuthError::from(&failure),
            AuthError::NoValidToken("shutting down".to_string())
        );
    }
}
