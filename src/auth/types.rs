// Credential and token types

use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Raw secret material that never prints itself
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw value. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(****)")
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A named secret loaded from a secret store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub name: String,
    pub value: SecretValue,
    pub required: bool,
}

impl Credential {
    pub fn new(name: impl Into<String>, value: impl Into<SecretValue>, required: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            required,
        }
    }
}

/// API key/secret pair presented to the upstream token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub api_key: SecretValue,
    pub api_secret: SecretValue,
}

/// A credential that failed its declared rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedField {
    pub name: String,
    /// Human-readable rule that was violated (never the value)
    pub rule: String,
}

/// Outcome of validating a credential set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub missing: Vec<String>,
    pub malformed: Vec<MalformedField>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.malformed.is_empty()
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("all credentials valid");
        }
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing: {}", self.missing.join(", ")));
        }
        if !self.malformed.is_empty() {
            let malformed: Vec<String> = self
                .malformed
                .iter()
                .map(|m| format!("{} ({})", m.name, m.rule))
                .collect();
            parts.push(format!("malformed: {}", malformed.join(", ")));
        }
        f.write_str(&parts.join("; "))
    }
}

/// Where a token record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Live token supplied alongside the credentials
    Initial,
    /// Issued by the upstream token endpoint
    Refreshed,
}

/// Access token with issuance and expiry timestamps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    value: SecretValue,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    source: TokenSource,
}

impl TokenRecord {
    /// Returns `None` unless `expires_at` is strictly after `issued_at`
    pub fn new(
        value: SecretValue,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        source: TokenSource,
    ) -> Option<Self> {
        if expires_at <= issued_at {
            return None;
        }
        Some(Self {
            value,
            issued_at,
            expires_at,
            source,
        })
    }

    pub fn value(&self) -> &SecretValue {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn source(&self) -> TokenSource {
        self.source
    }

    /// True when `now >= expires_at - margin`
    ///
    /// A margin reaching past the earliest representable time makes every
    /// token stale.
    pub fn is_stale(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at
            .checked_sub_signed(margin)
            .map_or(true, |refresh_at| now >= refresh_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Token as reported by the upstream endpoint
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: SecretValue,
    /// Absolute expiry, when reported
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifetime relative to issuance, when reported
    pub expires_in: Option<Duration>,
}

impl IssuedToken {
    pub fn new(access_token: impl Into<SecretValue>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
            expires_in: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn expiring_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Upstream expiry, falling back to `issued_at + default_lifetime`
    ///
    /// `None` when the lifetime pushes the expiry out of the representable range.
    pub fn resolve_expiry(
        &self,
        issued_at: DateTime<Utc>,
        default_lifetime: Duration,
    ) -> Option<DateTime<Utc>> {
        match (self.expires_at, self.expires_in) {
            (Some(at), _) => Some(at),
            (None, Some(lifetime)) => issued_at.checked_add_signed(lifetime),
            (None, None) => issued_at.checked_add_signed(default_lifetime),
        }
    }
}

/// Classification of a failed refresh request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Network,
    RateLimited,
    Timeout,
    InvalidCredential,
    Unknown,
    /// Abandoned because the coordinator is shutting down
    Cancelled,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Network | FailureKind::RateLimited | FailureKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::InvalidCredential => "invalid_credential",
            FailureKind::Unknown => "unknown",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// A failed refresh with reason code and retry eligibility
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    pub kind: FailureKind,
    /// Log-safe description
    pub reason: String,
    pub retryable: bool,
    /// Upstream hint for how long to wait before the next attempt
    pub retry_after: Option<std::time::Duration>,
}

impl RefreshFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            retryable: kind.is_retryable(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: std::time::Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.reason)
    }
}

/// Result of one refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Succeeded(TokenRecord),
    Failed(RefreshFailure),
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Succeeded(_))
    }
}

/// Refresh cycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Requesting,
    RetryableFailed,
    Succeeded,
    FatalFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-12T03:30:00+00:00")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_secret_value_debug_is_redacted() {
        let secret = SecretValue::new("super-secret-key");
        assert_eq!(format!("{:?}", secret), "SecretValue(****)");

        let cred = Credential::new("API_KEY", "super-secret-key", true);
        assert!(!format!("{:?}", cred).contains("super-secret-key"));
    }

    #[test]
    fn test_blank_secret() {
        assert!(SecretValue::new("").is_blank());
        assert!(SecretValue::new(" \t\n").is_blank());
        assert!(!SecretValue::new(" x ").is_blank());
    }

    #[test]
    fn test_token_record_rejects_non_increasing_expiry() {
        let value = SecretValue::new("tok");
        assert!(TokenRecord::new(value.clone(), t0(), t0(), TokenSource::Initial).is_none());
        assert!(TokenRecord::new(
            value.clone(),
            t0(),
            t0() - Duration::seconds(1),
            TokenSource::Initial
        )
        .is_none());
        assert!(
            TokenRecord::new(value, t0(), t0() + Duration::seconds(1), TokenSource::Initial)
                .is_some()
        );
    }

    #[test]
    fn test_staleness_boundary() {
        let record = TokenRecord::new(
            SecretValue::new("tok"),
            t0(),
            t0() + Duration::hours(24),
            TokenSource::Refreshed,
        )
        .unwrap();
        let margin = Duration::minutes(5);
        let boundary = t0() + Duration::hours(24) - margin;

        assert!(!record.is_stale(boundary - Duration::milliseconds(1), margin));
        assert!(record.is_stale(boundary, margin));
        assert!(record.is_stale(boundary + Duration::seconds(1), margin));
        assert!(!record.is_expired(boundary));
        assert!(record.is_expired(t0() + Duration::hours(24)));

        // Margin past the representable range
        assert!(record.is_stale(t0(), Duration::milliseconds(i64::MAX)));
    }

    #[test]
    fn test_validation_result_display_omits_values() {
        let result = ValidationResult {
            missing: vec!["API_SECRET".to_string()],
            malformed: vec![MalformedField {
                name: "API_KEY".to_string(),
                rule: "length >= 8".to_string(),
            }],
        };
        assert_eq!(
            result.to_string(),
            "missing: API_SECRET; malformed: API_KEY (length >= 8)"
        );
        assert_eq!(
            ValidationResult::default().to_string(),
            "all credentials valid"
        );
    }

    #[test]
    fn test_issued_token_expiry_resolution() {
        let lifetime = Duration::hours(24);

        let token = IssuedToken::new("tok");
        assert_eq!(token.resolve_expiry(t0(), lifetime), Some(t0() + lifetime));

        let token = IssuedToken::new("tok").expiring_in(Duration::hours(6));
        assert_eq!(
            token.resolve_expiry(t0(), lifetime),
            Some(t0() + Duration::hours(6))
        );

        let at = t0() + Duration::hours(2);
        let token = IssuedToken::new("tok")
            .expiring_at(at)
            .expiring_in(Duration::hours(6));
        assert_eq!(token.resolve_expiry(t0(), lifetime), Some(at));
    }

    #[test]
    fn test_issued_token_expiry_out_of_range() {
        let token = IssuedToken::new("tok").expiring_in(Duration::milliseconds(i64::MAX));
        assert_eq!(token.resolve_expiry(t0(), Duration::hours(24)), None);

        let token = IssuedToken::new("tok");
        assert_eq!(token.resolve_expiry(t0(), Duration::milliseconds(i64::MAX)), None);
    }

    #[test]
    fn test_failure_retry_eligibility() {
        assert!(RefreshFailure::new(FailureKind::Network, "x").retryable);
        assert!(RefreshFailure::new(FailureKind::RateLimited, "x").retryable);
        assert!(RefreshFailure::new(FailureKind::Timeout, "x").retryable);
        assert!(!RefreshFailure::new(FailureKind::InvalidCredential, "x").retryable);
        assert!(!RefreshFailure::new(FailureKind::Unknown, "x").retryable);
        assert!(!RefreshFailure::new(FailureKind::Cancelled, "x").retryable);
    }
}
