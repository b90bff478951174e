use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::masker::MaskerHandle;
use super::refresh::{RefreshCycle, RefreshPolicy, TokenRefresher};
use super::state::TokenState;
use super::types::{
    ApiCredentials, Credential, FailureKind, RefreshFailure, RefreshOutcome, RefreshPhase,
    SecretValue, TokenRecord, TokenSource,
};
use super::upstream::TokenEndpoint;
use super::validator::{CredentialSpec, CredentialValidator, FieldRule};
use crate::clock::{parse_expiry, Clock, SystemClock};
use crate::error::{AuthError, Result};
use crate::metrics::{MetricsSnapshot, RefreshMetrics};
use crate::secrets::SecretStore;

pub const API_KEY: &str = "API_KEY";
pub const API_SECRET: &str = "API_SECRET";
pub const ACCESS_TOKEN: &str = "ACCESS_TOKEN";
pub const ACCESS_TOKEN_EXPIRES_AT: &str = "ACCESS_TOKEN_EXPIRES_AT";

/// Unix seconds or an RFC 3339 timestamp
const EXPIRES_AT_PATTERN: &str = r"\d+|\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})";

/// Startup and refresh settings for [`LifecycleCoordinator`]
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Declared credentials, validated at startup and on reload
    pub credentials: Vec<CredentialSpec>,
    /// Refresh once `now >= expires_at - safety_margin`
    pub safety_margin: ChronoDuration,
    /// Proactive staleness check interval
    pub check_interval: Duration,
    pub policy: RefreshPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            credentials: default_credential_specs(),
            safety_margin: ChronoDuration::minutes(5),
            check_interval: Duration::from_secs(60),
            policy: RefreshPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Attach per-field rules by credential name
    ///
    /// Rules for undeclared names are a configuration error.
    pub fn with_rules(mut self, rules: HashMap<String, FieldRule>) -> Result<Self> {
        for (name, rule) in rules {
            let spec = self
                .credentials
                .iter_mut()
                .find(|s| s.name == name)
                .ok_or_else(|| {
                    AuthError::Config(format!("rule given for undeclared credential {}", name))
                })?;
            spec.rule = Some(rule);
        }
        Ok(self)
    }
}

fn default_credential_specs() -> Vec<CredentialSpec> {
    vec![
        CredentialSpec::required(API_KEY),
        CredentialSpec::required(API_SECRET),
        CredentialSpec::optional(ACCESS_TOKEN),
        CredentialSpec::optional(ACCESS_TOKEN_EXPIRES_AT).with_rule(FieldRule {
            pattern: Some(EXPIRES_AT_PATTERN.to_string()),
            ..Default::default()
        }),
    ]
}

/// Loaded credential set with lookups by name
struct LoadedCredentials(Vec<Credential>);

impl LoadedCredentials {
    async fn load(store: &dyn SecretStore, validator: &CredentialValidator) -> Result<Self> {
        let mut credentials = Vec::new();
        for spec in validator.specs() {
            if let Some(value) = store.get(&spec.name).await? {
                credentials.push(Credential::new(spec.name.clone(), value, spec.required));
            }
        }

        let result = validator.validate(&credentials);
        if !result.is_ok() {
            tracing::error!("Credential validation failed: {}", result);
            return Err(AuthError::from(&result));
        }
        Ok(Self(credentials))
    }

    fn get(&self, name: &str) -> Option<&SecretValue> {
        self.0
            .iter()
            .find(|c| c.name == name && !c.value.is_blank())
            .map(|c| &c.value)
    }

    fn api_credentials(&self) -> Result<ApiCredentials> {
        let missing: Vec<String> = [API_KEY, API_SECRET]
            .into_iter()
            .filter(|name| self.get(name).is_none())
            .map(str::to_string)
            .collect();
        match (self.get(API_KEY), self.get(API_SECRET)) {
            (Some(key), Some(secret)) => Ok(ApiCredentials {
                api_key: key.clone(),
                api_secret: secret.clone(),
            }),
            _ => Err(AuthError::MissingCredential { names: missing }),
        }
    }

    /// Values that must never reach the logs. The expiry timestamp is not one.
    fn secrets(&self) -> impl Iterator<Item = &SecretValue> {
        self.0
            .iter()
            .filter(|c| c.name != ACCESS_TOKEN_EXPIRES_AT)
            .map(|c| &c.value)
    }
}

/// Owns credentials, the token state and the background refresher
///
/// `start` validates credentials before anything else runs; a failed start
/// leaves no background task behind.
pub struct LifecycleCoordinator {
    store: Arc<dyn SecretStore>,
    validator: CredentialValidator,
    refresher: TokenRefresher,
    masker: MaskerHandle,
    metrics: Arc<RefreshMetrics>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("store", &self.store.describe())
            .field("refresher", &self.refresher)
            .finish()
    }
}

impl LifecycleCoordinator {
    pub async fn start(
        config: CoordinatorConfig,
        store: Arc<dyn SecretStore>,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Result<Self> {
        Self::start_with(
            config,
            store,
            endpoint,
            Arc::new(SystemClock),
            MaskerHandle::new(),
        )
        .await
    }

    /// Start with an explicit clock and a masker already wired into logging
    pub async fn start_with(
        config: CoordinatorConfig,
        store: Arc<dyn SecretStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        clock: Arc<dyn Clock>,
        masker: MaskerHandle,
    ) -> Result<Self> {
        tracing::info!("Loading credentials from {}", store.describe());
        let validator = CredentialValidator::new(&config.credentials)?;
        let loaded = LoadedCredentials::load(store.as_ref(), &validator).await?;
        let api_credentials = loaded.api_credentials()?;
        tracing::info!("Credentials validated");

        masker.set_credentials(loaded.secrets());

        let metrics = Arc::new(RefreshMetrics::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let cycle = Arc::new(RefreshCycle::new(
            endpoint,
            api_credentials,
            config.policy.clone(),
            clock.clone(),
            metrics.clone(),
            shutdown_rx,
        ));

        let initial = match seed_record(&loaded, clock.now(), config.safety_margin) {
            Some(record) => {
                tracing::info!(
                    expires_at = %record.expires_at().to_rfc3339(),
                    "Using supplied access token"
                );
                record
            }
            None => {
                tracing::info!("Requesting initial access token");
                match cycle.run().await {
                    RefreshOutcome::Succeeded(record) => record,
                    RefreshOutcome::Failed(failure) => return Err(startup_error(&failure)),
                }
            }
        };

        masker.set_token(Some(initial.value().clone()));
        let refresher = TokenRefresher::new(
            cycle,
            TokenState::new(initial),
            config.safety_margin,
            masker.clone(),
        );
        let background = refresher.spawn_background(config.check_interval);

        Ok(Self {
            store,
            validator,
            refresher,
            masker,
            metrics,
            shutdown,
            background: Mutex::new(Some(background)),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.refresher.cycle().clock().now()
    }

    /// A valid access token, refreshing first when the current one is stale
    ///
    /// Concurrent callers share one refresh. When refresh fails for a reason
    /// other than rejected credentials, the current token is still returned
    /// as long as it has not expired.
    pub async fn get_token(&self) -> Result<SecretValue> {
        if !self.refresher.is_stale() {
            return Ok(self.refresher.state().current().value().clone());
        }

        match self.refresher.refresh_if_stale().await {
            RefreshOutcome::Succeeded(record) => Ok(record.value().clone()),
            RefreshOutcome::Failed(failure) if failure.kind == FailureKind::InvalidCredential => {
                Err(AuthError::RefreshInvalidCredential(failure.reason))
            }
            RefreshOutcome::Failed(failure) => {
                let current = self.refresher.state().current();
                if !current.is_expired(self.now()) {
                    tracing::warn!(
                        "Using existing token despite refresh failure (not yet expired)"
                    );
                    return Ok(current.value().clone());
                }
                Err(AuthError::NoValidToken(failure.to_string()))
            }
        }
    }

    /// Current token without triggering a refresh
    pub fn peek_token(&self) -> Result<SecretValue> {
        let current = self.refresher.state().current();
        if current.is_expired(self.now()) {
            return Err(AuthError::TokenExpired);
        }
        Ok(current.value().clone())
    }

    /// Re-read the store, re-validate, and hand new credentials to the refresher
    ///
    /// Clears a previous invalid-credential failure. On error the old
    /// credentials stay in use.
    pub async fn reload_credentials(&self) -> Result<()> {
        self.store.reload().await?;
        let loaded = LoadedCredentials::load(self.store.as_ref(), &self.validator).await?;
        let api_credentials = loaded.api_credentials()?;

        self.masker.set_credentials(loaded.secrets());
        self.refresher.cycle().update_credentials(api_credentials);
        tracing::info!("Credentials reloaded from {}", self.store.describe());
        Ok(())
    }

    /// Redact every known secret and the current token
    pub fn mask(&self, text: &str) -> String {
        self.masker.mask(text)
    }

    pub fn masker(&self) -> MaskerHandle {
        self.masker.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn phase(&self) -> RefreshPhase {
        self.refresher.cycle().phase()
    }

    pub fn token_expires_at(&self) -> DateTime<Utc> {
        self.refresher.state().current().expires_at()
    }

    pub fn token_source(&self) -> TokenSource {
        self.refresher.state().current().source()
    }

    /// Notified whenever a new token is published
    pub fn subscribe(&self) -> watch::Receiver<TokenRecord> {
        self.refresher.state().subscribe()
    }

    /// Stop the background task and abandon any in-flight refresh
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Background refresh task failed: {}", e);
            }
            tracing::info!("Token lifecycle stopped");
        }
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Record for a supplied live token, if it has a usable expiry and is not stale
fn seed_record(
    loaded: &LoadedCredentials,
    now: DateTime<Utc>,
    margin: ChronoDuration,
) -> Option<TokenRecord> {
    let token = loaded.get(ACCESS_TOKEN)?;

    let Some(raw_expiry) = loaded.get(ACCESS_TOKEN_EXPIRES_AT) else {
        tracing::info!("Supplied access token has no expiry, refreshing");
        return None;
    };
    let Some(expires_at) = parse_expiry(raw_expiry.expose()) else {
        tracing::warn!("{} is not a valid timestamp, refreshing", ACCESS_TOKEN_EXPIRES_AT);
        return None;
    };

    let record = TokenRecord::new(token.clone(), now, expires_at, TokenSource::Initial);
    match record {
        Some(record) if !record.is_stale(now, margin) => Some(record),
        _ => {
            tracing::info!(
                expires_at = %expires_at.to_rfc3339(),
                "Supplied access token is expired or about to expire, refreshing"
            );
            None
        }
    }
}

fn startup_error(failure: &RefreshFailure) -> AuthError {
    match failure.kind {
        FailureKind::InvalidCredential => AuthError::RefreshInvalidCredential(failure.reason.clone()),
        _ => AuthError::NoValidToken(format!("initial refresh failed: {}", failure)),
    }
}
