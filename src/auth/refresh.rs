// Token refresh logic

use chrono::Duration as ChronoDuration;
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::masker::MaskerHandle;
use super::state::TokenState;
use super::types::{
    ApiCredentials, FailureKind, RefreshFailure, RefreshOutcome, RefreshPhase, TokenRecord,
    TokenSource,
};
use super::upstream::TokenEndpoint;
use crate::clock::Clock;
use crate::error::AuthError;
use crate::metrics::RefreshMetrics;

/// Retry, timeout and lifetime settings for refresh cycles
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    /// Upstream requests per cycle, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the backoff (0.0 - 1.0)
    pub jitter_ratio: f64,
    pub request_timeout: Duration,
    /// Lifetime assumed when upstream reports no expiry
    pub default_lifetime: ChronoDuration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.1,
            request_timeout: Duration::from_secs(10),
            default_lifetime: ChronoDuration::hours(24),
        }
    }
}

impl RefreshPolicy {
    /// Exponential backoff with jitter, capped at `max_delay`
    ///
    /// `retry` counts from 0. An upstream `Retry-After` hint raises the delay
    /// but never past the cap.
    pub fn backoff_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(retry))
            .min(self.max_delay);

        let ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let jitter = exponential.mul_f64(ratio * rand::thread_rng().gen::<f64>());
        let delay = (exponential + jitter).min(self.max_delay);

        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_delay)),
            None => delay,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let signalled = rx.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

/// One bounded run of upstream requests with backoff
///
/// Produces a record but never publishes it; publishing belongs to
/// [`TokenRefresher`].
pub struct RefreshCycle {
    endpoint: Arc<dyn TokenEndpoint>,
    credentials: RwLock<ApiCredentials>,
    policy: RefreshPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<RefreshMetrics>,
    phase: watch::Sender<RefreshPhase>,
    shutdown: watch::Receiver<bool>,
    /// Set after upstream rejects the credentials; cleared by new credentials
    credential_failure: Mutex<Option<RefreshFailure>>,
}

impl std::fmt::Debug for RefreshCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCycle")
            .field("policy", &self.policy)
            .field("phase", &*self.phase.borrow())
            .finish()
    }
}

impl RefreshCycle {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        credentials: ApiCredentials,
        policy: RefreshPolicy,
        clock: Arc<dyn Clock>,
        metrics: Arc<RefreshMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (phase, _) = watch::channel(RefreshPhase::Idle);
        Self {
            endpoint,
            credentials: RwLock::new(credentials),
            policy,
            clock,
            metrics,
            phase,
            shutdown,
            credential_failure: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        *self.phase.borrow()
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fatal credential failure from an earlier cycle, if any
    pub fn credential_failure(&self) -> Option<RefreshFailure> {
        lock(&self.credential_failure).clone()
    }

    /// Install new credentials and clear any credential failure
    pub fn update_credentials(&self, credentials: ApiCredentials) {
        let mut latch = lock(&self.credential_failure);
        *self.credentials.write().unwrap_or_else(|e| e.into_inner()) = credentials;
        if latch.take().is_some() {
            tracing::info!("Credentials updated, token refresh re-enabled");
        }
    }

    /// Latch a credential rejection unless the rejected credentials were
    /// replaced while the request was in flight
    fn latch_credential_failure(&self, used: &ApiCredentials, failure: &RefreshFailure) {
        let mut latch = lock(&self.credential_failure);
        let current = self.credentials.read().unwrap_or_else(|e| e.into_inner());
        if *current == *used {
            *latch = Some(failure.clone());
        } else {
            tracing::info!("Rejected credentials were already replaced, not latching");
        }
    }

    fn set_phase(&self, phase: RefreshPhase) {
        self.phase.send_replace(phase);
    }

    fn cancelled(&self) -> RefreshOutcome {
        self.set_phase(RefreshPhase::Idle);
        tracing::info!("Token refresh abandoned, shutting down");
        RefreshOutcome::Failed(RefreshFailure::new(
            FailureKind::Cancelled,
            "refresh abandoned during shutdown",
        ))
    }

    /// Run one cycle: Requesting, then retry on retryable failures until
    /// success, a fatal failure, or `max_attempts` is reached
    pub async fn run(&self) -> RefreshOutcome {
        if let Some(failure) = self.credential_failure() {
            tracing::error!(
                "Token refresh disabled until credentials are fixed: {}",
                failure
            );
            self.set_phase(RefreshPhase::FatalFailed);
            return RefreshOutcome::Failed(failure);
        }

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return self.cancelled();
        }

        let credentials = self
            .credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.set_phase(RefreshPhase::Requesting);
            self.metrics.record_request();
            tracing::debug!(attempt, max_attempts, "Requesting new access token");

            let result = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return self.cancelled(),
                r = tokio::time::timeout(
                    self.policy.request_timeout,
                    self.endpoint.request_token(&credentials),
                ) => r,
            };

            let failure = match result {
                Ok(Ok(issued)) => {
                    let issued_at = self.clock.now();
                    let expires_at =
                        issued.resolve_expiry(issued_at, self.policy.default_lifetime);
                    match expires_at.and_then(|expires_at| {
                        TokenRecord::new(
                            issued.access_token,
                            issued_at,
                            expires_at,
                            TokenSource::Refreshed,
                        )
                    }) {
                        Some(record) => {
                            self.set_phase(RefreshPhase::Succeeded);
                            self.metrics.record_success();
                            tracing::info!(
                                attempt,
                                expires_at = %record.expires_at().to_rfc3339(),
                                "Access token refreshed"
                            );
                            return RefreshOutcome::Succeeded(record);
                        }
                        None => RefreshFailure::new(
                            FailureKind::Unknown,
                            match expires_at {
                                Some(at) => format!(
                                    "upstream expiry {} is not after issuance",
                                    at.to_rfc3339()
                                ),
                                None => "upstream token lifetime is out of range".to_string(),
                            },
                        ),
                    }
                }
                Ok(Err(failure)) => failure,
                Err(_) => RefreshFailure::new(
                    FailureKind::Timeout,
                    format!(
                        "no response within {}s",
                        self.policy.request_timeout.as_secs_f64()
                    ),
                ),
            };

            self.metrics.record_failure(failure.kind);

            if !failure.retryable {
                if failure.kind == FailureKind::InvalidCredential {
                    self.latch_credential_failure(&credentials, &failure);
                }
                tracing::error!(
                    attempt,
                    kind = failure.kind.as_str(),
                    "Token refresh failed: {}",
                    AuthError::from(&failure)
                );
                self.set_phase(RefreshPhase::FatalFailed);
                return RefreshOutcome::Failed(failure);
            }

            if attempt >= max_attempts {
                tracing::error!(
                    attempts = attempt,
                    kind = failure.kind.as_str(),
                    "Token refresh retries exhausted: {}",
                    failure.reason
                );
                self.set_phase(RefreshPhase::FatalFailed);
                return RefreshOutcome::Failed(RefreshFailure {
                    reason: format!(
                        "retries exhausted after {} attempts: {}",
                        attempt, failure.reason
                    ),
                    retryable: false,
                    ..failure
                });
            }

            self.set_phase(RefreshPhase::RetryableFailed);
            let delay = self.policy.backoff_delay(attempt - 1, failure.retry_after);
            tracing::warn!(
                attempt,
                max_attempts,
                kind = failure.kind.as_str(),
                delay_ms = delay.as_millis() as u64,
                "Token refresh failed, will retry: {}",
                failure.reason
            );

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return self.cancelled(),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

struct RefresherInner {
    cycle: Arc<RefreshCycle>,
    state: TokenState,
    safety_margin: ChronoDuration,
    masker: MaskerHandle,
    inflight: Mutex<Option<InFlight>>,
}

/// Keeps [`TokenState`] fresh; the only writer of the token state
///
/// At most one refresh cycle is in flight. Callers arriving while a cycle runs
/// await the same outcome instead of issuing their own request.
#[derive(Clone)]
pub struct TokenRefresher {
    inner: Arc<RefresherInner>,
}

impl std::fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("cycle", &self.inner.cycle)
            .field("safety_margin", &self.inner.safety_margin)
            .finish()
    }
}

impl TokenRefresher {
    pub fn new(
        cycle: Arc<RefreshCycle>,
        state: TokenState,
        safety_margin: ChronoDuration,
        masker: MaskerHandle,
    ) -> Self {
        Self {
            inner: Arc::new(RefresherInner {
                cycle,
                state,
                safety_margin,
                masker,
                inflight: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> &TokenState {
        &self.inner.state
    }

    pub fn cycle(&self) -> &Arc<RefreshCycle> {
        &self.inner.cycle
    }

    pub fn safety_margin(&self) -> ChronoDuration {
        self.inner.safety_margin
    }

    pub fn is_stale(&self) -> bool {
        let now = self.inner.cycle.clock.now();
        self.inner.state.is_stale(now, self.inner.safety_margin)
    }

    /// Refresh unconditionally, joining any cycle already in flight
    pub async fn refresh(&self) -> RefreshOutcome {
        self.join_or_start(false).await
    }

    /// Refresh only if the token is still stale when the cycle starts
    ///
    /// When another caller published a fresh token in the meantime, the
    /// current record is returned without contacting upstream.
    pub async fn refresh_if_stale(&self) -> RefreshOutcome {
        self.join_or_start(true).await
    }

    async fn join_or_start(&self, only_if_stale: bool) -> RefreshOutcome {
        let flight = {
            let mut slot = lock(&self.inner.inflight);
            match slot.as_ref() {
                Some(flight) => {
                    self.inner.cycle.metrics.record_joined();
                    flight.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let flight = async move {
                        // A panicking cycle must still release the slot
                        let outcome = AssertUnwindSafe(inner.run_flight(only_if_stale))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                tracing::error!("Token refresh cycle panicked");
                                inner.cycle.set_phase(RefreshPhase::FatalFailed);
                                RefreshOutcome::Failed(RefreshFailure::new(
                                    FailureKind::Unknown,
                                    "refresh cycle panicked",
                                ))
                            });
                        lock(&inner.inflight).take();
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Proactive staleness check on a fixed interval until shutdown
    pub fn spawn_background(&self, interval: Duration) -> JoinHandle<()> {
        let refresher = self.clone();
        let mut shutdown = self.inner.cycle.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_secs = interval.as_secs(),
                "Background token refresh started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        if !refresher.is_stale() {
                            continue;
                        }
                        tracing::info!("Access token is stale, refreshing in background");
                        if let RefreshOutcome::Failed(failure) = refresher.refresh_if_stale().await {
                            if failure.kind == FailureKind::Cancelled {
                                break;
                            }
                            let err = AuthError::from(&failure);
                            if err.requires_operator_action() {
                                tracing::error!("Background refresh stopped making progress: {}", err);
                            } else {
                                tracing::warn!(
                                    "Background refresh failed, will retry on next check: {}",
                                    failure
                                );
                            }
                        }
                    }
                }
            }

            tracing::info!("Background token refresh stopped");
        })
    }
}

impl RefresherInner {
    async fn run_flight(&self, only_if_stale: bool) -> RefreshOutcome {
        if only_if_stale && !self.stale_now() {
            return RefreshOutcome::Succeeded(self.state.current());
        }
        let outcome = self.cycle.run().await;
        if let RefreshOutcome::Succeeded(record) = &outcome {
            self.publish(record.clone());
        }
        outcome
    }

    fn stale_now(&self) -> bool {
        self.state
            .is_stale(self.cycle.clock.now(), self.safety_margin)
    }

    fn publish(&self, record: TokenRecord) {
        self.masker.set_token(Some(record.value().clone()));
        self.state.replace(record);
    }
}
