// Current access token holder

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use super::types::TokenRecord;

/// Holds the single current token record
///
/// Backed by a watch channel: `replace` swaps the whole record at once, so
/// readers never see a token paired with another record's expiry.
#[derive(Debug, Clone)]
pub struct TokenState {
    current: Arc<watch::Sender<TokenRecord>>,
}

impl TokenState {
    pub fn new(initial: TokenRecord) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            current: Arc::new(tx),
        }
    }

    /// The current record
    pub fn current(&self) -> TokenRecord {
        self.current.borrow().clone()
    }

    /// Swap in a new record. The previous record is dropped.
    pub fn replace(&self, record: TokenRecord) {
        let previous = self.current.send_replace(record);
        drop(previous);
    }

    /// True when `now >= expires_at - margin`
    pub fn is_stale(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.current.borrow().is_stale(now, margin)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.current.borrow().is_expired(now)
    }

    /// Receiver notified on every replace
    pub fn subscribe(&self) -> watch::Receiver<TokenRecord> {
        self.current.subscribe()
    }
}
