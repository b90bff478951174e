// Secret stores
// Key-value providers for API credentials

use async_trait::async_trait;

use crate::error::AuthError;

mod env;
mod memory;

pub use env::{EnvFileStore, EnvStore};
pub use memory::MemoryStore;

/// Source of raw credential values by name
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Value for `name`, or `None` when the store has no such entry
    async fn get(&self, name: &str) -> Result<Option<String>, AuthError>;

    /// Re-read the backing source. Stores without one do nothing.
    async fn reload(&self) -> Result<(), AuthError> {
        Ok(())
    }

    /// Short log-safe description of where values come from
    fn describe(&self) -> String;
}
