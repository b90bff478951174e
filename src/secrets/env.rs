// Environment-backed secret stores

use async_trait::async_trait;
use std::collections::HashMap;
use std::env::VarError;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::SecretStore;
use crate::error::AuthError;

/// Process environment, with names looked up as `{prefix}{name}`
#[derive(Debug, Clone)]
pub struct EnvStore {
    prefix: String,
}

impl EnvStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl SecretStore for EnvStore {
    async fn get(&self, name: &str) -> Result<Option<String>, AuthError> {
        let key = self.key(name);
        match std::env::var(&key) {
            Ok(value) => Ok(Some(value)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => Err(AuthError::SecretStore(format!(
                "environment variable {} is not valid UTF-8",
                key
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("environment ({}*)", self.prefix)
    }
}

/// `.env`-style file, parsed with dotenvy and cached until `reload`
///
/// The process environment is left untouched.
#[derive(Debug)]
pub struct EnvFileStore {
    path: PathBuf,
    prefix: String,
    values: RwLock<HashMap<String, String>>,
}

impl EnvFileStore {
    /// Parse `path` now; a missing or unparseable file is an error
    pub fn open(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, AuthError> {
        let path = path.into();
        let values = read_env_file(&path)?;
        tracing::debug!(path = %path.display(), entries = values.len(), "Loaded env file");

        Ok(Self {
            path,
            prefix: prefix.into(),
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, AuthError> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        AuthError::SecretStore(format!("cannot read {}: {}", path.display(), e))
    })?;

    let mut values = HashMap::new();
    for item in iter {
        // dotenvy errors quote the offending line; report position only
        let (key, value) = item.map_err(|e| {
            AuthError::SecretStore(format!(
                "cannot parse {}: {}",
                path.display(),
                parse_error_summary(&e)
            ))
        })?;
        values.insert(key, value);
    }
    Ok(values)
}

fn parse_error_summary(e: &dotenvy::Error) -> String {
    match e {
        dotenvy::Error::LineParse(_, index) => format!("invalid entry at byte {}", index),
        dotenvy::Error::Io(io) => io.to_string(),
        _ => "invalid file".to_string(),
    }
}

#[async_trait]
impl SecretStore for EnvFileStore {
    async fn get(&self, name: &str) -> Result<Option<String>, AuthError> {
        let key = format!("{}{}", self.prefix, name);
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(&key).cloned())
    }

    async fn reload(&self) -> Result<(), AuthError> {
        let path = self.path.clone();
        let values = tokio::task::spawn_blocking(move || read_env_file(&path))
            .await
            .map_err(|e| AuthError::SecretStore(format!("reload task failed: {}", e)))??;

        tracing::info!(path = %self.path.display(), "Reloaded env file");
        *self.values.write().unwrap_or_else(|e| e.into_inner()) = values;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("env file {} ({}*)", self.path.display(), self.prefix)
    }
}
