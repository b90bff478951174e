// Secret masking for logs and diagnostics

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use regex::{NoExpand, Regex};
use std::sync::{Arc, RwLock};

use super::types::SecretValue;

/// Default replacement for a secret occurrence
pub const PLACEHOLDER: &str = "****";

// A placeholder is usable only if every secret has a char outside it,
// otherwise replacements could rebuild a secret from placeholder chars.
const PLACEHOLDER_CANDIDATES: [&str; 3] = [PLACEHOLDER, "####", "[masked]"];

/// Replaces known secret values with a constant-width placeholder
#[derive(Clone)]
pub struct SecretMasker {
    matcher: Option<Regex>,
    placeholder: &'static str,
    // Set when the matcher could not be built; everything is masked instead
    mask_all: bool,
}

impl std::fmt::Debug for SecretMasker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMasker")
            .field("active", &(self.matcher.is_some() || self.mask_all))
            .field("placeholder", &self.placeholder)
            .finish()
    }
}

impl Default for SecretMasker {
    fn default() -> Self {
        Self {
            matcher: None,
            placeholder: PLACEHOLDER,
            mask_all: false,
        }
    }
}

impl SecretMasker {
    /// Build a masker for the given secrets. Blank secrets are ignored.
    pub fn new<'a>(secrets: impl IntoIterator<Item = &'a SecretValue>) -> Self {
        let mut needles: Vec<String> = Vec::new();
        for secret in secrets {
            if secret.is_blank() {
                continue;
            }
            let raw = secret.expose();
            needles.push(raw.to_string());

            // As it appears inside a query string or a percent-encoded path
            let form: String = url::form_urlencoded::byte_serialize(raw.as_bytes()).collect();
            let percent = utf8_percent_encode(raw, NON_ALPHANUMERIC).to_string();
            for encoded in [form, percent] {
                if encoded != raw {
                    needles.push(encoded);
                }
            }
        }

        if needles.is_empty() {
            return Self::default();
        }

        // Longest first so overlapping secrets prefer the longer match
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        needles.dedup();

        // Removing secrets outright is the last resort: every pass then
        // shortens the text, so no secret can survive the pass limit
        let placeholder = PLACEHOLDER_CANDIDATES
            .iter()
            .copied()
            .find(|candidate| {
                needles
                    .iter()
                    .all(|needle| needle.chars().any(|c| !candidate.contains(c)))
            })
            .unwrap_or("");

        let pattern = needles
            .iter()
            .map(|n| regex::escape(n))
            .collect::<Vec<_>>()
            .join("|");

        match Regex::new(&pattern) {
            Ok(matcher) => Self {
                matcher: Some(matcher),
                placeholder,
                mask_all: false,
            },
            // Combined pattern exceeds the regex size limit
            Err(_) => Self {
                matcher: None,
                placeholder,
                mask_all: true,
            },
        }
    }

    /// Mask every occurrence of every known secret
    pub fn mask(&self, text: &str) -> String {
        if self.mask_all {
            return self.placeholder.to_string();
        }
        let Some(matcher) = &self.matcher else {
            return text.to_string();
        };

        let mut masked = text.to_string();
        // Replacing can create new adjacencies that spell a secret again; each
        // pass removes at least one non-placeholder char, so this terminates.
        let mut passes = masked.len() + 1;
        while passes > 0 && matcher.is_match(&masked) {
            masked = matcher
                .replace_all(&masked, NoExpand(self.placeholder))
                .into_owned();
            passes -= 1;
        }
        masked
    }

    pub fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_none() && !self.mask_all
    }

    /// True when no matcher could be built and all output is replaced
    pub fn is_degraded(&self) -> bool {
        self.mask_all
    }
}

#[derive(Debug, Default)]
struct MaskerSecrets {
    credentials: Vec<SecretValue>,
    token: Option<SecretValue>,
    masker: SecretMasker,
}

impl MaskerSecrets {
    /// Returns whether the rebuilt masker is degraded
    fn rebuild(&mut self) -> bool {
        self.masker = SecretMasker::new(self.credentials.iter().chain(self.token.iter()));
        self.masker.is_degraded()
    }
}

// Logged only after the lock is released: the log writer masks through it
fn report_degraded(degraded: bool) {
    if degraded {
        tracing::error!("Failed to build secret matcher, masking all log output");
    }
}

/// Shared, updatable masker used by the log writer
///
/// Holds the credential values plus the current token. Installing a new token
/// drops the previous one.
#[derive(Debug, Clone, Default)]
pub struct MaskerHandle {
    inner: Arc<RwLock<MaskerSecrets>>,
}

impl MaskerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_credentials<'a>(&self, secrets: impl IntoIterator<Item = &'a SecretValue>) {
        let degraded = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.credentials = secrets.into_iter().cloned().collect();
            inner.rebuild()
        };
        report_degraded(degraded);
    }

    pub fn set_token(&self, token: Option<SecretValue>) {
        let degraded = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.token = token;
            inner.rebuild()
        };
        report_degraded(degraded);
    }

    pub fn mask(&self, text: &str) -> String {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.masker.mask(text)
    }

    pub fn masker(&self) -> SecretMasker {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.masker.clone()
    }
}
