// Startup credential validation

use regex::Regex;
use serde::Deserialize;

use super::types::{Credential, MalformedField, ValidationResult};
use crate::error::AuthError;

/// Shape rule for a single credential field
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    pub prefix: Option<String>,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    /// Regex the whole value must match
    pub pattern: Option<String>,
}

/// Declared credential: name, whether it is required, optional rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSpec {
    pub name: String,
    pub required: bool,
    pub rule: Option<FieldRule>,
}

impl CredentialSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            rule: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            rule: None,
        }
    }

    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rule = Some(rule);
        self
    }
}

struct CompiledRule {
    rule: FieldRule,
    pattern: Option<Regex>,
}

impl CompiledRule {
    fn compile(name: &str, rule: &FieldRule) -> Result<Self, AuthError> {
        let pattern = rule
            .pattern
            .as_deref()
            .map(|p| Regex::new(&format!("^(?:{})$", p)))
            .transpose()
            .map_err(|e| AuthError::Config(format!("invalid pattern for {}: {}", name, e)))?;

        if let (Some(min), Some(max)) = (rule.min_len, rule.max_len) {
            if min > max {
                return Err(AuthError::Config(format!(
                    "rule for {}: min_len {} exceeds max_len {}",
                    name, min, max
                )));
            }
        }

        Ok(Self {
            rule: rule.clone(),
            pattern,
        })
    }

    /// First violated rule, described without the value
    fn violation(&self, value: &str) -> Option<String> {
        if let Some(prefix) = &self.rule.prefix {
            if !value.starts_with(prefix.as_str()) {
                return Some(format!("expected prefix '{}'", prefix));
            }
        }
        let len = value.chars().count();
        if let Some(min) = self.rule.min_len {
            if len < min {
                return Some(format!("length must be at least {}", min));
            }
        }
        if let Some(max) = self.rule.max_len {
            if len > max {
                return Some(format!("length must be at most {}", max));
            }
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(value) {
                return Some("does not match expected pattern".to_string());
            }
        }
        None
    }
}

/// Checks declared credentials are present and well formed
pub struct CredentialValidator {
    specs: Vec<(CredentialSpec, Option<CompiledRule>)>,
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialValidator")
            .field(
                "specs",
                &self.specs.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CredentialValidator {
    /// Compile the declared rules. Fails only on an unusable rule.
    pub fn new(specs: &[CredentialSpec]) -> Result<Self, AuthError> {
        let specs = specs
            .iter()
            .map(|spec| {
                let compiled = spec
                    .rule
                    .as_ref()
                    .map(|rule| CompiledRule::compile(&spec.name, rule))
                    .transpose()?;
                Ok((spec.clone(), compiled))
            })
            .collect::<Result<Vec<_>, AuthError>>()?;
        Ok(Self { specs })
    }

    /// Validate a credential set against the declared specs
    ///
    /// A required name that is absent or blank is missing. A present, non-blank
    /// value that violates its rule is malformed.
    pub fn validate(&self, credentials: &[Credential]) -> ValidationResult {
        let mut result = ValidationResult::default();

        for (spec, rule) in &self.specs {
            let value = credentials
                .iter()
                .find(|c| c.name == spec.name)
                .map(|c| &c.value)
                .filter(|v| !v.is_blank());

            match value {
                None if spec.required => result.missing.push(spec.name.clone()),
                None => {}
                Some(value) => {
                    if let Some(violation) = rule.as_ref().and_then(|r| r.violation(value.expose()))
                    {
                        result.malformed.push(MalformedField {
                            name: spec.name.clone(),
                            rule: violation,
                        });
                    }
                }
            }
        }

        result
    }

    pub fn specs(&self) -> impl Iterator<Item = &CredentialSpec> {
        self.specs.iter().map(|(s, _)| s)
    }
}
