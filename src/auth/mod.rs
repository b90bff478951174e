// Authentication module
// Credential validation, secret masking and access-token lifecycle

mod manager;
mod masker;
mod refresh;
mod state;
mod types;
mod upstream;
mod validator;

pub use manager::{
    CoordinatorConfig, LifecycleCoordinator, ACCESS_TOKEN, ACCESS_TOKEN_EXPIRES_AT, API_KEY,
    API_SECRET,
};
pub use masker::{MaskerHandle, SecretMasker, PLACEHOLDER};
pub use refresh::{RefreshCycle, RefreshPolicy, TokenRefresher};
pub use state::TokenState;
pub use types::{
    ApiCredentials, Credential, FailureKind, IssuedToken, MalformedField, RefreshFailure,
    RefreshOutcome, RefreshPhase, SecretValue, TokenRecord, TokenSource, ValidationResult,
};
pub use upstream::{parse_token_response, HttpTokenEndpoint, TokenEndpoint};
pub use validator::{CredentialSpec, CredentialValidator, FieldRule};
