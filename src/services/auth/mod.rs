//! Authentication strategies.
//!
//! The set of strategies is closed: [`Authenticator`] is chosen once at
//! startup and never looked up by name.

pub mod api;

use base64::{Engine as _, engine::general_purpose};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub use api::{ApiAuthenticator, ApiConfig};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to send an auth request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("auth endpoint answered with status {0}")]
    Rejected(u16),
    #[error("invalid authenticator configuration: {0}")]
    InvalidConfig(String),
}

/// Username and password presented by a client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Parse an `Authorization: Basic <base64(user:password)>` header value.
    pub fn from_basic_authorization(value: &str) -> Option<Self> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some(Self::new(user, password))
    }
}

/// One fixed user/password pair set at configuration time.
#[derive(Clone)]
pub struct StaticCredentials {
    user: String,
    password: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl StaticCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        let user_ok: bool = self.user.as_bytes().ct_eq(user.as_bytes()).into();
        let password_ok: bool = self.password.as_bytes().ct_eq(password.as_bytes()).into();
        user_ok && password_ok
    }
}

/// Server-wide credential gate.
#[derive(Clone, Debug, Default)]
pub enum Authenticator {
    /// No gate, every request passes.
    #[default]
    None,
    Static(StaticCredentials),
    Api(ApiAuthenticator),
}

impl Authenticator {
    /// `Ok(true)` admits the request. Callers must treat `Err` as a denial.
    pub async fn authenticate(&self, user: &str, password: &str) -> Result<bool, AuthError> {
        match self {
            Self::None => Ok(true),
            Self::Static(creds) => Ok(creds.verify(user, password)),
            Self::Api(api) => api.authenticate(user, password).await,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Static(_) => "static",
            Self::Api(_) => "api",
        }
    }
}
