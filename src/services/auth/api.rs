//! Delegated authentication against an external HTTP endpoint.
//!
//! The credentials are POSTed as `{"username": .., "password": ..}` together
//! with a fixed set of headers. Only a `200 OK` answer admits the request;
//! every other status and every transport failure is an error.

use super::AuthError;
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, Default)]
pub struct ApiConfig {
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
}

impl ApiConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Parse `Name=value,Other=value` into a header map.
    pub fn parse_headers(raw: &str) -> Result<BTreeMap<String, String>, AuthError> {
        let mut headers = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                AuthError::InvalidConfig(format!("header `{pair}` is not in Name=value form"))
            })?;
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
        Ok(headers)
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Clone, Debug)]
pub struct ApiAuthenticator {
    client: Client,
    endpoint: String,
    headers: HeaderMap,
}

impl ApiAuthenticator {
    pub fn new(config: ApiConfig) -> Result<Self, AuthError> {
        if config.endpoint.trim().is_empty() {
            return Err(AuthError::InvalidConfig("endpoint is empty".into()));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AuthError::InvalidConfig(format!("invalid header name `{name}`")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| AuthError::InvalidConfig(format!("invalid value for `{name}`")))?;
            headers.insert(name, value);
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
            headers,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn authenticate(&self, user: &str, password: &str) -> Result<bool, AuthError> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(&AuthRequest {
                username: user,
                password,
            })
            .send()
            .await?;

        let status = response.status();
        debug!(endpoint = %self.endpoint, status = status.as_u16(), "api authenticator answered");
        if status == StatusCode::OK {
            Ok(true)
        } else {
            Err(AuthError::Rejected(status.as_u16()))
        }
    }
}
