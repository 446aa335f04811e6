//! HTTP plumbing and API clients for the storefront and the knowledge base.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use gumsync_core::{Entry, StorefrontProduct};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub mod gumroad;
pub mod notion;

pub use gumroad::GumroadClient;
pub use notion::NotionClient;

pub const CRATE_NAME: &str = "gumsync-remote";

/// Bearer token that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken(***)")
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, ApiError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build().map_err(ApiError::Client)
    }
}

/// How the reconciliation loop should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection failures, rate limits and 5xx.
    Transient,
    /// Unexpected statuses or response shapes.
    Malformed,
    /// The target database could not be identified. Fatal.
    Discovery,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Malformed => "malformed",
            ErrorClass::Discovery => "discovery",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::Transient
    } else {
        ErrorClass::Malformed
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("expected exactly one database matching {query:?}, found {found}")]
    DatabaseDiscovery { query: String, found: usize },
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Client(_) | ApiError::Request { .. } => ErrorClass::Transient,
            ApiError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(ErrorClass::Malformed),
            ApiError::Decode { .. } | ApiError::Malformed(_) => ErrorClass::Malformed,
            ApiError::DatabaseDiscovery { .. } => ErrorClass::Discovery,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Discovery
    }
}

/// The knowledge-base side of the sync: database discovery, row reads and row writes.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Locate the single database matching `query` and return its id.
    async fn find_database(&self, query: &str) -> Result<String, ApiError>;

    /// Read every row of the database as an entry carrying its row id.
    async fn query_rows(&self, database_id: &str) -> Result<Vec<Entry>, ApiError>;

    /// Create a row under `database_id`, returning the new row id.
    async fn create_row(&self, database_id: &str, entry: &Entry) -> Result<String, ApiError>;

    /// Replace the tracked fields of an existing row, returning its id.
    async fn update_row(&self, row_id: &str, entry: &Entry) -> Result<String, ApiError>;
}

#[async_trait]
pub trait Storefront: Send + Sync {
    async fn list_products(&self) -> Result<Vec<StorefrontProduct>, ApiError>;
}

const ERROR_BODY_LIMIT: usize = 512;

/// Send a request and decode a JSON body, mapping every failure onto [`ApiError`].
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    url: &str,
) -> Result<T, ApiError> {
    let resp = request.send().await.map_err(|source| ApiError::Request {
        url: url.to_string(),
        source,
    })?;
    let status = resp.status();
    let body = resp.bytes().await.map_err(|source| ApiError::Request {
        url: url.to_string(),
        source,
    })?;

    if !status.is_success() {
        return Err(ApiError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body: String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_BODY_LIMIT)
                .collect(),
        });
    }

    serde_json::from_slice(&body).map_err(|source| ApiError::Decode {
        url: url.to_string(),
        source,
    })
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
