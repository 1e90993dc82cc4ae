//! Per-host authenticated HTTP sessions.
//!
//! Each host slot gets its own streaming [`reqwest::Client`] bound to the
//! operator's client certificate. Sessions follow at most five redirects and
//! never buffer whole bodies; TLS server verification mirrors the historical
//! ESGF tooling default (off) unless configured on.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Identity, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::Config;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Maximum redirects followed per request.
const MAX_REDIRECTS: usize = 5;

/// Errors building a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Could not read the client certificate file.
    #[error("cannot read credentials at {path}: {source}")]
    Credentials {
        /// Path that was tried.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The PEM contents were not a usable identity.
    #[error("invalid client certificate: {0}")]
    Identity(#[source] reqwest::Error),

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

/// Builds authenticated streaming clients, one per host slot.
///
/// The credential PEM is read once at construction so a missing or unreadable
/// file fails startup rather than the first dispatch.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    identity_pem: Option<Vec<u8>>,
    tls_verify: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl SessionFactory {
    /// Creates a factory from engine configuration, loading the credential
    /// file when one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Credentials`] if the configured PEM cannot be
    /// read.
    #[instrument(skip(config))]
    pub fn from_config(config: &Config) -> Result<Self, SessionError> {
        let identity_pem = match &config.credentials_pem {
            Some(path) => Some(read_credentials(path)?),
            None => None,
        };

        Ok(Self {
            identity_pem,
            tls_verify: config.tls_verify,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        })
    }

    /// Creates a factory with no client identity (anonymous sessions).
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            identity_pem: None,
            tls_verify: false,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }

    /// Builds one session. Called once per host slot; the client is then
    /// reused by every worker on that host.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Identity`] for an unusable certificate or
    /// [`SessionError::Build`] if the client cannot be constructed.
    #[instrument(skip(self))]
    pub fn make_session(&self) -> Result<Client, SessionError> {
        let mut builder = ClientBuilder::new()
            .use_rustls_tls()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .danger_accept_invalid_certs(!self.tls_verify);

        if let Some(pem) = &self.identity_pem {
            let identity = Identity::from_pem(pem).map_err(SessionError::Identity)?;
            builder = builder.identity(identity);
        }

        builder.build().map_err(SessionError::Build)
    }
}

fn read_credentials(path: &Path) -> Result<Vec<u8>, SessionError> {
    std::fs::read(path).map_err(|source| SessionError::Credentials {
        path: path.to_path_buf(),
        source,
    })
}

/// A failed GET, reduced to the short tag recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// HTTP 403.
    #[error("AUTH_FAIL")]
    AuthFail,
    /// HTTP 404.
    #[error("FILE_NOT_FOUND")]
    FileNotFound,
    /// HTTP 500.
    #[error("SERVER_ERROR")]
    ServerError,
    /// Any other non-200 status.
    #[error("{0}")]
    Status(u16),
    /// The redirect limit was exceeded.
    #[error("TOO_MANY_REDIRECTS")]
    TooManyRedirects,
    /// The request timed out (connect or read).
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    /// Connection-level failure (DNS, refused, TLS).
    #[error("CONNECTION_ERROR: {0}")]
    Connection(String),
    /// Anything else the HTTP stack reported.
    #[error("REQUEST_ERROR: {0}")]
    Request(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_redirect() {
            Self::TooManyRedirects
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Performs a GET with the host session and maps both transport failures and
/// non-200 statuses onto [`FetchError`] tags. The body is left unread for
/// the caller to stream.
///
/// # Errors
///
/// Returns a [`FetchError`] for any transport failure or non-200 response.
pub async fn get_checked(session: &Client, url: &str) -> Result<Response, FetchError> {
    let response = session.get(url).send().await?;

    let status = response.status();
    if status != StatusCode::OK {
        debug!(%url, status = status.as_u16(), "non-200 response");
        return Err(match status.as_u16() {
            403 => FetchError::AuthFail,
            404 => FetchError::FileNotFound,
            500 => FetchError::ServerError,
            code => FetchError::Status(code),
        });
    }

    Ok(response)
}
