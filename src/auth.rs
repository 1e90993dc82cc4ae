//! Credential state collaborator.
//!
//! Acquiring an X.509 proxy certificate from a MyProxy-style endpoint is
//! delegated to an external collaborator; the engine only needs to know
//! whether a usable credential exists before it starts dispatching, and to
//! give the collaborator one chance to obtain one.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Authentication errors. All of them abort startup.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No usable credential after attempting logon.
    #[error("NOAUTH: not logged on after credential acquisition")]
    NoAuth,

    /// The external acquisition step itself failed.
    #[error("credential acquisition failed: {0}")]
    Acquisition(String),
}

/// Credential acquisition seam.
///
/// Implementations report whether a credential is currently usable and can
/// attempt to obtain one. The engine calls `logon` at most once, then checks
/// `is_logged_on` again; still-absent credentials fail startup with
/// [`AuthError::NoAuth`].
#[async_trait]
pub trait Logon: Send + Sync {
    /// Whether a usable credential is currently available.
    fn is_logged_on(&self) -> bool;

    /// Attempts to acquire a credential from `auth_server`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Acquisition`] if the acquisition step fails
    /// outright.
    async fn logon(&self, username: &str, password: &str, auth_server: &str)
    -> Result<(), AuthError>;
}

/// Credential-file logon: logged on means the PEM exists and is non-empty.
///
/// Acquisition itself happens out of band (the operator runs the MyProxy
/// client), so `logon` is a no-op and a still-missing file surfaces as
/// `NOAUTH` through the engine's post-logon check.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    /// Watches the given PEM path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Logon for CredentialFile {
    fn is_logged_on(&self) -> bool {
        std::fs::metadata(&self.path).is_ok_and(|meta| meta.len() > 0)
    }

    async fn logon(
        &self,
        _username: &str,
        _password: &str,
        auth_server: &str,
    ) -> Result<(), AuthError> {
        tracing::warn!(
            path = %self.path.display(),
            %auth_server,
            "no credential file; obtain one with the MyProxy client and re-run"
        );
        Ok(())
    }
}
