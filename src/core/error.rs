//! Error taxonomy for clone and instance operations

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by clone lifecycle operations.
#[derive(Debug, Error)]
pub enum CloneError {
    /// The base application bundle is missing; launch-type operations cannot
    /// proceed until it is installed.
    #[error("application bundle not installed at {0}")]
    NotInstalled(PathBuf),

    /// I/O or signing failure while producing a clone. No partial clone is
    /// left behind and the operation is retryable.
    #[error("clone creation failed: {0}")]
    CopyCreationFailed(anyhow::Error),

    /// A destructive operation targeted an identity with a live process.
    /// Rejected before any filesystem action.
    #[error("identity {0} is currently running")]
    IdentityInUse(String),
}

/// Errors raised by the update check / download / install pipeline.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("no installable release found in feed")]
    NoReleaseFound,

    #[error("release feed returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("failed to parse release feed: {0}")]
    Parse(#[from] serde_json::Error),

    /// The user declined elevation, or the authorization probe itself failed.
    /// The staged update is kept for manual installation.
    #[error("administrator authorization denied")]
    AuthorizationDenied,

    /// The install script could not verify the swapped-in bundle; the backup
    /// has been restored.
    #[error("installed bundle failed verification")]
    InstallVerificationFailed,

    #[error("download cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
