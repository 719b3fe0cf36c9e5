//! Error types for module resolution.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving a module reference.
///
/// Fetch-phase variants carry the failing coordinate (scheme, location,
/// version) so a failure is always attributable to one reference. Secrets
/// never appear in any variant.
#[derive(Debug, Error)]
pub enum Error {
    /// The reference string or flag combination could not be parsed.
    #[error("invalid module reference '{input}': {reason}")]
    InvalidReference {
        /// The offending input, echoed back verbatim.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A username is required when the password is piped on stdin.
    #[error("a username must be provided when reading the password from stdin")]
    MissingUsername,

    /// Credentials could not be read from the terminal or stdin.
    #[error("failed to read credentials: {0}")]
    CredentialInput(String),

    /// The registry rejected the supplied credentials.
    #[error("authentication failed for registry '{registry}'")]
    Authentication {
        /// Registry host that rejected the credentials.
        registry: String,
    },

    /// A downloaded layer did not hash to its manifest-declared digest.
    ///
    /// Always fatal. Indicates tampering or transport corruption, never a
    /// trust decision, so it cannot be bypassed by any TLS setting.
    #[error("digest mismatch for {coordinate}: manifest declares {expected}, content hashed to {actual}")]
    Integrity {
        /// The coordinate being fetched.
        coordinate: String,
        /// Digest declared in the manifest.
        expected: String,
        /// Digest computed from the downloaded bytes.
        actual: String,
    },

    /// The requested branch, tag, or commit does not exist on the remote.
    #[error("reference '{reference}' not found in git repository {repo}")]
    RefNotFound {
        /// Repository URL.
        repo: String,
        /// Branch, tag, or commit that was requested.
        reference: String,
    },

    /// A git transport-level failure. Never retried: a partial clone can
    /// corrupt local state.
    #[error("failed to clone {repo}: {message}")]
    Clone {
        /// Repository URL.
        repo: String,
        /// Trimmed stderr from the git transport.
        message: String,
    },

    /// A local module path does not exist or is not usable.
    #[error("no such module path: {0}")]
    PathNotFound(PathBuf),

    /// The submodule path does not exist inside the fetched artifact.
    #[error("submodule '{submodule}' not found under {}", root.display())]
    SubmoduleNotFound {
        /// Requested sub-path.
        submodule: String,
        /// Root of the fetched artifact that was searched.
        root: PathBuf,
    },

    /// A network operation exceeded the configured deadline.
    #[error("timed out after {seconds}s while fetching {coordinate}")]
    Timeout {
        /// The coordinate being fetched.
        coordinate: String,
        /// Configured timeout in seconds.
        seconds: u64,
    },

    /// A transient or terminal network failure.
    #[error("network error while fetching {coordinate}: {message}")]
    Network {
        /// The coordinate being fetched.
        coordinate: String,
        /// Transport-level detail.
        message: String,
    },

    /// The settings file exists but could not be parsed.
    #[error("invalid settings file {}: {message}", path.display())]
    Settings {
        /// Path to the settings file.
        path: PathBuf,
        /// Parse failure detail.
        message: String,
    },

    /// Filesystem failure in the cache or during extraction.
    #[error("{context}: {source}")]
    Io {
        /// What was being done when the failure occurred.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap an I/O error with a description of the failed operation.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid_reference(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for module resolution operations.
pub type Result<T> = std::result::Result<T, Error>;
