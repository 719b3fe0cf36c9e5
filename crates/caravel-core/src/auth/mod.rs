//! Registry credentials and TLS trust policy.

mod input;

pub use input::resolve_credentials;

use std::fmt;

/// Where a secret came from. Recorded so callers can distinguish piped,
/// flag-supplied, and prompted credentials without re-reading anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    /// `--password` flag.
    Flag,
    /// Piped via `--password-stdin`.
    Stdin,
    /// Prompted on the terminal with echo suppressed.
    Interactive,
}

/// Registry credentials for one fetch or login operation.
///
/// Held in memory only for the duration of that operation and never
/// persisted by this crate. The secret is redacted from `Debug` output and
/// must never reach a log line or error message.
#[derive(Clone)]
pub struct Credentials {
    /// Registry host these credentials apply to.
    pub registry: String,
    /// Account name.
    pub username: String,
    /// Password or identity token.
    pub secret: String,
    /// How the secret was obtained.
    pub secret_source: SecretSource,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("secret_source", &self.secret_source)
            .finish()
    }
}

/// TLS trust policy for one registry host, for the lifetime of one process
/// invocation. Disabling verification never weakens content-digest checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustPolicy {
    /// Skip TLS certificate verification for this host.
    pub skip_tls_verify: bool,
}
