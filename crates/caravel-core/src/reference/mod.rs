//! Module reference types and parsing.

mod parser;

pub use parser::parse;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Addressing scheme of a module reference. Closed set: every fetch path in
/// the resolver dispatches on exactly these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    /// Filesystem path, used as-is.
    Local,
    /// OCI registry coordinate (`host/repo`).
    Oci,
    /// Git remote URL.
    Git,
}

impl Scheme {
    /// Stable lowercase name, used in cache keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Oci => "oci",
            Self::Git => "git",
        }
    }
}

/// Version qualifier of a module reference.
///
/// `Tag` applies to both OCI artifacts and git tags; `Branch` and `Commit`
/// are git-only. An absent version means the registry default tag (OCI) or
/// the remote default branch (git).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleVersion {
    /// OCI tag or git tag.
    Tag(String),
    /// Git branch name.
    Branch(String),
    /// Git commit hash, full or abbreviated.
    Commit(String),
}

impl ModuleVersion {
    /// The bare version string without its kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(s) | Self::Branch(s) | Self::Commit(s) => s,
        }
    }
}

/// A nested package inside a fetched artifact, optionally pinned to its own
/// version for registries that version submodules independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submodule {
    /// Path of the submodule within the fetched artifact.
    pub path: String,
    /// Independent submodule version; inherits the parent's resolved
    /// content when absent.
    pub version: Option<String>,
}

impl fmt::Display for Submodule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}", self.path, v),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Structured address of a module: scheme, location, optional version, and
/// optional submodule path. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReference {
    /// Addressing scheme.
    pub scheme: Scheme,
    /// Filesystem path, `host/repo` registry coordinate, or git remote URL.
    pub location: String,
    /// Version qualifier. Always `None` for `Scheme::Local`.
    pub version: Option<ModuleVersion>,
    /// Nested package selection within the fetched artifact.
    pub submodule: Option<Submodule>,
}

impl ModuleReference {
    /// A local reference for the given path.
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Local,
            location: path.into(),
            version: None,
            submodule: None,
        }
    }

    /// Human-readable coordinate (scheme, location, version) used in every
    /// fetch-phase error. Omits submodule and credentials by construction.
    pub fn coordinate(&self) -> String {
        let prefix = match self.scheme {
            Scheme::Local => return self.location.clone(),
            Scheme::Oci => "oci://",
            Scheme::Git => "",
        };
        match &self.version {
            Some(ModuleVersion::Tag(v)) => format!("{prefix}{}:{v}", self.location),
            Some(ModuleVersion::Branch(v)) => format!("{prefix}{}@{v}", self.location),
            Some(ModuleVersion::Commit(v)) => format!("{prefix}{}@{v}", self.location),
            None => format!("{prefix}{}", self.location),
        }
    }
}

impl fmt::Display for ModuleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.coordinate())
    }
}

/// Options recognized from the CLI collaborator, constructed once per
/// invocation and passed by reference through the call chain.
#[derive(Debug, Clone, Default)]
pub struct ParsedFlags {
    /// OCI registry URL (`--oci`).
    pub oci: Option<String>,
    /// Git remote URL (`--git`).
    pub git: Option<String>,
    /// OCI tag or git tag (`--tag`).
    pub tag: Option<String>,
    /// Git branch (`--branch`).
    pub branch: Option<String>,
    /// Git commit (`--commit`).
    pub commit: Option<String>,
    /// Registry username (`--username`).
    pub username: Option<String>,
    /// Registry password or identity token (`--password`).
    pub password: Option<String>,
    /// Read the password from stdin (`--password-stdin`).
    pub password_from_stdin: bool,
    /// Skip TLS certificate verification (`--insecure-skip-tls-verify`).
    pub insecure_skip_tls_verify: bool,
}
