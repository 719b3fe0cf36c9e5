//! Caravel Core Library
//!
//! Resolves module references (local paths, OCI registry artifacts, and
//! git repositories) into locally materialized source sets, with a shared
//! content-addressed cache and registry authentication.

pub mod auth;
pub mod cache;
pub mod error;
pub mod git;
pub mod oci;
pub mod reference;
pub mod resolver;
pub mod settings;

/// Re-exports of commonly used types
pub mod prelude {
    // References
    pub use crate::reference::{
        ModuleReference, ModuleVersion, ParsedFlags, Scheme, Submodule, parse,
    };

    // Resolution
    pub use crate::resolver::{LocalSourceSet, Resolver};

    // Fetchers
    pub use crate::git::GitFetcher;
    pub use crate::oci::{OciFetcher, RegistryClient};

    // Cache
    pub use crate::cache::{CacheEntry, CacheKey, ModuleCache};

    // Authentication
    pub use crate::auth::{Credentials, SecretSource, TrustPolicy, resolve_credentials};

    // Ambient
    pub use crate::error::{Error, Result};
    pub use crate::settings::Settings;
}
