//! Orchestration: parse a raw reference, dispatch to the right fetcher,
//! select the submodule, and hand back a local source set.
//!
//! The resolver holds no scheme-specific logic: local paths pass through,
//! OCI and git references delegate to their fetchers, and everything meets
//! again at submodule selection and entry-file collection.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::auth::{Credentials, TrustPolicy};
use crate::cache::ModuleCache;
use crate::error::{Error, Result};
use crate::git::GitFetcher;
use crate::oci::{OciFetcher, RegistryClient};
use crate::reference::{self, ModuleReference, ModuleVersion, ParsedFlags, Scheme, Submodule};
use crate::settings::Settings;

/// The materialized result of one resolution: a local directory plus the
/// entry files to hand to the execution stage, in a stable order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSourceSet {
    /// Normalized local root of the resolved module.
    pub root_directory: PathBuf,
    /// Entry files in execution order: command-line order for explicit
    /// local files, deterministic walk order for everything else.
    pub entry_files: Vec<PathBuf>,
}

/// One resolver per process invocation. Owns the cache handle and settings;
/// fetchers borrow both.
#[derive(Debug)]
pub struct Resolver {
    settings: Settings,
    cache: ModuleCache,
}

impl Resolver {
    /// Build a resolver over the configured cache root.
    pub fn new(settings: Settings) -> Result<Self> {
        let cache = ModuleCache::open(settings.cache_root())?;
        Ok(Self { settings, cache })
    }

    /// Build a resolver over an explicit cache, for callers that manage the
    /// cache location themselves.
    pub fn with_cache(settings: Settings, cache: ModuleCache) -> Self {
        Self { settings, cache }
    }

    /// Resolve the positional arguments plus flags into a local source set.
    ///
    /// More than one positional argument is only meaningful for local
    /// files; a single (or absent) argument goes through the full reference
    /// grammar.
    pub async fn resolve(
        &self,
        args: &[String],
        flags: &ParsedFlags,
        credentials: Option<&Credentials>,
        trust: &TrustPolicy,
    ) -> Result<LocalSourceSet> {
        if args.len() > 1 {
            return self.resolve_local_files(args, flags);
        }

        let reference = reference::parse(args.first().map(String::as_str), flags)?;
        debug!(coordinate = %reference.coordinate(), "resolved reference");

        let fetched = self.fetch(&reference, credentials, trust).await?;
        let root = self
            .select_submodule(&reference, &fetched, credentials, trust)
            .await?;

        let root_directory = normalize(&root)?;
        if !root_directory.is_dir() {
            // A single-file local module: its parent is the root and the
            // file itself is the only entry.
            let parent = root_directory
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Ok(LocalSourceSet {
                root_directory: parent,
                entry_files: vec![root_directory],
            });
        }

        let entry_files = collect_entries(&root_directory, self.settings.entry_extension.as_deref())?;
        info!(
            root = %root_directory.display(),
            entries = entry_files.len(),
            "resolution complete"
        );
        Ok(LocalSourceSet {
            root_directory,
            entry_files,
        })
    }

    /// Validate credentials against a registry without fetching anything.
    pub async fn login(
        &self,
        registry: &str,
        credentials: &Credentials,
        trust: &TrustPolicy,
    ) -> Result<()> {
        let client =
            RegistryClient::new(registry, Some(credentials.clone()), trust, &self.settings)?;
        client.login().await?;
        info!(registry = client.host(), "login succeeded");
        Ok(())
    }

    /// Dispatch one reference to its fetcher. Local references never touch
    /// the network or the cache.
    async fn fetch(
        &self,
        reference: &ModuleReference,
        credentials: Option<&Credentials>,
        trust: &TrustPolicy,
    ) -> Result<PathBuf> {
        match reference.scheme {
            Scheme::Local => {
                let path = PathBuf::from(&reference.location);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(Error::PathNotFound(path))
                }
            }
            Scheme::Oci => {
                OciFetcher::new(&self.cache, &self.settings)
                    .fetch(reference, credentials, trust)
                    .await
            }
            Scheme::Git => GitFetcher::new(&self.cache, &self.settings).fetch(reference),
        }
    }

    /// Narrow the fetched root to the requested submodule, recursing into a
    /// nested fetch when the submodule carries its own version.
    async fn select_submodule(
        &self,
        reference: &ModuleReference,
        fetched: &Path,
        credentials: Option<&Credentials>,
        trust: &TrustPolicy,
    ) -> Result<PathBuf> {
        let Some(submodule) = &reference.submodule else {
            return Ok(fetched.to_path_buf());
        };

        if let Some(version) = &submodule.version
            && Some(version.as_str()) != reference.version.as_ref().map(ModuleVersion::as_str)
        {
            let nested = nested_reference(reference, submodule, version)?;
            debug!(coordinate = %nested.coordinate(), "fetching independently versioned submodule");
            let nested_root = Box::pin(self.fetch(&nested, credentials, trust)).await?;
            return match nested.scheme {
                // A nested registry artifact is the submodule itself.
                Scheme::Oci => Ok(nested_root),
                _ => subdir(&nested_root, &submodule.path),
            };
        }

        subdir(fetched, &submodule.path)
    }

    fn resolve_local_files(&self, args: &[String], flags: &ParsedFlags) -> Result<LocalSourceSet> {
        if flags.oci.is_some() || flags.git.is_some() {
            return Err(Error::invalid_reference(
                args.join(" "),
                "multiple positional paths only apply to local files",
            ));
        }
        if flags.tag.is_some() || flags.branch.is_some() || flags.commit.is_some() {
            return Err(Error::invalid_reference(
                args.join(" "),
                "version flags apply only to oci:// or git references",
            ));
        }

        let mut entry_files = Vec::with_capacity(args.len());
        for arg in args {
            let path = PathBuf::from(arg);
            if !path.is_file() {
                return Err(Error::PathNotFound(path));
            }
            entry_files.push(normalize(&path)?);
        }

        // Root at the first file's directory; execution order follows the
        // command line, not the filesystem.
        let root_directory = entry_files[0]
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(LocalSourceSet {
            root_directory,
            entry_files,
        })
    }
}

/// Build the reference for an independently versioned submodule.
///
/// Registries version submodules as sibling artifacts, so the nested OCI
/// coordinate swaps the final repository segment for the submodule name. A
/// git submodule pin names a tag in the same repository.
fn nested_reference(
    parent: &ModuleReference,
    submodule: &Submodule,
    version: &str,
) -> Result<ModuleReference> {
    match parent.scheme {
        Scheme::Oci => {
            let location = match parent.location.rsplit_once('/') {
                Some((prefix, _)) => format!("{prefix}/{}", submodule.path),
                None => submodule.path.clone(),
            };
            Ok(ModuleReference {
                scheme: Scheme::Oci,
                location,
                version: Some(ModuleVersion::Tag(version.to_string())),
                submodule: None,
            })
        }
        Scheme::Git => Ok(ModuleReference {
            scheme: Scheme::Git,
            location: parent.location.clone(),
            version: Some(ModuleVersion::Tag(version.to_string())),
            submodule: None,
        }),
        Scheme::Local => Err(Error::invalid_reference(
            parent.coordinate(),
            "local references cannot pin a submodule version",
        )),
    }
}

fn subdir(root: &Path, submodule: &str) -> Result<PathBuf> {
    let dir = root.join(submodule);
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(Error::SubmoduleNotFound {
            submodule: submodule.to_string(),
            root: root.to_path_buf(),
        })
    }
}

fn normalize(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|e| Error::io(format!("failed to normalize path {}", path.display()), e))
}

/// Collect entry files under `root` in a deterministic order: lexicographic
/// recursive walk, hidden names skipped, optionally filtered to one
/// extension.
fn collect_entries(root: &Path, extension: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    walk(root, extension, &mut files)?;
    Ok(files)
}

fn walk(dir: &Path, extension: Option<&str>, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| Error::io(format!("failed to read directory {}", dir.display()), e))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            walk(&path, extension, out)?;
        } else if path.is_file() {
            let keep = match extension {
                Some(ext) => path.extension().and_then(|e| e.to_str()) == Some(ext),
                None => true,
            };
            if keep {
                out.push(path);
            }
        }
    }
    Ok(())
}
