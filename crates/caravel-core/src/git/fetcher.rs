//! Git fetcher: shallow checkouts of a branch, tag, or commit, cached by
//! resolved commit hash.
//!
//! Transfers shell out to the `git` CLI so SSH remotes authenticate through
//! the caller's agent; this crate never touches key material. Commit
//! resolution inside a checkout uses `git2`.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheKey, ModuleCache};
use crate::error::{Error, Result};
use crate::reference::{ModuleReference, ModuleVersion, Scheme};
use crate::settings::Settings;

/// Fetches git repositories into the module cache.
///
/// Floating references (branches, tags, default branch) are re-resolved
/// against the remote on every invocation; commit-pinned references hit the
/// cache without network after the first fetch.
#[derive(Debug)]
pub struct GitFetcher<'a> {
    cache: &'a ModuleCache,
    settings: &'a Settings,
}

impl<'a> GitFetcher<'a> {
    pub fn new(cache: &'a ModuleCache, settings: &'a Settings) -> Self {
        Self { cache, settings }
    }

    /// Fetch the repository content named by `reference`, returning the
    /// local directory (without `.git`).
    pub fn fetch(&self, reference: &ModuleReference) -> Result<PathBuf> {
        let repo_url = reference.location.as_str();

        match &reference.version {
            Some(ModuleVersion::Branch(name)) => {
                let commit = self.resolve_remote_ref(repo_url, &format!("refs/heads/{name}"))?;
                self.fetch_resolved(reference, Some(name), &commit)
            }
            Some(ModuleVersion::Tag(name)) => {
                let commit = self.resolve_remote_ref(repo_url, &format!("refs/tags/{name}"))?;
                self.fetch_resolved(reference, Some(name), &commit)
            }
            Some(ModuleVersion::Commit(hash)) => self.fetch_commit(reference, hash),
            None => {
                let commit = self.resolve_remote_ref(repo_url, "HEAD")?;
                self.fetch_resolved(reference, None, &commit)
            }
        }
    }

    /// Resolve a remote ref to its commit via `ls-remote`. Tags resolve to
    /// the peeled commit when the remote reports one.
    fn resolve_remote_ref(&self, repo_url: &str, refspec: &str) -> Result<String> {
        let output = self.run_git(None, &["ls-remote", repo_url, refspec], repo_url)?;

        let mut plain = None;
        let mut peeled = None;
        for line in output.lines() {
            let Some((sha, name)) = line.split_once('\t') else {
                continue;
            };
            if name.ends_with("^{}") {
                peeled = Some(sha.to_string());
            } else {
                plain.get_or_insert_with(|| sha.to_string());
            }
        }

        peeled.or(plain).ok_or_else(|| Error::RefNotFound {
            repo: repo_url.to_string(),
            reference: refspec.to_string(),
        })
    }

    /// Fetch a reference already resolved to a commit: serve from cache when
    /// the commit is present, otherwise shallow-clone the named ref.
    fn fetch_resolved(
        &self,
        reference: &ModuleReference,
        ref_name: Option<&str>,
        commit: &str,
    ) -> Result<PathBuf> {
        let repo_url = reference.location.as_str();
        let key = CacheKey::new(Scheme::Git, repo_url, commit);
        if let Some(dir) = self.cache.lookup(&key) {
            return Ok(dir);
        }

        let _lock = self.cache.lock(&key, self.timeout())?;
        if let Some(dir) = self.cache.lookup(&key) {
            return Ok(dir);
        }

        let stage = self.cache.stage_dir()?;
        let checkout = stage.path().join("checkout");
        let mut args = vec!["clone", "--quiet", "--depth", "1"];
        if let Some(name) = ref_name {
            args.extend(["--branch", name]);
        }
        let checkout_str = path_str(&checkout)?;
        args.extend([repo_url, checkout_str.as_str()]);
        self.run_git(None, &args, repo_url)?;

        let resolved = head_commit(&checkout, repo_url)?;
        self.publish_checkout(reference, &checkout, &resolved)
    }

    /// Fetch a commit pin. Full 40-hex pins are served from cache without
    /// any network; abbreviated pins are resolved by fetching.
    fn fetch_commit(&self, reference: &ModuleReference, hash: &str) -> Result<PathBuf> {
        let repo_url = reference.location.as_str();

        if is_full_commit(hash) {
            let key = CacheKey::new(Scheme::Git, repo_url, hash);
            if let Some(dir) = self.cache.lookup(&key) {
                return Ok(dir);
            }
        }

        let stage = self.cache.stage_dir()?;
        let checkout = stage.path().join("checkout");
        self.checkout_commit(repo_url, hash, &checkout)?;

        let resolved = head_commit(&checkout, repo_url)?;
        if !resolved.starts_with(hash) {
            return Err(Error::RefNotFound {
                repo: repo_url.to_string(),
                reference: hash.to_string(),
            });
        }

        let key = CacheKey::new(Scheme::Git, repo_url, &resolved);
        let _lock = self.cache.lock(&key, self.timeout())?;
        if let Some(dir) = self.cache.lookup(&key) {
            return Ok(dir);
        }
        self.publish_checkout(reference, &checkout, &resolved)
    }

    /// Materialize `commit` into `checkout`, preferring a shallow exact-sha
    /// fetch and falling back to a full clone for remotes that refuse
    /// direct sha requests or for abbreviated hashes.
    fn checkout_commit(&self, repo_url: &str, commit: &str, checkout: &Path) -> Result<()> {
        let checkout_str = path_str(checkout)?;

        let shallow = self
            .run_git(None, &["init", "--quiet", checkout_str.as_str()], repo_url)
            .and_then(|_| {
                self.run_git(
                    Some(checkout),
                    &["remote", "add", "origin", repo_url],
                    repo_url,
                )
            })
            .and_then(|_| {
                self.run_git(
                    Some(checkout),
                    &["fetch", "--quiet", "--depth", "1", "origin", commit],
                    repo_url,
                )
            })
            .and_then(|_| {
                self.run_git(
                    Some(checkout),
                    &["checkout", "--quiet", "--detach", "FETCH_HEAD"],
                    repo_url,
                )
            });

        match shallow {
            Ok(_) => Ok(()),
            Err(e @ Error::Timeout { .. }) => Err(e),
            Err(_) => {
                debug!(repo_url, commit, "shallow commit fetch refused, falling back to full clone");
                std::fs::remove_dir_all(checkout).ok();
                self.run_git(
                    None,
                    &["clone", "--quiet", repo_url, checkout_str.as_str()],
                    repo_url,
                )?;
                self.run_git(
                    Some(checkout),
                    &["checkout", "--quiet", "--detach", commit],
                    repo_url,
                )
                .map_err(|e| match e {
                    // The clone succeeded, so a failing checkout means the
                    // commit does not exist on the remote.
                    Error::Clone { repo, .. } => Error::RefNotFound {
                        repo,
                        reference: commit.to_string(),
                    },
                    other => other,
                })?;
                Ok(())
            }
        }
    }

    /// Drop `.git` and publish the checkout under the resolved commit key.
    fn publish_checkout(
        &self,
        reference: &ModuleReference,
        checkout: &Path,
        resolved: &str,
    ) -> Result<PathBuf> {
        let git_dir = checkout.join(".git");
        if git_dir.exists() {
            std::fs::remove_dir_all(&git_dir).map_err(|e| {
                Error::io(format!("failed to remove {}", git_dir.display()), e)
            })?;
        }

        let key = CacheKey::new(Scheme::Git, &reference.location, resolved);
        let entry = CacheEntry::new(Scheme::Git, &reference.location, resolved);
        let dir = self.cache.publish(&key, &entry, checkout)?;
        info!(coordinate = %reference.coordinate(), commit = resolved, "fetched git repository");
        Ok(dir)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    /// Run one git command with the configured deadline, classifying
    /// missing-ref failures apart from transport failures.
    fn run_git(&self, cwd: Option<&Path>, args: &[&str], repo_url: &str) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::io(format!("failed to invoke git {}", args.first().unwrap_or(&"")), e)
        })?;

        // Drain both pipes while the child runs; a full pipe buffer would
        // otherwise block git and stall it into the deadline.
        let stdout_reader = child.stdout.take().map(drain_pipe);
        let stderr_reader = child.stderr.take().map(drain_pipe);

        let deadline = Instant::now() + self.timeout();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Timeout {
                        coordinate: repo_url.to_string(),
                        seconds: self.settings.timeout_secs,
                    });
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => return Err(Error::io("failed to wait for git", e)),
            }
        };

        let stdout = stdout_reader
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = stderr_reader
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else if ref_missing(&stderr) {
            Err(Error::RefNotFound {
                repo: repo_url.to_string(),
                reference: args.last().unwrap_or(&"").to_string(),
            })
        } else {
            Err(Error::Clone {
                repo: repo_url.to_string(),
                message: stderr.trim().to_string(),
            })
        }
    }
}

/// Read a child pipe to the end on a background thread.
fn drain_pipe<R: std::io::Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buffer = String::new();
        let _ = pipe.read_to_string(&mut buffer);
        buffer
    })
}

/// Whether stderr from a git command indicates a missing ref rather than a
/// transport failure.
fn ref_missing(stderr: &str) -> bool {
    const MARKERS: [&str; 5] = [
        "couldn't find remote ref",
        "not our ref",
        "bad object",
        "Remote branch",
        "pathspec",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

fn is_full_commit(hash: &str) -> bool {
    hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        Error::io(
            "checkout path is not valid UTF-8",
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })
}

/// Full commit hash of a checkout's HEAD.
fn head_commit(checkout: &Path, repo_url: &str) -> Result<String> {
    let repo = git2::Repository::open(checkout).map_err(|e| Error::Clone {
        repo: repo_url.to_string(),
        message: format!("failed to open checkout: {e}"),
    })?;
    let commit = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .map_err(|e| Error::Clone {
            repo: repo_url.to_string(),
            message: format!("failed to resolve HEAD: {e}"),
        })?;
    Ok(commit.id().to_string())
}
