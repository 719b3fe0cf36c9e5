use std::fs;
use std::path::Path;

use git2::{IndexAddOption, Repository, Signature};
use tempfile::TempDir;

use caravel_core::cache::ModuleCache;
use caravel_core::error::Error;
use caravel_core::git::GitFetcher;
use caravel_core::reference::{ModuleReference, ModuleVersion, Scheme};
use caravel_core::settings::Settings;

fn commit_all(repo: &Repository, message: &str) -> git2::Oid {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();

    let sig = Signature::now("test", "test@example.com").unwrap();
    match repo.head() {
        Ok(head) => {
            let parent = repo.find_commit(head.target().unwrap()).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
                .unwrap()
        }
        Err(_) => repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])
            .unwrap(),
    }
}

/// A remote with two commits on the default branch, a `dev` branch, and a
/// `v1.0.0` tag on the first commit.
fn fixture_remote(dir: &Path) -> (String, git2::Oid, git2::Oid) {
    let repo = Repository::init(dir).unwrap();

    fs::write(dir.join("main.k"), "a = 1").unwrap();
    let first = commit_all(&repo, "initial");
    repo.tag_lightweight("v1.0.0", &repo.find_object(first, None).unwrap(), false)
        .unwrap();

    let branch_point = repo.find_commit(first).unwrap();
    repo.branch("dev", &branch_point, false).unwrap();

    fs::write(dir.join("main.k"), "a = 2").unwrap();
    let second = commit_all(&repo, "update");

    (format!("file://{}", dir.display()), first, second)
}

fn git_reference(url: &str, version: Option<ModuleVersion>) -> ModuleReference {
    ModuleReference {
        scheme: Scheme::Git,
        location: url.to_string(),
        version,
        submodule: None,
    }
}

#[test]
fn fetches_default_branch_head() {
    let remote_dir = TempDir::new().unwrap();
    let (url, _, second) = fixture_remote(remote_dir.path());
    let cache_dir = TempDir::new().unwrap();
    let cache = ModuleCache::open(cache_dir.path()).unwrap();
    let settings = Settings::default();

    let fetcher = GitFetcher::new(&cache, &settings);
    let dir = fetcher.fetch(&git_reference(&url, None)).unwrap();

    assert_eq!(fs::read_to_string(dir.join("main.k")).unwrap(), "a = 2");
    assert!(!dir.join(".git").exists());

    let entry = cache
        .entry(&caravel_core::cache::CacheKey::new(
            Scheme::Git,
            &url,
            &second.to_string(),
        ))
        .unwrap()
        .unwrap();
    assert_eq!(entry.resolved_version, second.to_string());
}

#[test]
fn fetches_tag_content() {
    let remote_dir = TempDir::new().unwrap();
    let (url, _, _) = fixture_remote(remote_dir.path());
    let cache_dir = TempDir::new().unwrap();
    let cache = ModuleCache::open(cache_dir.path()).unwrap();
    let settings = Settings::default();

    let fetcher = GitFetcher::new(&cache, &settings);
    let reference = git_reference(&url, Some(ModuleVersion::Tag("v1.0.0".to_string())));
    let dir = fetcher.fetch(&reference).unwrap();

    assert_eq!(fs::read_to_string(dir.join("main.k")).unwrap(), "a = 1");
}

#[test]
fn fetches_branch_content() {
    let remote_dir = TempDir::new().unwrap();
    let (url, _, _) = fixture_remote(remote_dir.path());
    let cache_dir = TempDir::new().unwrap();
    let cache = ModuleCache::open(cache_dir.path()).unwrap();
    let settings = Settings::default();

    let fetcher = GitFetcher::new(&cache, &settings);
    let reference = git_reference(&url, Some(ModuleVersion::Branch("dev".to_string())));
    let dir = fetcher.fetch(&reference).unwrap();

    // dev branches off the first commit.
    assert_eq!(fs::read_to_string(dir.join("main.k")).unwrap(), "a = 1");
}

#[test]
fn commit_pin_hits_cache_without_the_remote() {
    let remote_dir = TempDir::new().unwrap();
    let (url, first, _) = fixture_remote(remote_dir.path());
    let cache_dir = TempDir::new().unwrap();
    let cache = ModuleCache::open(cache_dir.path()).unwrap();
    let settings = Settings::default();

    let reference = git_reference(&url, Some(ModuleVersion::Commit(first.to_string())));
    let fetched = GitFetcher::new(&cache, &settings).fetch(&reference).unwrap();
    assert_eq!(fs::read_to_string(fetched.join("main.k")).unwrap(), "a = 1");

    // A pinned commit must be served from cache even when the remote is gone.
    drop(remote_dir);
    let again = GitFetcher::new(&cache, &settings).fetch(&reference).unwrap();
    assert_eq!(again, fetched);
}

#[test]
fn abbreviated_commit_resolves_to_full_hash() {
    let remote_dir = TempDir::new().unwrap();
    let (url, first, _) = fixture_remote(remote_dir.path());
    let cache_dir = TempDir::new().unwrap();
    let cache = ModuleCache::open(cache_dir.path()).unwrap();
    let settings = Settings::default();

    let short = first.to_string()[..7].to_string();
    let reference = git_reference(&url, Some(ModuleVersion::Commit(short)));
    let dir = GitFetcher::new(&cache, &settings).fetch(&reference).unwrap();
    assert_eq!(fs::read_to_string(dir.join("main.k")).unwrap(), "a = 1");

    // The cache entry records the full resolved hash.
    let key = caravel_core::cache::CacheKey::new(Scheme::Git, &url, &first.to_string());
    assert!(cache.lookup(&key).is_some());
}

#[test]
fn missing_branch_fails_with_ref_not_found() {
    let remote_dir = TempDir::new().unwrap();
    let (url, _, _) = fixture_remote(remote_dir.path());
    let cache_dir = TempDir::new().unwrap();
    let cache = ModuleCache::open(cache_dir.path()).unwrap();
    let settings = Settings::default();

    let reference = git_reference(&url, Some(ModuleVersion::Branch("absent".to_string())));
    let err = GitFetcher::new(&cache, &settings)
        .fetch(&reference)
        .unwrap_err();
    assert!(matches!(err, Error::RefNotFound { .. }));
}

#[test]
fn nonexistent_commit_fails_with_ref_not_found() {
    let remote_dir = TempDir::new().unwrap();
    let (url, _, _) = fixture_remote(remote_dir.path());
    let cache_dir = TempDir::new().unwrap();
    let cache = ModuleCache::open(cache_dir.path()).unwrap();
    let settings = Settings::default();

    let reference = git_reference(
        &url,
        Some(ModuleVersion::Commit("0123456789abcdef0123456789abcdef01234567".to_string())),
    );
    let err = GitFetcher::new(&cache, &settings)
        .fetch(&reference)
        .unwrap_err();
    assert!(matches!(err, Error::RefNotFound { .. }));
}
