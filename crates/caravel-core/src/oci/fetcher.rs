//! OCI artifact fetcher: tag resolution, cached pulls, concurrent layer
//! download, and extraction into the module cache.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::auth::{Credentials, TrustPolicy};
use crate::cache::{CacheEntry, CacheKey, ModuleCache};
use crate::error::{Error, Result};
use crate::reference::{ModuleReference, ModuleVersion, Scheme};
use crate::settings::Settings;

use super::{Descriptor, Manifest, RegistryClient, extract_layer, verify_descriptor};

/// Pulls versioned package artifacts from OCI registries into the cache.
#[derive(Debug)]
pub struct OciFetcher<'a> {
    cache: &'a ModuleCache,
    settings: &'a Settings,
}

impl<'a> OciFetcher<'a> {
    pub fn new(cache: &'a ModuleCache, settings: &'a Settings) -> Self {
        Self { cache, settings }
    }

    /// Fetch the artifact named by `reference`, returning the local package
    /// directory. Cached digests are served without network transfer beyond
    /// the tag-to-digest manifest lookup.
    pub async fn fetch(
        &self,
        reference: &ModuleReference,
        credentials: Option<&Credentials>,
        trust: &TrustPolicy,
    ) -> Result<PathBuf> {
        let (host, repo) = split_location(reference)?;
        let client = Arc::new(RegistryClient::new(
            host,
            credentials.cloned(),
            trust,
            self.settings,
        )?);

        let tag = match &reference.version {
            Some(ModuleVersion::Tag(tag)) => tag.clone(),
            // The parser only ever attaches tags to OCI references.
            Some(other) => {
                return Err(Error::invalid_reference(
                    reference.coordinate(),
                    format!("'{}' is not an OCI tag", other.as_str()),
                ));
            }
            None => self.latest_tag(&client, repo).await?,
        };

        let (manifest, digest) = client.manifest(repo, &tag).await?;
        debug!(coordinate = %reference.coordinate(), tag, digest, "resolved manifest");

        // Keyed by the resolved digest, never the floating tag: a retagged
        // upstream artifact can never serve stale bytes for a new tag, while
        // a recurring digest is reused without transfer.
        let key = CacheKey::new(Scheme::Oci, &reference.location, &digest);
        if let Some(dir) = self.cache.lookup(&key) {
            return Ok(dir);
        }

        let _lock = self
            .cache
            .lock(&key, Duration::from_secs(self.settings.timeout_secs))?;
        // A concurrent invocation may have published while we waited.
        if let Some(dir) = self.cache.lookup(&key) {
            return Ok(dir);
        }

        let coordinate = reference.coordinate();
        let layers = self
            .download_layers(client, repo, &manifest, &coordinate)
            .await?;

        let entry = CacheEntry::new(Scheme::Oci, &reference.location, &digest);
        let dir = self.publish_layers(&key, &entry, &layers, &coordinate)?;
        info!(coordinate = %coordinate, digest, "fetched OCI artifact");
        Ok(dir)
    }

    /// Verify every downloaded layer against its manifest-declared digest,
    /// then extract into a staging directory and publish under `key`.
    ///
    /// Verification of all layers completes before extraction starts, and
    /// extraction targets staging: the cache only ever receives fully
    /// verified content, so a mismatch leaves no entry behind.
    pub fn publish_layers(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        layers: &[(Descriptor, Vec<u8>)],
        coordinate: &str,
    ) -> Result<PathBuf> {
        for (descriptor, bytes) in layers {
            verify_descriptor(descriptor, bytes, coordinate)?;
        }

        let stage = self.cache.stage_dir()?;
        let content = stage.path().join("pkg");
        std::fs::create_dir_all(&content).map_err(|e| {
            Error::io(
                format!("failed to create staging directory {}", content.display()),
                e,
            )
        })?;
        for (descriptor, bytes) in layers {
            extract_layer(&descriptor.media_type, bytes, &content)?;
        }
        let content = collapse_single_dir(content);

        self.cache.publish(key, entry, &content)
    }

    /// Resolve an unversioned reference to the highest semver tag, falling
    /// back to the registry's `latest` convention.
    async fn latest_tag(&self, client: &RegistryClient, repo: &str) -> Result<String> {
        let tags = client.tags(repo).await?;
        Ok(pick_latest_tag(&tags))
    }

    /// Download all layers of one artifact with bounded concurrency. Joins
    /// every transfer before returning.
    async fn download_layers(
        &self,
        client: Arc<RegistryClient>,
        repo: &str,
        manifest: &Manifest,
        coordinate: &str,
    ) -> Result<Vec<(Descriptor, Vec<u8>)>> {
        let concurrency = self.settings.layer_concurrency.max(1);
        let mut layers: Vec<Option<(Descriptor, Vec<u8>)>> = Vec::new();
        layers.resize_with(manifest.layers.len(), || None);

        let indexed: Vec<(usize, Descriptor)> =
            manifest.layers.iter().cloned().enumerate().collect();

        for batch in indexed.chunks(concurrency) {
            let mut set = JoinSet::new();
            for (index, descriptor) in batch.iter().cloned() {
                let client = client.clone();
                let repo = repo.to_string();
                set.spawn(async move {
                    let bytes = client.blob(&repo, &descriptor.digest).await?;
                    Ok::<_, Error>((index, descriptor, bytes))
                });
            }

            while let Some(joined) = set.join_next().await {
                let (index, descriptor, bytes) = joined.map_err(|e| Error::Network {
                    coordinate: coordinate.to_string(),
                    message: format!("layer download task failed: {e}"),
                })??;
                debug!(digest = descriptor.digest, bytes = bytes.len(), "layer downloaded");
                layers[index] = Some((descriptor, bytes));
            }
        }

        // All slots filled: every batch joined completely above.
        Ok(layers.into_iter().flatten().collect())
    }
}

/// Pick the default tag for an unversioned reference: the highest
/// semver-parseable tag, or the literal `latest` when nothing parses.
fn pick_latest_tag(tags: &[String]) -> String {
    tags.iter()
        .filter_map(|t| semver::Version::parse(t).ok().map(|v| (v, t)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, t)| t.clone())
        .unwrap_or_else(|| "latest".to_string())
}

/// Split `host/repo` out of an OCI location.
fn split_location(reference: &ModuleReference) -> Result<(&str, &str)> {
    reference.location.split_once('/').ok_or_else(|| {
        Error::invalid_reference(
            &reference.location,
            "an OCI reference needs the form host/repository",
        )
    })
}

/// Descend through wrapper directories: some packagers archive the package
/// under a single top-level directory.
fn collapse_single_dir(mut root: PathBuf) -> PathBuf {
    loop {
        let mut entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries.flatten(),
            Err(_) => return root,
        };
        let (first, second) = (entries.next(), entries.next());
        match (first, second) {
            (Some(only), None) if only.path().is_dir() => root = only.path(),
            _ => return root,
        }
    }
}
