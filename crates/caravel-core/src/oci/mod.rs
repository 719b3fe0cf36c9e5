//! OCI distribution protocol support: manifest types, digest verification,
//! layer extraction, registry client, and the artifact fetcher.

mod client;
mod fetcher;

pub use client::RegistryClient;
pub use fetcher::OciFetcher;

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Error, Result};

/// Accept header offered for manifest requests.
pub(crate) const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// A content-addressed reference to one blob in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced blob.
    pub media_type: String,
    /// Declared content digest (`sha256:<hex>`).
    pub digest: String,
    /// Blob size in bytes, when declared.
    pub size: Option<u64>,
}

/// An OCI image manifest: a config blob plus ordered content layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Response body of the tags listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TagList {
    #[allow(dead_code)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Verify downloaded bytes against their manifest-declared digest.
///
/// Mandatory for every layer, independent of any TLS trust setting.
pub fn verify_descriptor(descriptor: &Descriptor, bytes: &[u8], coordinate: &str) -> Result<()> {
    let actual = sha256_digest(bytes);
    if descriptor.digest.eq_ignore_ascii_case(&actual) {
        Ok(())
    } else {
        Err(Error::Integrity {
            coordinate: coordinate.to_string(),
            expected: descriptor.digest.clone(),
            actual,
        })
    }
}

/// Unpack one verified layer into `dest`.
///
/// Handles plain tar and gzip-compressed tar layers; anything else is
/// skipped with a warning (config blobs never reach here).
pub fn extract_layer(media_type: &str, bytes: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| {
        Error::io(format!("failed to create extract directory {}", dest.display()), e)
    })?;

    if media_type.contains("gzip") || media_type.ends_with("+tgz") {
        let decoder = flate2::read::GzDecoder::new(bytes);
        tar::Archive::new(decoder)
            .unpack(dest)
            .map_err(|e| Error::io(format!("failed to unpack gzip layer into {}", dest.display()), e))
    } else if media_type.contains("tar") {
        tar::Archive::new(bytes)
            .unpack(dest)
            .map_err(|e| Error::io(format!("failed to unpack tar layer into {}", dest.display()), e))
    } else {
        warn!(media_type, "skipping layer with unrecognized media type");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_digest_matches_known_vector() {
        // Well-known digest of the empty input.
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn verify_descriptor_accepts_matching_content() {
        let bytes = b"layer content";
        let descriptor = Descriptor {
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
            digest: sha256_digest(bytes),
            size: Some(bytes.len() as u64),
        };
        verify_descriptor(&descriptor, bytes, "oci://example.test/pkg").unwrap();
    }

    #[test]
    fn verify_descriptor_rejects_mismatch() {
        let descriptor = Descriptor {
            media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
            digest: sha256_digest(b"expected content"),
            size: None,
        };
        let err = verify_descriptor(&descriptor, b"tampered content", "oci://example.test/pkg")
            .unwrap_err();
        match err {
            Error::Integrity { expected, actual, .. } => {
                assert_ne!(expected, actual);
            }
            other => panic!("expected Integrity error, got {other:?}"),
        }
    }

    #[test]
    fn manifest_parses_registry_json() {
        let raw = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:aaaa",
                "size": 2
            },
            "layers": [
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar",
                    "digest": "sha256:bbbb",
                    "size": 1024
                }
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].digest, "sha256:bbbb");
    }
}
