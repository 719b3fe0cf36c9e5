//! Minimal OCI distribution client: manifest, tags, and blob endpoints with
//! bearer/basic authentication and bounded retry.

use std::time::Duration;

use base64::Engine;
use reqwest::StatusCode;
use reqwest::header;
use tracing::{debug, warn};

use crate::auth::{Credentials, TrustPolicy};
use crate::error::{Error, Result};
use crate::settings::Settings;

use super::{MANIFEST_ACCEPT, Manifest, TagList, sha256_digest};

/// HTTP client bound to one registry host for one operation.
///
/// TLS trust relaxation is scoped here: it never reaches digest
/// verification, which happens on the downloaded bytes regardless.
#[derive(Debug)]
pub struct RegistryClient {
    /// Scheme + host, e.g. `https://ghcr.io`.
    base_url: String,
    /// Host without scheme, used in error coordinates.
    host: String,
    client: reqwest::Client,
    credentials: Option<Credentials>,
    /// Bearer token cached after the first successful auth dance.
    token: tokio::sync::Mutex<Option<String>>,
    timeout_secs: u64,
    retry_attempts: u32,
}

impl RegistryClient {
    /// Build a client for `registry` (a bare host, or a host with an
    /// explicit `http://`/`https://` scheme for local registries).
    pub fn new(
        registry: &str,
        credentials: Option<Credentials>,
        trust: &TrustPolicy,
        settings: &Settings,
    ) -> Result<Self> {
        let (base_url, host) = if let Some(host) = registry.strip_prefix("https://") {
            (registry.trim_end_matches('/').to_string(), host.trim_end_matches('/').to_string())
        } else if let Some(host) = registry.strip_prefix("http://") {
            (registry.trim_end_matches('/').to_string(), host.trim_end_matches('/').to_string())
        } else {
            let host = registry.trim_end_matches('/');
            (format!("https://{host}"), host.to_string())
        };

        let client = reqwest::Client::builder()
            .user_agent(concat!("caravel/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .danger_accept_invalid_certs(trust.skip_tls_verify)
            .build()
            .map_err(|e| Error::Network {
                coordinate: format!("oci://{host}"),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        if trust.skip_tls_verify {
            warn!(host, "TLS certificate verification disabled for this registry");
        }

        Ok(Self {
            base_url,
            host,
            client,
            credentials,
            token: tokio::sync::Mutex::new(None),
            timeout_secs: settings.timeout_secs,
            retry_attempts: settings.retry_attempts.max(1),
        })
    }

    /// Registry host without scheme.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn coordinate(&self, repo: &str) -> String {
        format!("oci://{}/{repo}", self.host)
    }

    /// Validate the supplied credentials against the registry's
    /// authentication endpoint without fetching any artifact.
    pub async fn login(&self) -> Result<()> {
        let url = format!("{}/v2/", self.base_url);
        let coordinate = format!("oci://{}", self.host);
        self.get(&url, None, &coordinate).await?;
        debug!(host = %self.host, "registry accepted credentials");
        Ok(())
    }

    /// Fetch the manifest for `reference` (tag or digest) and return it with
    /// its resolved content digest.
    pub async fn manifest(&self, repo: &str, reference: &str) -> Result<(Manifest, String)> {
        let url = format!("{}/v2/{repo}/manifests/{reference}", self.base_url);
        let coordinate = self.coordinate(repo);
        let response = self.get(&url, Some(MANIFEST_ACCEPT), &coordinate).await?;

        let declared = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await.map_err(|e| Error::Network {
            coordinate: coordinate.clone(),
            message: format!("failed to read manifest body: {e}"),
        })?;

        // The canonical digest is the hash of the manifest bytes; the header
        // is only a cross-check.
        let digest = sha256_digest(&body);
        if let Some(declared) = declared
            && !declared.eq_ignore_ascii_case(&digest)
        {
            return Err(Error::Integrity {
                coordinate,
                expected: declared,
                actual: digest,
            });
        }

        let manifest = serde_json::from_slice(&body).map_err(|e| Error::Network {
            coordinate,
            message: format!("invalid manifest JSON: {e}"),
        })?;
        Ok((manifest, digest))
    }

    /// List the tags published for `repo`.
    pub async fn tags(&self, repo: &str) -> Result<Vec<String>> {
        let url = format!("{}/v2/{repo}/tags/list", self.base_url);
        let coordinate = self.coordinate(repo);
        let response = self.get(&url, None, &coordinate).await?;
        let list: TagList = response.json().await.map_err(|e| Error::Network {
            coordinate,
            message: format!("invalid tag list: {e}"),
        })?;
        Ok(list.tags)
    }

    /// Download one blob by digest.
    pub async fn blob(&self, repo: &str, digest: &str) -> Result<Vec<u8>> {
        let url = format!("{}/v2/{repo}/blobs/{digest}", self.base_url);
        let coordinate = self.coordinate(repo);
        let response = self.get(&url, None, &coordinate).await?;
        let bytes = response.bytes().await.map_err(|e| Error::Network {
            coordinate,
            message: format!("failed to read blob {digest}: {e}"),
        })?;
        Ok(bytes.to_vec())
    }

    /// Authenticated GET with bounded exponential backoff.
    ///
    /// Transient transport failures and 5xx responses are retried; 401/403
    /// surface as authentication errors and other 4xx are terminal.
    async fn get(
        &self,
        url: &str,
        accept: Option<&str>,
        coordinate: &str,
    ) -> Result<reqwest::Response> {
        let mut delay = Duration::from_millis(500);
        let mut last_message = String::new();

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                debug!(url, attempt, "retrying registry request");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            match self.get_once(url, accept).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(Error::Authentication {
                            registry: self.host.clone(),
                        });
                    }
                    if status.is_server_error() {
                        last_message = format!("HTTP {status}");
                        continue;
                    }
                    return Err(Error::Network {
                        coordinate: coordinate.to_string(),
                        message: format!("HTTP {status}"),
                    });
                }
                Err(e) if e.is_timeout() => {
                    return Err(Error::Timeout {
                        coordinate: coordinate.to_string(),
                        seconds: self.timeout_secs,
                    });
                }
                Err(e) if e.is_connect() || e.is_request() => {
                    last_message = e.to_string();
                }
                Err(e) => {
                    return Err(Error::Network {
                        coordinate: coordinate.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(Error::Network {
            coordinate: coordinate.to_string(),
            message: format!(
                "giving up after {} attempts: {last_message}",
                self.retry_attempts
            ),
        })
    }

    /// One request, answering a 401 challenge at most once.
    async fn get_once(
        &self,
        url: &str,
        accept: Option<&str>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let response = self.request(url, accept, None).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(challenge) = challenge else {
            return Ok(response);
        };
        let Some(authorization) = self.answer_challenge(&challenge).await? else {
            return Ok(response);
        };

        self.request(url, accept, Some(&authorization)).await
    }

    async fn request(
        &self,
        url: &str,
        accept: Option<&str>,
        authorization: Option<&str>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }
        match authorization {
            Some(value) => request = request.header(header::AUTHORIZATION, value.to_string()),
            None => {
                if let Some(token) = self.token.lock().await.as_deref() {
                    request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
                }
            }
        }
        request.send().await
    }

    /// Answer a `WWW-Authenticate` challenge, returning the authorization
    /// header value to retry with.
    async fn answer_challenge(
        &self,
        challenge: &str,
    ) -> std::result::Result<Option<String>, reqwest::Error> {
        let (scheme, params) = parse_challenge(challenge);

        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(self.basic_authorization());
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Ok(None);
        }

        let Some(realm) = params.iter().find(|(k, _)| k == "realm").map(|(_, v)| v) else {
            return Ok(None);
        };

        let mut request = self.client.get(realm);
        for (key, value) in &params {
            if key == "service" || key == "scope" {
                request = request.query(&[(key.as_str(), value.as_str())]);
            }
        }
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.secret));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }
        let body: TokenResponse = response.json().await?;
        let Some(token) = body.token.or(body.access_token) else {
            return Ok(None);
        };

        *self.token.lock().await = Some(token.clone());
        Ok(Some(format!("Bearer {token}")))
    }

    fn basic_authorization(&self) -> Option<String> {
        let creds = self.credentials.as_ref()?;
        let raw = format!("{}:{}", creds.username, creds.secret);
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
        Some(format!("Basic {encoded}"))
    }
}

/// Split a `WWW-Authenticate` header into its scheme and `key="value"`
/// parameters.
fn parse_challenge(header: &str) -> (String, Vec<(String, String)>) {
    let header = header.trim();
    let (scheme, rest) = match header.split_once(' ') {
        Some((scheme, rest)) => (scheme.to_string(), rest),
        None => return (header.to_string(), Vec::new()),
    };

    let params = rest
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            Some((key.trim().to_string(), value.trim_matches('"').to_string()))
        })
        .collect();

    (scheme, params)
}
