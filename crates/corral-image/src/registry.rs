//! Registry pulls over the distribution HTTP API.
//!
//! Flow: fetch an anonymous pull token, fetch the manifest (resolving a
//! manifest list to the host platform), then download, verify, and apply
//! each layer blob in order.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_common::config::RegistryConfig;
use corral_common::constants::MAX_IMAGE_LAYERS;
use corral_common::error::{CorralError, Result};
use corral_common::types::Sha256Hash;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;

use crate::manifest::{self, ACCEPTED_MEDIA_TYPES, Descriptor, Manifest};
use crate::reference::ImageReference;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Token endpoint response. Registries use either field name.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Blocking client for one registry.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: Client,
    config: RegistryConfig,
}

impl RegistryClient {
    /// Builds a client for the given endpoints.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Registry` if the HTTP client cannot be built.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("corral/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(registry_err("building HTTP client"))?;
        Ok(Self { http, config })
    }

    /// Pulls `reference` and applies its layers onto `destination`.
    ///
    /// # Errors
    ///
    /// Fails on any auth, manifest, blob, digest, or extraction error.
    pub fn pull(&self, reference: &ImageReference, destination: &Path) -> Result<()> {
        tracing::info!(image = %reference, destination = %destination.display(), "pulling image");
        let token = self.fetch_token(&reference.repository)?;
        let layers = self.resolve_layers(reference, token.as_deref())?;

        for (index, layer) in layers.iter().enumerate() {
            let digest = Sha256Hash::from_digest(&layer.digest)?;
            let blob_path = destination.join(format!(".corral-layer-{index}.tar"));
            let applied = self
                .download_blob(&reference.repository, &digest, token.as_deref(), &blob_path)
                .and_then(|()| crate::hash::validate_hash(&blob_path, &digest))
                .and_then(|()| crate::layer::apply_layer(&blob_path, destination));
            if let Err(e) = std::fs::remove_file(&blob_path) {
                tracing::debug!(path = %blob_path.display(), error = %e, "layer blob not removed");
            }
            applied?;
            tracing::info!(index, digest = %digest, "layer applied");
        }
        tracing::info!(image = %reference, layers = layers.len(), "image pulled");
        Ok(())
    }

    /// Requests an anonymous pull token for `repository`.
    ///
    /// Returns `None` when no auth endpoint is configured.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Registry` if the endpoint fails or returns no
    /// token.
    pub fn fetch_token(&self, repository: &str) -> Result<Option<String>> {
        if self.config.auth_url.is_empty() {
            return Ok(None);
        }
        let scope = format!("repository:{repository}:pull");
        tracing::debug!(url = %self.config.auth_url, scope = %scope, "requesting pull token");
        let response = self
            .http
            .get(&self.config.auth_url)
            .query(&[("service", self.config.auth_service.as_str()), ("scope", scope.as_str())])
            .send()
            .and_then(Response::error_for_status)
            .map_err(registry_err("requesting pull token"))?;
        let body: TokenResponse = response
            .json()
            .map_err(registry_err("decoding token response"))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .map(Some)
            .ok_or_else(|| CorralError::Registry {
                message: format!("token endpoint returned no token for {repository}"),
            })
    }

    /// Resolves the ordered layer list for `reference` on this host.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Registry` if a manifest cannot be fetched, the
    /// list has no usable entry, or the image has too many layers.
    pub fn resolve_layers(
        &self,
        reference: &ImageReference,
        token: Option<&str>,
    ) -> Result<Vec<Descriptor>> {
        let repository = &reference.repository;
        let layers = match self.fetch_manifest(repository, &reference.reference(), token)? {
            Manifest::Image { layers } => layers,
            Manifest::List { manifests } => {
                let arch = manifest::host_architecture();
                let entry = manifest::select_platform(&manifests, "linux", arch).ok_or_else(
                    || CorralError::Registry {
                        message: format!("manifest list for {reference} is empty"),
                    },
                )?;
                tracing::debug!(digest = %entry.descriptor.digest, arch, "selected platform manifest");
                match self.fetch_manifest(repository, &entry.descriptor.digest, token)? {
                    Manifest::Image { layers } => layers,
                    Manifest::List { .. } => {
                        return Err(CorralError::Registry {
                            message: format!("nested manifest list for {reference}"),
                        });
                    }
                }
            }
        };
        if layers.len() > MAX_IMAGE_LAYERS {
            return Err(CorralError::Registry {
                message: format!(
                    "{reference} has {} layers, more than the {MAX_IMAGE_LAYERS} allowed",
                    layers.len()
                ),
            });
        }
        Ok(layers)
    }

    /// Fetches and parses one manifest by tag or digest.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Registry` on HTTP failure or an undecodable body.
    pub fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
        token: Option<&str>,
    ) -> Result<Manifest> {
        let url = format!(
            "{}/v2/{repository}/manifests/{reference}",
            self.base_url()
        );
        tracing::debug!(url = %url, "fetching manifest");
        let response = authorized(self.http.get(&url), token)
            .header(ACCEPT, ACCEPTED_MEDIA_TYPES.join(", "))
            .send()
            .and_then(Response::error_for_status)
            .map_err(registry_err("fetching manifest"))?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response
            .bytes()
            .map_err(registry_err("reading manifest body"))?;
        Manifest::parse(&body, content_type.as_deref())
    }

    /// Streams one blob to `path`.
    ///
    /// # Errors
    ///
    /// Returns `CorralError::Registry` on HTTP failure, or `CorralError::Io`
    /// if the file cannot be written.
    pub fn download_blob(
        &self,
        repository: &str,
        digest: &Sha256Hash,
        token: Option<&str>,
        path: &Path,
    ) -> Result<()> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.base_url());
        tracing::debug!(url = %url, path = %path.display(), "downloading blob");
        let mut response = authorized(self.http.get(&url), token)
            .send()
            .and_then(Response::error_for_status)
            .map_err(registry_err("downloading blob"))?;

        let io_err = |e| CorralError::Io {
            path: PathBuf::from(path),
            source: e,
        };
        let mut file = std::fs::File::create(path).map_err(io_err)?;
        response
            .copy_to(&mut file)
            .map_err(registry_err("streaming blob"))?;
        file.flush().map_err(io_err)?;
        Ok(())
    }

    fn base_url(&self) -> &str {
        self.config.registry_url.trim_end_matches('/')
    }
}

fn authorized(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
        None => request,
    }
}

fn registry_err(action: &'static str) -> impl FnOnce(reqwest::Error) -> CorralError {
    move |e| CorralError::Registry {
        message: format!("{action}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    use sha2::{Digest, Sha256};

    use super::*;
    use crate::reference::Selector;

    struct Route {
        content_type: &'static str,
        body: Vec<u8>,
    }

    /// Minimal HTTP/1.1 server answering fixed routes; records request paths.
    fn serve(routes: HashMap<String, Route>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                let mut auth = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    if line.to_ascii_lowercase().starts_with("authorization:") {
                        auth = line.trim().to_owned();
                    }
                }
                let target = request_line.split_whitespace().nth(1).unwrap_or("/").to_owned();
                let path = target.split('?').next().unwrap_or("/").to_owned();
                log.lock().expect("lock").push(format!("{path} {auth}"));
                let (status, content_type, body) = routes.get(&path).map_or(
                    ("404 Not Found", "text/plain", b"missing".to_vec()),
                    |r| ("200 OK", r.content_type, r.body.clone()),
                );
                let head = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        (base, seen)
    }

    fn layer_tar(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).expect("append");
        builder.into_inner().expect("finish")
    }

    fn digest_of(bytes: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(bytes))
    }

    fn client(base: &str) -> RegistryClient {
        RegistryClient::new(RegistryConfig {
            auth_url: format!("{base}/token"),
            auth_service: "test.registry".into(),
            registry_url: base.to_owned(),
        })
        .expect("client")
    }

    fn reference(tag: &str) -> ImageReference {
        ImageReference {
            repository: "library/tiny".into(),
            selector: Selector::Tag(tag.into()),
        }
    }

    fn image_manifest(layers: &[&[u8]]) -> Vec<u8> {
        let entries: Vec<_> = layers
            .iter()
            .map(|l| {
                serde_json::json!({
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar",
                    "digest": digest_of(l),
                    "size": l.len(),
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": manifest::DOCKER_MANIFEST_V2,
            "layers": entries,
        }))
        .expect("json")
    }

    fn token_route() -> (String, Route) {
        (
            "/token".into(),
            Route {
                content_type: "application/json",
                body: br#"{"token":"t0k"}"#.to_vec(),
            },
        )
    }

    #[test]
    fn pull_applies_layers_in_order_through_manifest_list() {
        let lower = layer_tar("etc/motd", b"lower");
        let upper = layer_tar("etc/motd", b"upper");
        let image = image_manifest(&[lower.as_slice(), upper.as_slice()]);
        let image_digest = digest_of(&image);
        let list = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": manifest::OCI_INDEX,
            "manifests": [{
                "mediaType": manifest::DOCKER_MANIFEST_V2,
                "digest": image_digest,
                "size": image.len(),
                "platform": {"os": "linux", "architecture": manifest::host_architecture()},
            }],
        }))
        .expect("json");

        let mut routes = HashMap::from([token_route()]);
        let _ = routes.insert(
            "/v2/library/tiny/manifests/latest".into(),
            Route { content_type: manifest::OCI_INDEX, body: list },
        );
        let _ = routes.insert(
            format!("/v2/library/tiny/manifests/{image_digest}"),
            Route { content_type: manifest::DOCKER_MANIFEST_V2, body: image },
        );
        for blob in [&lower, &upper] {
            let _ = routes.insert(
                format!("/v2/library/tiny/blobs/{}", digest_of(blob)),
                Route { content_type: "application/octet-stream", body: blob.clone() },
            );
        }
        let (base, seen) = serve(routes);

        let dest = tempfile::tempdir().expect("tempdir");
        client(&base).pull(&reference("latest"), dest.path()).expect("pull");

        assert_eq!(
            std::fs::read_to_string(dest.path().join("etc/motd")).expect("read"),
            "upper"
        );
        let leftovers: Vec<_> = std::fs::read_dir(dest.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".corral-layer"))
            .collect();
        assert!(leftovers.is_empty());

        let seen = seen.lock().expect("lock");
        assert!(seen[0].starts_with("/token"));
        assert!(
            seen[1..]
                .iter()
                .all(|r| r.to_ascii_lowercase().ends_with("authorization: bearer t0k"))
        );
    }

    #[test]
    fn tampered_blob_fails_digest_check() {
        let real = layer_tar("bin/tool", b"real");
        let image = image_manifest(&[real.as_slice()]);
        let mut routes = HashMap::from([token_route()]);
        let _ = routes.insert(
            "/v2/library/tiny/manifests/latest".into(),
            Route { content_type: manifest::DOCKER_MANIFEST_V2, body: image },
        );
        let _ = routes.insert(
            format!("/v2/library/tiny/blobs/{}", digest_of(&real)),
            Route {
                content_type: "application/octet-stream",
                body: layer_tar("bin/tool", b"evil"),
            },
        );
        let (base, _) = serve(routes);

        let dest = tempfile::tempdir().expect("tempdir");
        let err = client(&base)
            .pull(&reference("latest"), dest.path())
            .unwrap_err();
        assert!(matches!(err, CorralError::HashMismatch { .. }));
        assert!(!dest.path().join("bin/tool").exists());
    }

    #[test]
    fn missing_manifest_is_registry_error() {
        let (base, _) = serve(HashMap::from([token_route()]));
        let dest = tempfile::tempdir().expect("tempdir");
        let err = client(&base)
            .pull(&reference("nope"), dest.path())
            .unwrap_err();
        assert!(matches!(err, CorralError::Registry { .. }));
    }

    #[test]
    fn failing_token_endpoint_is_registry_error() {
        let (base, _) = serve(HashMap::new());
        let err = client(&base).fetch_token("library/tiny").unwrap_err();
        assert!(matches!(err, CorralError::Registry { .. }));
    }

    #[test]
    fn empty_auth_url_skips_token() {
        let client = RegistryClient::new(RegistryConfig {
            auth_url: String::new(),
            ..RegistryConfig::default()
        })
        .expect("client");
        assert!(client.fetch_token("library/tiny").expect("token").is_none());
    }
}
