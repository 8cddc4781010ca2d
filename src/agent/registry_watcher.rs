use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;

use crate::agent::compose::ComposeSpec;
use crate::agent::errors::{AgentError, Result};
use crate::agent::retry::{with_retry, RetryPolicy};
use crate::agent::settings::RegistrySettings;
use crate::agent::subtask::{ChangeMap, SubTask};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// An image reference split into the parts the registry v2 API needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageReference {
    /// Splits `registry.example.com/org/app:tag` into its components.
    /// A first segment without a dot, colon or `localhost` is part of the
    /// repository and the image lives on Docker Hub.
    pub fn parse(image: &str) -> Self {
        let (remainder, reference) = match image.rsplit_once(':') {
            // a colon after a slash is a port, not a tag separator
            Some((head, tail)) if !tail.contains('/') => (head, tail.to_string()),
            _ => (image, "latest".to_string()),
        };

        match remainder.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                Self {
                    registry: first.to_string(),
                    repository: rest.to_string(),
                    reference,
                }
            }
            _ => {
                let repository = if remainder.contains('/') {
                    remainder.to_string()
                } else {
                    format!("library/{remainder}")
                };
                Self {
                    registry: DOCKER_HUB_REGISTRY.to_string(),
                    repository,
                    reference,
                }
            }
        }
    }

    fn manifest_url(&self) -> String {
        // loopback registries speak plain http, like the docker daemon assumes
        let scheme = if self.registry.starts_with("localhost") || self.registry.starts_with("127.0.0.1")
        {
            "http"
        } else {
            "https"
        };
        format!(
            "{scheme}://{}/v2/{}/manifests/{}",
            self.registry, self.repository, self.reference
        )
    }
}

struct WatchedImage {
    image: String,
    /// Manifest digest recorded at init; `None` when the image was not yet
    /// pushed to its registry at that time.
    digest: Option<String>,
}

/// Watches the manifest digests of every image referenced by the current
/// stack descriptor. Rebuilt from the fresh descriptor after each deploy,
/// so the recorded digests always describe what is running.
pub struct RegistryWatcher {
    registries: Vec<RegistrySettings>,
    images: Vec<WatchedImage>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl RegistryWatcher {
    pub fn new(registries: &[RegistrySettings], stack: &ComposeSpec) -> Result<Self> {
        let images = stack
            .image_references()?
            .into_iter()
            .map(|image| WatchedImage {
                image,
                digest: None,
            })
            .collect();
        Ok(Self {
            registries: registries.to_vec(),
            images,
            client: reqwest::Client::new(),
            retry: RetryPolicy::watcher(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn credentials_for(&self, registry: &str) -> Option<&RegistrySettings> {
        self.registries.iter().find(|r| {
            r.url == registry
                || r.url
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    == registry
        })
    }

    /// Resolve the current manifest digest of an image. `Ok(None)` means the
    /// registry does not know the image (yet).
    async fn fetch_digest(&self, image: &str) -> Result<Option<String>> {
        let parsed = ImageReference::parse(image);
        let mut request = self
            .client
            .head(parsed.manifest_url())
            .header(ACCEPT, MANIFEST_ACCEPT);
        if let Some(creds) = self.credentials_for(&parsed.registry) {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        match response.status() {
            // only a definite 404 counts as absence; an auth failure on an
            // image that resolved before must not look like it vanished
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let digest = response
                    .headers()
                    .get("docker-content-digest")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
                    .ok_or_else(|| AgentError::UnexpectedResponse {
                        status: status.as_u16(),
                        url: parsed.manifest_url(),
                        body: "missing Docker-Content-Digest header".to_string(),
                    })?;
                Ok(Some(digest))
            }
            status => Err(AgentError::UnexpectedResponse {
                status: status.as_u16(),
                url: parsed.manifest_url(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn check_images(&self) -> Result<ChangeMap> {
        let mut changes = ChangeMap::new();
        for watched in &self.images {
            match self.fetch_digest(&watched.image).await {
                Ok(current) => {
                    if current != watched.digest {
                        info!(
                            "docker image {} signature changed from {:?} to {:?}",
                            watched.image, watched.digest, current
                        );
                        changes.insert(
                            watched.image.clone(),
                            format!(
                                "docker image {} signature changed from {:?} to {:?}",
                                watched.image, watched.digest, current
                            ),
                        );
                    }
                }
                Err(e) if watched.digest.is_some() => {
                    // the image resolved before, something is off with the
                    // registry or the configuration
                    warn!(
                        "error while retrieving image {} in registry: {e}",
                        watched.image
                    );
                }
                Err(_) => {
                    warn!(
                        "docker image {} is still not available in the registry",
                        watched.image
                    );
                }
            }
        }
        Ok(changes)
    }
}

#[async_trait]
impl SubTask for RegistryWatcher {
    fn name(&self) -> &str {
        "docker registry watcher"
    }

    async fn init(&mut self) -> Result<ChangeMap> {
        info!("initializing docker registry watcher...");
        for index in 0..self.images.len() {
            let image = self.images[index].image.clone();
            let digest = match self.fetch_digest(&image).await {
                Ok(Some(digest)) => {
                    debug!("successfully accessed image {image}: {digest}");
                    Some(digest)
                }
                Ok(None) => {
                    warn!("could not find image {image}, maybe it was newly added to the stack?");
                    None
                }
                Err(e) => {
                    warn!("could not access image {image}: {e}");
                    None
                }
            };
            self.images[index].digest = digest;
        }
        info!("docker registry watcher initialized");
        Ok(ChangeMap::new())
    }

    async fn check_for_changes(&mut self) -> Result<ChangeMap> {
        with_retry(&self.retry, "registry check", || self.check_images()).await
    }

    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}
