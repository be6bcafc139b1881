use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Method, StatusCode, Url};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{object_key, ResourceCache, StorageBackend, StorageError, StorageResult};
use crate::config::RackspaceConfig;

const AUTH_TOKEN_HEADER: &str = "x-auth-token";
const SESSION_KEY: &str = "session";

/// CDN endpoints a container publishes once CDN is enabled on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdnUris {
    pub uri: Option<String>,
    pub ssl_uri: Option<String>,
    pub streaming_uri: Option<String>,
    pub ios_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub cdn: Option<CdnUris>,
}

/// Remote calls the CDN container backend needs.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Look up a container; a missing container is a not-found error.
    async fn get_container(&self, name: &str) -> StorageResult<Container>;
    async fn create_container(&self, name: &str) -> StorageResult<()>;
    /// Returns false when the service accepted the request without storing the object.
    async fn upload(
        &self,
        container: &Container,
        remote: &str,
        local_path: &Path,
        content_type: &str,
    ) -> StorageResult<bool>;
    async fn remove_file(&self, container: &Container, remote: &str) -> StorageResult<()>;
}

pub struct RackspaceStorageBackend {
    client: Arc<dyn ContainerClient>,
    container: String,
    directory: Option<String>,
    containers: ResourceCache<Container>,
    cdn: OnceLock<CdnUris>,
}

impl RackspaceStorageBackend {
    pub fn new(client: Arc<dyn ContainerClient>, container: String, directory: Option<String>) -> Self {
        Self {
            client,
            container,
            directory,
            containers: ResourceCache::new(),
            cdn: OnceLock::new(),
        }
    }

    pub fn cdn_uris(&self) -> Option<&CdnUris> {
        self.cdn.get()
    }

    async fn resolve_container(&self) -> StorageResult<Container> {
        let client = self.client.clone();
        let name = self.container.clone();
        let container = self
            .containers
            .get_or_acquire(&self.container, || async move {
                match client.get_container(&name).await {
                    Err(err) if err.is_not_found() => {
                        info!("Creating container {}", name);
                        client.create_container(&name).await?;
                        client.get_container(&name).await
                    }
                    other => other,
                }
            })
            .await?;
        if let Some(cdn) = &container.cdn {
            // First successful resolution wins; later ones carry the same URIs.
            let _ = self.cdn.set(cdn.clone());
        }
        Ok(container)
    }
}

#[async_trait]
impl StorageBackend for RackspaceStorageBackend {
    fn name(&self) -> &'static str {
        "rackspace"
    }

    #[cfg_attr(feature = "instrumentation", tracing::instrument(skip(self)))]
    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        content_type: &str,
    ) -> StorageResult<Option<String>> {
        let container = self.resolve_container().await?;
        let remote = object_key(self.directory.as_deref(), remote_name);
        let stored = self
            .client
            .upload(&container, &remote, local_path, content_type)
            .await?;
        if !stored {
            debug!("Container {} accepted {} without storing it", container.name, remote);
            return Ok(None);
        }
        info!("Uploaded {} to container {}", remote, container.name);
        Ok(Some(remote_name.to_string()))
    }

    #[cfg_attr(feature = "instrumentation", tracing::instrument(skip(self)))]
    async fn remove(&self, remote_name: &str) -> StorageResult<()> {
        let container = self.resolve_container().await?;
        let remote = object_key(self.directory.as_deref(), remote_name);
        match self.client.remove_file(&container, &remote).await {
            Ok(()) => {
                info!("Removed {} from container {}", remote, container.name);
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                info!("{} not found in container {}", remote, container.name);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn base_uri(&self) -> Option<String> {
        self.cdn.get().and_then(|cdn| cdn.uri.clone())
    }
}

/// Which catalog endpoint a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    Storage,
    Cdn,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    storage_url: String,
    cdn_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access: Access,
}

#[derive(Debug, Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct Token {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    #[serde(default)]
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

impl Access {
    fn endpoint(&self, kind: &str, region: Option<&str>) -> Option<String> {
        let entry = self.service_catalog.iter().find(|entry| entry.kind == kind)?;
        let by_region = region.and_then(|region| {
            entry.endpoints.iter().find(|endpoint| {
                endpoint
                    .region
                    .as_deref()
                    .is_some_and(|candidate| candidate.eq_ignore_ascii_case(region))
            })
        });
        by_region
            .or_else(|| entry.endpoints.first())
            .map(|endpoint| endpoint.public_url.clone())
    }
}

/// Cloud Files (OpenStack Swift) client authenticating with an API key.
pub struct CloudFilesClient {
    http: reqwest::Client,
    username: String,
    api_key: String,
    auth_url: String,
    region: Option<String>,
    sessions: ResourceCache<Session>,
}

impl CloudFilesClient {
    pub fn new(config: &RackspaceConfig) -> StorageResult<Self> {
        let auth_url = if config.auth_url.starts_with("http://") || config.auth_url.starts_with("https://") {
            config.auth_url.clone()
        } else {
            format!("https://{}", config.auth_url)
        };
        Url::parse(&auth_url)
            .map_err(|err| StorageError::Configuration(format!("invalid auth url {auth_url}: {err}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            username: config.username.clone(),
            api_key: config.api_key.clone(),
            auth_url,
            region: config.region.clone(),
            sessions: ResourceCache::new(),
        })
    }

    async fn session(&self) -> StorageResult<Session> {
        self.sessions
            .get_or_acquire(SESSION_KEY, || self.authenticate())
            .await
    }

    async fn authenticate(&self) -> StorageResult<Session> {
        let url = format!("{}/v2.0/tokens", self.auth_url.trim_end_matches('/'));
        debug!(url = %url, "Authenticating with Cloud Files");
        let body = serde_json::json!({
            "auth": {
                "RAX-KSKEY:apiKeyCredentials": {
                    "username": self.username,
                    "apiKey": self.api_key,
                }
            }
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::client(
                Some(status.as_u16()),
                format!("authentication failed: {text}"),
            ));
        }
        let auth: AuthResponse = response.json().await.map_err(transport_error)?;
        let region = self.region.as_deref();
        let storage_url = auth
            .access
            .endpoint("object-store", region)
            .ok_or_else(|| StorageError::Configuration("no object-store endpoint in service catalog".to_string()))?;
        let cdn_url = auth.access.endpoint("rax:object-cdn", region);
        info!("Authenticated with Cloud Files as {}", self.username);
        Ok(Session {
            token: auth.access.token.id,
            storage_url,
            cdn_url,
        })
    }

    fn url(base: &str, segments: &[&str]) -> StorageResult<Url> {
        let mut url = Url::parse(base)
            .map_err(|err| StorageError::Configuration(format!("invalid endpoint {base}: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Configuration(format!("endpoint {base} cannot be a base")))?
            .pop_if_empty()
            .extend(segments.iter().flat_map(|segment| segment.split('/')));
        Ok(url)
    }

    /// Issue an authenticated request. A rejected token is dropped from the
    /// session cache and the request is retried once with a fresh one.
    async fn send(
        &self,
        method: Method,
        service: Service,
        segments: &[&str],
        upload: Option<(&Path, &str)>,
    ) -> StorageResult<reqwest::Response> {
        let mut reauthenticated = false;
        loop {
            let session = self.session().await?;
            let base = match service {
                Service::Storage => Some(session.storage_url.as_str()),
                Service::Cdn => session.cdn_url.as_deref(),
            }
            .ok_or_else(|| StorageError::NotFound("no CDN endpoint in service catalog".to_string()))?;
            let url = Self::url(base, segments)?;

            let mut request = self
                .http
                .request(method.clone(), url)
                .header(AUTH_TOKEN_HEADER, &session.token);
            if let Some((local_path, content_type)) = upload {
                let file = tokio::fs::File::open(local_path).await?;
                let length = file.metadata().await?.len();
                request = request
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .header(reqwest::header::CONTENT_LENGTH, length)
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
            }

            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                warn!("Cloud Files rejected the auth token, authenticating again");
                self.sessions
                    .invalidate_if(SESSION_KEY, |cached| cached.token == session.token)
                    .await;
                reauthenticated = true;
                continue;
            }
            let text = response.text().await.unwrap_or_default();
            return Err(StorageError::client(Some(status.as_u16()), text));
        }
    }
}

fn transport_error(err: reqwest::Error) -> StorageError {
    StorageError::client(err.status().map(|status| status.as_u16()), err.to_string())
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

fn cdn_from_headers(headers: &HeaderMap) -> Option<CdnUris> {
    let enabled = header(headers, "x-cdn-enabled").is_some_and(|value| value.eq_ignore_ascii_case("true"));
    if !enabled {
        return None;
    }
    Some(CdnUris {
        uri: header(headers, "x-cdn-uri"),
        ssl_uri: header(headers, "x-cdn-ssl-uri"),
        streaming_uri: header(headers, "x-cdn-streaming-uri"),
        ios_uri: header(headers, "x-cdn-ios-uri"),
    })
}

#[async_trait]
impl ContainerClient for CloudFilesClient {
    async fn get_container(&self, name: &str) -> StorageResult<Container> {
        self.send(Method::HEAD, Service::Storage, &[name], None).await?;

        // Missing CDN endpoint or container not CDN-enabled both mean no CDN URIs.
        let cdn = match self.send(Method::HEAD, Service::Cdn, &[name], None).await {
            Ok(response) => cdn_from_headers(response.headers()),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        Ok(Container {
            name: name.to_string(),
            cdn,
        })
    }

    async fn create_container(&self, name: &str) -> StorageResult<()> {
        self.send(Method::PUT, Service::Storage, &[name], None).await?;
        Ok(())
    }

    async fn upload(
        &self,
        container: &Container,
        remote: &str,
        local_path: &Path,
        content_type: &str,
    ) -> StorageResult<bool> {
        let response = self
            .send(
                Method::PUT,
                Service::Storage,
                &[&container.name, remote],
                Some((local_path, content_type)),
            )
            .await?;
        Ok(response.status() == StatusCode::CREATED)
    }

    async fn remove_file(&self, container: &Container, remote: &str) -> StorageResult<()> {
        self.send(Method::DELETE, Service::Storage, &[&container.name, remote], None)
            .await?;
        Ok(())
    }
}
