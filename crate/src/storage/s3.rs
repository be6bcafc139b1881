use super::{object_key, StorageBackend, StorageError, StorageResult};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, StorageClass};
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::info;

pub struct S3StorageBackend {
    client: Client,
    config: S3Config,
    directory: Option<String>,
}

impl S3StorageBackend {
    pub async fn new(config: S3Config, directory: Option<String>) -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(region) = &config.region {
            builder = builder.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "imager-config",
            ));
        }
        let client = Client::from_conf(builder.build());
        info!(bucket = %config.bucket, "Initialized S3 storage");
        Self::from_client(client, config, directory)
    }

    pub fn from_client(client: Client, config: S3Config, directory: Option<String>) -> Self {
        Self {
            client,
            config,
            directory,
        }
    }

    fn object_path(&self, object: &str) -> String {
        object_key(self.directory.as_deref(), object)
    }
}

/// Public base URI objects are served from, derived from the client endpoint.
fn endpoint_uri(config: &S3Config) -> String {
    match (&config.endpoint, &config.region) {
        (Some(endpoint), _) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
        (None, Some(region)) => format!("https://{}.s3.{}.amazonaws.com", config.bucket, region),
        (None, None) => format!("https://{}.s3.amazonaws.com", config.bucket),
    }
}

fn sdk_error<E>(err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err
        .raw_response()
        .map(|response| response.status().as_u16());
    let not_found = err
        .as_service_error()
        .and_then(|service| service.code())
        .is_some_and(|code| code == "NoSuchKey" || code == "NotFound");
    let message = DisplayErrorContext(&err).to_string();
    if not_found {
        StorageError::NotFound(message)
    } else {
        StorageError::client(status, message)
    }
}

#[async_trait]
impl StorageBackend for S3StorageBackend {
    fn name(&self) -> &'static str {
        "s3"
    }

    #[cfg_attr(feature = "instrumentation", tracing::instrument(skip(self)))]
    async fn upload(
        &self,
        local_path: &Path,
        remote_name: &str,
        content_type: &str,
    ) -> StorageResult<Option<String>> {
        let key = self.object_path(remote_name);
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|err| StorageError::Io(err.to_string()))?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(body)
            .content_type(content_type)
            .acl(ObjectCannedAcl::PublicRead);
        if let Some(class) = &self.config.storage_class {
            request = request.storage_class(StorageClass::from(class.as_str()));
        }
        request.send().await.map_err(sdk_error)?;
        info!(bucket = %self.config.bucket, "Uploaded {} to S3", key);
        Ok(Some(remote_name.to_string()))
    }

    #[cfg_attr(feature = "instrumentation", tracing::instrument(skip(self)))]
    async fn remove(&self, remote_name: &str) -> StorageResult<()> {
        let key = self.object_path(remote_name);
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(sdk_error)?;
        info!(bucket = %self.config.bucket, "Removed {} from S3", key);
        Ok(())
    }

    fn base_uri(&self) -> Option<String> {
        Some(endpoint_uri(&self.config))
    }
}
