//! S3-compatible file store (AWS S3 or MinIO)

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::Region,
    error::DisplayErrorContext,
    primitives::{ByteStream, DateTime as S3DateTime},
    Client,
};
use chartwell_common::{FileReference, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use tracing::{debug, info, instrument};

use super::{build_upload_key, drain_chunks, history_prefix, ByteChunks, FileStore, FileStream, UploadMetadata};
use crate::connector::ConnectorKind;
use crate::error::{IngestError, Result};

const META_TENANT: &str = "tenant-id";
const META_FILE_NAME: &str = "file-name";
const META_CHECKSUM: &str = "sha256";
const META_UPLOADED_AT: &str = "uploaded-at";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: "chartwell-uploads".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: false,
        }
    }
}

impl S3Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|v| !v.is_empty()),
            region: env::var("S3_REGION").unwrap_or(defaults.region),
            bucket: env::var("S3_BUCKET").unwrap_or(defaults.bucket),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or(defaults.access_key),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or(defaults.secret_key),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            path_style: true,
            ..Self::default()
        }
    }
}

fn unavailable<E>(what: &str, err: E) -> IngestError
where
    E: std::error::Error,
{
    IngestError::StorageUnavailable(format!("{}: {}", what, DisplayErrorContext(err)))
}

fn to_chrono(value: Option<&S3DateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

/// [`FileStore`] over one S3 bucket
#[derive(Clone)]
pub struct S3FileStore {
    client: Client,
    bucket: String,
}

impl S3FileStore {
    pub async fn new(config: S3Config) -> Result<Self> {
        debug!(
            "Initializing S3 file store (endpoint: {:?}, bucket: {})",
            config.endpoint, config.bucket
        );

        let region = Region::new(config.region.clone());

        // Without static keys, fall back to the standard AWS credential chain.
        let mut builder = if config.access_key.is_empty() {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        } else {
            let credentials = Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "chartwell-file-store",
            );
            aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(credentials)
                .region(region)
        };

        builder = builder.force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!("S3 file store initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self))]
    async fn head(&self, reference: &FileReference, tenant: &TenantId) -> Result<UploadMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(reference.as_str())
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_not_found()) {
                    IngestError::NotFound(reference.to_string())
                } else {
                    unavailable("Failed to read object metadata", e)
                }
            })?;

        let empty = HashMap::new();
        let user_metadata = response.metadata().unwrap_or(&empty);
        let file_name = user_metadata
            .get(META_FILE_NAME)
            .cloned()
            .unwrap_or_else(|| reference.file_name().to_string());

        let uploaded_at = user_metadata
            .get(META_UPLOADED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .or_else(|| to_chrono(response.last_modified()))
            .unwrap_or_else(Utc::now);

        Ok(UploadMetadata {
            reference: reference.clone(),
            tenant_id: tenant.clone(),
            connector_kind: ConnectorKind::from_file_name(&file_name),
            file_name,
            size_bytes: response.content_length().unwrap_or(0).max(0) as u64,
            checksum_sha256: user_metadata.get(META_CHECKSUM).cloned().unwrap_or_default(),
            uploaded_at,
        })
    }
}

#[async_trait]
impl FileStore for S3FileStore {
    #[instrument(skip(self, content))]
    async fn upload(
        &self,
        tenant: &TenantId,
        content: ByteChunks,
        file_name: &str,
    ) -> Result<FileReference> {
        let (data, checksum) = drain_chunks(content).await?;
        let reference = build_upload_key(tenant, file_name)?;
        let size = data.len();

        debug!("Uploading {} bytes to s3://{}/{}", size, self.bucket, reference);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(reference.as_str())
            .content_length(size as i64)
            .metadata(META_TENANT, tenant.as_str())
            .metadata(META_FILE_NAME, reference.file_name())
            .metadata(META_CHECKSUM, checksum)
            .metadata(META_UPLOADED_AT, Utc::now().to_rfc3339())
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| unavailable("Failed to upload to S3", e))?;

        info!("Successfully uploaded to s3://{}/{}", self.bucket, reference);

        Ok(reference)
    }

    #[instrument(skip(self))]
    async fn stream(&self, reference: &FileReference) -> Result<FileStream> {
        debug!("Opening stream on s3://{}/{}", self.bucket, reference);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(reference.as_str())
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    IngestError::NotFound(reference.to_string())
                } else {
                    unavailable("Failed to open S3 object", e)
                }
            })?;

        Ok(FileStream::new(reference.clone(), response.body.into_async_read()))
    }

    #[instrument(skip(self))]
    async fn history(
        &self,
        tenant: &TenantId,
        kind: ConnectorKind,
    ) -> Result<BTreeMap<FileReference, UploadMetadata>> {
        let prefix = history_prefix(tenant, kind);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| unavailable("Failed to list S3 objects", e))?;

            keys.extend(page.contents().iter().filter_map(|o| o.key().map(String::from)));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        debug!("Found {} uploads under s3://{}/{}", keys.len(), self.bucket, prefix);

        let mut history = BTreeMap::new();
        for key in keys {
            let reference = FileReference::new(key)?;
            let metadata = self.head(&reference, tenant).await?;
            history.insert(reference, metadata);
        }

        Ok(history)
    }

    #[instrument(skip(self))]
    async fn delete(&self, reference: &FileReference) -> Result<()> {
        debug!("Deleting s3://{}/{}", self.bucket, reference);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(reference.as_str())
            .send()
            .await
            .map_err(|e| unavailable("Failed to delete from S3", e))?;

        info!("Successfully deleted s3://{}/{}", self.bucket, reference);

        Ok(())
    }
}
