//! File store adapter
//!
//! Raw uploads live in a distributed file store keyed by tenant. Jobs only
//! ever read through [`FileStore::stream`]; history is for audit display.
//!
//! Keys follow `uploads/<tenant>/<kind>/<uuid>/<file name>`, where `<kind>` is
//! derived from the file extension (`raw` when no connector claims it).

use async_trait::async_trait;
use bytes::Bytes;
use chartwell_common::checksum::StreamingChecksum;
use chartwell_common::{FileReference, TenantId};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use uuid::Uuid;

use crate::connector::ConnectorKind;
use crate::error::{IngestError, Result};

pub mod memory;
pub mod s3;

pub use memory::MemoryFileStore;
pub use s3::{S3Config, S3FileStore};

/// Root prefix of every uploaded object
pub const UPLOAD_PREFIX: &str = "uploads";

/// Kind segment for files no connector recognizes
pub const RAW_SEGMENT: &str = "raw";

/// Chunked upload body
pub type ByteChunks = BoxStream<'static, std::io::Result<Bytes>>;

/// Wrap an in-memory buffer as an upload body
pub fn chunks_from_bytes(data: impl Into<Bytes>) -> ByteChunks {
    let data = data.into();
    stream::once(async move { Ok(data) }).boxed()
}

/// Audit record kept for every upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub reference: FileReference,
    pub tenant_id: TenantId,
    pub connector_kind: Option<ConnectorKind>,
    pub file_name: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Forward-only byte sequence over one stored file
///
/// Every call to [`FileStore::stream`] yields a fresh `FileStream` positioned at
/// byte zero. Dropping it releases the underlying handle.
pub struct FileStream {
    reference: FileReference,
    reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl FileStream {
    pub fn new(reference: FileReference, reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            reference,
            reader: Box::pin(reader),
        }
    }

    pub fn reference(&self) -> &FileReference {
        &self.reference
    }

    /// Drain the remaining bytes
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.reader
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| IngestError::StorageUnavailable(format!("{}: {}", self.reference, e)))?;
        Ok(buffer)
    }
}

impl AsyncRead for FileStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.reader.as_mut().poll_read(cx, buf)
    }
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

/// Upload and stream access to the distributed file store
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist `content` under a tenant-scoped key
    async fn upload(
        &self,
        tenant: &TenantId,
        content: ByteChunks,
        file_name: &str,
    ) -> Result<FileReference>;

    /// Open the file from byte zero; `NotFound` for unknown references
    async fn stream(&self, reference: &FileReference) -> Result<FileStream>;

    /// Uploads of one tenant for one connector kind
    async fn history(
        &self,
        tenant: &TenantId,
        kind: ConnectorKind,
    ) -> Result<BTreeMap<FileReference, UploadMetadata>>;

    async fn delete(&self, reference: &FileReference) -> Result<()>;

    /// Whole-object read
    async fn download(&self, reference: &FileReference) -> Result<Vec<u8>> {
        self.stream(reference).await?.read_to_end().await
    }
}

/// Buffer an upload body, fingerprinting it on the way
pub(crate) async fn drain_chunks(mut content: ByteChunks) -> Result<(Bytes, String)> {
    let mut checksum = StreamingChecksum::new();
    let mut buffer = Vec::new();

    while let Some(chunk) = content.next().await {
        let chunk = chunk.map_err(|e| IngestError::Common(e.into()))?;
        checksum.update(&chunk);
        buffer.extend_from_slice(&chunk);
    }

    Ok((Bytes::from(buffer), checksum.finish()))
}

fn kind_segment(kind: Option<ConnectorKind>) -> &'static str {
    kind.map(|k| k.storage_segment()).unwrap_or(RAW_SEGMENT)
}

fn sanitize_file_name(file_name: &str) -> String {
    let cleaned: String = file_name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Allocate a fresh key for an upload
pub fn build_upload_key(tenant: &TenantId, file_name: &str) -> Result<FileReference> {
    let file_name = sanitize_file_name(file_name);
    let kind = ConnectorKind::from_file_name(&file_name);
    let key = format!(
        "{}/{}/{}/{}/{}",
        UPLOAD_PREFIX,
        tenant,
        kind_segment(kind),
        Uuid::new_v4(),
        file_name
    );
    Ok(FileReference::new(key)?)
}

/// Key prefix under which `history` looks
pub fn history_prefix(tenant: &TenantId, kind: ConnectorKind) -> String {
    format!("{}/{}/{}/", UPLOAD_PREFIX, tenant, kind.storage_segment())
}
