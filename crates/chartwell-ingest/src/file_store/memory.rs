//! Process-local file store used by tests and the `memory` backend

use async_trait::async_trait;
use bytes::Bytes;
use chartwell_common::{FileReference, TenantId};
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::{build_upload_key, drain_chunks, history_prefix, ByteChunks, FileStore, FileStream, UploadMetadata};
use crate::connector::ConnectorKind;
use crate::error::{IngestError, Result};

struct StoredObject {
    data: Bytes,
    metadata: UploadMetadata,
}

/// Reader that reports when it is dropped
struct TrackedReader {
    inner: Cursor<Bytes>,
    released: Arc<AtomicUsize>,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory [`FileStore`]
///
/// Counts opened and released streams so callers can check that a job let go
/// of its file handle. [`MemoryFileStore::set_available`] simulates an outage.
#[derive(Default)]
pub struct MemoryFileStore {
    objects: RwLock<BTreeMap<FileReference, StoredObject>>,
    unavailable: AtomicBool,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Streams handed out so far
    pub fn streams_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Streams dropped so far
    pub fn streams_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.streams_opened().saturating_sub(self.streams_released())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(IngestError::StorageUnavailable("in-memory file store is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    #[instrument(skip(self, content))]
    async fn upload(
        &self,
        tenant: &TenantId,
        content: ByteChunks,
        file_name: &str,
    ) -> Result<FileReference> {
        self.ensure_available()?;

        let (data, checksum) = drain_chunks(content).await?;
        let reference = build_upload_key(tenant, file_name)?;

        let metadata = UploadMetadata {
            reference: reference.clone(),
            tenant_id: tenant.clone(),
            connector_kind: ConnectorKind::from_file_name(reference.file_name()),
            file_name: reference.file_name().to_string(),
            size_bytes: data.len() as u64,
            checksum_sha256: checksum,
            uploaded_at: Utc::now(),
        };

        debug!("Stored {} bytes at {}", data.len(), reference);

        self.objects
            .write()
            .await
            .insert(reference.clone(), StoredObject { data, metadata });

        Ok(reference)
    }

    async fn stream(&self, reference: &FileReference) -> Result<FileStream> {
        self.ensure_available()?;

        let objects = self.objects.read().await;
        let object = objects
            .get(reference)
            .ok_or_else(|| IngestError::NotFound(reference.to_string()))?;

        self.opened.fetch_add(1, Ordering::SeqCst);
        let reader = TrackedReader {
            inner: Cursor::new(object.data.clone()),
            released: Arc::clone(&self.released),
        };

        Ok(FileStream::new(reference.clone(), reader))
    }

    async fn history(
        &self,
        tenant: &TenantId,
        kind: ConnectorKind,
    ) -> Result<BTreeMap<FileReference, UploadMetadata>> {
        self.ensure_available()?;

        let prefix = history_prefix(tenant, kind);
        let objects = self.objects.read().await;

        Ok(objects
            .iter()
            .filter(|(reference, _)| reference.as_str().starts_with(&prefix))
            .map(|(reference, object)| (reference.clone(), object.metadata.clone()))
            .collect())
    }

    async fn delete(&self, reference: &FileReference) -> Result<()> {
        self.ensure_available()?;

        self.objects
            .write()
            .await
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| IngestError::NotFound(reference.to_string()))
    }
}
