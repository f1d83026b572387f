//! Source registry client
//!
//! Sources are registered and owned by an external service. The pipeline
//! only reads them and records the last successful sync.

use async_trait::async_trait;
use chartwell_common::{SourceId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::config::RequestDefaults;
use crate::error::{IngestError, Result};
use crate::request::{RequestClient, RequestEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Inactive,
    Deleted,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Inactive => "inactive",
            SourceStatus::Deleted => "deleted",
        }
    }

    /// `Active <-> Inactive`, either to `Deleted`; `Deleted` is final
    pub fn can_transition_to(&self, next: SourceStatus) -> bool {
        use SourceStatus::*;
        matches!(
            (self, next),
            (Active, Inactive) | (Inactive, Active) | (Active, Deleted) | (Inactive, Deleted)
        ) || (*self == next && *self != Deleted)
    }
}

/// A registered ingestible data origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub tenant_id: TenantId,
    /// Raw connector kind as registered; parsed by the task factory
    pub connector_kind: String,
    /// Connector settings, opaque outside the connector's own job
    #[serde(default)]
    pub config: serde_json::Value,
    pub status: SourceStatus,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

impl Source {
    pub fn new(id: SourceId, tenant_id: TenantId, connector_kind: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id,
            connector_kind: connector_kind.into(),
            config: serde_json::Value::Null,
            status: SourceStatus::Active,
            starred: false,
            last_sync: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == SourceStatus::Active
    }

    pub fn transition_to(&mut self, next: SourceStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(IngestError::Validation(format!(
                "source {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// `NotFound` when the id is unknown
    async fn get_source(&self, id: &SourceId) -> Result<Source>;

    async fn mark_synced(&self, id: &SourceId, at: DateTime<Utc>) -> Result<()>;
}

/// Registry kept in process memory
#[derive(Default)]
pub struct InMemorySourceRegistry {
    sources: RwLock<HashMap<SourceId, Source>>,
}

impl InMemorySourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, source: Source) {
        self.sources.write().await.insert(source.id.clone(), source);
    }

    pub async fn set_status(&self, id: &SourceId, status: SourceStatus) -> Result<()> {
        let mut sources = self.sources.write().await;
        let source = sources
            .get_mut(id)
            .ok_or_else(|| IngestError::NotFound(format!("source {}", id)))?;
        source.transition_to(status)
    }
}

#[async_trait]
impl SourceRegistry for InMemorySourceRegistry {
    async fn get_source(&self, id: &SourceId) -> Result<Source> {
        self.sources
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(format!("source {}", id)))
    }

    async fn mark_synced(&self, id: &SourceId, at: DateTime<Utc>) -> Result<()> {
        let mut sources = self.sources.write().await;
        let source = sources
            .get_mut(id)
            .ok_or_else(|| IngestError::NotFound(format!("source {}", id)))?;
        source.last_sync = Some(at);
        Ok(())
    }
}

#[derive(Serialize)]
struct LastSyncBody {
    last_sync: DateTime<Utc>,
}

/// Registry reached over HTTP through request envelopes
///
/// `GET <base>/sources/<id>` and `PUT <base>/sources/<id>/last-sync`.
pub struct HttpSourceRegistry {
    base_url: String,
    client: RequestClient,
    defaults: RequestDefaults,
}

impl HttpSourceRegistry {
    pub fn new(base_url: impl Into<String>, client: RequestClient, defaults: RequestDefaults) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            defaults,
        }
    }

    fn source_url(&self, id: &SourceId) -> String {
        format!("{}/sources/{}", self.base_url, id)
    }
}

#[async_trait]
impl SourceRegistry for HttpSourceRegistry {
    #[instrument(skip(self))]
    async fn get_source(&self, id: &SourceId) -> Result<Source> {
        let envelope = RequestEnvelope::get(self.source_url(id)).with_defaults(self.defaults);
        debug!(request_id = envelope.request_id(), "Fetching source");
        self.client.execute_json(&envelope).await
    }

    #[instrument(skip(self))]
    async fn mark_synced(&self, id: &SourceId, at: DateTime<Utc>) -> Result<()> {
        let envelope = RequestEnvelope::put(format!("{}/last-sync", self.source_url(id)))
            .with_defaults(self.defaults)
            .with_json_body(&LastSyncBody { last_sync: at })?;
        self.client.execute(&envelope).await?;
        Ok(())
    }
}
