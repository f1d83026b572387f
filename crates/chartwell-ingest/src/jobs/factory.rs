//! Builds the import job matching a source's connector kind

use chartwell_common::FileReference;
use std::sync::Arc;
use tracing::debug;

use super::{DelimitedOptions, ImportJob};
use crate::config::PipelineConfig;
use crate::connector::ConnectorKind;
use crate::error::Result;
use crate::file_store::FileStore;
use crate::gateway::RelationalStore;
use crate::sources::Source;

/// Hands every job the shared file store and gateway handles
#[derive(Clone)]
pub struct ProcessingTaskFactory {
    files: Arc<dyn FileStore>,
    store: Arc<dyn RelationalStore>,
    pipeline: PipelineConfig,
}

impl ProcessingTaskFactory {
    pub fn new(files: Arc<dyn FileStore>, store: Arc<dyn RelationalStore>, pipeline: PipelineConfig) -> Self {
        Self { files, store, pipeline }
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Create a pending job for `file`
    ///
    /// Fails with `UnsupportedConnector` before any job exists when the
    /// source's connector kind has no implementation.
    pub fn create_job(&self, source: &Source, file: FileReference, is_first_import: bool) -> Result<ImportJob> {
        let kind: ConnectorKind = source.connector_kind.parse()?;

        let job = match kind {
            ConnectorKind::DelimitedText => {
                let options =
                    DelimitedOptions::for_connector(&source.connector_kind).with_config(&source.config)?;
                ImportJob::new(
                    source.id.clone(),
                    file,
                    is_first_import,
                    options,
                    self.pipeline.sample_size,
                    self.pipeline.batch_size,
                    Arc::clone(&self.files),
                    Arc::clone(&self.store),
                )
            },
        };

        debug!(job_id = %job.id(), source_id = %source.id, %kind, "Created import job");
        Ok(job)
    }
}
