//! Import jobs
//!
//! One job turns one uploaded file of one source into rows in that source's
//! table. A job runs `PENDING -> RUNNING -> SUCCEEDED | FAILED` exactly once;
//! a fresh attempt needs a new job.
//!
//! On a first import the job samples the leading rows, infers a
//! [`TableMapping`] and creates the table before writing anything. Otherwise it
//! reads the existing mapping back from the backend catalog. Rows are written
//! in file order, in batches of at most the configured size; batches flushed
//! before a failure stay committed.

use chartwell_common::{FileReference, SourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::file_store::FileStore;
use crate::gateway::{RelationalStore, MAX_BIND_PARAMS};
use crate::schema::{table_name_for, SchemaMapper, TableMapping};

pub mod delimited;
pub mod factory;

pub use delimited::{DelimitedOptions, RowReader};
pub use factory::ProcessingTaskFactory;

/// Lifecycle state of an import job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Transitions only move forward
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub source_id: SourceId,
    pub file: FileReference,
    pub is_first_import: bool,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// [`IngestError::kind`] of the failure
    pub failure_kind: Option<String>,
    pub rows_written: u64,
    pub batches_flushed: u64,
}

impl JobSnapshot {
    fn pending(job_id: Uuid, source_id: SourceId, file: FileReference, is_first_import: bool) -> Self {
        Self {
            job_id,
            source_id,
            file,
            is_first_import,
            state: JobState::Pending,
            started_at: None,
            finished_at: None,
            failure_reason: None,
            failure_kind: None,
            rows_written: 0,
            batches_flushed: 0,
        }
    }
}

/// Rows waiting for the next flush plus where they sit in the file
struct Batcher {
    pending: Vec<Vec<String>>,
    batch_size: usize,
    /// Data rows already flushed, i.e. file index of `pending[0]`
    flushed_rows: usize,
}

impl Batcher {
    /// Lower the batch size so one insert binds at most `MAX_BIND_PARAMS` values
    fn fit_to(&mut self, mapping: &TableMapping) {
        let limit = (MAX_BIND_PARAMS / mapping.len().max(1)).max(1);
        if self.batch_size > limit {
            warn!(
                table = %mapping.table_name,
                columns = mapping.len(),
                configured = self.batch_size,
                batch_size = limit,
                "Lowering batch size to stay within the bind parameter limit"
            );
            self.batch_size = limit;
        }
    }
}

/// Ingests one file for one source
pub struct ImportJob {
    id: Uuid,
    file: FileReference,
    is_first_import: bool,
    options: DelimitedOptions,
    mapper: SchemaMapper,
    batch_size: usize,
    files: Arc<dyn FileStore>,
    store: Arc<dyn RelationalStore>,
    status: watch::Sender<JobSnapshot>,
    cancel: CancellationToken,
}

impl ImportJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: SourceId,
        file: FileReference,
        is_first_import: bool,
        options: DelimitedOptions,
        sample_size: usize,
        batch_size: usize,
        files: Arc<dyn FileStore>,
        store: Arc<dyn RelationalStore>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (status, _) = watch::channel(JobSnapshot::pending(id, source_id, file.clone(), is_first_import));

        Self {
            id,
            file,
            is_first_import,
            options,
            mapper: SchemaMapper::new(sample_size, options.has_header),
            batch_size: batch_size.max(1),
            files,
            store,
            status,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.status.borrow().state
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.status.borrow().failure_reason.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.status.borrow().clone()
    }

    /// Token that cancels this job; usable before and after `start`
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.status.subscribe()
    }

    /// Run the job on its own task
    pub fn start(self) -> JobHandle {
        let receiver = self.subscribe();
        let cancel = self.cancellation_token();
        let task = tokio::spawn(self.run());
        JobHandle::new(receiver, cancel, task)
    }

    /// Run the job to completion on the current task
    ///
    /// Consumes the job: the file stream is dropped before the terminal state
    /// is published, and the file store and gateway handles are dropped when
    /// this returns.
    pub async fn run(self) -> JobSnapshot {
        let span = info_span!(
            "import_job",
            job_id = %self.id,
            source_id = %self.status.borrow().source_id,
            file = %self.file
        );

        async move {
            self.transition(JobState::Running, None);
            info!(first_import = self.is_first_import, "Import job started");

            match self.execute().await {
                Ok(()) => {
                    self.transition(JobState::Succeeded, None);
                    let snapshot = self.snapshot();
                    info!(
                        rows = snapshot.rows_written,
                        batches = snapshot.batches_flushed,
                        "Import job succeeded"
                    );
                },
                Err(err) => {
                    match &err {
                        IngestError::Cancelled => warn!("Import job cancelled"),
                        other => error!(error = %other, kind = other.kind(), "Import job failed"),
                    }
                    self.transition(JobState::Failed, Some(&err));
                },
            }

            self.snapshot()
        }
        .instrument(span)
        .await
    }

    fn transition(&self, next: JobState, failure: Option<&IngestError>) {
        self.status.send_if_modified(|snapshot| {
            let current = snapshot.state;
            if !current.can_transition_to(next) {
                return false;
            }

            let now = Utc::now();
            snapshot.state = next;
            if next == JobState::Running {
                snapshot.started_at = Some(now);
            }
            if next.is_terminal() {
                snapshot.started_at.get_or_insert(now);
                snapshot.finished_at = Some(now);
            }
            if let Some(err) = failure {
                snapshot.failure_reason = Some(err.to_string());
                snapshot.failure_kind = Some(err.kind().to_string());
            }
            true
        });
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(IngestError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn next_record(&self, reader: &mut RowReader) -> Result<Option<Vec<String>>> {
        self.check_cancelled()?;
        reader.next_record().await
    }

    async fn execute(&self) -> Result<()> {
        self.check_cancelled()?;

        let stream = self.files.stream(&self.file).await?;
        let mut reader = RowReader::new(stream, self.options);

        let header = if self.options.has_header {
            self.next_record(&mut reader).await?
        } else {
            None
        };

        let mut batcher = Batcher {
            pending: Vec::with_capacity(self.batch_size),
            batch_size: self.batch_size,
            flushed_rows: 0,
        };

        let (mut mapping, strict) = if self.is_first_import {
            let mut sample = Vec::with_capacity(self.mapper.sample_size() + 1);
            sample.extend(header);
            while batcher.pending.len() < self.mapper.sample_size() {
                match self.next_record(&mut reader).await? {
                    Some(row) => batcher.pending.push(row),
                    None => break,
                }
            }
            sample.extend(batcher.pending.iter().cloned());

            let source_id = self.status.borrow().source_id.clone();
            let inferred = self.mapper.infer(&source_id, &sample);
            (self.create_table(inferred).await?, false)
        } else {
            (self.load_mapping().await?, true)
        };
        let base_width = mapping.len();
        batcher.fit_to(&mapping);

        // Sample rows may already exceed one batch; flush them in order.
        let sampled = std::mem::take(&mut batcher.pending);
        for row in sampled {
            self.accept_row(&mut mapping, &mut batcher, row, base_width, strict)
                .await?;
        }

        while let Some(row) = self.next_record(&mut reader).await? {
            self.accept_row(&mut mapping, &mut batcher, row, base_width, strict)
                .await?;
        }

        drop(reader);
        self.flush(&mapping, &mut batcher).await
    }

    async fn accept_row(
        &self,
        mapping: &mut TableMapping,
        batcher: &mut Batcher,
        row: Vec<String>,
        base_width: usize,
        strict: bool,
    ) -> Result<()> {
        if strict && row.len() < base_width {
            return Err(IngestError::SchemaMismatch(format!(
                "row {} has {} fields, table {} maps {} columns",
                batcher.flushed_rows + batcher.pending.len(),
                row.len(),
                mapping.table_name,
                base_width
            )));
        }

        if row.len() > mapping.len() {
            let added = mapping.append_columns(row.len());
            info!(
                table = %mapping.table_name,
                columns = added.len(),
                "Appending text columns for wider rows"
            );
            self.store.add_columns(&mapping.table_name, &added).await?;

            batcher.fit_to(mapping);
            if batcher.pending.len() >= batcher.batch_size {
                self.flush(mapping, batcher).await?;
            }
        }

        batcher.pending.push(row);
        if batcher.pending.len() >= batcher.batch_size {
            self.flush(mapping, batcher).await?;
        }
        Ok(())
    }

    /// Write every pending row, at most one batch per insert
    async fn flush(&self, mapping: &TableMapping, batcher: &mut Batcher) -> Result<()> {
        while !batcher.pending.is_empty() {
            self.check_cancelled()?;

            let rows = batcher.pending.len().min(batcher.batch_size);
            let batch = self.status.borrow().batches_flushed + 1;
            debug!(table = %mapping.table_name, batch, rows, "Flushing batch");

            let offset = batcher.flushed_rows;
            self.store
                .batch_insert(&mapping.table_name, &mapping.columns, &batcher.pending[..rows])
                .await
                .map_err(|err| match err {
                    IngestError::WriteFailed { table, row, message } => IngestError::WriteFailed {
                        table,
                        row: row.map(|index| offset + index),
                        message,
                    },
                    other => other,
                })?;

            batcher.flushed_rows += rows;
            batcher.pending.drain(..rows);
            self.status.send_modify(|snapshot| {
                snapshot.rows_written += rows as u64;
                snapshot.batches_flushed += 1;
            });
        }

        Ok(())
    }

    /// Create the table for a first import, adopting an existing one on a race
    async fn create_table(&self, mapping: TableMapping) -> Result<TableMapping> {
        match self.store.create_table(&mapping.table_name, &mapping.columns).await {
            Ok(()) => Ok(mapping),
            Err(err) if err.is_already_exists() => {
                info!(table = %mapping.table_name, "Table already exists, reusing its mapping");
                self.store
                    .describe_table(&mapping.table_name)
                    .await?
                    .map(|columns| TableMapping {
                        columns,
                        ..mapping
                    })
                    .ok_or(err)
            },
            Err(err) => Err(err),
        }
    }

    async fn load_mapping(&self) -> Result<TableMapping> {
        let source_id = self.status.borrow().source_id.clone();
        let table_name = table_name_for(&source_id);

        let columns = self.store.describe_table(&table_name).await?.ok_or_else(|| {
            IngestError::SchemaMismatch(format!(
                "no table mapping exists for source {} (expected table {})",
                source_id, table_name
            ))
        })?;

        Ok(TableMapping {
            source_id,
            table_name,
            columns,
        })
    }
}

/// Observer and control handle of a started job
pub struct JobHandle {
    status: watch::Receiver<JobSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<JobSnapshot>,
}

impl JobHandle {
    pub(crate) fn new(status: watch::Receiver<JobSnapshot>, cancel: CancellationToken, task: JoinHandle<JobSnapshot>) -> Self {
        Self { status, cancel, task }
    }

    pub fn job_id(&self) -> Uuid {
        self.status.borrow().job_id
    }

    pub fn state(&self) -> JobState {
        self.status.borrow().state
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.status.borrow().failure_reason.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.status.borrow().clone()
    }

    /// Request cancellation; takes effect at the next read or flush
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job's task to end and return the final snapshot
    pub async fn wait(self) -> JobSnapshot {
        match self.task.await {
            Ok(snapshot) => snapshot,
            Err(join_error) => {
                let mut snapshot = self.status.borrow().clone();
                error!(job_id = %snapshot.job_id, error = %join_error, "Import job task aborted");
                if !snapshot.state.is_terminal() {
                    snapshot.state = JobState::Failed;
                    snapshot.finished_at = Some(Utc::now());
                    snapshot.failure_reason = Some(format!("job task aborted: {}", join_error));
                    snapshot.failure_kind = Some("aborted".to_string());
                }
                snapshot
            },
        }
    }
}
