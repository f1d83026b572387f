//! Shared fixtures for chartwell-ingest integration tests
//!
//! [`RecordingStore`] stands in for the Postgres gateway: it records every
//! call, keeps table shapes in memory and can be told to fail or pause.

#![allow(dead_code)]

use async_trait::async_trait;
use chartwell_common::{FileReference, SourceId, TenantId};
use chartwell_ingest::config::PipelineConfig;
use chartwell_ingest::error::{IngestError, Result};
use chartwell_ingest::file_store::{chunks_from_bytes, FileStore, MemoryFileStore};
use chartwell_ingest::gateway::RelationalStore;
use chartwell_ingest::schema::{table_name_for, ColumnDef, ColumnType};
use chartwell_ingest::sources::Source;
use chartwell_ingest::ProcessingTaskFactory;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateTable { table: String, columns: Vec<ColumnDef> },
    DropTable { table: String },
    AddColumns { table: String, columns: Vec<ColumnDef> },
    DescribeTable { table: String },
    BatchInsert { table: String, columns: Vec<String>, rows: Vec<Vec<String>> },
    Close,
}

/// How the Nth batch insert (1-based) should fail
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub batch: usize,
    pub row: Option<usize>,
    pub connection_lost: bool,
}

#[derive(Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<Call>>,
    tables: Mutex<HashMap<String, Vec<ColumnDef>>>,
    inserted: Mutex<HashMap<String, Vec<Vec<String>>>>,
    batch_failure: Mutex<Option<BatchFailure>>,
    /// Report already-exists on CREATE even for unknown tables
    create_races: Mutex<Option<Vec<ColumnDef>>>,
    insert_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_batch(&self, failure: BatchFailure) {
        *self.batch_failure.lock().unwrap() = Some(failure);
    }

    /// Simulate another job creating the table with `columns` first
    pub fn lose_create_race(&self, columns: Vec<ColumnDef>) {
        *self.create_races.lock().unwrap() = Some(columns);
    }

    /// Every insert waits for a permit of the returned semaphore
    pub fn gate_inserts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.insert_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn with_table(self: Arc<Self>, table: &str, columns: Vec<ColumnDef>) -> Arc<Self> {
        self.tables.lock().unwrap().insert(table.to_string(), columns);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn table_columns(&self, table: &str) -> Option<Vec<ColumnDef>> {
        self.tables.lock().unwrap().get(table).cloned()
    }

    /// Rows committed to `table`, in insert order
    pub fn committed_rows(&self, table: &str) -> Vec<Vec<String>> {
        self.inserted.lock().unwrap().get(table).cloned().unwrap_or_default()
    }

    /// Row counts of every batch insert attempt
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::BatchInsert { rows, .. } => Some(rows.len()),
                _ => None,
            })
            .collect()
    }

    pub fn create_calls(&self) -> Vec<(String, Vec<ColumnDef>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateTable { table, columns } => Some((table, columns)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RelationalStore for RecordingStore {
    async fn create_table(&self, table: &str, columns: &[ColumnDef]) -> Result<()> {
        self.record(Call::CreateTable {
            table: table.to_string(),
            columns: columns.to_vec(),
        });

        if let Some(existing) = self.create_races.lock().unwrap().take() {
            self.tables.lock().unwrap().insert(table.to_string(), existing);
        }

        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(table) {
            return Err(IngestError::SchemaOperationFailed {
                table: table.to_string(),
                message: format!("relation \"{}\" already exists", table),
                already_exists: true,
            });
        }
        tables.insert(table.to_string(), columns.to_vec());
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.record(Call::DropTable { table: table.to_string() });
        self.tables
            .lock()
            .unwrap()
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| IngestError::schema_failed(table, "table does not exist"))
    }

    async fn add_columns(&self, table: &str, columns: &[ColumnDef]) -> Result<()> {
        self.record(Call::AddColumns {
            table: table.to_string(),
            columns: columns.to_vec(),
        });
        let mut tables = self.tables.lock().unwrap();
        let existing = tables
            .get_mut(table)
            .ok_or_else(|| IngestError::schema_failed(table, "table does not exist"))?;
        for column in columns {
            if !existing.iter().any(|c| c.name == column.name) {
                existing.push(column.clone());
            }
        }
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>> {
        self.record(Call::DescribeTable { table: table.to_string() });
        Ok(self.tables.lock().unwrap().get(table).cloned())
    }

    async fn batch_insert(&self, table: &str, columns: &[ColumnDef], rows: &[Vec<String>]) -> Result<u64> {
        let gate = self.insert_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }

        self.record(Call::BatchInsert {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            rows: rows.to_vec(),
        });

        let attempt = self.batch_sizes().len();
        let failure = self.batch_failure.lock().unwrap().clone();
        if let Some(failure) = failure.filter(|f| f.batch == attempt) {
            if failure.connection_lost {
                return Err(IngestError::ConnectionLost("server closed the connection".into()));
            }
            return Err(IngestError::write_failed(table, failure.row, "invalid input syntax"));
        }

        self.inserted
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        Ok(())
    }
}

pub fn tenant() -> TenantId {
    TenantId::new("acme").unwrap()
}

pub fn source_id(id: &str) -> SourceId {
    SourceId::new(id).unwrap()
}

/// Table the pipeline writes for source `id`
pub fn table(id: &str) -> String {
    table_name_for(&source_id(id))
}

pub fn csv_source(id: &str) -> Source {
    Source::new(source_id(id), tenant(), "csv")
}

pub fn int_col(name: &str) -> ColumnDef {
    ColumnDef::new(name, ColumnType::Integer)
}

pub fn text_col(name: &str) -> ColumnDef {
    ColumnDef::new(name, ColumnType::Text)
}

pub async fn upload(files: &MemoryFileStore, name: &str, content: &str) -> FileReference {
    files
        .upload(&tenant(), chunks_from_bytes(content.to_string()), name)
        .await
        .expect("upload should succeed")
}

pub fn factory(files: Arc<MemoryFileStore>, store: Arc<RecordingStore>, batch_size: usize) -> ProcessingTaskFactory {
    ProcessingTaskFactory::new(files, store, PipelineConfig::default().with_batch_size(batch_size))
}

pub fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
    data.iter()
        .map(|r| r.iter().map(|s| s.to_string()).collect())
        .collect()
}
