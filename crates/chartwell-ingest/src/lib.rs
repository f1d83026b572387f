//! Chartwell Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Asynchronous ingestion pipeline: uploaded files become rows in one
//! relational table per source.
//!
//! # Components
//!
//! - **File store** ([`file_store`]): tenant-scoped uploads, streaming reads, history
//! - **Schema mapper** ([`schema`]): table shape inferred from a sample of rows
//! - **Storage gateway** ([`gateway`]): the single backend connection, DDL and batch inserts
//! - **Import jobs** ([`jobs`]): one task per (source, file), built by the task factory
//! - **Coordinator** ([`coordinator`]): one live job per (source, file), bounded concurrency
//! - **Requests** ([`request`]): envelope-based outbound calls with timeouts and retries
//!
//! # Example
//!
//! ```no_run
//! use chartwell_common::{SourceId, TenantId};
//! use chartwell_ingest::config::IngestConfig;
//! use chartwell_ingest::file_store::{chunks_from_bytes, FileStore, MemoryFileStore};
//! use chartwell_ingest::gateway::StorageGateway;
//! use chartwell_ingest::jobs::ProcessingTaskFactory;
//! use chartwell_ingest::sources::Source;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = IngestConfig::from_env()?;
//! let files = Arc::new(MemoryFileStore::new());
//! let gateway = Arc::new(StorageGateway::connect(&config.database).await?);
//!
//! let tenant = TenantId::new("acme")?;
//! let file = files.upload(&tenant, chunks_from_bytes("id,amount\n1,10.5\n"), "sales.csv").await?;
//!
//! let source = Source::new(SourceId::new("sales")?, tenant, "csv");
//! let factory = ProcessingTaskFactory::new(files, gateway, config.pipeline.clone());
//! let snapshot = factory.create_job(&source, file, true)?.start().wait().await;
//! println!("{}", snapshot.state.as_str());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod file_store;
pub mod gateway;
pub mod jobs;
pub mod request;
pub mod schema;
pub mod sources;

pub use config::IngestConfig;
pub use connector::ConnectorKind;
pub use coordinator::ImportCoordinator;
pub use error::{IngestError, Result};
pub use jobs::{ImportJob, JobHandle, JobSnapshot, JobState, ProcessingTaskFactory};
