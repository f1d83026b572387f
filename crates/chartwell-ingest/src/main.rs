//! Chartwell Ingest - file ingestion worker

use anyhow::{bail, Context, Result};
use chartwell_common::logging::{init_logging, LogConfig, LogLevel};
use chartwell_common::{FileReference, SourceId, TenantId};
use chartwell_ingest::config::{FileStoreBackend, FileStoreConfig, IngestConfig};
use chartwell_ingest::file_store::{FileStore, MemoryFileStore, S3FileStore};
use chartwell_ingest::gateway::{RelationalStore, StorageGateway};
use chartwell_ingest::jobs::JobState;
use chartwell_ingest::request::RequestClient;
use chartwell_ingest::schema::table_name_for;
use chartwell_ingest::sources::{HttpSourceRegistry, InMemorySourceRegistry, Source, SourceRegistry};
use chartwell_ingest::{ConnectorKind, ImportCoordinator, ProcessingTaskFactory};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chartwell-ingest")]
#[command(author, version, about = "Chartwell file ingestion worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Database URL (overrides DATABASE_URL)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// File store backend: memory or s3 (overrides FILE_STORE_BACKEND)
    #[arg(long, global = true)]
    file_store: Option<FileStoreBackend>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Upload a local file into the file store
    Upload {
        #[arg(short, long)]
        tenant: String,

        /// Local file to upload
        #[arg(short, long)]
        path: PathBuf,

        /// Stored file name (defaults to the local file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Run one import job for an uploaded file
    Import {
        /// Source the file belongs to
        #[arg(short, long)]
        source: String,

        /// File reference returned by `upload`
        #[arg(short, long)]
        file: String,

        /// Infer the schema and create the source table
        #[arg(long)]
        first_import: bool,

        /// Tenant owning the source (used without a source registry)
        #[arg(short, long, default_value = "default")]
        tenant: String,

        /// Connector kind (used without a source registry)
        #[arg(long, default_value = "csv")]
        connector: String,

        /// Field delimiter (used without a source registry)
        #[arg(long)]
        delimiter: Option<String>,

        /// The file has no header row (used without a source registry)
        #[arg(long)]
        no_header: bool,

        /// Rows per batch insert
        #[arg(long)]
        batch_size: Option<usize>,

        /// Rows sampled for schema inference
        #[arg(long)]
        sample_size: Option<usize>,
    },

    /// List a tenant's uploads
    History {
        #[arg(short, long)]
        tenant: String,

        #[arg(long, default_value = "csv")]
        connector: String,
    },

    /// Drop the table of a source
    DropTable {
        #[arg(short, long)]
        source: String,
    },
}

async fn open_file_store(config: &FileStoreConfig) -> Result<Arc<dyn FileStore>> {
    match config.backend {
        FileStoreBackend::Memory => {
            warn!("Using the in-memory file store; uploads do not outlive this process");
            Ok(Arc::new(MemoryFileStore::new()))
        },
        FileStoreBackend::S3 => Ok(Arc::new(S3FileStore::new(config.s3.clone()).await?)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("chartwell-ingest")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(backend) = cli.file_store {
        config.file_store.backend = backend;
    }

    match cli.command {
        Command::Upload { tenant, path, name } => {
            let tenant = TenantId::new(tenant)?;
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("upload path has no file name")?,
            };

            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let files = open_file_store(&config.file_store).await?;

            let reference = files
                .upload(&tenant, ReaderStream::new(file).boxed(), &name)
                .await?;

            info!("Uploaded {} as {}", path.display(), reference);
            println!("{}", reference);
        },

        Command::Import {
            source,
            file,
            first_import,
            tenant,
            connector,
            delimiter,
            no_header,
            batch_size,
            sample_size,
        } => {
            if let Some(batch_size) = batch_size {
                config.pipeline.batch_size = batch_size;
            }
            if let Some(sample_size) = sample_size {
                config.pipeline.sample_size = sample_size;
            }
            config.pipeline.validate()?;

            let source_id = SourceId::new(source)?;
            let file = FileReference::new(file)?;

            let registry: Arc<dyn SourceRegistry> = match &config.registry_url {
                Some(url) => {
                    info!("Resolving sources through {}", url);
                    Arc::new(HttpSourceRegistry::new(url.clone(), RequestClient::http()?, config.requests))
                },
                None => {
                    let mut settings = serde_json::json!({ "has_header": !no_header });
                    if let Some(delimiter) = delimiter {
                        settings["delimiter"] = serde_json::Value::String(delimiter);
                    }
                    let registry = InMemorySourceRegistry::new();
                    registry
                        .insert(
                            Source::new(source_id.clone(), TenantId::new(tenant)?, connector).with_config(settings),
                        )
                        .await;
                    Arc::new(registry)
                },
            };

            let files = open_file_store(&config.file_store).await?;
            let gateway = Arc::new(StorageGateway::connect(&config.database).await?);
            let factory = ProcessingTaskFactory::new(files, gateway.clone(), config.pipeline.clone());
            let coordinator = ImportCoordinator::new(registry, factory);

            let waited = match coordinator.submit(&source_id, file, first_import).await {
                Ok(handle) => {
                    info!(job_id = %handle.job_id(), "Import job submitted");
                    Ok(coordinator.wait_or_cancel(handle, interrupted()).await)
                },
                Err(err) => Err(err),
            };

            // The job is terminal here; release the connection before reporting.
            let closed = gateway.close().await;
            let (snapshot, was_interrupted) = waited?;
            closed?;

            if was_interrupted {
                warn!(state = ?snapshot.state, "Import interrupted");
                bail!("import interrupted");
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);

            if snapshot.state != JobState::Succeeded {
                bail!(
                    "import failed: {}",
                    snapshot.failure_reason.unwrap_or_else(|| "unknown reason".to_string())
                );
            }
        },

        Command::History { tenant, connector } => {
            let tenant = TenantId::new(tenant)?;
            let kind: ConnectorKind = connector.parse()?;
            let files = open_file_store(&config.file_store).await?;

            let history = files.history(&tenant, kind).await?;
            let entries: Vec<_> = history.into_values().collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        },

        Command::DropTable { source } => {
            let table = table_name_for(&SourceId::new(source)?);
            let gateway = StorageGateway::connect(&config.database).await?;
            let dropped = gateway.drop_table(&table).await;
            gateway.close().await?;
            dropped?;
            info!("Dropped {}", table);
        },
    }

    Ok(())
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
