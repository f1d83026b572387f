//! Relational storage gateway
//!
//! Owns the single connection to the storage backend. Jobs reach the backend
//! only through [`RelationalStore`]; calls from concurrent jobs queue on the
//! gateway's mutex. There is no pooling and no reconnect: once the connection
//! drops, every later call fails with [`IngestError::ConnectionLost`].

use async_trait::async_trait;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::error::{IngestError, Result};
use crate::schema::{coerce_value, quote_ident, CellValue, ColumnDef, ColumnType};

/// Postgres caps a statement at this many bind parameters
pub const MAX_BIND_PARAMS: usize = 65535;

const DUPLICATE_TABLE: &str = "42P07";
const ADMIN_SHUTDOWN: &str = "57P01";

/// DDL and batch writes against the storage backend
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// `CREATE TABLE`; a duplicate is reported with `already_exists` set
    async fn create_table(&self, table: &str, columns: &[ColumnDef]) -> Result<()>;

    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Append columns; existing ones are left untouched
    async fn add_columns(&self, table: &str, columns: &[ColumnDef]) -> Result<()>;

    /// Current columns in ordinal order, `None` if the table does not exist
    ///
    /// A table without columns describes as `Some` of an empty list.
    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>>;

    /// Insert `rows` in one round-trip, coercing each cell to its column type
    ///
    /// Rows shorter than `columns` are padded with NULL. On failure the error
    /// names the offending row (index within `rows`) when it is known.
    async fn batch_insert(&self, table: &str, columns: &[ColumnDef], rows: &[Vec<String>]) -> Result<u64>;

    /// Close the connection; later calls fail with `ConnectionLost`
    async fn close(&self) -> Result<()>;
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code == ADMIN_SHUTDOWN),
        _ => false,
    }
}

fn live(connection: &mut Option<PgConnection>) -> Result<&mut PgConnection> {
    connection
        .as_mut()
        .ok_or_else(|| IngestError::ConnectionLost("connection is no longer available".into()))
}

/// Map a backend error, discarding the connection if it is gone
fn classify(
    connection: &mut Option<PgConnection>,
    err: sqlx::Error,
    otherwise: impl FnOnce(&sqlx::Error) -> IngestError,
) -> IngestError {
    if is_connection_error(&err) {
        warn!(error = %err, "Storage connection lost; discarding it");
        *connection = None;
        IngestError::ConnectionLost(err.to_string())
    } else {
        otherwise(&err)
    }
}

fn column_list(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_definitions(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.sql_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Coerce a batch up front so a bad cell is reported before any write
fn coerce_rows(table: &str, columns: &[ColumnDef], rows: &[Vec<String>]) -> Result<Vec<Vec<CellValue>>> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            if row.len() > columns.len() {
                return Err(IngestError::write_failed(
                    table,
                    Some(index),
                    format!("row has {} fields but only {} columns are mapped", row.len(), columns.len()),
                ));
            }

            columns
                .iter()
                .enumerate()
                .map(|(position, column)| {
                    let raw = row.get(position).map(String::as_str).unwrap_or("");
                    coerce_value(column.column_type, raw).map_err(|message| {
                        IngestError::write_failed(table, Some(index), format!("column {}: {}", column.name, message))
                    })
                })
                .collect()
        })
        .collect()
}

fn build_insert<'a>(table: &str, columns: &'a [ColumnDef], rows: Vec<Vec<CellValue>>) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        quote_ident(table),
        column_list(columns)
    ));

    builder.push_values(rows, |mut b, row| {
        for (cell, column) in row.into_iter().zip(columns) {
            match (cell, column.column_type) {
                (CellValue::Integer(v), _) => b.push_bind(v),
                (CellValue::Float(v), _) => b.push_bind(v),
                (CellValue::Boolean(v), _) => b.push_bind(v),
                (CellValue::Text(v), _) => b.push_bind(v),
                (CellValue::Null, ColumnType::Integer) => b.push_bind(None::<i64>),
                (CellValue::Null, ColumnType::Float) => b.push_bind(None::<f64>),
                (CellValue::Null, ColumnType::Boolean) => b.push_bind(None::<bool>),
                (CellValue::Null, ColumnType::Text) => b.push_bind(None::<String>),
            };
        }
    });

    builder
}

/// Postgres-backed [`RelationalStore`] over one owned connection
pub struct StorageGateway {
    connection: Mutex<Option<PgConnection>>,
}

impl StorageGateway {
    /// Establish the connection; the gateway never opens another one
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        debug!("Connecting storage gateway (timeout: {}s)", config.connect_timeout_secs);

        let connection = tokio::time::timeout(config.connect_timeout(), PgConnection::connect(&config.url))
            .await
            .map_err(|_| {
                IngestError::ConnectionLost(format!(
                    "timed out after {}s connecting to storage backend",
                    config.connect_timeout_secs
                ))
            })?
            .map_err(|e| IngestError::ConnectionLost(format!("Failed to connect to storage backend: {}", e)))?;

        info!("Storage gateway connected");

        Ok(Self {
            connection: Mutex::new(Some(connection)),
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn execute_ddl(&self, table: &str, sql: String) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let conn = live(&mut guard)?;

        debug!(%sql, "Executing DDL");
        let outcome = sqlx::query(&sql).execute(&mut *conn).await;

        outcome.map(|_| ()).map_err(|err| {
            classify(&mut guard, err, |err| {
                let already_exists = matches!(
                    err,
                    sqlx::Error::Database(db) if db.code().as_deref() == Some(DUPLICATE_TABLE)
                );
                IngestError::SchemaOperationFailed {
                    table: table.to_string(),
                    message: err.to_string(),
                    already_exists,
                }
            })
        })
    }
}

#[async_trait]
impl RelationalStore for StorageGateway {
    #[instrument(skip(self, columns), fields(columns = columns.len()))]
    async fn create_table(&self, table: &str, columns: &[ColumnDef]) -> Result<()> {
        let sql = format!("CREATE TABLE {} ({})", quote_ident(table), column_definitions(columns));
        self.execute_ddl(table, sql).await?;
        info!("Created table {}", table);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn drop_table(&self, table: &str) -> Result<()> {
        self.execute_ddl(table, format!("DROP TABLE {}", quote_ident(table)))
            .await?;
        info!("Dropped table {}", table);
        Ok(())
    }

    #[instrument(skip(self, columns), fields(columns = columns.len()))]
    async fn add_columns(&self, table: &str, columns: &[ColumnDef]) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }

        let clauses = columns
            .iter()
            .map(|c| {
                format!(
                    "ADD COLUMN IF NOT EXISTS {} {}",
                    quote_ident(&c.name),
                    c.column_type.sql_type()
                )
            })
            .collect::<Vec<_>>()
            .join(", ");

        self.execute_ddl(table, format!("ALTER TABLE {} {}", quote_ident(table), clauses))
            .await
    }

    #[instrument(skip(self))]
    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDef>>> {
        let mut guard = self.connection.lock().await;
        let conn = live(&mut guard)?;

        let outcome = sqlx::query(
            "SELECT column_name::text AS column_name, data_type::text AS data_type \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&mut *conn)
        .await;

        let rows = outcome
            .map_err(|err| classify(&mut guard, err, |err| IngestError::schema_failed(table, err.to_string())))?;

        if rows.is_empty() {
            // A table created from an empty file has no catalog columns.
            let conn = live(&mut guard)?;
            let outcome = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1)",
            )
            .bind(table)
            .fetch_one(&mut *conn)
            .await;

            let exists = outcome
                .map_err(|err| classify(&mut guard, err, |err| IngestError::schema_failed(table, err.to_string())))?;
            return Ok(exists.then(Vec::new));
        }

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.try_get("column_name")?;
                let data_type: String = row.try_get("data_type")?;
                Ok(ColumnDef::new(name, ColumnType::from_sql_type(&data_type)))
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| IngestError::schema_failed(table, e.to_string()))?;

        Ok(Some(columns))
    }

    #[instrument(skip(self, columns, rows), fields(rows = rows.len()))]
    async fn batch_insert(&self, table: &str, columns: &[ColumnDef], rows: &[Vec<String>]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if columns.is_empty() {
            return Err(IngestError::write_failed(table, None, "no columns to insert into"));
        }

        let params = rows.len().saturating_mul(columns.len());
        if params > MAX_BIND_PARAMS {
            return Err(IngestError::write_failed(
                table,
                None,
                format!(
                    "batch needs {} bind parameters, backend limit is {}",
                    params, MAX_BIND_PARAMS
                ),
            ));
        }

        let values = coerce_rows(table, columns, rows)?;
        let mut builder = build_insert(table, columns, values);

        let mut guard = self.connection.lock().await;
        let conn = live(&mut guard)?;

        let outcome = builder.build().execute(&mut *conn).await;
        let result = outcome.map_err(|err| {
            classify(&mut guard, err, |err| IngestError::write_failed(table, None, err.to_string()))
        })?;

        debug!("Inserted {} rows into {}", result.rows_affected(), table);
        Ok(result.rows_affected())
    }

    async fn close(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();
        match connection {
            Some(conn) => {
                conn.close()
                    .await
                    .map_err(|e| IngestError::ConnectionLost(format!("error while closing: {}", e)))?;
                info!("Storage gateway connection closed");
                Ok(())
            },
            None => Ok(()),
        }
    }
}
