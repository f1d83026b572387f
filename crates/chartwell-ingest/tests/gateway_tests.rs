//! Storage gateway tests against a live Postgres
//!
//! These tests require DATABASE_URL to point at a disposable database.
//! They are skipped when it is not set.
//!
//! Covers:
//! - table creation, description and column appends
//! - batch inserts with typed values and NULL padding
//! - error classification (already exists, bad values)
//! - closing the connection

mod common;

use chartwell_ingest::config::{DatabaseConfig, DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS};
use chartwell_ingest::gateway::{RelationalStore, StorageGateway};
use chartwell_ingest::schema::{ColumnDef, ColumnType};
use chartwell_ingest::IngestError;
use common::*;

async fn setup_gateway() -> Option<StorageGateway> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let config = DatabaseConfig {
        url,
        connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
    };
    Some(
        StorageGateway::connect(&config)
            .await
            .expect("Failed to connect storage gateway"),
    )
}

fn unique_table(prefix: &str) -> String {
    format!("test_{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

fn sales_columns() -> Vec<ColumnDef> {
    vec![
        int_col("id"),
        ColumnDef::new("amount", ColumnType::Float),
        ColumnDef::new("paid", ColumnType::Boolean),
        text_col("note"),
    ]
}

// ============================================================================
// Schema operations
// ============================================================================

#[tokio::test]
async fn test_create_then_describe_table() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let table = unique_table("describe");
    gateway
        .create_table(&table, &sales_columns())
        .await
        .expect("Create should succeed");

    let described = gateway
        .describe_table(&table)
        .await
        .expect("Describe should succeed");
    assert_eq!(described, Some(sales_columns()));

    gateway.drop_table(&table).await.ok();
    gateway.close().await.ok();
}

#[tokio::test]
async fn test_describe_missing_table_is_none() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let described = gateway.describe_table(&unique_table("missing")).await.unwrap();
    assert!(described.is_none());
}

#[tokio::test]
async fn test_describe_table_without_columns_is_empty_mapping() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let table = unique_table("empty");
    gateway.create_table(&table, &[]).await.expect("Create should succeed");

    let described = gateway.describe_table(&table).await.unwrap();
    assert_eq!(described, Some(vec![]));

    gateway
        .add_columns(&table, &[text_col("column_1")])
        .await
        .expect("Add columns should succeed");
    assert_eq!(gateway.describe_table(&table).await.unwrap(), Some(vec![text_col("column_1")]));

    gateway.drop_table(&table).await.ok();
}

#[tokio::test]
async fn test_create_existing_table_reports_already_exists() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let table = unique_table("dup");
    gateway.create_table(&table, &[text_col("a")]).await.unwrap();

    let err = gateway.create_table(&table, &[text_col("a")]).await.unwrap_err();
    assert!(err.is_already_exists(), "unexpected error: {}", err);
    assert!(gateway.is_connected().await);

    gateway.drop_table(&table).await.ok();
}

#[tokio::test]
async fn test_add_columns_appends_in_order() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let table = unique_table("append");
    gateway.create_table(&table, &[int_col("id")]).await.unwrap();
    gateway
        .add_columns(&table, &[text_col("column_2"), text_col("column_3")])
        .await
        .expect("Add columns should succeed");

    let described = gateway.describe_table(&table).await.unwrap();
    assert_eq!(
        described,
        Some(vec![int_col("id"), text_col("column_2"), text_col("column_3")])
    );

    gateway.drop_table(&table).await.ok();
}

#[tokio::test]
async fn test_drop_missing_table_fails() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let err = gateway.drop_table(&unique_table("gone")).await.unwrap_err();
    assert!(matches!(err, IngestError::SchemaOperationFailed { .. }));
}

// ============================================================================
// Batch inserts
// ============================================================================

#[tokio::test]
async fn test_batch_insert_writes_typed_rows() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let table = unique_table("insert");
    gateway.create_table(&table, &sales_columns()).await.unwrap();

    let written = gateway
        .batch_insert(
            &table,
            &sales_columns(),
            &rows(&[&["1", "10.5", "true", "first"], &["2", "", "FALSE", ""], &["3"]]),
        )
        .await
        .expect("Insert should succeed");
    assert_eq!(written, 3);

    let empty = gateway.batch_insert(&table, &sales_columns(), &[]).await.unwrap();
    assert_eq!(empty, 0);

    gateway.drop_table(&table).await.ok();
}

#[tokio::test]
async fn test_batch_insert_rejects_bad_value_with_row_index() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let table = unique_table("badvalue");
    gateway.create_table(&table, &[int_col("id")]).await.unwrap();

    let err = gateway
        .batch_insert(&table, &[int_col("id")], &rows(&[&["1"], &["two"]]))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::WriteFailed { row: Some(1), .. }), "unexpected error: {}", err);
    assert!(gateway.is_connected().await);

    gateway.drop_table(&table).await.ok();
}

#[tokio::test]
async fn test_insert_into_missing_table_keeps_connection() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    let err = gateway
        .batch_insert(&unique_table("nowhere"), &[text_col("a")], &rows(&[&["x"]]))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::WriteFailed { .. }));
    assert!(gateway.is_connected().await);
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_calls_after_close_report_connection_lost() {
    let Some(gateway) = setup_gateway().await else {
        println!("Skipping test: DATABASE_URL not configured");
        return;
    };

    gateway.close().await.expect("Close should succeed");
    assert!(!gateway.is_connected().await);

    let err = gateway.describe_table("anything").await.unwrap_err();
    assert!(matches!(err, IngestError::ConnectionLost(_)));

    // Closing twice is a no-op.
    gateway.close().await.expect("Second close should succeed");
}
