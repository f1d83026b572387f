//! Chartwell Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Chartwell workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: SHA-256 helpers used to fingerprint uploaded files
//! - **Types**: tenant, source, and file identifiers shared by every crate
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//!
//! # Example
//!
//! ```no_run
//! use chartwell_common::types::{FileReference, TenantId};
//!
//! fn describe(tenant: &TenantId, file: &FileReference) -> String {
//!     format!("{} uploaded {}", tenant, file)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{FileReference, SourceId, TenantId};
