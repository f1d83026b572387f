//! Outbound request contract
//!
//! Every cross-service call the pipeline makes goes through a
//! [`RequestEnvelope`] executed by a [`RequestClient`].

pub mod client;
pub mod envelope;

pub use client::{AttemptError, HttpTransport, RequestClient, Response, Transport, REQUEST_ID_HEADER};
pub use envelope::{HttpMethod, RequestEnvelope};
