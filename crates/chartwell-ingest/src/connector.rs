//! Connector kinds understood by the pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// Closed set of connector kinds with a job implementation
///
/// Anything else a source registry hands us is rejected with
/// [`IngestError::UnsupportedConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    DelimitedText,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::DelimitedText => "delimited_text",
        }
    }

    /// Key segment used to group uploads of this kind in the file store
    pub fn storage_segment(&self) -> &'static str {
        match self {
            ConnectorKind::DelimitedText => "csv",
        }
    }

    /// Guess the connector kind from a file name's extension
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let (_, extension) = file_name.rsplit_once('.')?;
        match extension.to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "txt" => Some(ConnectorKind::DelimitedText),
            _ => None,
        }
    }
}

impl FromStr for ConnectorKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "delimited" | "delimited_text" | "delimited-text" => {
                Ok(ConnectorKind::DelimitedText)
            },
            other => Err(IngestError::UnsupportedConnector(other.to_string())),
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
