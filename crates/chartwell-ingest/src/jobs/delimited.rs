//! Delimited-text reading for import jobs

use csv_async::{AsyncReader, AsyncReaderBuilder, ErrorKind, StringRecord};
use serde_json::Value;

use crate::error::{IngestError, Result};
use crate::file_store::FileStream;

/// Parsing options taken from a source's config blob
///
/// Recognized keys: `delimiter` (one ASCII character, or `"tab"`/`"\t"`) and
/// `has_header` (boolean, alias `header`). Missing keys keep the defaults of
/// the connector spelling: tab for `tsv`, comma otherwise, with a header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimitedOptions {
    pub delimiter: u8,
    pub has_header: bool,
}

impl Default for DelimitedOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
        }
    }
}

fn parse_delimiter(value: &str) -> Result<u8> {
    match value {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        _ => match value.as_bytes() {
            [byte] if byte.is_ascii() && *byte != b'\n' && *byte != b'\r' => Ok(*byte),
            _ => Err(IngestError::Validation(format!(
                "delimiter must be a single ASCII character, got {:?}",
                value
            ))),
        },
    }
}

impl DelimitedOptions {
    /// Defaults implied by a connector kind spelling
    pub fn for_connector(spelling: &str) -> Self {
        match spelling.trim().to_ascii_lowercase().as_str() {
            "tsv" => Self {
                delimiter: b'\t',
                ..Self::default()
            },
            _ => Self::default(),
        }
    }

    pub fn from_config(config: &Value) -> Result<Self> {
        Self::default().with_config(config)
    }

    /// Apply config overrides on top of `self`
    pub fn with_config(self, config: &Value) -> Result<Self> {
        let mut options = self;

        let Some(map) = config.as_object() else {
            return match config {
                Value::Null => Ok(options),
                other => Err(IngestError::Validation(format!(
                    "source config must be a JSON object, got {}",
                    other
                ))),
            };
        };

        match map.get("delimiter") {
            None | Some(Value::Null) => {},
            Some(Value::String(s)) => options.delimiter = parse_delimiter(s)?,
            Some(other) => {
                return Err(IngestError::Validation(format!("delimiter must be a string, got {}", other)))
            },
        }

        match map.get("has_header").or_else(|| map.get("header")) {
            None | Some(Value::Null) => {},
            Some(Value::Bool(b)) => options.has_header = *b,
            Some(other) => {
                return Err(IngestError::Validation(format!("has_header must be a boolean, got {}", other)))
            },
        }

        Ok(options)
    }
}

/// Record-at-a-time reader over a file stream
///
/// Header handling is left to the caller, so every record comes back as data.
pub struct RowReader {
    inner: AsyncReader<FileStream>,
    record: StringRecord,
    records_read: u64,
}

impl RowReader {
    pub fn new(stream: FileStream, options: DelimitedOptions) -> Self {
        let inner = AsyncReaderBuilder::new()
            .delimiter(options.delimiter)
            .has_headers(false)
            .flexible(true)
            .create_reader(stream);

        Self {
            inner,
            record: StringRecord::new(),
            records_read: 0,
        }
    }

    /// Records consumed so far, header included
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Next record, `None` at end of file
    pub async fn next_record(&mut self) -> Result<Option<Vec<String>>> {
        let more = self.inner.read_record(&mut self.record).await.map_err(|err| {
            let record = self.records_read + 1;
            match err.kind() {
                ErrorKind::Io(io) => IngestError::StorageUnavailable(format!(
                    "read failed at record {}: {}",
                    record, io
                )),
                _ => IngestError::Parse {
                    record,
                    message: err.to_string(),
                },
            }
        })?;

        if !more {
            return Ok(None);
        }

        self.records_read += 1;
        Ok(Some(self.record.iter().map(String::from).collect()))
    }
}
