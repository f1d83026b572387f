//! Identifier types used across Chartwell
//!
//! All three identifiers are thin string newtypes. They are validated on
//! construction so that a value can be embedded in object-store keys and
//! table names without further escaping of path separators.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CommonError, Result};

/// Maximum identifier length accepted for tenants and sources
pub const MAX_IDENTIFIER_LEN: usize = 128;

fn validate_segment(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CommonError::invalid_identifier(value, format!("{} cannot be empty", what)));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(CommonError::invalid_identifier(
            value,
            format!("{} exceeds {} bytes", what, MAX_IDENTIFIER_LEN),
        ));
    }
    if value.contains('/') || value.contains('\\') {
        return Err(CommonError::invalid_identifier(
            value,
            format!("{} cannot contain path separators", what),
        ));
    }
    Ok(())
}

/// Owning tenant of sources and uploads
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_segment(&value, "tenant id")?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a registered source; immutable once assigned
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_segment(&value, "source id")?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a stored file inside the file store
///
/// References are relative, `/`-separated keys such as
/// `uploads/acme/csv/<uuid>/sales.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileReference(String);

impl FileReference {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(CommonError::invalid_identifier(value, "file reference cannot be empty"));
        }
        if value.starts_with('/') {
            return Err(CommonError::invalid_identifier(value, "file reference must be relative"));
        }
        if value.split('/').any(|segment| segment.is_empty() || segment == "..") {
            return Err(CommonError::invalid_identifier(
                value,
                "file reference contains an empty or parent segment",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, i.e. the original file name for uploaded files
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! string_conversions {
    ($($ty:ident),*) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = CommonError;

                fn try_from(value: String) -> Result<Self> {
                    $ty::new(value)
                }
            }

            impl From<$ty> for String {
                fn from(value: $ty) -> Self {
                    value.0
                }
            }

            impl std::str::FromStr for $ty {
                type Err = CommonError;

                fn from_str(s: &str) -> Result<Self> {
                    $ty::new(s)
                }
            }
        )*
    };
}

string_conversions!(TenantId, SourceId, FileReference);
