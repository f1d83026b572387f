//! Schema inference for first imports
//!
//! The mapper looks at a bounded sample of parsed rows and picks, per column
//! position, the narrowest type that holds every sampled value. Precedence is
//! integer, then floating-point, then boolean, with text as the fallback.
//! Values past the sample window are never inspected here; a later value that
//! does not coerce to its column type fails the insert of its batch.

use chartwell_common::checksum::sha256_hex;
use chartwell_common::SourceId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::config::DEFAULT_SAMPLE_SIZE;

/// Postgres limit on identifier length, in bytes; applies to tables and columns
pub const MAX_TABLE_NAME_LEN: usize = 63;

/// Hex digits of the id digest appended to every table name
pub const TABLE_DIGEST_LEN: usize = 12;

const TABLE_PREFIX: &str = "src_";

/// Inferred storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
}

impl ColumnType {
    /// Candidates from narrowest to widest
    const PRECEDENCE: [ColumnType; 4] = [
        ColumnType::Integer,
        ColumnType::Float,
        ColumnType::Boolean,
        ColumnType::Text,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Text => "text",
        }
    }

    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Text => "TEXT",
        }
    }

    /// Reverse of [`ColumnType::sql_type`] for catalog lookups
    ///
    /// Accepts the names `information_schema.columns.data_type` reports.
    /// Anything unrecognized is read back as text.
    pub fn from_sql_type(sql_type: &str) -> Self {
        match sql_type.trim().to_ascii_lowercase().as_str() {
            "bigint" | "integer" | "smallint" | "int8" | "int4" | "int2" => ColumnType::Integer,
            "double precision" | "real" | "float8" | "float4" | "numeric" => ColumnType::Float,
            "boolean" | "bool" => ColumnType::Boolean,
            _ => ColumnType::Text,
        }
    }

    /// Whether a non-empty cell can be stored in a column of this type
    pub fn accepts(&self, value: &str) -> bool {
        coerce_value(*self, value).is_ok()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed cell ready to bind into an insert
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Convert a raw cell into a value of `column_type`
///
/// Empty (or whitespace-only) cells are NULL for every type.
pub fn coerce_value(column_type: ColumnType, raw: &str) -> Result<CellValue, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(CellValue::Null);
    }

    match column_type {
        ColumnType::Integer => value
            .parse::<i64>()
            .map(CellValue::Integer)
            .map_err(|_| format!("'{}' is not a valid integer", raw)),
        ColumnType::Float => match value.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(CellValue::Float(f)),
            _ => Err(format!("'{}' is not a valid floating-point number", raw)),
        },
        ColumnType::Boolean => parse_bool(value)
            .map(CellValue::Boolean)
            .ok_or_else(|| format!("'{}' is not a valid boolean", raw)),
        ColumnType::Text => Ok(CellValue::Text(raw.to_string())),
    }
}

/// Quote an identifier for interpolation into SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Deterministic table name for a source
///
/// `src_`, then the id lowercased with every character outside `[a-z0-9_]`
/// replaced by `_` and cut to fit, then `_` and the first
/// [`TABLE_DIGEST_LEN`] hex digits of the SHA-256 of the exact id. The digest
/// keeps ids that sanitize alike (`Sales` and `sales`, `a-b` and `a_b`, long
/// shared prefixes) on separate tables. Never longer than 63 bytes.
pub fn table_name_for(source_id: &SourceId) -> String {
    let digest = sha256_hex(source_id.as_str().as_bytes());
    let readable_len = MAX_TABLE_NAME_LEN - TABLE_PREFIX.len() - 1 - TABLE_DIGEST_LEN;

    let mut name = String::with_capacity(MAX_TABLE_NAME_LEN);
    name.push_str(TABLE_PREFIX);
    name.extend(
        source_id
            .as_str()
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(readable_len),
    );
    name.push('_');
    name.push_str(&digest[..TABLE_DIGEST_LEN]);
    name
}

/// Longest prefix of `name` that fits in `max` bytes without splitting a char
fn truncate_to_bytes(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Storage shape of a source's table
///
/// Columns are only ever appended; existing entries keep their name and type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_id: SourceId,
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableMapping {
    pub fn new(source_id: SourceId, columns: Vec<ColumnDef>) -> Self {
        let table_name = table_name_for(&source_id);
        Self {
            source_id,
            table_name,
            columns,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Grow the mapping to `width` columns with trailing text columns
    ///
    /// Returns only the newly added definitions; empty when `width` does not
    /// exceed the current column count.
    pub fn append_columns(&mut self, width: usize) -> Vec<ColumnDef> {
        let mut taken: HashSet<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        let mut added = Vec::new();

        for index in self.columns.len()..width {
            let name = unique_name(&synthesized_name(index), index, &mut taken);
            added.push(ColumnDef::new(name, ColumnType::Text));
        }

        self.columns.extend(added.iter().cloned());
        added
    }
}

fn synthesized_name(index: usize) -> String {
    format!("column_{}", index + 1)
}

/// Fit `candidate` into an identifier not yet in `taken`
///
/// Names are cut to 63 bytes first, since the backend would truncate them and
/// two long names sharing a prefix would then collide. A taken name gets a
/// `_<n>` suffix starting at `index + 1`, shortening the base to make room.
fn unique_name(candidate: &str, index: usize, taken: &mut HashSet<String>) -> String {
    let base = truncate_to_bytes(candidate, MAX_TABLE_NAME_LEN);
    let mut name = base.to_string();
    let mut suffix = index + 1;
    while taken.contains(&name) {
        let tail = format!("_{}", suffix);
        name = format!("{}{}", truncate_to_bytes(base, MAX_TABLE_NAME_LEN - tail.len()), tail);
        suffix += 1;
    }
    taken.insert(name.clone());
    name
}

/// Derives a [`TableMapping`] from sampled rows
#[derive(Debug, Clone, Copy)]
pub struct SchemaMapper {
    sample_size: usize,
    has_header: bool,
}

impl Default for SchemaMapper {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE, true)
    }
}

impl SchemaMapper {
    pub fn new(sample_size: usize, has_header: bool) -> Self {
        Self {
            sample_size: sample_size.max(1),
            has_header,
        }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Infer the table shape
    ///
    /// With a header, `rows[0]` supplies column names and at most
    /// `sample_size` following rows are typed. Without one, the first
    /// `sample_size` rows are typed and names are synthesized.
    pub fn infer(&self, source_id: &SourceId, rows: &[Vec<String>]) -> TableMapping {
        let (header, data) = match (self.has_header, rows.split_first()) {
            (true, Some((header, rest))) => (Some(header.as_slice()), rest),
            _ => (None, rows),
        };
        let sample = &data[..data.len().min(self.sample_size)];

        let width = sample
            .iter()
            .map(Vec::len)
            .chain(header.map(<[String]>::len))
            .max()
            .unwrap_or(0);

        let mut taken = HashSet::new();
        let columns = (0..width)
            .map(|index| {
                let raw = header
                    .and_then(|h| h.get(index))
                    .map(|name| name.trim())
                    .filter(|name| !name.is_empty());
                let candidate = raw.map(String::from).unwrap_or_else(|| synthesized_name(index));
                let name = unique_name(&candidate, index, &mut taken);
                ColumnDef::new(name, infer_column(sample, index))
            })
            .collect();

        TableMapping::new(source_id.clone(), columns)
    }
}

fn infer_column(sample: &[Vec<String>], index: usize) -> ColumnType {
    let values: Vec<&str> = sample
        .iter()
        .filter_map(|row| row.get(index))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();

    if values.is_empty() {
        return ColumnType::Text;
    }

    ColumnType::PRECEDENCE
        .into_iter()
        .find(|candidate| values.iter().all(|v| candidate.accepts(v)))
        .unwrap_or(ColumnType::Text)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|r| r.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    fn source(id: &str) -> SourceId {
        SourceId::new(id).unwrap()
    }

    #[test]
    fn test_infers_types_with_precedence() {
        let mapper = SchemaMapper::new(100, true);
        let sample = rows(&[
            &["id", "amount", "active", "label", "ratio"],
            &["1", "10.5", "true", "x", "1"],
            &["2", "20", "FALSE", "7", "2.5"],
            &["3", "abc", "true", "y", ""],
        ]);

        let mapping = mapper.infer(&source("orders"), &sample);

        let types: Vec<ColumnType> = mapping.columns.iter().map(|c| c.column_type).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Integer,
                ColumnType::Text,
                ColumnType::Boolean,
                ColumnType::Text,
                ColumnType::Float
            ]
        );
        assert_eq!(mapping.column_names(), vec!["id", "amount", "active", "label", "ratio"]);
        assert_eq!(mapping.table_name, table_name_for(&source("orders")));
    }

    #[test]
    fn test_inference_is_deterministic() {
        let mapper = SchemaMapper::default();
        let sample = rows(&[&["a", "b"], &["1", "x"], &["2", "3.0"]]);
        assert_eq!(mapper.infer(&source("s"), &sample), mapper.infer(&source("s"), &sample));
    }

    #[test]
    fn test_sample_window_is_respected() {
        let mapper = SchemaMapper::new(2, true);
        let sample = rows(&[&["n"], &["1"], &["2"], &["not a number"]]);
        assert_eq!(mapper.infer(&source("s"), &sample).columns[0].column_type, ColumnType::Integer);
    }

    #[test]
    fn test_headerless_names_are_synthesized() {
        let mapper = SchemaMapper::new(10, false);
        let sample = rows(&[&["1", "a"], &["2", "b", "true"]]);
        let mapping = mapper.infer(&source("s"), &sample);

        assert_eq!(mapping.column_names(), vec!["column_1", "column_2", "column_3"]);
        assert_eq!(mapping.columns[0].column_type, ColumnType::Integer);
        assert_eq!(mapping.columns[2].column_type, ColumnType::Boolean);
    }

    #[test]
    fn test_header_cleanup() {
        let mapper = SchemaMapper::default();
        let sample = rows(&[&[" id ", "", "id"], &["1", "2", "3"]]);
        assert_eq!(
            mapper.infer(&source("s"), &sample).column_names(),
            vec!["id", "column_2", "id_3"]
        );
    }

    #[test]
    fn test_empty_column_is_text() {
        let mapper = SchemaMapper::default();
        let sample = rows(&[&["a", "b"], &["1", ""], &["2", " "]]);
        assert_eq!(mapper.infer(&source("s"), &sample).columns[1].column_type, ColumnType::Text);
    }

    #[test]
    fn test_append_columns_only_adds_text() {
        let mut mapping = TableMapping::new(
            source("s"),
            vec![ColumnDef::new("id", ColumnType::Integer), ColumnDef::new("column_3", ColumnType::Text)],
        );

        let added = mapping.append_columns(4);

        assert_eq!(added.len(), 2);
        assert_eq!(added[0].name, "column_3_3");
        assert_eq!(added[1].name, "column_4");
        assert!(added.iter().all(|c| c.column_type == ColumnType::Text));
        assert_eq!(mapping.columns[0], ColumnDef::new("id", ColumnType::Integer));
        assert!(mapping.append_columns(3).is_empty());
    }

    #[test]
    fn test_table_name_for() {
        let name = table_name_for(&source("Sales-2024.Q1"));
        assert!(name.starts_with("src_sales_2024_q1_"), "{}", name);
        assert_eq!(name.len(), "src_sales_2024_q1_".len() + TABLE_DIGEST_LEN);
        assert_eq!(name, table_name_for(&source("Sales-2024.Q1")));
        assert!(table_name_for(&source("Ünïcode")).starts_with("src__n_code_"));

        let long = "x".repeat(100);
        assert_eq!(table_name_for(&source(&long)).len(), MAX_TABLE_NAME_LEN);
    }

    #[test]
    fn test_ids_that_sanitize_alike_get_distinct_tables() {
        let pairs = [
            ("Sales".to_string(), "sales".to_string()),
            ("orders-2024".to_string(), "orders_2024".to_string()),
            (format!("{}a", "p".repeat(70)), format!("{}b", "p".repeat(70))),
        ];

        for (left, right) in pairs {
            let (a, b) = (table_name_for(&source(&left)), table_name_for(&source(&right)));
            assert_ne!(a, b, "{} and {} share a table", left, right);
            assert!(a.len() <= MAX_TABLE_NAME_LEN && b.len() <= MAX_TABLE_NAME_LEN);
        }
    }

    #[test]
    fn test_long_headers_stay_unique_within_identifier_limit() {
        let shared = "measurement_".repeat(6);
        let first = format!("{}first", shared);
        let second = format!("{}second", shared);
        let accented = format!("{}é", "e".repeat(62));
        let sample = vec![vec![first, second, accented], vec!["1".into(), "2".into(), "3".into()]];

        let mapping = SchemaMapper::new(10, true).infer(&source("wide"), &sample);
        let names = mapping.column_names();

        assert!(names.iter().all(|n| n.len() <= MAX_TABLE_NAME_LEN), "{:?}", names);
        assert_eq!(names[0], shared[..MAX_TABLE_NAME_LEN]);
        assert_eq!(names[1], format!("{}_2", &shared[..MAX_TABLE_NAME_LEN - 2]));
        assert_eq!(names[2], "e".repeat(62));
        assert_eq!(names.iter().collect::<HashSet<_>>().len(), 3);
    }

    #[test]
    fn test_coerce_value() {
        assert_eq!(coerce_value(ColumnType::Integer, " 42 ").unwrap(), CellValue::Integer(42));
        assert_eq!(coerce_value(ColumnType::Float, "").unwrap(), CellValue::Null);
        assert_eq!(coerce_value(ColumnType::Boolean, "True").unwrap(), CellValue::Boolean(true));
        assert_eq!(coerce_value(ColumnType::Text, " a ").unwrap(), CellValue::Text(" a ".into()));
        assert!(coerce_value(ColumnType::Integer, "abc").is_err());
        assert!(coerce_value(ColumnType::Float, "NaN").is_err());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_from_sql_type() {
        for t in ColumnType::PRECEDENCE {
            assert_eq!(ColumnType::from_sql_type(t.sql_type()), t);
        }
    }
}
