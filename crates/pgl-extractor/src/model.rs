//! Core data model shared by every pipeline stage

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ExtractError;

pub const DEFAULT_SCHEMA: &str = "dbo";

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `[schema].[name]` with embedded `]` escaped
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    /// Case-insensitive match, the way SQL Server's default collation compares names
    pub fn matches(&self, other: &TableRef) -> bool {
        self.schema.eq_ignore_ascii_case(&other.schema) && self.name.eq_ignore_ascii_case(&other.name)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("[{}]", ident.replace(']', "]]"))
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl FromStr for TableRef {
    type Err = ExtractError;

    /// Accepts `Vendas`, `dbo.Vendas` and `[dbo].[Vendas]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .trim()
            .split('.')
            .map(|p| p.trim().trim_start_matches('[').trim_end_matches(']'))
            .collect();

        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(TableRef::new(DEFAULT_SCHEMA, *name)),
            [schema, name] if !schema.is_empty() && !name.is_empty() => {
                Ok(TableRef::new(*schema, *name))
            },
            _ => Err(ExtractError::Config(format!("invalid table name '{}'", s))),
        }
    }
}

/// One source column as reported by the database catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Catalog type name, e.g. `nvarchar`, `decimal`, `datetime2`
    pub source_type: String,
    pub nullable: bool,
    /// Characters for string types; `None` for `(max)` and non-strings
    pub max_length: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
            nullable: true,
            max_length: None,
            precision: None,
            scale: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Ordered columns of one table plus the key used to page through it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub table: TableRef,
    pub columns: Vec<ColumnDescriptor>,
    /// Column names giving a deterministic total order for offset paging
    pub ordering_key: Vec<String>,
}

impl TableDescriptor {
    pub fn new(table: TableRef, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            table,
            columns,
            ordering_key: Vec::new(),
        }
    }

    pub fn with_ordering_key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordering_key = key.into_iter().map(Into::into).collect();
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// A single cell as it travels through the pipeline
///
/// Before normalization a value mirrors what the driver returned; afterwards
/// its variant matches the column's target type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// All integer widths
    Int(i64),
    Float(f64),
    /// Unscaled integer plus scale: `Decimal { value: 12345, scale: 2 }` is 123.45
    Decimal {
        value: i128,
        scale: u8,
    },
    Text(String),
    Binary(Vec<u8>),
    Guid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal { .. } => "decimal",
            Value::Text(_) => "text",
            Value::Binary(_) => "binary",
            Value::Guid(_) => "guid",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamp with offset",
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Values in descriptor column order
pub type Row = Vec<Value>;

/// A bounded, ordered slice of one table's rows
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub table: Arc<TableDescriptor>,
    /// 0-based position of this batch within the extraction
    pub sequence: u64,
    /// Row offset of the first row in this batch
    pub offset: u64,
    pub rows: Vec<Row>,
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in `row`, by column name
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.table.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }
}

/// Position reached by an extraction
///
/// Everything before `next_offset` has been delivered downstream, so
/// extraction resumes from here without duplicating or skipping rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub next_offset: u64,
    pub batches_delivered: u64,
}

impl Checkpoint {
    pub fn start() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, rows: usize) {
        self.next_offset += rows as u64;
        self.batches_delivered += 1;
    }
}
