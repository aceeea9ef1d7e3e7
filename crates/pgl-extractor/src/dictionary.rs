//! Type dictionary
//!
//! Maps SQL Server type names to the type an artifact column is written as,
//! together with the coercion rule the normalizer applies. The dictionary is
//! loaded once from JSON and shared read-only (`Arc<TypeDictionary>`) by every
//! tenant.
//!
//! ```json
//! {
//!   "types": {
//!     "int":      { "target": "int32" },
//!     "money":    { "target": "decimal(19,4)" },
//!     "nvarchar": { "target": "utf8", "overflow": "truncate" }
//!   },
//!   "overrides": {
//!     "dbo.Vendas": { "HoraVenda": { "target": "utf8", "nullable": false } }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{ExtractError, Result};

/// Largest precision a SQL Server decimal (and an Arrow Decimal128) can hold
pub const MAX_DECIMAL_PRECISION: u8 = 38;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no type dictionary entry for source type '{0}'")]
pub struct UnknownTypeError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecimalSpec {
    pub precision: u8,
    pub scale: u8,
}

impl DecimalSpec {
    /// Used when neither the rule nor the column carries precision/scale
    pub const FALLBACK: DecimalSpec = DecimalSpec {
        precision: MAX_DECIMAL_PRECISION,
        scale: 10,
    };
}

/// Column type in the written artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetType {
    Bool,
    Int32,
    Int64,
    Float64,
    /// `None` inherits precision and scale from the source column
    Decimal(Option<DecimalSpec>),
    Utf8,
    Binary,
    Date,
    Time,
    Timestamp,
}

impl TargetType {
    /// Fill in anything the column itself has to provide
    pub fn resolve_for(self, precision: Option<u8>, scale: Option<u8>) -> TargetType {
        match self {
            TargetType::Decimal(None) => {
                let spec = match (precision, scale) {
                    (Some(p), s) if p > 0 => DecimalSpec {
                        precision: p.min(MAX_DECIMAL_PRECISION),
                        scale: s.unwrap_or(0).min(p),
                    },
                    _ => DecimalSpec::FALLBACK,
                };
                TargetType::Decimal(Some(spec))
            },
            other => other,
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Bool => write!(f, "bool"),
            TargetType::Int32 => write!(f, "int32"),
            TargetType::Int64 => write!(f, "int64"),
            TargetType::Float64 => write!(f, "float64"),
            TargetType::Decimal(None) => write!(f, "decimal"),
            TargetType::Decimal(Some(spec)) => write!(f, "decimal({},{})", spec.precision, spec.scale),
            TargetType::Utf8 => write!(f, "utf8"),
            TargetType::Binary => write!(f, "binary"),
            TargetType::Date => write!(f, "date"),
            TargetType::Time => write!(f, "time"),
            TargetType::Timestamp => write!(f, "timestamp"),
        }
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        if let Some(args) = lowered
            .strip_prefix("decimal(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return parse_decimal_args(args).map(|spec| TargetType::Decimal(Some(spec)));
        }

        match lowered.as_str() {
            "bool" | "boolean" => Ok(TargetType::Bool),
            "int32" | "int" | "integer" => Ok(TargetType::Int32),
            "int64" | "long" | "bigint" => Ok(TargetType::Int64),
            "float64" | "double" | "float" => Ok(TargetType::Float64),
            "decimal" => Ok(TargetType::Decimal(None)),
            "utf8" | "string" | "text" => Ok(TargetType::Utf8),
            "binary" | "bytes" => Ok(TargetType::Binary),
            "date" => Ok(TargetType::Date),
            "time" => Ok(TargetType::Time),
            "timestamp" | "datetime" => Ok(TargetType::Timestamp),
            other => Err(format!("unknown target type '{}'", other)),
        }
    }
}

fn parse_decimal_args(args: &str) -> std::result::Result<DecimalSpec, String> {
    let mut parts = args.split(',').map(str::trim);
    let precision: u8 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| format!("invalid decimal precision in 'decimal({})'", args))?;
    let scale: u8 = match parts.next() {
        Some(s) => s
            .parse()
            .map_err(|_| format!("invalid decimal scale in 'decimal({})'", args))?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(format!("too many arguments in 'decimal({})'", args));
    }
    if precision == 0 || precision > MAX_DECIMAL_PRECISION || scale > precision {
        return Err(format!(
            "decimal({},{}) is out of range (1 <= precision <= {}, scale <= precision)",
            precision, scale, MAX_DECIMAL_PRECISION
        ));
    }
    Ok(DecimalSpec { precision, scale })
}

impl TryFrom<String> for TargetType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetType> for String {
    fn from(value: TargetType) -> Self {
        value.to_string()
    }
}

/// What to do with a value that does not fit the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Fail the row with a coercion error
    #[default]
    Reject,
    /// Clamp numbers / cut strings and count the value as truncated
    Truncate,
}

/// One dictionary entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRule {
    pub target: TargetType,

    /// `false` replaces nulls with the target's default value
    #[serde(default = "default_nullable")]
    pub nullable: bool,

    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_nullable() -> bool {
    true
}

impl TypeRule {
    pub fn new(target: TargetType) -> Self {
        Self {
            target,
            nullable: true,
            overflow: OverflowPolicy::Reject,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DictionaryFile {
    types: HashMap<String, TypeRule>,
    #[serde(default)]
    overrides: HashMap<String, HashMap<String, TypeRule>>,
}

/// Column override keyed by its lowercased name; `column` keeps the declared spelling
#[derive(Debug, Clone)]
struct ColumnOverride {
    column: String,
    rule: TypeRule,
}

/// Immutable source-type lookup table
#[derive(Debug, Clone, Default)]
pub struct TypeDictionary {
    types: HashMap<String, TypeRule>,
    overrides: HashMap<String, HashMap<String, ColumnOverride>>,
}

/// Canonical lookup key for a SQL type name: `[NVarChar](50)` -> `nvarchar`
pub fn normalize_type_name(source_type: &str) -> String {
    let base = source_type
        .split('(')
        .next()
        .unwrap_or(source_type)
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();
    base.to_lowercase()
}

fn normalize_table_key(table: &str) -> String {
    table
        .split('.')
        .map(|part| part.trim().trim_start_matches('[').trim_end_matches(']'))
        .collect::<Vec<_>>()
        .join(".")
        .to_lowercase()
}

impl TypeDictionary {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: DictionaryFile = serde_json::from_str(json)
            .map_err(|e| ExtractError::Config(format!("invalid type dictionary: {}", e)))?;

        if file.types.is_empty() {
            return Err(ExtractError::Config(
                "type dictionary defines no types".to_string(),
            ));
        }

        let types = file
            .types
            .into_iter()
            .map(|(name, rule)| (normalize_type_name(&name), rule))
            .collect();

        let overrides = file
            .overrides
            .into_iter()
            .map(|(table, columns)| {
                let columns = columns
                    .into_iter()
                    .map(|(column, rule)| (column.to_lowercase(), ColumnOverride { column, rule }))
                    .collect();
                (normalize_table_key(&table), columns)
            })
            .collect();

        Ok(Self { types, overrides })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::Config(format!(
                "cannot read type dictionary {}: {}",
                path.display(),
                e
            ))
        })?;
        let dictionary = Self::from_json_str(&json)?;
        info!(
            path = %path.display(),
            types = dictionary.types.len(),
            overrides = dictionary.overrides.len(),
            "Type dictionary loaded"
        );
        Ok(dictionary)
    }

    /// Add or replace a type entry (used to build dictionaries in code)
    pub fn with_type(mut self, source_type: &str, rule: TypeRule) -> Self {
        self.types.insert(normalize_type_name(source_type), rule);
        self
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Look up the rule for a source type
    pub fn resolve(&self, source_type: &str) -> std::result::Result<&TypeRule, UnknownTypeError> {
        let key = normalize_type_name(source_type);
        self.types
            .get(&key)
            .ok_or_else(|| UnknownTypeError(source_type.trim().to_string()))
    }

    /// Per-table column override first, then the source type
    ///
    /// `table` may be `schema.table` or just the table name; an override
    /// keyed by the bare name applies to that table in every schema.
    pub fn resolve_column(&self, table: &str, column: &str, source_type: &str) -> Result<TypeRule> {
        let column_key = column.to_lowercase();

        for key in table_keys(table) {
            if let Some(o) = self.overrides.get(&key).and_then(|cols| cols.get(&column_key)) {
                debug!(table, column, target = %o.rule.target, "Using column override");
                return Ok(o.rule);
            }
        }

        self.resolve(source_type)
            .copied()
            .map_err(|source| ExtractError::UnknownType {
                column: column.to_string(),
                source,
            })
    }

    /// Every override that applies to `table`, sorted by column name
    ///
    /// An entry under `schema.table` shadows one for the same column under
    /// the bare table name.
    pub fn overrides_for(&self, table: &str) -> Vec<(&str, TypeRule)> {
        let mut found: Vec<(&str, TypeRule)> = Vec::new();
        for key in table_keys(table) {
            let Some(columns) = self.overrides.get(&key) else {
                continue;
            };
            for o in columns.values() {
                if !found.iter().any(|(name, _)| name.eq_ignore_ascii_case(&o.column)) {
                    found.push((o.column.as_str(), o.rule));
                }
            }
        }
        found.sort_by_key(|(name, _)| name.to_lowercase());
        found
    }
}

/// `schema.table` key first, then the bare table name
fn table_keys(table: &str) -> [String; 2] {
    let table_key = normalize_table_key(table);
    let bare_key = table_key.rsplit('.').next().unwrap_or(&table_key).to_string();
    [table_key, bare_key]
}
