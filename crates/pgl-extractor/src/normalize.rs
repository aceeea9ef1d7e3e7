//! Type normalization
//!
//! [`Normalizer::plan`] resolves every source column through the type
//! dictionary once per table. [`Normalizer::normalize`] then coerces each
//! batch against that plan. Nothing reaches the serializer unless every value
//! in its row coerced cleanly.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{CoercionFailurePolicy, DateTimePolicy, TenantConfig};
use crate::dictionary::{DecimalSpec, OverflowPolicy, TargetType, TypeDictionary, TypeRule};
use crate::error::{ExtractError, Result};
use crate::model::{RecordBatch, Row, TableDescriptor, Value};

/// Where a normalized column's values come from
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnOrigin {
    /// Position in the source row
    Source {
        index: usize,
        source_type: String,
        max_length: Option<u32>,
        rule: TypeRule,
    },
    /// Same value on every row
    Constant(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedColumn {
    pub name: String,
    /// Fully resolved: decimals always carry precision and scale
    pub target: TargetType,
    pub nullable: bool,
    pub origin: ColumnOrigin,
}

/// Column layout of every artifact written for one table
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSchema {
    /// Display name, e.g. `dbo.Vendas`
    pub table: String,
    pub columns: Vec<NormalizedColumn>,
    pub datetime: DateTimePolicy,
}

impl NormalizedSchema {
    pub fn column(&self, name: &str) -> Option<&NormalizedColumn> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Single-row schema made of constants only
    pub fn constants(table: impl Into<String>, stamps: &Stamps, datetime: DateTimePolicy) -> Self {
        Self {
            table: table.into(),
            columns: stamps.columns().collect(),
            datetime,
        }
    }

    /// Row of every constant column, `Null` for source columns
    pub fn constant_row(&self) -> Row {
        self.columns
            .iter()
            .map(|c| match &c.origin {
                ColumnOrigin::Constant(value) => value.clone(),
                ColumnOrigin::Source { .. } => Value::Null,
            })
            .collect()
    }
}

/// Constant columns stamped onto every row of a tenant's tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stamps {
    columns: Vec<(String, TargetType, Value)>,
}

impl Stamps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name.into(), TargetType::Utf8, Value::Text(value.into()));
        self
    }

    pub fn timestamp(mut self, name: impl Into<String>, value: NaiveDateTime) -> Self {
        self.push(name.into(), TargetType::Timestamp, Value::Timestamp(value));
        self
    }

    fn push(&mut self, name: String, target: TargetType, value: Value) {
        self.columns.retain(|(n, _, _)| !n.eq_ignore_ascii_case(&name));
        self.columns.push((name, target, value));
    }

    /// Configured constants plus the optional run timestamp column
    pub fn for_tenant(tenant: &TenantConfig, run_started: DateTime<Utc>) -> Self {
        let mut stamps = tenant
            .stamp_columns
            .iter()
            .fold(Stamps::new(), |stamps, s| stamps.text(&s.name, &s.value));
        if let Some(column) = &tenant.run_timestamp_column {
            stamps = stamps.timestamp(column, run_started.naive_utc());
        }
        stamps
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn get(&self, name: &str) -> Option<NormalizedColumn> {
        self.columns
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, target, value)| NormalizedColumn {
                name: name.to_string(),
                target: *target,
                nullable: false,
                origin: ColumnOrigin::Constant(value.clone()),
            })
    }

    fn columns(&self) -> impl Iterator<Item = NormalizedColumn> + '_ {
        self.columns.iter().map(|(name, target, value)| NormalizedColumn {
            name: name.clone(),
            target: *target,
            nullable: false,
            origin: ColumnOrigin::Constant(value.clone()),
        })
    }
}

/// Coerced rows ready for serialization
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub schema: Arc<NormalizedSchema>,
    pub sequence: u64,
    pub offset: u64,
    pub rows: Vec<Row>,
    pub skipped_rows: u64,
    pub truncated_values: u64,
}

impl NormalizedBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub struct Normalizer {
    dictionary: Arc<TypeDictionary>,
    datetime: DateTimePolicy,
}

impl Normalizer {
    pub fn new(dictionary: Arc<TypeDictionary>, datetime: DateTimePolicy) -> Self {
        Self {
            dictionary,
            datetime,
        }
    }

    /// Resolve every column; fails with `UnknownType` on the first unmapped one
    ///
    /// A source column sharing its name with a stamp is replaced in place by
    /// the stamp. Dictionary overrides naming a column the table lacks are
    /// appended next, filled with their type's default value, followed by
    /// the remaining stamps.
    pub fn plan(&self, descriptor: &TableDescriptor, stamps: &Stamps) -> Result<NormalizedSchema> {
        let table = descriptor.table.to_string();
        let mut columns = Vec::with_capacity(descriptor.columns.len() + stamps.columns.len());

        for (index, column) in descriptor.columns.iter().enumerate() {
            if let Some(stamp) = stamps.get(&column.name) {
                columns.push(stamp);
                continue;
            }

            let rule = self
                .dictionary
                .resolve_column(&table, &column.name, &column.source_type)?;
            let target = rule.target.resolve_for(column.precision, column.scale);

            columns.push(NormalizedColumn {
                name: column.name.clone(),
                target,
                nullable: rule.nullable && column.nullable,
                origin: ColumnOrigin::Source {
                    index,
                    source_type: column.source_type.clone(),
                    max_length: column.max_length,
                    rule,
                },
            });
        }

        for (name, rule) in self.dictionary.overrides_for(&table) {
            if descriptor.column_index(name).is_some() || stamps.get(name).is_some() {
                continue;
            }
            let target = rule.target.resolve_for(None, None);
            debug!("{}: adding missing column {} as {}", table, name, target);
            columns.push(NormalizedColumn {
                name: name.to_string(),
                target,
                nullable: false,
                origin: ColumnOrigin::Constant(default_value(target)),
            });
        }

        for stamp in stamps.columns() {
            if descriptor.column_index(&stamp.name).is_none() {
                columns.push(stamp);
            }
        }

        debug!("Planned {} columns for {}", columns.len(), table);
        Ok(NormalizedSchema {
            table,
            columns,
            datetime: self.datetime,
        })
    }

    /// Coerce one batch
    ///
    /// With `SkipRow` a failing row is dropped and counted; with any other
    /// policy the first failure is returned as `Coercion` and the caller
    /// decides whether the batch or the table pays for it.
    pub fn normalize(
        &self,
        schema: &Arc<NormalizedSchema>,
        batch: RecordBatch,
        policy: CoercionFailurePolicy,
    ) -> Result<NormalizedBatch> {
        let mut rows = Vec::with_capacity(batch.rows.len());
        let mut skipped_rows = 0;
        let mut truncated_values = 0;

        for (i, source_row) in batch.rows.into_iter().enumerate() {
            let row_number = batch.offset + i as u64;
            match coerce_row(schema, source_row) {
                Ok((row, truncated)) => {
                    truncated_values += truncated;
                    rows.push(row);
                },
                Err((column, reason)) => {
                    if policy == CoercionFailurePolicy::SkipRow {
                        warn!(
                            "{}: skipping row {} ({}: {})",
                            schema.table, row_number, column, reason
                        );
                        skipped_rows += 1;
                        continue;
                    }
                    return Err(ExtractError::Coercion {
                        row: row_number,
                        column,
                        reason,
                    });
                },
            }
        }

        Ok(NormalizedBatch {
            schema: Arc::clone(schema),
            sequence: batch.sequence,
            offset: batch.offset,
            rows,
            skipped_rows,
            truncated_values,
        })
    }
}

fn coerce_row(schema: &NormalizedSchema, mut source: Row) -> std::result::Result<(Row, u64), (String, String)> {
    let mut row = Vec::with_capacity(schema.columns.len());
    let mut truncated = 0;
    let available = source.len();

    for column in &schema.columns {
        let value = match &column.origin {
            ColumnOrigin::Constant(value) => value.clone(),
            ColumnOrigin::Source { index, .. } => match source.get_mut(*index) {
                Some(v) => std::mem::replace(v, Value::Null),
                None => {
                    return Err((
                        column.name.clone(),
                        format!("row has {} values, expected at least {}", available, index + 1),
                    ))
                },
            },
        };

        let (value, was_truncated) =
            coerce_value(value, column).map_err(|reason| (column.name.clone(), reason))?;
        if was_truncated {
            truncated += 1;
        }
        row.push(value);
    }

    Ok((row, truncated))
}

type Coerced = std::result::Result<(Value, bool), String>;

/// Coerce `value` to the column's target type
pub fn coerce_value(value: Value, column: &NormalizedColumn) -> Coerced {
    let (overflow, max_length, fill_nulls) = match &column.origin {
        ColumnOrigin::Source {
            rule, max_length, ..
        } => (rule.overflow, *max_length, !rule.nullable),
        ColumnOrigin::Constant(_) => (OverflowPolicy::Reject, None, false),
    };

    if value.is_null() {
        return if column.nullable {
            Ok((Value::Null, false))
        } else if fill_nulls {
            Ok((default_value(column.target), false))
        } else {
            Err("null in a NOT NULL column".to_string())
        };
    }

    match column.target {
        TargetType::Bool => to_bool(&value).map(|b| (Value::Bool(b), false)),
        TargetType::Int32 => {
            let v = to_integer(&value)?;
            fit_integer(v, i128::from(i32::MIN), i128::from(i32::MAX), overflow, "int32")
        },
        TargetType::Int64 => {
            let v = to_integer(&value)?;
            fit_integer(v, i128::from(i64::MIN), i128::from(i64::MAX), overflow, "int64")
        },
        TargetType::Float64 => to_float(&value).map(|f| (Value::Float(f), false)),
        TargetType::Decimal(spec) => to_decimal(&value, spec.unwrap_or(DecimalSpec::FALLBACK), overflow),
        TargetType::Utf8 => fit_text(to_text(value)?, max_length, overflow),
        TargetType::Binary => to_binary(value).map(|b| (Value::Binary(b), false)),
        TargetType::Date => to_date(&value).map(|d| (Value::Date(d), false)),
        TargetType::Time => to_time(&value).map(|t| (Value::Time(t), false)),
        TargetType::Timestamp => to_timestamp(&value).map(|ts| (Value::Timestamp(ts), false)),
    }
}

/// Fill value for nulls in non-nullable columns
pub fn default_value(target: TargetType) -> Value {
    match target {
        TargetType::Bool => Value::Bool(false),
        TargetType::Int32 | TargetType::Int64 => Value::Int(0),
        TargetType::Float64 => Value::Float(0.0),
        TargetType::Decimal(spec) => Value::Decimal {
            value: 0,
            scale: spec.unwrap_or(DecimalSpec::FALLBACK).scale,
        },
        TargetType::Utf8 => Value::Text(String::new()),
        TargetType::Binary => Value::Binary(Vec::new()),
        TargetType::Date => Value::Date(NaiveDate::default()),
        TargetType::Time => Value::Time(NaiveTime::default()),
        TargetType::Timestamp => Value::Timestamp(NaiveDateTime::default()),
    }
}

fn cannot(value: &Value, target: &str) -> String {
    format!("cannot convert {} to {}", value.type_name(), target)
}

fn pow10(exp: u32) -> std::result::Result<i128, String> {
    10i128
        .checked_pow(exp)
        .ok_or_else(|| format!("10^{} overflows a 128-bit decimal", exp))
}

fn to_bool(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int(i) => Ok(*i != 0),
        Value::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "t" => Ok(true),
            "false" | "0" | "no" | "n" | "f" => Ok(false),
            other => Err(format!("'{}' is not a boolean", other)),
        },
        other => Err(cannot(other, "bool")),
    }
}

/// Exact integer value; fractional inputs are rejected
fn to_integer(value: &Value) -> std::result::Result<i128, String> {
    match value {
        Value::Int(i) => Ok(i128::from(*i)),
        Value::Bool(b) => Ok(i128::from(*b)),
        Value::Float(f) => {
            if !f.is_finite() || f.fract() != 0.0 {
                return Err(format!("{} is not integral", f));
            }
            if f.abs() >= 1e38 {
                return Err(format!("{} is out of integer range", f));
            }
            Ok(*f as i128)
        },
        Value::Decimal { value, scale } => {
            let divisor = pow10(u32::from(*scale))?;
            if value % divisor != 0 {
                return Err(format!("{} is not integral", format_decimal(*value, *scale)));
            }
            Ok(value / divisor)
        },
        Value::Text(s) => s
            .trim()
            .parse::<i128>()
            .map_err(|_| format!("'{}' is not an integer", s.trim())),
        other => Err(cannot(other, "integer")),
    }
}

fn fit_integer(v: i128, min: i128, max: i128, overflow: OverflowPolicy, target: &str) -> Coerced {
    if (min..=max).contains(&v) {
        return Ok((Value::Int(v as i64), false));
    }
    match overflow {
        OverflowPolicy::Truncate => Ok((Value::Int(v.clamp(min, max) as i64), true)),
        OverflowPolicy::Reject => Err(format!("{} overflows {}", v, target)),
    }
}

fn parse_float(text: &str) -> std::result::Result<f64, String> {
    let trimmed = text.trim();
    trimmed
        .parse::<f64>()
        .or_else(|_| trimmed.replace(',', ".").parse::<f64>())
        .map_err(|_| format!("'{}' is not a number", trimmed))
}

fn to_float(value: &Value) -> std::result::Result<f64, String> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Decimal { value, scale } => Ok(*value as f64 / 10f64.powi(i32::from(*scale))),
        Value::Text(s) => parse_float(s),
        other => Err(cannot(other, "float64")),
    }
}

/// Move an unscaled decimal from one scale to another, rounding half away from zero
fn rescale(value: i128, from: u8, to: u8) -> std::result::Result<i128, String> {
    if to >= from {
        let factor = pow10(u32::from(to - from))?;
        value
            .checked_mul(factor)
            .ok_or_else(|| "decimal overflows 128 bits".to_string())
    } else {
        let divisor = pow10(u32::from(from - to))?;
        let quotient = value / divisor;
        let remainder = (value % divisor).abs();
        // divisor may be 10^38, so doubling the remainder can overflow
        if remainder >= divisor - remainder {
            Ok(quotient + value.signum())
        } else {
            Ok(quotient)
        }
    }
}

/// `"-12.345"` at scale 2 -> `-1235`
fn parse_decimal_text(text: &str, scale: u8) -> std::result::Result<i128, String> {
    let trimmed = text.trim();
    let invalid = || format!("'{}' is not a decimal number", trimmed);

    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let (whole, fraction) = match digits.split_once(['.', ',']) {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole_value: i128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let fraction_scale = u8::try_from(fraction.len()).map_err(|_| invalid())?;
    let fraction_value: i128 = if fraction.is_empty() {
        0
    } else {
        fraction.parse().map_err(|_| invalid())?
    };

    let unscaled = whole_value
        .checked_mul(pow10(u32::from(fraction_scale))?)
        .and_then(|w| w.checked_add(fraction_value))
        .ok_or_else(invalid)?;
    let signed = if negative { -unscaled } else { unscaled };
    rescale(signed, fraction_scale, scale)
}

pub fn format_decimal(value: i128, scale: u8) -> String {
    if scale == 0 {
        return value.to_string();
    }
    let digits = value.unsigned_abs().to_string();
    let scale = usize::from(scale);
    let padded = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
    } else {
        digits
    };
    let (whole, fraction) = padded.split_at(padded.len() - scale);
    let sign = if value < 0 { "-" } else { "" };
    format!("{}{}.{}", sign, whole, fraction)
}

fn to_decimal(value: &Value, spec: DecimalSpec, overflow: OverflowPolicy) -> Coerced {
    let unscaled = match value {
        Value::Decimal { value, scale } => rescale(*value, *scale, spec.scale)?,
        Value::Int(i) => i128::from(*i)
            .checked_mul(pow10(u32::from(spec.scale))?)
            .ok_or_else(|| format!("{} overflows decimal({},{})", i, spec.precision, spec.scale))?,
        Value::Bool(b) => i128::from(*b) * pow10(u32::from(spec.scale))?,
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(format!("{} is not a finite number", f));
            }
            let scaled = (f * 10f64.powi(i32::from(spec.scale))).round();
            if scaled.abs() >= 1e38 {
                return match overflow {
                    OverflowPolicy::Truncate => Ok((clamp_decimal(scaled.signum() as i128, spec)?, true)),
                    OverflowPolicy::Reject => Err(format!(
                        "{} overflows decimal({},{})",
                        f, spec.precision, spec.scale
                    )),
                };
            }
            scaled as i128
        },
        Value::Text(s) => parse_decimal_text(s, spec.scale)?,
        other => return Err(cannot(other, "decimal")),
    };

    let limit = pow10(u32::from(spec.precision))?;
    if unscaled.abs() < limit {
        return Ok((
            Value::Decimal {
                value: unscaled,
                scale: spec.scale,
            },
            false,
        ));
    }
    match overflow {
        OverflowPolicy::Truncate => Ok((clamp_decimal(unscaled.signum(), spec)?, true)),
        OverflowPolicy::Reject => Err(format!(
            "{} overflows decimal({},{})",
            format_decimal(unscaled, spec.scale),
            spec.precision,
            spec.scale
        )),
    }
}

/// Largest magnitude the precision allows, with the given sign
fn clamp_decimal(sign: i128, spec: DecimalSpec) -> std::result::Result<Value, String> {
    let max = pow10(u32::from(spec.precision))? - 1;
    Ok(Value::Decimal {
        value: if sign < 0 { -max } else { max },
        scale: spec.scale,
    })
}

fn to_text(value: Value) -> std::result::Result<String, String> {
    Ok(match value {
        Value::Text(s) => s,
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Decimal { value, scale } => format_decimal(value, scale),
        Value::Guid(g) => g.to_string().to_uppercase(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
        Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        Value::TimestampTz(ts) => ts.to_rfc3339(),
        Value::Binary(bytes) => {
            String::from_utf8(bytes).map_err(|_| "binary value is not valid UTF-8".to_string())?
        },
        Value::Null => String::new(),
    })
}

fn fit_text(text: String, max_length: Option<u32>, overflow: OverflowPolicy) -> Coerced {
    let Some(max) = max_length.map(|m| m as usize) else {
        return Ok((Value::Text(text), false));
    };
    let length = text.chars().count();
    if length <= max {
        return Ok((Value::Text(text), false));
    }
    match overflow {
        OverflowPolicy::Truncate => Ok((Value::Text(text.chars().take(max).collect()), true)),
        OverflowPolicy::Reject => Err(format!("{} characters exceed the column length {}", length, max)),
    }
}

fn to_binary(value: Value) -> std::result::Result<Vec<u8>, String> {
    match value {
        Value::Binary(bytes) => Ok(bytes),
        Value::Text(s) => Ok(s.into_bytes()),
        Value::Guid(g) => Ok(g.as_bytes().to_vec()),
        other => Err(cannot(&other, "binary")),
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y%m%d"];
const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

fn to_date(value: &Value) -> std::result::Result<NaiveDate, String> {
    match value {
        Value::Date(d) => Ok(*d),
        Value::Timestamp(ts) => Ok(ts.date()),
        Value::TimestampTz(ts) => Ok(ts.naive_utc().date()),
        Value::Text(s) => DATE_FORMATS
            .iter()
            .find_map(|f| NaiveDate::parse_from_str(s.trim(), f).ok())
            .or_else(|| parse_timestamp_text(s).map(|ts| ts.date()))
            .ok_or_else(|| format!("'{}' is not a date", s.trim())),
        other => Err(cannot(other, "date")),
    }
}

fn to_time(value: &Value) -> std::result::Result<NaiveTime, String> {
    match value {
        Value::Time(t) => Ok(*t),
        Value::Timestamp(ts) => Ok(ts.time()),
        Value::TimestampTz(ts) => Ok(ts.naive_utc().time()),
        Value::Text(s) => TIME_FORMATS
            .iter()
            .find_map(|f| NaiveTime::parse_from_str(s.trim(), f).ok())
            .ok_or_else(|| format!("'{}' is not a time", s.trim())),
        other => Err(cannot(other, "time")),
    }
}

fn parse_timestamp_text(text: &str) -> Option<NaiveDateTime> {
    let trimmed = text.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(with_offset.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(trimmed, f).ok())
}

/// Offsets are converted to UTC; naive values pass through untouched
fn to_timestamp(value: &Value) -> std::result::Result<NaiveDateTime, String> {
    match value {
        Value::Timestamp(ts) => Ok(*ts),
        Value::TimestampTz(ts) => Ok(ts.naive_utc()),
        Value::Date(d) => Ok(d.and_time(NaiveTime::default())),
        Value::Text(s) => parse_timestamp_text(s)
            .or_else(|| {
                DATE_FORMATS
                    .iter()
                    .find_map(|f| NaiveDate::parse_from_str(s.trim(), f).ok())
                    .map(|d| d.and_time(NaiveTime::default()))
            })
            .ok_or_else(|| format!("'{}' is not a timestamp", s.trim())),
        other => Err(cannot(other, "timestamp")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{ColumnDescriptor, TableRef};
    use chrono::{FixedOffset, TimeZone};

    const STOCK: &str = include_str!("../config/type_dictionary.json");

    fn normalizer() -> Normalizer {
        let dictionary = TypeDictionary::from_json_str(STOCK).unwrap();
        Normalizer::new(Arc::new(dictionary), DateTimePolicy::Naive)
    }

    fn column(target: TargetType, nullable: bool, rule: TypeRule, max_length: Option<u32>) -> NormalizedColumn {
        NormalizedColumn {
            name: "c".to_string(),
            target,
            nullable,
            origin: ColumnOrigin::Source {
                index: 0,
                source_type: "x".to_string(),
                max_length,
                rule,
            },
        }
    }

    fn rule(target: TargetType) -> TypeRule {
        TypeRule::new(target)
    }

    fn truncating(target: TargetType) -> TypeRule {
        TypeRule {
            overflow: OverflowPolicy::Truncate,
            ..TypeRule::new(target)
        }
    }

    fn vendas() -> TableDescriptor {
        TableDescriptor::new(
            TableRef::new("dbo", "Vendas"),
            vec![
                ColumnDescriptor::new("IdVenda", "int").not_null(),
                ColumnDescriptor::new("Valor", "money"),
                ColumnDescriptor::new("Cliente", "nvarchar").with_max_length(5),
                ColumnDescriptor::new("Data", "datetime2"),
            ],
        )
    }

    fn batch(rows: Vec<Row>) -> RecordBatch {
        RecordBatch {
            table: Arc::new(vendas()),
            sequence: 0,
            offset: 100,
            rows,
        }
    }

    #[test]
    fn test_plan_resolves_and_appends_stamps() {
        let stamps = Stamps::new().text("idEmpresa", "1042");
        let schema = normalizer().plan(&vendas(), &stamps).unwrap();

        let names: Vec<_> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["IdVenda", "Valor", "Cliente", "Data", "idEmpresa"]);
        assert_eq!(schema.columns[0].target, TargetType::Int32);
        assert!(!schema.columns[0].nullable);
        assert_eq!(
            schema.columns[1].target,
            TargetType::Decimal(Some(DecimalSpec {
                precision: 19,
                scale: 4
            }))
        );
        assert_eq!(schema.columns[4].origin, ColumnOrigin::Constant(Value::from("1042")));
    }

    #[test]
    fn test_stamp_replaces_source_column_in_place() {
        let stamps = Stamps::new().text("cliente", "fixed");
        let schema = normalizer().plan(&vendas(), &stamps).unwrap();
        assert_eq!(schema.columns.len(), 4);
        assert_eq!(schema.columns[2].target, TargetType::Utf8);
        assert!(matches!(schema.columns[2].origin, ColumnOrigin::Constant(_)));
    }

    #[test]
    fn test_missing_override_columns_are_filled_with_defaults() {
        let json = r#"{
            "types": {
                "int": { "target": "int32" },
                "money": { "target": "decimal(19,4)" },
                "nvarchar": { "target": "utf8" },
                "datetime2": { "target": "timestamp" }
            },
            "overrides": {
                "dbo.Vendas": {
                    "Valor": { "target": "float64" },
                    "Desconto": { "target": "decimal(10,2)" },
                    "Canal": { "target": "utf8" }
                }
            }
        }"#;
        let dictionary = TypeDictionary::from_json_str(json).unwrap();
        let normalizer = Normalizer::new(Arc::new(dictionary), DateTimePolicy::Naive);
        let stamps = Stamps::new().text("idEmpresa", "1042");
        let schema = Arc::new(normalizer.plan(&vendas(), &stamps).unwrap());

        let names: Vec<_> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["IdVenda", "Valor", "Cliente", "Data", "Canal", "Desconto", "idEmpresa"]
        );
        assert_eq!(schema.columns[1].target, TargetType::Float64);
        assert!(matches!(schema.columns[1].origin, ColumnOrigin::Source { .. }));

        let out = normalizer
            .normalize(
                &schema,
                batch(vec![vec![Value::Int(7), Value::Float(2.5), Value::from("Ana"), Value::Null]]),
                CoercionFailurePolicy::FailTable,
            )
            .unwrap();
        assert_eq!(out.rows[0][4], Value::from(""));
        assert_eq!(out.rows[0][5], Value::Decimal { value: 0, scale: 2 });
        assert_eq!(out.rows[0][6], Value::from("1042"));
    }

    #[test]
    fn test_plan_fails_on_unknown_type() {
        let mut descriptor = vendas();
        descriptor.columns.push(ColumnDescriptor::new("Local", "geography"));
        let err = normalizer().plan(&descriptor, &Stamps::new()).unwrap_err();
        assert!(matches!(err, ExtractError::UnknownType { ref column, .. } if column == "Local"));
    }

    #[test]
    fn test_normalize_batch() {
        let normalizer = normalizer();
        let schema = Arc::new(normalizer.plan(&vendas(), &Stamps::new()).unwrap());
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 30, 0).unwrap();

        let out = normalizer
            .normalize(
                &schema,
                batch(vec![
                    vec![Value::Int(1), Value::Float(19.9), Value::from("Maria Silva"), Value::Timestamp(ts)],
                    vec![Value::Int(2), Value::Null, Value::Null, Value::Null],
                ]),
                CoercionFailurePolicy::FailTable,
            )
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out.truncated_values, 1);
        assert_eq!(out.rows[0][1], Value::Decimal { value: 199_000, scale: 4 });
        assert_eq!(out.rows[0][2], Value::from("Maria"));
        assert_eq!(out.rows[1][1], Value::Null);
        assert_eq!(out.offset, 100);
    }

    #[test]
    fn test_coercion_error_names_row_and_column() {
        let normalizer = normalizer();
        let schema = Arc::new(normalizer.plan(&vendas(), &Stamps::new()).unwrap());
        let rows = vec![
            vec![Value::Int(1), Value::Null, Value::Null, Value::Null],
            vec![Value::from("abc"), Value::Null, Value::Null, Value::Null],
        ];

        let err = normalizer
            .normalize(&schema, batch(rows.clone()), CoercionFailurePolicy::FailTable)
            .unwrap_err();
        assert!(matches!(err, ExtractError::Coercion { row: 101, ref column, .. } if column == "IdVenda"));

        let out = normalizer
            .normalize(&schema, batch(rows), CoercionFailurePolicy::SkipRow)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.skipped_rows, 1);
    }

    #[test]
    fn test_null_handling() {
        let fill = TypeRule {
            nullable: false,
            ..TypeRule::new(TargetType::Utf8)
        };
        assert_eq!(
            coerce_value(Value::Null, &column(TargetType::Utf8, false, fill, None)).unwrap(),
            (Value::from(""), false)
        );
        assert_eq!(
            coerce_value(Value::Null, &column(TargetType::Int64, true, rule(TargetType::Int64), None)).unwrap(),
            (Value::Null, false)
        );
        assert!(coerce_value(Value::Null, &column(TargetType::Int64, false, rule(TargetType::Int64), None)).is_err());
        assert_eq!(default_value(TargetType::Date), Value::Date(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()));
    }

    #[test]
    fn test_integer_overflow_policies() {
        let big = Value::Int(i64::from(i32::MAX) + 1);
        let reject = column(TargetType::Int32, true, rule(TargetType::Int32), None);
        assert!(coerce_value(big.clone(), &reject).is_err());

        let clamp = column(TargetType::Int32, true, truncating(TargetType::Int32), None);
        assert_eq!(
            coerce_value(big, &clamp).unwrap(),
            (Value::Int(i64::from(i32::MAX)), true)
        );
    }

    #[test]
    fn test_float_to_int_only_when_integral() {
        let col = column(TargetType::Int64, true, rule(TargetType::Int64), None);
        assert_eq!(coerce_value(Value::Float(42.0), &col).unwrap(), (Value::Int(42), false));
        assert!(coerce_value(Value::Float(42.5), &col).is_err());
        assert_eq!(
            coerce_value(Value::Decimal { value: 1500, scale: 2 }, &col).unwrap(),
            (Value::Int(15), false)
        );
    }

    #[test]
    fn test_decimal_precision_overflow() {
        let spec = DecimalSpec {
            precision: 5,
            scale: 2,
        };
        let target = TargetType::Decimal(Some(spec));
        let reject = column(target, true, rule(target), None);
        assert_eq!(
            coerce_value(Value::from("123.456"), &reject).unwrap(),
            (Value::Decimal { value: 12346, scale: 2 }, false)
        );
        assert!(coerce_value(Value::Int(1000), &reject).is_err());

        let clamp = column(target, true, truncating(target), None);
        assert_eq!(
            coerce_value(Value::Int(-1000), &clamp).unwrap(),
            (Value::Decimal { value: -99999, scale: 2 }, true)
        );
    }

    #[test]
    fn test_decimal_text_helpers() {
        assert_eq!(parse_decimal_text("-12,5", 2).unwrap(), -1250);
        assert_eq!(parse_decimal_text(".5", 1).unwrap(), 5);
        assert!(parse_decimal_text("1e5", 2).is_err());
        assert!(parse_decimal_text("-", 2).is_err());
        assert_eq!(format_decimal(-1250, 2), "-12.50");
        assert_eq!(format_decimal(5, 3), "0.005");
        assert_eq!(format_decimal(42, 0), "42");
    }

    #[test]
    fn test_rescale_across_all_38_digits() {
        let nines = pow10(38).unwrap() - 1;
        assert_eq!(rescale(9 * pow10(37).unwrap(), 38, 0).unwrap(), 1);
        assert_eq!(rescale(-9 * pow10(37).unwrap(), 38, 0).unwrap(), -1);
        assert_eq!(rescale(nines, 38, 0).unwrap(), 1);
        assert_eq!(rescale(4 * pow10(37).unwrap(), 38, 0).unwrap(), 0);
        assert_eq!(rescale(5 * pow10(37).unwrap(), 38, 0).unwrap(), 1);

        assert_eq!(parse_decimal_text("0.99999999999999999999999999999999999999", 0).unwrap(), 1);
        assert_eq!(parse_decimal_text("-0.49999999999999999999999999999999999999", 0).unwrap(), 0);

        let target = TargetType::Decimal(Some(DecimalSpec {
            precision: 10,
            scale: 0,
        }));
        let col = column(target, true, rule(target), None);
        let source = Value::Decimal {
            value: nines,
            scale: 38,
        };
        assert_eq!(coerce_value(source, &col).unwrap(), (Value::Decimal { value: 1, scale: 0 }, false));
    }

    #[test]
    fn test_text_length_overflow() {
        let reject = column(TargetType::Utf8, true, rule(TargetType::Utf8), Some(3));
        assert!(coerce_value(Value::from("abcd"), &reject).is_err());
        assert_eq!(
            coerce_value(Value::from("açaí"), &column(TargetType::Utf8, true, truncating(TargetType::Utf8), Some(3)))
                .unwrap(),
            (Value::from("açaí".chars().take(3).collect::<String>().as_str()), true)
        );
    }

    #[test]
    fn test_offset_timestamps_become_utc() {
        let col = column(TargetType::Timestamp, true, rule(TargetType::Timestamp), None);
        let offset = FixedOffset::west_opt(3 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2024, 5, 10, 21, 0, 0).unwrap();

        let (value, _) = coerce_value(Value::TimestampTz(local), &col).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 5, 11).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(value, Value::Timestamp(expected));
    }

    #[test]
    fn test_text_parsing_for_dates_and_numbers() {
        let date = column(TargetType::Date, true, rule(TargetType::Date), None);
        assert_eq!(
            coerce_value(Value::from("25/12/2023"), &date).unwrap().0,
            Value::Date(NaiveDate::from_ymd_opt(2023, 12, 25).unwrap())
        );
        let time = column(TargetType::Time, true, rule(TargetType::Time), None);
        assert_eq!(
            coerce_value(Value::from("08:15:00"), &time).unwrap().0,
            Value::Time(NaiveTime::from_hms_opt(8, 15, 0).unwrap())
        );
        let float = column(TargetType::Float64, true, rule(TargetType::Float64), None);
        assert_eq!(coerce_value(Value::from("3,25"), &float).unwrap().0, Value::Float(3.25));
        let boolean = column(TargetType::Bool, true, rule(TargetType::Bool), None);
        assert_eq!(coerce_value(Value::Int(1), &boolean).unwrap().0, Value::Bool(true));
    }
}
