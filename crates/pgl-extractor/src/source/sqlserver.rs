//! SQL Server source over a bb8 pool of tiberius connections

use async_trait::async_trait;
use bb8::Pool;
use bb8_tiberius::ConnectionManager;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use std::time::Duration;
use tiberius::{AuthMethod, ColumnData, Config, FromSql, ToSql};
use tracing::{debug, info, warn};

use super::SourceDatabase;
use crate::config::SourceConfig;
use crate::error::{ExtractError, Result};
use crate::model::{quote_ident, ColumnDescriptor, Row, TableDescriptor, TableRef, Value};

pub type SqlServerPool = Pool<ConnectionManager>;

/// SQL Server error number for "Login failed for user"
const LOGIN_FAILED: u32 = 18456;

const LIST_TABLES_SQL: &str = "\
SELECT TABLE_SCHEMA, TABLE_NAME
FROM INFORMATION_SCHEMA.TABLES
WHERE TABLE_TYPE = 'BASE TABLE'
ORDER BY TABLE_SCHEMA, TABLE_NAME";

const DESCRIBE_SQL: &str = "\
SELECT c.COLUMN_NAME,
       c.DATA_TYPE,
       c.IS_NULLABLE,
       CAST(c.CHARACTER_MAXIMUM_LENGTH AS INT) AS max_length,
       CAST(c.NUMERIC_PRECISION AS INT) AS numeric_precision,
       CAST(c.NUMERIC_SCALE AS INT) AS numeric_scale,
       CAST(pk.ORDINAL_POSITION AS INT) AS key_ordinal
FROM INFORMATION_SCHEMA.COLUMNS c
LEFT JOIN (
    SELECT ku.COLUMN_NAME, ku.ORDINAL_POSITION
    FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
    JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku
      ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME
     AND tc.CONSTRAINT_SCHEMA = ku.CONSTRAINT_SCHEMA
    WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
      AND tc.TABLE_SCHEMA = @P1
      AND tc.TABLE_NAME = @P2
) pk ON pk.COLUMN_NAME = c.COLUMN_NAME
WHERE c.TABLE_SCHEMA = @P1
  AND c.TABLE_NAME = @P2
ORDER BY c.ORDINAL_POSITION";

pub struct SqlServerSource {
    pool: SqlServerPool,
    location: String,
}

impl SqlServerSource {
    /// Build the pool; `pool_size` should cover the tenant's table parallelism
    pub async fn connect(config: &SourceConfig, pool_size: u32) -> Result<Self> {
        let mut tds = Config::new();
        tds.host(&config.host);
        tds.port(config.port);
        tds.database(&config.database);

        let password = config.password.as_ref().map(|p| p.expose()).unwrap_or_default();
        tds.authentication(AuthMethod::sql_server(&config.user, password));

        if config.trust_cert {
            tds.trust_cert();
        }
        if let Some(instance) = &config.instance_name {
            tds.instance_name(instance);
        }

        let manager = ConnectionManager::new(tds);

        let location = match &config.instance_name {
            Some(instance) => format!("mssql://{}\\{}/{}", config.host, instance, config.database),
            None => format!("mssql://{}:{}/{}", config.host, config.port, config.database),
        };

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build(manager)
            .await
            .map_err(|e| {
                ExtractError::Connection(format!("{}: failed to create pool: {}", location, e))
            })?;

        info!("Connection pool ready for {} (max {} connections)", location, pool_size.max(1));

        Ok(Self { pool, location })
    }

    async fn query_rows(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<tiberius::Row>> {
        let mut conn = self.pool.get().await.map_err(|e| {
            ExtractError::Connection(format!("{}: no connection available: {}", self.location, e))
        })?;

        let stream = conn.query(sql, params).await.map_err(classify_error)?;
        stream.into_first_result().await.map_err(classify_error)
    }
}

/// Network, TLS, routing and login failures are retryable connection errors
fn classify_error(err: tiberius::error::Error) -> ExtractError {
    use tiberius::error::Error as TdsError;

    match &err {
        TdsError::Io { .. } | TdsError::Tls(_) | TdsError::Routing { .. } => {
            ExtractError::Connection(err.to_string())
        },
        TdsError::Server(token) if token.code() == LOGIN_FAILED => {
            ExtractError::Connection(err.to_string())
        },
        _ => ExtractError::Query(err.to_string()),
    }
}

fn small_int(value: Option<i32>) -> Option<u8> {
    value.and_then(|v| u8::try_from(v).ok())
}

/// `SELECT <cols> FROM <table> ORDER BY <key> OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY`
pub(crate) fn page_query(descriptor: &TableDescriptor) -> String {
    let columns = descriptor
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let order_by = if descriptor.ordering_key.is_empty() {
        "(SELECT NULL)".to_string()
    } else {
        descriptor
            .ordering_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "SELECT {} FROM {} ORDER BY {} OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY",
        columns,
        descriptor.table.quoted(),
        order_by
    )
}

fn column_value(data: ColumnData<'static>) -> Result<Value> {
    let conversion = |e: tiberius::error::Error| ExtractError::Query(format!("conversion: {}", e));

    let value = match data {
        ColumnData::U8(v) => v.map_or(Value::Null, |v| Value::Int(i64::from(v))),
        ColumnData::I16(v) => v.map_or(Value::Null, |v| Value::Int(i64::from(v))),
        ColumnData::I32(v) => v.map_or(Value::Null, |v| Value::Int(i64::from(v))),
        ColumnData::I64(v) => v.map_or(Value::Null, Value::Int),
        ColumnData::F32(v) => v.map_or(Value::Null, |v| Value::Float(f64::from(v))),
        ColumnData::F64(v) => v.map_or(Value::Null, Value::Float),
        ColumnData::Bit(v) => v.map_or(Value::Null, Value::Bool),
        ColumnData::String(v) => v.map_or(Value::Null, |s| Value::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map_or(Value::Null, Value::Guid),
        ColumnData::Binary(v) => v.map_or(Value::Null, |b| Value::Binary(b.into_owned())),
        ColumnData::Numeric(v) => v.map_or(Value::Null, |n| Value::Decimal {
            value: n.value(),
            scale: n.scale(),
        }),
        ColumnData::Xml(v) => v.map_or(Value::Null, |x| Value::Text(x.into_owned().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)
                .map_err(conversion)?
                .map_or(Value::Null, Value::Timestamp)
        },
        ColumnData::Date(_) => NaiveDate::from_sql(&data)
            .map_err(conversion)?
            .map_or(Value::Null, Value::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)
            .map_err(conversion)?
            .map_or(Value::Null, Value::Time),
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(&data)
            .map_err(conversion)?
            .map_or(Value::Null, Value::TimestampTz),
    };
    Ok(value)
}

#[async_trait]
impl SourceDatabase for SqlServerSource {
    fn describe_location(&self) -> String {
        self.location.clone()
    }

    async fn ping(&self) -> Result<()> {
        self.query_rows("SELECT 1", &[]).await?;
        debug!("{} is reachable", self.location);
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<TableRef>> {
        let rows = self.query_rows(LIST_TABLES_SQL, &[]).await?;
        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let schema: Option<&str> = row.try_get(0).map_err(classify_error)?;
            let name: Option<&str> = row.try_get(1).map_err(classify_error)?;
            if let (Some(schema), Some(name)) = (schema, name) {
                tables.push(TableRef::new(schema, name));
            }
        }
        info!("{} base tables found in {}", tables.len(), self.location);
        Ok(tables)
    }

    async fn describe(&self, table: &TableRef) -> Result<TableDescriptor> {
        let schema = table.schema.as_str();
        let name = table.name.as_str();
        let rows = self.query_rows(DESCRIBE_SQL, &[&schema, &name]).await?;

        if rows.is_empty() {
            return Err(ExtractError::SchemaNotFound(table.to_string()));
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut key: Vec<(i32, String)> = Vec::new();

        for row in rows {
            let column_name: &str = row
                .try_get(0)
                .map_err(classify_error)?
                .ok_or_else(|| ExtractError::Query(format!("{}: unnamed column", table)))?;
            let data_type: &str = row.try_get(1).map_err(classify_error)?.unwrap_or_default();
            let is_nullable: &str = row.try_get(2).map_err(classify_error)?.unwrap_or("YES");
            let max_length: Option<i32> = row.try_get(3).map_err(classify_error)?;
            let precision: Option<i32> = row.try_get(4).map_err(classify_error)?;
            let scale: Option<i32> = row.try_get(5).map_err(classify_error)?;
            let key_ordinal: Option<i32> = row.try_get(6).map_err(classify_error)?;

            if let Some(ordinal) = key_ordinal {
                key.push((ordinal, column_name.to_string()));
            }

            columns.push(ColumnDescriptor {
                name: column_name.to_string(),
                source_type: data_type.to_string(),
                nullable: is_nullable.eq_ignore_ascii_case("YES"),
                // -1 means (max)
                max_length: max_length.and_then(|l| u32::try_from(l).ok()),
                precision: small_int(precision),
                scale: small_int(scale),
            });
        }

        key.sort_by_key(|(ordinal, _)| *ordinal);
        debug!(
            "Described {}: {} columns, primary key [{}]",
            table,
            columns.len(),
            key.iter().map(|(_, c)| c.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(TableDescriptor::new(table.clone(), columns).with_ordering_key(key.into_iter().map(|(_, c)| c)))
    }

    async fn fetch_page(&self, table: &TableDescriptor, offset: u64, limit: usize) -> Result<Vec<Row>> {
        if table.ordering_key.is_empty() {
            warn!("{} has no ordering key; page order is not guaranteed", table.table);
        }

        let sql = page_query(table);
        let offset = i64::try_from(offset)
            .map_err(|_| ExtractError::Query(format!("offset {} out of range", offset)))?;
        let limit = i64::try_from(limit)
            .map_err(|_| ExtractError::Query(format!("page size {} out of range", limit)))?;

        let rows = self.query_rows(&sql, &[&offset, &limit]).await?;
        rows.into_iter()
            .map(|row| row.into_iter().map(column_value).collect::<Result<Row>>())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_page_query_orders_by_key() {
        let descriptor = TableDescriptor::new(
            TableRef::new("dbo", "Vendas"),
            vec![
                ColumnDescriptor::new("IdVenda", "int"),
                ColumnDescriptor::new("Valor Total", "money"),
            ],
        )
        .with_ordering_key(["IdVenda"]);

        assert_eq!(
            page_query(&descriptor),
            "SELECT [IdVenda], [Valor Total] FROM [dbo].[Vendas] ORDER BY [IdVenda] \
             OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY"
        );
    }

    #[test]
    fn test_page_query_without_key() {
        let descriptor = TableDescriptor::new(
            TableRef::new("dbo", "Log"),
            vec![ColumnDescriptor::new("Texto", "ntext")],
        );
        assert!(page_query(&descriptor).contains("ORDER BY (SELECT NULL)"));
    }

    #[test]
    fn test_column_values() {
        assert_eq!(column_value(ColumnData::I32(Some(7))).unwrap(), Value::Int(7));
        assert_eq!(column_value(ColumnData::I32(None)).unwrap(), Value::Null);
        assert_eq!(column_value(ColumnData::Bit(Some(true))).unwrap(), Value::Bool(true));
        assert_eq!(
            column_value(ColumnData::String(Some("Centro".into()))).unwrap(),
            Value::Text("Centro".to_string())
        );
        assert_eq!(column_value(ColumnData::F64(Some(1.5))).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn test_io_errors_are_connection_errors() {
        let err = classify_error(tiberius::error::Error::Io {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "reset by peer".to_string(),
        });
        assert!(err.is_transient());

        let err = classify_error(tiberius::error::Error::Conversion("bad".into()));
        assert!(matches!(err, ExtractError::Query(_)));
    }
}
