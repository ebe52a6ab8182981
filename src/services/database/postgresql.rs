// PostgreSQL runner using connection pooling for local sources backed by Postgres
use crate::api::middleware::RelayError;
use crate::services::database::adapter::{EngineRow, EngineRowStream, QueryRunner};
use deadpool_postgres::Pool;
use futures::StreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio_postgres::types::Type;
use tokio_postgres::Row;
use url::Url;

pub struct PostgresRunner {
    pool: Pool,
}

impl PostgresRunner {
    pub fn new(pool: Pool, connection_url: &str) -> Result<Self, RelayError> {
        let url = Url::parse(connection_url)
            .map_err(|e| RelayError::Config(format!("Invalid PostgreSQL URL: {}", e)))?;

        if url.scheme() != "postgresql" && url.scheme() != "postgres" {
            return Err(RelayError::Config(
                "URL must use postgresql:// or postgres:// scheme".to_string(),
            ));
        }

        Ok(Self { pool })
    }

    fn query_error(e: tokio_postgres::Error) -> RelayError {
        let details = match e.as_db_error() {
            Some(db_error) => format!(
                "Code: {}, Message: {}",
                db_error.code().code(),
                db_error.message()
            ),
            None => e.to_string(),
        };
        RelayError::Engine(format!("Query execution failed: {}", details))
    }

    /// Convert one Postgres row into a JSON object keyed by column name
    fn row_to_json(row: &Row) -> EngineRow {
        let mut values = EngineRow::new();
        for (idx, column) in row.columns().iter().enumerate() {
            let value = match *column.type_() {
                Type::INT2 => row.get::<_, Option<i16>>(idx).map(|v| json!(v)),
                Type::INT4 => row.get::<_, Option<i32>>(idx).map(|v| json!(v)),
                Type::INT8 => row.get::<_, Option<i64>>(idx).map(|v| json!(v)),
                Type::FLOAT4 => row.get::<_, Option<f32>>(idx).map(|v| json!(v)),
                Type::FLOAT8 => row.get::<_, Option<f64>>(idx).map(|v| json!(v)),
                Type::BOOL => row.get::<_, Option<bool>>(idx).map(|v| json!(v)),
                Type::NUMERIC => match row.try_get::<_, Option<Decimal>>(idx) {
                    Ok(v) => v.map(numeric_to_json),
                    // NaN and values beyond 96 bits have no decimal form
                    Err(_) => Some(json!(format!("<{}>", column.type_().name()))),
                },
                Type::DATE => row
                    .get::<_, Option<chrono::NaiveDate>>(idx)
                    .map(|d| json!(d.format("%Y-%m-%d").to_string())),
                Type::TIMESTAMP => row
                    .get::<_, Option<chrono::NaiveDateTime>>(idx)
                    .map(|ts| json!(ts.to_string())),
                Type::TIMESTAMPTZ => row
                    .get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                    .map(|ts| json!(ts.to_rfc3339())),
                _ => match row.try_get::<_, Option<String>>(idx) {
                    Ok(v) => v.map(|s| json!(s)),
                    // Types without a text mapping show up as their type name
                    Err(_) => Some(json!(format!("<{}>", column.type_().name()))),
                },
            };
            values.insert(column.name().to_string(), value.unwrap_or(Value::Null));
        }
        values
    }
}

/// Whole NUMERIC values become JSON integers, the rest floats
fn numeric_to_json(value: Decimal) -> Value {
    if value.fract().is_zero() {
        if let Some(whole) = value.to_i64() {
            return json!(whole);
        }
    }
    value
        .to_f64()
        .map(|v| json!(v))
        .unwrap_or_else(|| json!(value.to_string()))
}

#[async_trait::async_trait]
impl QueryRunner for PostgresRunner {
    async fn execute_stream(&self, sql: &str) -> Result<EngineRowStream, RelayError> {
        let client = self.pool.get().await.map_err(|e| {
            RelayError::Engine(format!("Failed to get connection from pool: {}", e))
        })?;

        let rows = client
            .query_raw(sql, Vec::<String>::new())
            .await
            .map_err(Self::query_error)?;

        // The pooled connection stays checked out until the row stream is dropped
        let stream = futures::stream::unfold(
            (client, Box::pin(rows)),
            |(client, mut rows)| async move {
                let item = match rows.next().await? {
                    Ok(row) => Ok(Self::row_to_json(&row)),
                    Err(e) => Err(Self::query_error(e)),
                };
                Some((item, (client, rows)))
            },
        );

        Ok(stream.boxed())
    }

    fn engine_kind(&self) -> &str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_postgres::{Config as PoolConfig, Runtime};
    use tokio_postgres::NoTls;

    fn lazy_pool(url: &str) -> Pool {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(url.to_string());
        cfg.create_pool(Some(Runtime::Tokio1), NoTls).unwrap()
    }

    #[test]
    fn test_numeric_values_are_numbers() {
        use std::str::FromStr;

        assert_eq!(numeric_to_json(Decimal::from_str("42").unwrap()), json!(42));
        assert_eq!(numeric_to_json(Decimal::from_str("42.000").unwrap()), json!(42));
        assert_eq!(numeric_to_json(Decimal::from_str("-0.25").unwrap()), json!(-0.25));
        assert_eq!(numeric_to_json(Decimal::from_str("1234.5").unwrap()), json!(1234.5));
    }

    #[tokio::test]
    async fn test_rejects_non_postgres_scheme() {
        let pool = lazy_pool("postgresql://localhost/relay");
        assert!(PostgresRunner::new(pool.clone(), "postgresql://localhost/relay").is_ok());
        let err = PostgresRunner::new(pool, "mysql://localhost/relay").err().unwrap();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_database_is_engine_error() {
        // Nothing listens on port 1, so checking out a connection fails
        let pool = lazy_pool("postgresql://relay@127.0.0.1:1/relay");
        let runner = PostgresRunner::new(pool, "postgresql://relay@127.0.0.1:1/relay").unwrap();
        let err = runner.execute_stream("SELECT 1").await.err().unwrap();
        assert!(matches!(err, RelayError::Engine(_)));
    }
}
