use crate::config::DatabaseConfig;
use crate::mapper::{FieldValue, ParsedRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::BTreeSet;
use tracing::debug;

/// Destination for mapped records. The batch writer is the only caller; an
/// implementation must make each batch all-or-nothing.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn insert_batch(&self, table: &str, records: &[ParsedRecord]) -> Result<()>;
}

/// PostgreSQL sink backed by a connection pool.
#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(options)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to postgres at {}:{}/{}",
                    config.host, config.port, config.database
                )
            })?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordSink for PgSink {
    /// Inserts the whole batch with one multi-row INSERT. Records may carry
    /// different field subsets; the statement covers the union of columns and
    /// binds NULL where a record has no value. A single statement commits or
    /// rolls back as a unit, so a failed batch leaves no partial rows.
    async fn insert_batch(&self, table: &str, records: &[ParsedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut column_set: BTreeSet<&str> = BTreeSet::new();
        for record in records {
            column_set.extend(record.fields.keys().map(String::as_str));
        }
        let columns: Vec<&str> = column_set.into_iter().collect();

        // Identifiers were restricted to [A-Za-z0-9_] at config load, so
        // quoting them here is safe.
        let mut builder = QueryBuilder::<Postgres>::new(format!("INSERT INTO \"{table}\" ("));
        {
            let mut separated = builder.separated(", ");
            for column in &columns {
                separated.push(format!("\"{column}\""));
            }
        }
        builder.push(") ");

        builder.push_values(records, |mut row, record| {
            for column in &columns {
                match record.fields.get(*column) {
                    Some(FieldValue::Text(value)) => {
                        row.push_bind(value.clone());
                    }
                    Some(FieldValue::Integer(value)) => {
                        row.push_bind(*value);
                    }
                    Some(FieldValue::Float(value)) => {
                        row.push_bind(*value);
                    }
                    Some(FieldValue::Timestamp(value)) => {
                        row.push_bind(*value);
                    }
                    Some(FieldValue::Boolean(value)) => {
                        row.push_bind(*value);
                    }
                    None => {
                        row.push("NULL");
                    }
                }
            }
        });

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .with_context(|| format!("batch insert into {table} failed"))?;

        debug!(
            table,
            rows = result.rows_affected(),
            columns = columns.len(),
            "batch insert committed"
        );
        Ok(())
    }
}
