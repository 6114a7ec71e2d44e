//! SQL database source adapter
//!
//! Pulls rows with keyset-style pagination: the cursor carries the
//! incremental watermark plus an offset, and ordering always includes
//! the primary key as a tie-breaker so equal watermark values cannot
//! loop. Works against postgres, mysql, and sqlite through the `Any`
//! driver.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow, install_default_drivers};
use sqlx::{AnyPool, Column, Row, TypeInfo};

use super::{Connector, ConnectorStats, FetchResult, SharedStats};
use crate::domain::{ConnectionConfig, DataSource, Interface, SourceParams};
use crate::error::SyncError;

/// Resumable position inside a table scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SqlCursor {
    /// Incremental watermark the scan is bounded below by
    #[serde(default)]
    last: Option<String>,
    /// Offset within the bounded scan
    #[serde(default)]
    offset: u64,
}

impl SqlCursor {
    fn parse(raw: Option<&str>) -> Result<Self, SyncError> {
        match raw {
            None => Ok(Self::default()),
            Some(raw) => {
                serde_json::from_str(raw).map_err(|e| SyncError::Fatal(format!("malformed sql cursor '{raw}': {e}")))
            }
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).expect("cursor serializes")
    }
}

pub struct SqlConnector {
    url: String,
    table: String,
    increment_column: Option<String>,
    order_columns: Vec<String>,
    params: SourceParams,
    pool: Option<AnyPool>,
    stats: SharedStats,
}

impl SqlConnector {
    pub fn new(source: &DataSource, interface: &Interface) -> Result<Self, SyncError> {
        let ConnectionConfig::Database { url, table } = &source.connection else {
            return Err(SyncError::Config("source is not a database".into()));
        };
        safe_ident(table)?;
        let increment_column = interface.increment_field().map(|f| f.name.clone());
        let mut order_columns = Vec::new();
        if let Some(inc) = &increment_column {
            order_columns.push(inc.clone());
        }
        for pk in interface.primary_key_columns() {
            if !order_columns.contains(&pk) {
                order_columns.push(pk);
            }
        }
        for column in order_columns.iter().chain(increment_column.iter()) {
            safe_ident(column)?;
        }
        Ok(Self {
            url: url.clone(),
            table: table.clone(),
            increment_column,
            order_columns,
            params: source.params.clone(),
            pool: None,
            stats: SharedStats::default(),
        })
    }

    fn pool(&self) -> Result<&AnyPool, SyncError> {
        self.pool
            .as_ref()
            .ok_or_else(|| SyncError::Fatal("sql connector used before open()".into()))
    }

    fn select_sql(&self, bounded: bool, max: usize, offset: u64) -> String {
        let mut sql = format!("SELECT * FROM {}", self.table);
        if bounded {
            let inc = self.increment_column.as_deref().expect("bounded scan needs increment column");
            sql.push_str(&format!(" WHERE {} > {}", inc, self.placeholder(1)));
        }
        if !self.order_columns.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_columns.join(" ASC, "));
            sql.push_str(" ASC");
        }
        sql.push_str(&format!(" LIMIT {max} OFFSET {offset}"));
        sql
    }

    fn placeholder(&self, n: usize) -> String {
        if self.url.starts_with("postgres") {
            format!("${n}")
        } else {
            "?".to_string()
        }
    }
}

/// Only plain identifiers reach the generated SQL
fn safe_ident(ident: &str) -> Result<(), SyncError> {
    let valid = !ident.is_empty()
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !ident.chars().next().expect("non-empty").is_ascii_digit();
    if valid {
        Ok(())
    } else {
        Err(SyncError::Config(format!("unsafe SQL identifier '{ident}'")))
    }
}

fn classify_sqlx(e: sqlx::Error) -> SyncError {
    match e {
        sqlx::Error::PoolTimedOut => SyncError::Timeout(Duration::from_secs(10)),
        sqlx::Error::Io(e) => SyncError::Unavailable(e.to_string()),
        sqlx::Error::Configuration(e) => SyncError::Config(e.to_string()),
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            if msg.contains("does not exist") || msg.contains("no such") || msg.contains("unknown column") {
                SyncError::Schema(db.message().to_string())
            } else {
                SyncError::Unavailable(db.message().to_string())
            }
        }
        other => SyncError::Unavailable(other.to_string()),
    }
}

/// Decode one driver row into a JSON object, column by column
fn decode_row(row: &AnyRow) -> Map<String, Value> {
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name().to_uppercase();
        let value = if type_name.contains("INT") {
            row.try_get::<Option<i64>, _>(i).ok().flatten().map(Value::from)
        } else if type_name.contains("FLOAT")
            || type_name.contains("DOUBLE")
            || type_name.contains("REAL")
            || type_name.contains("NUMERIC")
            || type_name.contains("DECIMAL")
        {
            row.try_get::<Option<f64>, _>(i).ok().flatten().map(Value::from)
        } else if type_name.contains("BOOL") {
            row.try_get::<Option<bool>, _>(i).ok().flatten().map(Value::from)
        } else {
            // Text, timestamps, and anything else arrive as strings
            row.try_get::<Option<String>, _>(i)
                .ok()
                .flatten()
                .map(Value::from)
                .or_else(|| {
                    row.try_get::<Option<Vec<u8>>, _>(i)
                        .ok()
                        .flatten()
                        .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
                })
        };
        out.insert(name, value.unwrap_or(Value::Null));
    }
    out
}

#[async_trait]
impl Connector for SqlConnector {
    async fn open(&mut self) -> Result<(), SyncError> {
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(self.params.connection_timeout_secs))
            .connect(&self.url)
            .await
            .map_err(classify_sqlx)?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn fetch_batch(&mut self, cursor: Option<&str>, max: usize) -> Result<FetchResult, SyncError> {
        let cursor = SqlCursor::parse(cursor)?;
        let bounded = cursor.last.is_some() && self.increment_column.is_some();
        let sql = self.select_sql(bounded, max, cursor.offset);

        let mut query = sqlx::query(&sql);
        if bounded {
            query = query.bind(cursor.last.clone().expect("bounded scan has a watermark"));
        }
        let rows = query.fetch_all(self.pool()?).await.map_err(classify_sqlx)?;

        let records: Vec<Value> = rows.iter().map(|r| Value::Object(decode_row(r))).collect();
        self.stats.batch();
        self.stats.record(records.len() as u64);

        let eof = records.len() < max;
        let next_cursor = if eof {
            None
        } else {
            Some(
                SqlCursor {
                    last: cursor.last,
                    offset: cursor.offset + records.len() as u64,
                }
                .encode(),
            )
        };
        Ok(FetchResult {
            records,
            next_cursor,
            eof,
        })
    }

    async fn health(&self) -> Result<(), SyncError> {
        sqlx::query("SELECT 1")
            .fetch_one(self.pool()?)
            .await
            .map_err(classify_sqlx)?;
        Ok(())
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sql_db"
    }

    fn initial_cursor(&self, last_sync_value: Option<&str>) -> Option<String> {
        last_sync_value.map(|last| {
            SqlCursor {
                last: Some(last.to_string()),
                offset: 0,
            }
            .encode()
        })
    }
}
