//! The record store on PostgreSQL.
//!
//! Each partition namespace is a schema holding one `records` table:
//!
//! ```sql
//! CREATE TABLE "partition_0".records (
//!     id          TEXT PRIMARY KEY,
//!     attributes  JSONB NOT NULL DEFAULT '{}',
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! Ids are stored in their canonical text form so `42` and `"42"` hit the
//! same row.

use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use partita_core::{
    ConnectionFactory, Endpoint, Key, Record, StoreConnection, StoreError, StoreResult,
};

use crate::connection::{PgConnection, Row};
use crate::error::PgError;

const UNIQUE_VIOLATION: &str = "23505";

/// Opens [`PgStore`] connections for pools.
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    timeout: Duration,
}

impl Default for PgConnectionFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl PgConnectionFactory {
    /// `timeout` bounds connecting and each socket read or write.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ConnectionFactory for PgConnectionFactory {
    fn connect(&self, endpoint: &Endpoint) -> StoreResult<Box<dyn StoreConnection>> {
        let conn = PgConnection::connect(endpoint, self.timeout).map_err(store_error)?;
        Ok(Box::new(PgStore::new(conn)))
    }
}

/// A [`StoreConnection`] over one PostgreSQL session.
pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub fn new(conn: PgConnection) -> Self {
        Self { conn }
    }
}

impl StoreConnection for PgStore {
    fn ensure_schema(&mut self, namespace: &str) -> StoreResult<()> {
        let schema = quote_ident(namespace);
        debug!(%namespace, "ensuring schema");
        self.conn
            .simple_query(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema}; \
                 CREATE TABLE IF NOT EXISTS {schema}.records (\
                 id TEXT PRIMARY KEY, \
                 attributes JSONB NOT NULL DEFAULT '{{}}', \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now())"
            ))
            .map_err(store_error)
    }

    fn insert(&mut self, namespace: &str, record: &Record) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {}.records (id, attributes) VALUES ($1, $2::jsonb)",
            quote_ident(namespace)
        );
        let id = record.id.canonical();
        let attributes = record.attributes_json();
        self.conn
            .execute(&sql, &[Some(id.as_str()), Some(attributes.as_str())])
            .map(|_| ())
            .map_err(store_error)
    }

    fn fetch(&mut self, namespace: &str, key: &Key) -> StoreResult<Option<Record>> {
        let sql = format!(
            "SELECT id, attributes::text FROM {}.records WHERE id = $1",
            quote_ident(namespace)
        );
        let id = key.canonical();
        let rows = self
            .conn
            .query(&sql, &[Some(id.as_str())])
            .map_err(store_error)?;
        rows.first().map(row_to_record).transpose()
    }

    fn is_healthy(&self) -> bool {
        !self.conn.is_broken()
    }
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Classify a driver error for the access layer.
pub fn store_error(err: PgError) -> StoreError {
    if err.sqlstate() == Some(UNIQUE_VIOLATION) {
        return StoreError::UniqueViolation(err.to_string());
    }
    if err.is_connection_loss() {
        StoreError::Transport(err.to_string())
    } else {
        StoreError::Rejected(err.to_string())
    }
}

fn row_to_record(row: &Row) -> StoreResult<Record> {
    let id = row
        .get(0)
        .ok_or_else(|| StoreError::Rejected("record row has no id".to_string()))?;
    let attributes = match row.get(1) {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(StoreError::Rejected(format!(
                    "attributes of {} are not an object: {}",
                    id, other
                )));
            }
            Err(err) => {
                return Err(StoreError::Rejected(format!(
                    "attributes of {} are not valid JSON: {}",
                    id, err
                )));
            }
        },
        None => Map::new(),
    };
    Ok(Record {
        id: Key::parse(id),
        attributes,
    })
}
