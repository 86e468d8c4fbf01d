// cms_importer/src/sqlite/mod.rs
// SQLite document store for staging imports locally.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tokio::task;
use tracing::info;

use crate::error::{ImporterError, Result};
use crate::store::{Entity, EntityId, EntityStore, Fields, FilterOp, Query, StoreConfig};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    data TEXT NOT NULL
)";

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS entities_collection ON entities (collection)";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection,>,>,
}

impl SqliteStore {
    async fn blocking<T, F,>(&self, op: F,) -> Result<T,>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection,) -> Result<T,> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn,);
        task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner,);
            op(&mut conn,)
        },)
        .await
        .map_err(|e| ImporterError::Other(format!("SQLite task failed: {}", e),),)?
    }
}

fn db_error(e: rusqlite::Error,) -> ImporterError {
    ImporterError::DatabaseError(e.to_string(),)
}

fn decode_fields(data: &str,) -> Result<Fields,> {
    serde_json::from_str(data,)
        .map_err(|e| ImporterError::DatabaseError(format!("Corrupt stored document: {}", e),),)
}

/// JSON path for a top-level field, quoted so any key is addressable.
fn json_path(field: &str,) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

fn to_sql_value(val: &Value,) -> rusqlite::types::Value {
    match val {
        Value::Number(n,) => {
            if let Some(i,) = n.as_i64() {
                rusqlite::types::Value::Integer(i,)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0,),)
            }
        },
        Value::String(s,) => rusqlite::types::Value::Text(s.clone(),),
        Value::Bool(b,) => rusqlite::types::Value::Integer(i64::from(*b,),),
        Value::Null => rusqlite::types::Value::Null,
        other => rusqlite::types::Value::Text(other.to_string(),),
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn connect(config: StoreConfig,) -> Result<Self,> {
        let conn_path = config.url.trim_start_matches("sqlite://",).to_string();
        if conn_path.is_empty() {
            return Err(ImporterError::ConfigurationError(
                "SQLite store URL has no database path".to_string(),
            ),);
        }

        let conn = task::spawn_blocking(move || {
            let conn = Connection::open(&conn_path,)?;
            conn.execute(CREATE_TABLE, [],)?;
            conn.execute(CREATE_INDEX, [],)?;
            Ok::<_, rusqlite::Error,>(conn,)
        },)
        .await
        .map_err(|e| {
            ImporterError::Other(format!(
                "Failed to spawn blocking task for SQLite connection: {}",
                e
            ),)
        },)?
        .map_err(|e| ImporterError::ConnectionError(format!("Failed to open SQLite: {}", e),),)?;

        info!("Opened SQLite store at '{}'", config.url);
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn,),),
        },)
    }

    async fn find_many(&self, collection: &str, query: &Query,) -> Result<Vec<Entity,>,> {
        let mut sql = "SELECT id, data FROM entities WHERE collection = ?1".to_string();
        let mut params: Vec<rusqlite::types::Value,> =
            vec![rusqlite::types::Value::Text(collection.to_string(),)];

        for filter in &query.filters {
            match filter.op {
                FilterOp::Eq => {
                    params.push(rusqlite::types::Value::Text(json_path(&filter.field,),),);
                    let path_idx = params.len();
                    params.push(to_sql_value(&filter.value,),);
                    let value_idx = params.len();
                    // Compare as text so "10" and 10 match each other.
                    sql.push_str(&format!(
                        " AND CAST(json_extract(data, ?{}) AS TEXT) = CAST(?{} AS TEXT)",
                        path_idx, value_idx
                    ),);
                },
            }
        }
        sql.push_str(" ORDER BY id",);
        if let Some(limit,) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit),);
        }

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql,).map_err(db_error,)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params,), |row| {
                    Ok((row.get::<_, i64,>(0,)?, row.get::<_, String,>(1,)?,),)
                },)
                .map_err(db_error,)?
                .collect::<std::result::Result<Vec<(i64, String,),>, rusqlite::Error,>>()
                .map_err(db_error,)?;

            rows.into_iter()
                .map(|(id, data,)| Ok(Entity::new(EntityId(id,), decode_fields(&data,)?,),),)
                .collect::<Result<Vec<Entity,>,>>()
        },)
        .await
    }

    async fn create(&self, collection: &str, data: Fields,) -> Result<Entity,> {
        let collection = collection.to_string();
        let json_data =
            serde_json::to_string(&data,).map_err(|e| ImporterError::Other(e.to_string(),),)?;

        let id = self
            .blocking(move |conn| {
                conn.execute(
                    "INSERT INTO entities (collection, data) VALUES (?1, ?2)",
                    params![collection, json_data],
                )
                .map_err(db_error,)?;
                Ok(conn.last_insert_rowid(),)
            },)
            .await?;

        Ok(Entity::new(EntityId(id,), data,),)
    }

    async fn update(&self, collection: &str, id: EntityId, data: Fields,) -> Result<Entity,> {
        let collection = collection.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(db_error,)?;
            let stored: Option<String,> = tx
                .query_row(
                    "SELECT data FROM entities WHERE id = ?1 AND collection = ?2",
                    params![id.0, collection],
                    |row| row.get(0,),
                )
                .optional()
                .map_err(db_error,)?;
            let stored = stored.ok_or_else(|| {
                ImporterError::DatabaseError(format!("{}#{} not found", collection, id),)
            },)?;

            let mut fields = decode_fields(&stored,)?;
            fields.extend(data,);
            let json_data = serde_json::to_string(&fields,)
                .map_err(|e| ImporterError::DatabaseError(e.to_string(),),)?;
            tx.execute(
                "UPDATE entities SET data = ?1 WHERE id = ?2",
                params![json_data, id.0],
            )
            .map_err(db_error,)?;
            tx.commit().map_err(db_error,)?;

            Ok(Entity::new(id, fields,),)
        },)
        .await
    }
}
