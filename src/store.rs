// cms_importer/src/store.rs
// The object-persistence contract the importer talks to, and backend selection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ImporterError, Result};
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::strapi::{StrapiStore, StrapiVersion};

/// Attribute map of an entity, as sent to and read from the store.
pub type Fields = Map<String, Value,>;

/// Store-generated identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,)]
#[serde(transparent)]
pub struct EntityId(pub i64,);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_,>,) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record in the target store. Placeholders (dry-run only) carry no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,)]
pub struct Entity {
    pub id:     Option<EntityId,>,
    pub fields: Fields,
}

impl Entity {
    pub fn new(id: EntityId, fields: Fields,) -> Self {
        Self {
            id: Some(id,),
            fields,
        }
    }

    pub fn placeholder(fields: Fields,) -> Self {
        Self { id: None, fields, }
    }

    pub fn is_placeholder(&self,) -> bool {
        self.id.is_none()
    }

    pub fn get(&self, field: &str,) -> Option<&Value,> {
        self.fields.get(field,)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum FilterOp {
    Eq,
}

#[derive(Debug, Clone, PartialEq,)]
pub struct Filter {
    pub field: String,
    pub op:    FilterOp,
    pub value: Value,
}

/// `findMany` arguments: conjunction of filters plus an optional limit.
#[derive(Debug, Clone, Default, PartialEq,)]
pub struct Query {
    pub filters: Vec<Filter,>,
    pub limit:   Option<usize,>,
}

impl Query {
    pub fn eq(field: impl Into<String,>, value: impl Into<Value,>,) -> Self {
        Self {
            filters: vec![Filter {
                field: field.into(),
                op:    FilterOp::Eq,
                value: value.into(),
            }],
            limit:   None,
        }
    }

    pub fn limit(mut self, limit: usize,) -> Self {
        self.limit = Some(limit,);
        self
    }

    /// Whether `fields` satisfies every filter. Strings and numbers compare by
    /// their canonical text so `"10"` matches `10`.
    pub fn matches(&self, fields: &Fields,) -> bool {
        self.filters.iter().all(|f| match f.op {
            FilterOp::Eq => fields
                .get(&f.field,)
                .is_some_and(|v| loosely_equal(v, &f.value,),),
        },)
    }
}

fn loosely_equal(a: &Value, b: &Value,) -> bool {
    match (a, b,) {
        (Value::String(s,), Value::Number(n,),) | (Value::Number(n,), Value::String(s,),) => {
            s == &n.to_string()
        },
        _ => a == b,
    }
}

/// Connection details for a store backend.
#[derive(Debug, Clone, Default,)]
pub struct StoreConfig {
    pub url:            String,
    pub api_token:      Option<String,>,
    /// Only read by the Strapi backend.
    pub strapi_version: StrapiVersion,
}

/// The three-operation persistence contract of the content backend.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Connects to the backend described by `config`.
    async fn connect(config: StoreConfig,) -> Result<Self,>
    where
        Self: Sized;

    async fn find_many(&self, collection: &str, query: &Query,) -> Result<Vec<Entity,>,>;

    async fn create(&self, collection: &str, data: Fields,) -> Result<Entity,>;

    /// Writes `data` over the named fields of entity `id`; other fields are kept.
    async fn update(&self, collection: &str, id: EntityId, data: Fields,) -> Result<Entity,>;
}

/// Selects a backend from the URL scheme and connects to it.
pub async fn open_store(config: StoreConfig,) -> Result<Arc<dyn EntityStore,>,> {
    let scheme = config
        .url
        .split_once(':',)
        .map(|(scheme, _,)| scheme.to_ascii_lowercase(),)
        .ok_or_else(|| {
            ImporterError::ConfigurationError(format!("Store URL '{}' has no scheme", config.url),)
        },)?;

    let store: Arc<dyn EntityStore,> = match scheme.as_str() {
        "http" | "https" => Arc::new(StrapiStore::connect(config,).await?,),
        "sqlite" => Arc::new(SqliteStore::connect(config,).await?,),
        "memory" => Arc::new(MemoryStore::connect(config,).await?,),
        other => {
            return Err(ImporterError::ConfigurationError(format!(
                "Unsupported store scheme '{}'",
                other
            ),),);
        },
    };
    Ok(store,)
}
