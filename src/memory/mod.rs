// cms_importer/src/memory/mod.rs
// In-process store used for rehearsals and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{ImporterError, Result};
use crate::store::{Entity, EntityId, EntityStore, Fields, Query, StoreConfig};

#[derive(Debug, Clone,)]
struct Rejection {
    collection: String,
    field:      String,
    value:      Value,
}

pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Entity,>,>,>,
    next_id:     AtomicI64,
    mutations:   AtomicUsize,
    rejections:  Mutex<Vec<Rejection,>,>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new(),),
            next_id:     AtomicI64::new(1,),
            mutations:   AtomicUsize::new(0,),
            rejections:  Mutex::new(Vec::new(),),
        }
    }

    /// Makes every `create` in `collection` whose `field` equals `value` fail
    /// with a permanent store error.
    pub fn reject_creates(&self, collection: &str, field: &str, value: impl Into<Value,>,) {
        lock(&self.rejections,).push(Rejection {
            collection: collection.to_string(),
            field:      field.to_string(),
            value:      value.into(),
        },);
    }

    /// Number of successful creates and updates so far.
    pub fn mutation_count(&self,) -> usize {
        self.mutations.load(Ordering::SeqCst,)
    }

    pub fn entities(&self, collection: &str,) -> Vec<Entity,> {
        lock(&self.collections,)
            .get(collection,)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str,) -> usize {
        lock(&self.collections,)
            .get(collection,)
            .map_or(0, Vec::len,)
    }

    pub fn is_empty(&self,) -> bool {
        lock(&self.collections,).values().all(Vec::is_empty,)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T,>(mutex: &Mutex<T,>,) -> MutexGuard<'_, T,> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner,)
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn connect(config: StoreConfig,) -> Result<Self,> {
        debug!("Using in-memory store for '{}'", config.url);
        Ok(MemoryStore::new(),)
    }

    async fn find_many(&self, collection: &str, query: &Query,) -> Result<Vec<Entity,>,> {
        let collections = lock(&self.collections,);
        let limit = query.limit.unwrap_or(usize::MAX,);
        Ok(collections
            .get(collection,)
            .map(|entities| {
                entities
                    .iter()
                    .filter(|e| query.matches(&e.fields,),)
                    .take(limit,)
                    .cloned()
                    .collect()
            },)
            .unwrap_or_default(),)
    }

    async fn create(&self, collection: &str, data: Fields,) -> Result<Entity,> {
        let rejected = lock(&self.rejections,).iter().any(|r| {
            r.collection == collection
                && Query::eq(r.field.clone(), r.value.clone(),).matches(&data,)
        },);
        if rejected {
            return Err(ImporterError::DatabaseError(format!(
                "unique constraint rejected create in '{}'",
                collection
            ),),);
        }

        let id = EntityId(self.next_id.fetch_add(1, Ordering::SeqCst,),);
        let entity = Entity::new(id, data,);
        lock(&self.collections,)
            .entry(collection.to_string(),)
            .or_default()
            .push(entity.clone(),);
        self.mutations.fetch_add(1, Ordering::SeqCst,);
        Ok(entity,)
    }

    async fn update(&self, collection: &str, id: EntityId, data: Fields,) -> Result<Entity,> {
        let mut collections = lock(&self.collections,);
        let entity = collections
            .get_mut(collection,)
            .and_then(|entities| entities.iter_mut().find(|e| e.id == Some(id,),),)
            .ok_or_else(|| {
                ImporterError::DatabaseError(format!("{}#{} not found", collection, id),)
            },)?;
        entity.fields.extend(data,);
        self.mutations.fetch_add(1, Ordering::SeqCst,);
        Ok(entity.clone(),)
    }
}
