// cms_importer/src/upsert.rs
// Create-if-absent keyed by natural key.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{ImporterError, Result};
use crate::retry::{RetryPolicy, execute_with_retry, wrap_error};
use crate::store::{Entity, EntityStore, Fields, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize,)]
pub enum UpsertOutcome {
    Found,
    Created,
    /// Dry-run only: the entity is missing and a live run would create it.
    WouldCreate,
}

impl UpsertOutcome {
    pub fn was_created(&self,) -> bool {
        matches!(self, UpsertOutcome::Created)
    }
}

fn lock<T,>(mutex: &Mutex<T,>,) -> MutexGuard<'_, T,> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner,)
}

type LockKey = (String, String,);

/// One async mutex per (collection, natural key), held only while in use.
#[derive(Default,)]
struct KeyLocks {
    inner: Mutex<HashMap<LockKey, Arc<AsyncMutex<(),>,>,>,>,
}

impl KeyLocks {
    async fn acquire(&self, collection: &str, key: &str,) -> KeyGuard<'_,> {
        let key = (collection.to_string(), key.to_string(),);
        let key_lock = Arc::clone(lock(&self.inner,).entry(key.clone(),).or_default(),);
        KeyGuard {
            locks: self,
            key,
            guard: Some(key_lock.lock_owned().await,),
        }
    }

    #[cfg(test)]
    fn len(&self,) -> usize {
        lock(&self.inner,).len()
    }
}

struct KeyGuard<'a,> {
    locks: &'a KeyLocks,
    key:   LockKey,
    guard: Option<OwnedMutexGuard<(),>,>,
}

impl Drop for KeyGuard<'_,> {
    fn drop(&mut self,) {
        drop(self.guard.take(),);
        // Waiters hold a clone of the Arc, so a count of one means nobody else
        // wants this key.
        let mut inner = lock(&self.locks.inner,);
        if inner.get(&self.key,).is_some_and(|l| Arc::strong_count(l,) == 1,) {
            inner.remove(&self.key,);
        }
    }
}

pub struct UpsertEngine {
    store:   Arc<dyn EntityStore,>,
    dry_run: bool,
    retry:   RetryPolicy,
    locks:   KeyLocks,
    /// Dry-run only: keys a live run would have created by now.
    planned: Mutex<HashSet<LockKey,>,>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn EntityStore,>, dry_run: bool, retry: RetryPolicy,) -> Self {
        Self {
            store,
            dry_run,
            retry,
            locks: KeyLocks::default(),
            planned: Mutex::new(HashSet::new(),),
        }
    }

    pub fn is_dry_run(&self,) -> bool {
        self.dry_run
    }

    /// Looks up the single entity of `collection` whose `key_field` is `key`.
    pub async fn find(&self, collection: &str, key_field: &str, key: &str,) -> Result<Option<Entity,>,> {
        let store = &self.store;
        let query = Query::eq(key_field, key,).limit(1,);
        let query = &query;

        let found = execute_with_retry(self.retry, || async move {
            store.find_many(collection, query,).await.map_err(wrap_error,)
        },)
        .await
        .map_err(|source| ImporterError::LookupError {
            collection: collection.to_string(),
            key:        key.to_string(),
            source:     Box::new(source,),
        },)?;

        Ok(found.into_iter().next(),)
    }

    /// Returns the entity keyed by `key`, creating it from `fields` when it
    /// does not exist. Existing entities are returned untouched.
    pub async fn upsert(
        &self,
        collection: &str,
        key_field: &str,
        key: &str,
        fields: Fields,
    ) -> Result<(Entity, UpsertOutcome,),> {
        let _guard = self.locks.acquire(collection, key,).await;

        if let Some(existing,) = self.find(collection, key_field, key,).await? {
            debug!("Found {} '{}' ({:?})", collection, key, existing.id);
            return Ok((existing, UpsertOutcome::Found,),);
        }

        if self.dry_run {
            let first = lock(&self.planned,).insert((collection.to_string(), key.to_string(),),);
            if first {
                info!("[dry-run] Would create {} '{}'", collection, key);
                return Ok((Entity::placeholder(fields,), UpsertOutcome::WouldCreate,),);
            }
            return Ok((Entity::placeholder(fields,), UpsertOutcome::Found,),);
        }

        let entity = self.create(collection, key_field, key, fields,).await?;
        info!("Created {} '{}' (#{})", collection, key, entity.id.map(|id| id.0).unwrap_or_default());
        Ok((entity, UpsertOutcome::Created,),)
    }

    /// Creates under retry. A retried attempt first checks whether the failed
    /// attempt reached the store anyway, so a timeout never yields a duplicate.
    async fn create(&self, collection: &str, key_field: &str, key: &str, fields: Fields,) -> Result<Entity,> {
        let store = &self.store;
        let query = Query::eq(key_field, key,).limit(1,);
        let query = &query;
        let fields = &fields;
        let attempts = AtomicUsize::new(0,);
        let attempts = &attempts;

        execute_with_retry(self.retry, || async move {
            if attempts.fetch_add(1, Ordering::SeqCst,) > 0 {
                let existing = store.find_many(collection, query,).await.map_err(wrap_error,)?;
                if let Some(entity,) = existing.into_iter().next() {
                    return Ok(entity,);
                }
            }
            store.create(collection, fields.clone(),).await.map_err(wrap_error,)
        },)
        .await
        .map_err(|source| ImporterError::CreateError {
            collection: collection.to_string(),
            key:        key.to_string(),
            source:     Box::new(source,),
        },)
    }

    /// Writes `fields` onto an existing entity whose stored values are blank.
    /// Returns the updated entity, or `None` when nothing was written.
    pub async fn backfill(&self, collection: &str, entity: &Entity, fields: Fields,) -> Result<Option<Entity,>,> {
        if fields.is_empty() {
            return Ok(None,);
        }
        let names: Vec<&str,> = fields.keys().map(String::as_str,).collect();
        let names = names.join(",",);

        let Some(id,) = entity.id else {
            return Ok(None,);
        };
        if self.dry_run {
            info!("[dry-run] Would backfill {} on {}#{}", names, collection, id);
            return Ok(None,);
        }

        let store = &self.store;
        let fields = &fields;
        let updated = execute_with_retry(self.retry, || async move {
            store.update(collection, id, fields.clone(),).await.map_err(wrap_error,)
        },)
        .await
        .map_err(|source| ImporterError::LinkError {
            collection: collection.to_string(),
            id:         id.to_string(),
            field:      names.clone(),
            source:     Box::new(source,),
        },)?;

        info!("Backfilled {} on {}#{}", names, collection, id);
        Ok(Some(updated,),)
    }
}
