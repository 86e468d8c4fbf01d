// cms_importer/src/linker.rs
// Writes relationship edges once their children are resolved.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ImporterError, Result};
use crate::retry::{RetryPolicy, execute_with_retry, wrap_error};
use crate::store::{Entity, EntityId, EntityStore, Fields};

#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum LinkOutcome {
    /// The relationship field now holds this many identifiers.
    Linked(usize,),
    /// The stored field already held exactly the resolved identifiers.
    Unchanged,
    DryRun,
}

pub struct Linker {
    store:   Arc<dyn EntityStore,>,
    dry_run: bool,
    retry:   RetryPolicy,
}

impl Linker {
    pub fn new(store: Arc<dyn EntityStore,>, dry_run: bool, retry: RetryPolicy,) -> Self {
        Self {
            store,
            dry_run,
            retry,
        }
    }

    /// Replaces `relation_field` on `parent` with the identifiers of
    /// `children`. `missing` names children that failed to resolve; they are
    /// left out of the edge.
    pub async fn link(
        &self,
        collection: &str,
        parent: &Entity,
        relation_field: &str,
        children: &[Entity],
        missing: &[String],
    ) -> Result<LinkOutcome,> {
        let parent_label = parent
            .id
            .map_or_else(|| "(new)".to_string(), |id| format!("#{}", id),);

        if !missing.is_empty() {
            warn!(
                "Linking {}{} '{}' without unresolved children: {}",
                collection,
                parent_label,
                relation_field,
                missing.join(", ")
            );
        }

        if self.dry_run {
            info!(
                "[dry-run] Would link {} {} to {}{}",
                children.len(),
                relation_field,
                collection,
                parent_label
            );
            return Ok(LinkOutcome::DryRun,);
        }

        let parent_id = parent.id.ok_or_else(|| ImporterError::LinkError {
            collection: collection.to_string(),
            id:         parent_label.clone(),
            field:      relation_field.to_string(),
            source:     Box::new(ImporterError::Other("parent entity has no identifier".to_string(),),),
        },)?;

        let ids = child_ids(children,);
        if ids.len() < children.len() {
            warn!(
                "{} {} children of {}#{} have no identifier and were left out",
                children.len() - ids.len(),
                relation_field,
                collection,
                parent_id
            );
        }

        let edge = Value::Array(ids.iter().map(|id| Value::from(id.0,),).collect(),);
        if parent.get(relation_field,) == Some(&edge,) {
            debug!("{}#{} '{}' already linked", collection, parent_id, relation_field);
            return Ok(LinkOutcome::Unchanged,);
        }

        let mut data = Fields::new();
        data.insert(relation_field.to_string(), edge,);

        let store = &self.store;
        let data = &data;
        execute_with_retry(self.retry, || async move {
            store
                .update(collection, parent_id, data.clone(),)
                .await
                .map_err(wrap_error,)
        },)
        .await
        .map_err(|source| ImporterError::LinkError {
            collection: collection.to_string(),
            id:         parent_id.to_string(),
            field:      relation_field.to_string(),
            source:     Box::new(source,),
        },)?;

        debug!(
            "Linked {} {} to {}#{}",
            ids.len(),
            relation_field,
            collection,
            parent_id
        );
        Ok(LinkOutcome::Linked(ids.len(),),)
    }
}

/// Identifiers of resolved children, de-duplicated in first-seen order.
fn child_ids(children: &[Entity],) -> Vec<EntityId,> {
    let mut ids: Vec<EntityId,> = Vec::with_capacity(children.len(),);
    for id in children.iter().filter_map(|c| c.id,) {
        if !ids.contains(&id,) {
            ids.push(id,);
        }
    }
    ids
}
