// cms_importer/src/strapi/mod.rs
// Strapi REST backend for the persistence contract.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::error::{ImporterError, Result};
use crate::store::{Entity, EntityId, EntityStore, Fields, FilterOp, Query, StoreConfig};

/// Strapi major version; decides how drafts are queried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum,)]
pub enum StrapiVersion {
    #[default]
    V4,
    V5,
}

pub struct StrapiStore {
    client:    Client,
    base:      Url,
    api_token: Option<String,>,
    version:   StrapiVersion,
    /// v5 addresses single entries by `documentId`, keyed here by numeric id.
    documents: Mutex<HashMap<(String, EntityId,), String,>,>,
}

#[derive(Serialize,)]
struct DataEnvelope<'a,> {
    data: &'a Fields,
}

#[derive(Deserialize,)]
struct ListResponse {
    #[serde(default)]
    data: Vec<Value,>,
}

#[derive(Deserialize,)]
struct ItemResponse {
    data: Value,
}

impl StrapiStore {
    pub fn collection_url(&self, collection: &str,) -> Result<Url,> {
        self.base
            .join(&format!("api/{}", collection),)
            .map_err(|e| ImporterError::ConfigurationError(format!("Invalid collection URL: {}", e),),)
    }

    fn entity_url(&self, collection: &str, id: EntityId,) -> Result<Url,> {
        let segment = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .get(&(collection.to_string(), id,),)
            .cloned()
            .unwrap_or_else(|| id.to_string(),);
        self.base
            .join(&format!("api/{}/{}", collection, segment),)
            .map_err(|e| ImporterError::ConfigurationError(format!("Invalid entity URL: {}", e),),)
    }

    /// Parses response items and keeps their document ids for later updates.
    fn accept(&self, collection: &str, items: Vec<Value,>,) -> Result<Vec<Entity,>,> {
        let parsed = items.into_iter().map(parse_entity,).collect::<Result<Vec<_,>,>>()?;
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner,);
        Ok(parsed
            .into_iter()
            .map(|(entity, document_id,)| {
                if let (Some(id,), Some(document_id,),) = (entity.id, document_id,) {
                    documents.insert((collection.to_string(), id,), document_id,);
                }
                entity
            },)
            .collect(),)
    }

    async fn read_item(&self, collection: &str, response: Response,) -> Result<Entity,> {
        let result: ItemResponse = response.json().await.map_err(|e| {
            ImporterError::DatabaseError(format!("Failed to parse Strapi response: {}", e),)
        },)?;
        self.accept(collection, vec![result.data],)?
            .pop()
            .ok_or_else(|| ImporterError::DatabaseError("Strapi returned no entity".to_string(),),)
    }

    fn authorize(&self, request: RequestBuilder,) -> RequestBuilder {
        match &self.api_token {
            Some(token,) => request.bearer_auth(token,),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder,) -> Result<Response,> {
        let response = self
            .authorize(request,)
            .send()
            .await
            .map_err(|e| ImporterError::ConnectionError(format!("Strapi request failed: {}", e),),)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response,);
        }

        let error_text = response.text().await.unwrap_or_default();
        Err(status_error(status, &error_text,),)
    }
}

/// Maps a failed HTTP status onto the error taxonomy; overload and server
/// faults are transient, everything else is a permanent rejection.
fn status_error(status: StatusCode, body: &str,) -> ImporterError {
    let message = format!("Strapi API error: {} - {}", status, body);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ImporterError::ConnectionError(message,)
    } else {
        ImporterError::DatabaseError(message,)
    }
}

/// Query-string pairs for a `findMany` call. Relations are populated and
/// drafts included, so entries the importer created itself are visible.
fn query_pairs(query: &Query, version: StrapiVersion,) -> Vec<(String, String,),> {
    let mut pairs = vec![("populate".to_string(), "*".to_string(),)];
    pairs.push(match version {
        StrapiVersion::V4 => ("publicationState".to_string(), "preview".to_string(),),
        StrapiVersion::V5 => ("status".to_string(), "draft".to_string(),),
    },);
    for filter in &query.filters {
        let op = match filter.op {
            FilterOp::Eq => "$eq",
        };
        let value = match &filter.value {
            Value::String(s,) => s.clone(),
            other => other.to_string(),
        };
        pairs.push((format!("filters[{}][{}]", filter.field, op), value,),);
    }
    if let Some(limit,) = query.limit {
        pairs.push(("pagination[limit]".to_string(), limit.to_string(),),);
    }
    pairs
}

/// Reads one item of a Strapi response. Handles both the v4 shape
/// (`{id, attributes: {...}}`) and the flat v5 shape (`{id, documentId, ...}`).
/// Populated relations come back as plain ids.
fn parse_entity(item: Value,) -> Result<(Entity, Option<String,>,),> {
    let Value::Object(mut obj,) = item else {
        return Err(ImporterError::DatabaseError(
            "Strapi returned a non-object entity".to_string(),
        ),);
    };

    let id = obj
        .remove("id",)
        .and_then(|v| v.as_i64(),)
        .map(EntityId,)
        .ok_or_else(|| ImporterError::DatabaseError("Strapi entity has no numeric id".to_string(),),)?;

    let document_id = match obj.remove("documentId",) {
        Some(Value::String(document_id,),) => Some(document_id,),
        _ => None,
    };

    let fields = match obj.remove("attributes",) {
        Some(Value::Object(attributes,),) => attributes,
        _ => obj,
    };
    let fields = fields
        .into_iter()
        .map(|(name, value,)| (name, flatten_relation(value,),),)
        .collect();
    Ok((Entity::new(id, fields,), document_id,),)
}

/// `{data: [{id}]}` and `{data: {id}}` (v4) or `[{id, documentId}]` and
/// `{id, documentId}` (v5) become an id list or a single id.
fn flatten_relation(value: Value,) -> Value {
    match value {
        Value::Object(mut obj,) if is_relation_envelope(&obj,) => match obj.remove("data",) {
            Some(Value::Array(items,),) => Value::Array(items.iter().filter_map(relation_id,).collect(),),
            Some(item @ Value::Object(_,),) => relation_id(&item,).unwrap_or(Value::Null,),
            _ => Value::Null,
        },
        Value::Object(obj,) if obj.contains_key("documentId",) => {
            obj.get("id",).filter(|id| id.is_i64(),).cloned().unwrap_or(Value::Null,)
        },
        Value::Array(items,) if !items.is_empty() && items.iter().all(|i| i.get("documentId",).is_some(),) => {
            Value::Array(items.iter().filter_map(relation_id,).collect(),)
        },
        other => other,
    }
}

fn is_relation_envelope(obj: &Fields,) -> bool {
    obj.contains_key("data",) && obj.keys().all(|k| k == "data" || k == "meta",)
}

fn relation_id(item: &Value,) -> Option<Value,> {
    item.get("id",).filter(|id| id.is_i64(),).cloned()
}

#[async_trait]
impl EntityStore for StrapiStore {
    async fn connect(config: StoreConfig,) -> Result<Self,> {
        let mut base = Url::parse(&config.url,)
            .map_err(|e| ImporterError::ConfigurationError(format!("Invalid Strapi URL: {}", e),),)?;
        if !base.path().ends_with('/',) {
            let path = format!("{}/", base.path());
            base.set_path(&path,);
        }

        if config.api_token.is_none() {
            info!("No API token configured; Strapi requests are unauthenticated");
        }

        Ok(StrapiStore {
            client: Client::new(),
            base,
            api_token: config.api_token,
            version: config.strapi_version,
            documents: Mutex::new(HashMap::new(),),
        },)
    }

    async fn find_many(&self, collection: &str, query: &Query,) -> Result<Vec<Entity,>,> {
        let url = self.collection_url(collection,)?;
        debug!("GET {} {:?}", url, query.filters);
        let response = self
            .send(self.client.get(url,).query(&query_pairs(query, self.version,),),)
            .await?;

        let result: ListResponse = response.json().await.map_err(|e| {
            ImporterError::DatabaseError(format!("Failed to parse Strapi response: {}", e),)
        },)?;

        self.accept(collection, result.data,)
    }

    async fn create(&self, collection: &str, data: Fields,) -> Result<Entity,> {
        let url = self.collection_url(collection,)?;
        let response = self
            .send(
                self.client
                    .post(url,)
                    .query(&[("populate", "*",)],)
                    .json(&DataEnvelope { data: &data, },),
            )
            .await?;
        self.read_item(collection, response,).await
    }

    async fn update(&self, collection: &str, id: EntityId, data: Fields,) -> Result<Entity,> {
        let url = self.entity_url(collection, id,)?;
        let response = self
            .send(
                self.client
                    .put(url,)
                    .query(&[("populate", "*",)],)
                    .json(&DataEnvelope { data: &data, },),
            )
            .await?;
        self.read_item(collection, response,).await
    }
}
