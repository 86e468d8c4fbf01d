// cms_importer/src/entity.rs
// Descriptors mapping an export's record shape onto a target collection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ImporterError, Result};
use crate::reader::SourceRecord;
use crate::store::Fields;

/// Copies one source field into one target field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,)]
pub struct FieldSpec {
    pub source:   String,
    pub target:   String,
    /// Written onto an existing entity when the stored value is missing.
    #[serde(default)]
    pub backfill: bool,
}

/// A lookup-only link to a collection imported by an earlier job, e.g. an
/// establishment's `LocationId`. Never creates the referenced entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,)]
pub struct ReferenceSpec {
    pub source_field:   String,
    pub collection:     String,
    pub key_field:      String,
    pub relation_field: String,
}

/// A nested array of child records, upserted and then linked to the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,)]
pub struct ChildSpec {
    pub source_field:   String,
    pub relation_field: String,
    pub entity:         EntitySpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,)]
pub struct EntitySpec {
    pub name:       String,
    pub collection: String,
    pub key_source: String,
    pub key_target: String,
    #[serde(default)]
    pub fields:     Vec<FieldSpec,>,
    #[serde(default)]
    pub references: Vec<ReferenceSpec,>,
    #[serde(default)]
    pub children:   Vec<ChildSpec,>,
}

impl EntitySpec {
    pub fn new(name: &str, collection: &str, key_source: &str, key_target: &str,) -> Self {
        Self {
            name:       name.to_string(),
            collection: collection.to_string(),
            key_source: key_source.to_string(),
            key_target: key_target.to_string(),
            fields:     Vec::new(),
            references: Vec::new(),
            children:   Vec::new(),
        }
    }

    pub fn field(mut self, source: &str, target: &str,) -> Self {
        self.fields.push(FieldSpec {
            source:   source.to_string(),
            target:   target.to_string(),
            backfill: false,
        },);
        self
    }

    pub fn backfill_field(mut self, source: &str, target: &str,) -> Self {
        self.fields.push(FieldSpec {
            source:   source.to_string(),
            target:   target.to_string(),
            backfill: true,
        },);
        self
    }

    pub fn reference(
        mut self,
        source_field: &str,
        collection: &str,
        key_field: &str,
        relation_field: &str,
    ) -> Self {
        self.references.push(ReferenceSpec {
            source_field:   source_field.to_string(),
            collection:     collection.to_string(),
            key_field:      key_field.to_string(),
            relation_field: relation_field.to_string(),
        },);
        self
    }

    pub fn child(mut self, source_field: &str, relation_field: &str, entity: EntitySpec,) -> Self {
        self.children.push(ChildSpec {
            source_field: source_field.to_string(),
            relation_field: relation_field.to_string(),
            entity,
        },);
        self
    }

    /// Applies `--map Source:target` overrides: renames the target of a known
    /// source field, or adds a plain copy for an unknown one.
    pub fn with_mappings(mut self, mappings: &HashMap<String, String,>,) -> Self {
        let mut sources: Vec<&String,> = mappings.keys().collect();
        sources.sort();

        for source in sources {
            let target = &mappings[source];
            if *source == self.key_source {
                self.key_target = target.clone();
                continue;
            }
            match self.fields.iter_mut().find(|f| &f.source == source,) {
                Some(field,) => field.target = target.clone(),
                None => self = self.field(source, target,),
            }
        }
        self
    }

    /// The canonical natural key of `record`.
    pub fn natural_key(&self, record: &SourceRecord,) -> Result<String,> {
        record
            .get(&self.key_source,)
            .and_then(canonical_key,)
            .ok_or_else(|| ImporterError::MissingNaturalKey(self.key_source.clone(),),)
    }

    /// The attributes a newly created entity gets: the natural key in string
    /// form plus every mapped field the record carries.
    pub fn creation_fields(&self, record: &SourceRecord, key: &str,) -> Fields {
        let mut fields = Fields::new();
        fields.insert(self.key_target.clone(), Value::String(key.to_string(),),);
        for spec in &self.fields {
            if let Some(value,) = record.get(&spec.source,).filter(|v| !is_blank(v,),) {
                fields.insert(spec.target.clone(), value.clone(),);
            }
        }
        fields
    }

    /// Backfillable values of `record` whose target is blank on `existing`.
    pub fn backfill_fields(&self, record: &SourceRecord, existing: &Fields,) -> Fields {
        let mut fields = Fields::new();
        for spec in self.fields.iter().filter(|f| f.backfill,) {
            if !existing.get(&spec.target,).is_none_or(is_blank,) {
                continue;
            }
            if let Some(value,) = record.get(&spec.source,).filter(|v| !is_blank(v,),) {
                fields.insert(spec.target.clone(), value.clone(),);
            }
        }
        fields
    }

    /// Every collection this descriptor touches, parents first.
    pub fn collections(&self,) -> Vec<String,> {
        let mut out = vec![self.collection.clone()];
        for child in &self.children {
            for collection in child.entity.collections() {
                if !out.contains(&collection,) {
                    out.push(collection,);
                }
            }
        }
        out
    }
}

/// Canonical string form of a natural-key value. Integral numbers lose any
/// fractional zero, strings are trimmed; anything else has no key.
pub fn canonical_key(value: &Value,) -> Option<String,> {
    match value {
        Value::Number(n,) => {
            if let Some(i,) = n.as_i64() {
                Some(i.to_string(),)
            } else if let Some(u,) = n.as_u64() {
                Some(u.to_string(),)
            } else {
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    Some(format!("{}", f as i64),)
                } else {
                    Some(n.to_string(),)
                }
            }
        },
        Value::String(s,) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string(),)
        },
        _ => None,
    }
}

/// Null and empty strings count as missing.
pub fn is_blank(value: &Value,) -> bool {
    match value {
        Value::Null => true,
        Value::String(s,) => s.trim().is_empty(),
        _ => false,
    }
}
