//! Conflict-significant field declarations.
//!
//! Each entity type declares which payload fields matter when deciding whether
//! a local and a remote version have really diverged, and which fields carry
//! timestamps that are refreshed when two versions are merged. The resolver
//! only sees this through the [`ConflictComparator`] trait, so applications can
//! plug in their own comparison without the engine knowing entity shapes.

use crate::EntityType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Compares local and remote payloads of one entity type.
pub trait ConflictComparator: Send + Sync {
    /// Conflict-significant fields on which the two payloads disagree.
    fn differing_fields(&self, entity_type: EntityType, local: &Value, remote: &Value)
        -> Vec<String>;

    /// Fields refreshed to the resolution time when payloads are merged.
    fn timestamp_fields(&self, entity_type: EntityType) -> Vec<String>;

    /// Whether the payloads agree on every conflict-significant field.
    fn equivalent(&self, entity_type: EntityType, local: &Value, remote: &Value) -> bool {
        self.differing_fields(entity_type, local, remote).is_empty()
    }
}

/// Field declarations for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    pub entity_type: EntityType,
    /// Fields compared for divergence. Empty means every non-timestamp field.
    pub significant_fields: Vec<String>,
    /// Fields holding modification timestamps
    pub timestamp_fields: Vec<String>,
}

impl EntitySchema {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            significant_fields: Vec::new(),
            timestamp_fields: Vec::new(),
        }
    }

    pub fn significant<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.significant_fields
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn timestamps<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.timestamp_fields
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Conflict-significant fields on which `local` and `remote` disagree.
    ///
    /// Non-object payloads are compared as a whole and reported as `"*"`.
    pub fn diff(&self, local: &Value, remote: &Value) -> Vec<String> {
        let (Some(local_obj), Some(remote_obj)) = (local.as_object(), remote.as_object()) else {
            return if local == remote {
                Vec::new()
            } else {
                vec!["*".to_string()]
            };
        };

        if !self.significant_fields.is_empty() {
            return self
                .significant_fields
                .iter()
                .filter(|f| local_obj.get(*f) != remote_obj.get(*f))
                .cloned()
                .collect();
        }

        let mut keys: Vec<&String> = local_obj.keys().chain(remote_obj.keys()).collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .filter(|k| !self.timestamp_fields.contains(k))
            .filter(|k| local_obj.get(*k) != remote_obj.get(*k))
            .cloned()
            .collect()
    }
}

/// Field declarations for all entity types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub entities: HashMap<EntityType, EntitySchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declarations for the built-in business entities.
    pub fn standard() -> Self {
        Self::new()
            .with_entity(
                EntitySchema::new(EntityType::Quote)
                    .significant(["clientId", "siteId", "status", "lineItems", "total", "notes"])
                    .timestamps(["updatedAt"]),
            )
            .with_entity(
                EntitySchema::new(EntityType::Client)
                    .significant(["name", "email", "phone", "address"])
                    .timestamps(["updatedAt"]),
            )
            .with_entity(
                EntitySchema::new(EntityType::Site)
                    .significant(["clientId", "name", "address", "contact"])
                    .timestamps(["updatedAt"]),
            )
            .with_entity(
                EntitySchema::new(EntityType::SupplyItem)
                    .significant(["name", "sku", "unit", "unitPrice"])
                    .timestamps(["updatedAt"]),
            )
    }

    pub fn add_entity(&mut self, schema: EntitySchema) -> &mut Self {
        self.entities.insert(schema.entity_type, schema);
        self
    }

    pub fn with_entity(mut self, schema: EntitySchema) -> Self {
        self.add_entity(schema);
        self
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&EntitySchema> {
        self.entities.get(&entity_type)
    }
}

impl ConflictComparator for Schema {
    fn differing_fields(
        &self,
        entity_type: EntityType,
        local: &Value,
        remote: &Value,
    ) -> Vec<String> {
        match self.get(entity_type) {
            Some(schema) => schema.diff(local, remote),
            None => EntitySchema::new(entity_type).diff(local, remote),
        }
    }

    fn timestamp_fields(&self, entity_type: EntityType) -> Vec<String> {
        self.get(entity_type)
            .map(|s| s.timestamp_fields.clone())
            .unwrap_or_default()
    }
}
