//! Local entity records.

use crate::{EntityId, EntityType, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// A business entity as held by the local entity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Identifier, unique within its entity type
    pub id: EntityId,
    pub entity_type: EntityType,
    /// Version number, incremented on each local write
    pub version: Version,
    /// Opaque entity body
    pub payload: serde_json::Value,
    /// When the entity was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the entity was last written (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
}

impl Entity {
    /// Create a new live entity at version 1.
    pub fn new(
        entity_type: EntityType,
        id: impl Into<EntityId>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type,
            version: 1,
            payload,
            created_at: timestamp,
            updated_at: timestamp,
            deleted: false,
        }
    }

    /// Check if the entity is live (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Replace the payload and bump the version.
    pub fn update_payload(&mut self, payload: serde_json::Value, timestamp: Timestamp) {
        self.payload = payload;
        self.version += 1;
        self.updated_at = timestamp;
    }

    /// Mark the entity as deleted and bump the version.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.version += 1;
        self.updated_at = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_entity() {
        let entity = Entity::new(EntityType::Client, "client-1", json!({"name": "Acme"}), 1000);

        assert_eq!(entity.id, "client-1");
        assert_eq!(entity.entity_type, EntityType::Client);
        assert_eq!(entity.version, 1);
        assert_eq!(entity.created_at, 1000);
        assert!(entity.is_active());
    }

    #[test]
    fn update_entity() {
        let mut entity = Entity::new(EntityType::Client, "client-1", json!({"name": "Acme"}), 1000);
        entity.update_payload(json!({"name": "Acme Ltd"}), 2000);

        assert_eq!(entity.version, 2);
        assert_eq!(entity.payload, json!({"name": "Acme Ltd"}));
        assert_eq!(entity.created_at, 1000);
        assert_eq!(entity.updated_at, 2000);
    }

    #[test]
    fn delete_entity() {
        let mut entity = Entity::new(EntityType::Site, "site-1", json!({}), 1000);
        entity.mark_deleted(2000);

        assert!(entity.deleted);
        assert!(!entity.is_active());
        assert_eq!(entity.version, 2);
    }

    #[test]
    fn serialization_format() {
        let entity = Entity::new(EntityType::SupplyItem, "item-1", json!({"sku": "X"}), 1);
        let json = serde_json::to_string(&entity).unwrap();
        assert!(json.contains("\"entityType\":\"SUPPLY_ITEM\""));
        assert!(json.contains("updatedAt"));
    }
}
