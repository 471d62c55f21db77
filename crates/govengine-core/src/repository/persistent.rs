//! Persistent repository using redb.
//!
//! # Table design
//!
//! ```text
//! engine_actions       guid            -> JSON EngineAction
//! engine_action_names  qualified name  -> guid
//! elements             guid            -> JSON MetadataElement
//! relationships        guid            -> JSON Relationship
//! ```
//!
//! redb serializes write transactions, so reading the stored version and
//! writing the replacement inside one write transaction is a compare-and-swap.
//! The same holds for the qualified-name uniqueness check on insert.

use std::fmt;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use super::{
    duplicate_name, prepare_update, unknown_element, unknown_relationship, EVENT_CHANNEL_CAPACITY,
};
use crate::action::EngineAction;
use crate::error::{GovError, Result};
use crate::metadata::{
    MetadataElement, MetadataEvent, MetadataEventKind, MetadataReader, OpenMetadataStore,
    PropertyBag, Relationship,
};
use crate::store::EngineActionStore;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("engine_actions");
const ACTION_NAMES: TableDefinition<&str, &str> = TableDefinition::new("engine_action_names");
const ELEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("elements");
const RELATIONSHIPS: TableDefinition<&str, &[u8]> = TableDefinition::new("relationships");

fn db_err(e: impl fmt::Display) -> GovError {
    GovError::PropertyServer(e.to_string())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(db_err)
}

// ---------------------------------------------------------------------------
// RedbRepository
// ---------------------------------------------------------------------------

pub struct RedbRepository {
    db: Database,
    events: broadcast::Sender<MetadataEvent>,
}

impl RedbRepository {
    /// Open or create the database at `path`, creating all tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(ACTIONS).map_err(db_err)?;
        wt.open_table(ACTION_NAMES).map_err(db_err)?;
        wt.open_table(ELEMENTS).map_err(db_err)?;
        wt.open_table(RELATIONSHIPS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { db, events })
    }

    fn publish(&self, event: MetadataEvent) {
        let _ = self.events.send(event);
    }

    fn read_one<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(table).map_err(db_err)?;
        let found = table.get(key).map_err(db_err)?;
        found.map(|v| decode(v.value())).transpose()
    }

    fn read_all<T: DeserializeOwned>(&self, table: TableDefinition<&str, &[u8]>) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(table).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    /// Load, mutate and store one element inside a single write transaction.
    fn modify_element<F>(&self, guid: &str, f: F) -> Result<MetadataElement>
    where
        F: FnOnce(&mut MetadataElement) -> Result<()>,
    {
        let wt = self.db.begin_write().map_err(db_err)?;
        let element = {
            let mut table = wt.open_table(ELEMENTS).map_err(db_err)?;
            let existing = table
                .get(guid)
                .map_err(db_err)?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| unknown_element(guid))?;
            let mut element: MetadataElement = decode(&existing)?;
            f(&mut element)?;
            let encoded = serde_json::to_vec(&element)?;
            table.insert(guid, encoded.as_slice()).map_err(db_err)?;
            element
        };
        wt.commit().map_err(db_err)?;
        Ok(element)
    }
}

impl EngineActionStore for RedbRepository {
    fn insert(&self, action: &EngineAction) -> Result<()> {
        let value = serde_json::to_vec(action)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut names = wt.open_table(ACTION_NAMES).map_err(db_err)?;
            if names
                .get(action.qualified_name.as_str())
                .map_err(db_err)?
                .is_some()
            {
                return Err(duplicate_name(&action.qualified_name));
            }
            names
                .insert(action.qualified_name.as_str(), action.guid.as_str())
                .map_err(db_err)?;
            let mut table = wt.open_table(ACTIONS).map_err(db_err)?;
            table
                .insert(action.guid.as_str(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn get(&self, guid: &str) -> Result<Option<EngineAction>> {
        self.read_one(ACTIONS, guid)
    }

    fn find_by_qualified_name(&self, qualified_name: &str) -> Result<Option<EngineAction>> {
        let guid = {
            let rt = self.db.begin_read().map_err(db_err)?;
            let names = rt.open_table(ACTION_NAMES).map_err(db_err)?;
            let found = names.get(qualified_name).map_err(db_err)?;
            found.map(|v| v.value().to_string())
        };
        match guid {
            Some(guid) => self.get(&guid),
            None => Ok(None),
        }
    }

    fn update(&self, action: &EngineAction) -> Result<EngineAction> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let next = {
            let mut table = wt.open_table(ACTIONS).map_err(db_err)?;
            let existing = table
                .get(action.guid.as_str())
                .map_err(db_err)?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| GovError::invalid(format!("unknown engine action {}", action.guid)))?;
            let stored: EngineAction = decode(&existing)?;
            let next = prepare_update(&stored, action)?;
            let encoded = serde_json::to_vec(&next)?;
            table
                .insert(next.guid.as_str(), encoded.as_slice())
                .map_err(db_err)?;
            next
        };
        wt.commit().map_err(db_err)?;
        Ok(next)
    }

    fn list(&self) -> Result<Vec<EngineAction>> {
        let mut all: Vec<EngineAction> = self.read_all(ACTIONS)?;
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.guid.cmp(&b.guid)));
        Ok(all)
    }
}

impl MetadataReader for RedbRepository {
    fn get_element(&self, _user: &str, guid: &str) -> Result<MetadataElement> {
        self.read_one(ELEMENTS, guid)?
            .ok_or_else(|| unknown_element(guid))
    }

    fn find_elements(&self, _user: &str, type_name: &str) -> Result<Vec<MetadataElement>> {
        let mut found: Vec<MetadataElement> = self
            .read_all::<MetadataElement>(ELEMENTS)?
            .into_iter()
            .filter(|e| e.type_name == type_name)
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    fn relationships(&self, _user: &str, guid: &str) -> Result<Vec<Relationship>> {
        let mut found: Vec<Relationship> = self
            .read_all::<Relationship>(RELATIONSHIPS)?
            .into_iter()
            .filter(|r| r.touches(guid))
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }
}

impl OpenMetadataStore for RedbRepository {
    fn create_element(
        &self,
        user: &str,
        type_name: &str,
        properties: PropertyBag,
    ) -> Result<String> {
        let element = MetadataElement::new(type_name, properties, user);
        let encoded = serde_json::to_vec(&element)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(ELEMENTS).map_err(db_err)?;
            table
                .insert(element.guid.as_str(), encoded.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        self.publish(MetadataEvent::element(
            MetadataEventKind::NewElement,
            &element.guid,
            type_name,
            user,
        ));
        Ok(element.guid)
    }

    fn update_element(
        &self,
        user: &str,
        guid: &str,
        properties: PropertyBag,
        replace: bool,
    ) -> Result<()> {
        let element = self.modify_element(guid, |e| {
            e.update_properties(properties, replace);
            Ok(())
        })?;
        self.publish(MetadataEvent::element(
            MetadataEventKind::UpdatedElement,
            guid,
            element.type_name,
            user,
        ));
        Ok(())
    }

    fn delete_element(&self, user: &str, guid: &str) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let (element, detached) = {
            let mut elements = wt.open_table(ELEMENTS).map_err(db_err)?;
            let removed = elements
                .remove(guid)
                .map_err(db_err)?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| unknown_element(guid))?;
            let element: MetadataElement = decode(&removed)?;

            let mut relationships = wt.open_table(RELATIONSHIPS).map_err(db_err)?;
            let mut detached = Vec::new();
            for entry in relationships.iter().map_err(db_err)? {
                let (_, v) = entry.map_err(db_err)?;
                let rel: Relationship = decode(v.value())?;
                if rel.touches(guid) {
                    detached.push(rel);
                }
            }
            for rel in &detached {
                relationships.remove(rel.guid.as_str()).map_err(db_err)?;
            }
            (element, detached)
        };
        wt.commit().map_err(db_err)?;

        for rel in &detached {
            self.publish(MetadataEvent::relationship(
                MetadataEventKind::DeletedRelationship,
                rel,
                user,
            ));
        }
        self.publish(MetadataEvent::element(
            MetadataEventKind::DeletedElement,
            guid,
            element.type_name,
            user,
        ));
        Ok(())
    }

    fn classify(
        &self,
        user: &str,
        guid: &str,
        classification: &str,
        properties: PropertyBag,
    ) -> Result<()> {
        let element = self.modify_element(guid, |e| e.classify(classification, properties))?;
        self.publish(MetadataEvent::classification(
            MetadataEventKind::Classified,
            guid,
            element.type_name,
            classification,
            user,
        ));
        Ok(())
    }

    fn reclassify(
        &self,
        user: &str,
        guid: &str,
        classification: &str,
        properties: PropertyBag,
    ) -> Result<()> {
        let element = self.modify_element(guid, |e| e.reclassify(classification, properties))?;
        self.publish(MetadataEvent::classification(
            MetadataEventKind::Reclassified,
            guid,
            element.type_name,
            classification,
            user,
        ));
        Ok(())
    }

    fn declassify(&self, user: &str, guid: &str, classification: &str) -> Result<()> {
        let element = self.modify_element(guid, |e| e.declassify(classification))?;
        self.publish(MetadataEvent::classification(
            MetadataEventKind::Declassified,
            guid,
            element.type_name,
            classification,
            user,
        ));
        Ok(())
    }

    fn create_relationship(
        &self,
        user: &str,
        type_name: &str,
        end1_guid: &str,
        end2_guid: &str,
        properties: PropertyBag,
    ) -> Result<String> {
        let rel = Relationship::new(type_name, end1_guid, end2_guid, properties, user);
        let encoded = serde_json::to_vec(&rel)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let elements = wt.open_table(ELEMENTS).map_err(db_err)?;
            for end in [end1_guid, end2_guid] {
                if elements.get(end).map_err(db_err)?.is_none() {
                    return Err(unknown_element(end));
                }
            }
            let mut table = wt.open_table(RELATIONSHIPS).map_err(db_err)?;
            table
                .insert(rel.guid.as_str(), encoded.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        self.publish(MetadataEvent::relationship(
            MetadataEventKind::NewRelationship,
            &rel,
            user,
        ));
        Ok(rel.guid)
    }

    fn delete_relationship(&self, user: &str, guid: &str) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let rel: Relationship = {
            let mut table = wt.open_table(RELATIONSHIPS).map_err(db_err)?;
            let removed = table
                .remove(guid)
                .map_err(db_err)?
                .map(|v| v.value().to_vec())
                .ok_or_else(|| unknown_relationship(guid))?;
            decode(&removed)?
        };
        wt.commit().map_err(db_err)?;
        self.publish(MetadataEvent::relationship(
            MetadataEventKind::DeletedRelationship,
            &rel,
            user,
        ));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MetadataEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NewEngineAction;
    use crate::metadata::{properties, PropertyValue};
    use crate::types::EngineActionStatus;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbRepository) {
        let dir = TempDir::new().unwrap();
        let repo = RedbRepository::open(&dir.path().join("test.redb")).unwrap();
        (dir, repo)
    }

    fn action(name: &str) -> EngineAction {
        EngineAction::new(
            NewEngineAction::new(name, "scan-asset").target("asset-1"),
            "tester",
        )
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let (_dir, repo) = open_tmp();
        let a = action("q1");
        repo.insert(&a).unwrap();
        let loaded = repo.get(&a.guid).unwrap().unwrap();
        assert_eq!(loaded.qualified_name, "q1");
        assert_eq!(loaded.target_guids(), vec!["asset-1".to_string()]);
        assert!(repo.get("nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_name_leaves_single_record() {
        let (_dir, repo) = open_tmp();
        repo.insert(&action("q1")).unwrap();
        assert!(repo.insert(&action("q1")).is_err());
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn second_claim_with_same_version_conflicts() {
        let (_dir, repo) = open_tmp();
        let a = action("q1");
        repo.insert(&a).unwrap();

        let mut w1 = a.clone();
        w1.transition(EngineActionStatus::Activating).unwrap();
        w1.processing_engine_guid = Some("engine-1".into());
        let mut w2 = a.clone();
        w2.transition(EngineActionStatus::Activating).unwrap();
        w2.processing_engine_guid = Some("engine-2".into());

        repo.update(&w1).unwrap();
        assert!(matches!(repo.update(&w2), Err(GovError::Conflict { .. })));

        let stored = repo.get(&a.guid).unwrap().unwrap();
        assert_eq!(stored.processing_engine_guid.as_deref(), Some("engine-1"));
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.redb");
        let a = action("q1");
        let element_guid = {
            let repo = RedbRepository::open(&path).unwrap();
            repo.insert(&a).unwrap();
            repo.create_element("u", "Asset", properties([("qualifiedName", "asset-1")]))
                .unwrap()
        };
        let repo = RedbRepository::open(&path).unwrap();
        assert!(repo.find_by_qualified_name("q1").unwrap().is_some());
        let el = repo.get_element("u", &element_guid).unwrap();
        assert_eq!(el.properties["qualifiedName"], PropertyValue::from("asset-1"));
    }

    #[test]
    fn classification_failures_do_not_commit() {
        let (_dir, repo) = open_tmp();
        let guid = repo.create_element("u", "Asset", PropertyBag::new()).unwrap();
        repo.classify("u", &guid, "Retention", PropertyBag::new())
            .unwrap();
        assert!(repo
            .classify("u", &guid, "Retention", PropertyBag::new())
            .is_err());
        assert_eq!(repo.get_element("u", &guid).unwrap().version, 1);
    }

    #[test]
    fn delete_element_cascades_relationships() {
        let (_dir, repo) = open_tmp();
        let a = repo.create_element("u", "Asset", PropertyBag::new()).unwrap();
        let s = repo.create_element("u", "Schema", PropertyBag::new()).unwrap();
        let rel = repo
            .create_relationship("u", "SchemaAttachment", &a, &s, PropertyBag::new())
            .unwrap();
        repo.delete_element("u", &s).unwrap();
        assert!(repo.relationships("u", &a).unwrap().is_empty());
        assert!(repo.delete_relationship("u", &rel).is_err());
    }
}
