use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

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

#[derive(Default)]
struct State {
    actions: HashMap<String, EngineAction>,
    names: HashMap<String, String>,
    elements: HashMap<String, MetadataElement>,
    relationships: HashMap<String, Relationship>,
}

/// In-process repository. All operations take a single lock, which also
/// makes the conditional update atomic.
pub struct MemoryRepository {
    state: Mutex<State>,
    events: broadcast::Sender<MetadataEvent>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| GovError::property_server("repository lock poisoned"))
    }

    fn publish(&self, event: MetadataEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl EngineActionStore for MemoryRepository {
    fn insert(&self, action: &EngineAction) -> Result<()> {
        let mut state = self.state()?;
        if state.names.contains_key(&action.qualified_name) {
            return Err(duplicate_name(&action.qualified_name));
        }
        state
            .names
            .insert(action.qualified_name.clone(), action.guid.clone());
        state.actions.insert(action.guid.clone(), action.clone());
        Ok(())
    }

    fn get(&self, guid: &str) -> Result<Option<EngineAction>> {
        Ok(self.state()?.actions.get(guid).cloned())
    }

    fn find_by_qualified_name(&self, qualified_name: &str) -> Result<Option<EngineAction>> {
        let state = self.state()?;
        Ok(state
            .names
            .get(qualified_name)
            .and_then(|guid| state.actions.get(guid))
            .cloned())
    }

    fn update(&self, action: &EngineAction) -> Result<EngineAction> {
        let mut state = self.state()?;
        let stored = state
            .actions
            .get(&action.guid)
            .ok_or_else(|| GovError::invalid(format!("unknown engine action {}", action.guid)))?;
        let next = prepare_update(stored, action)?;
        state.actions.insert(next.guid.clone(), next.clone());
        Ok(next)
    }

    fn list(&self) -> Result<Vec<EngineAction>> {
        let mut all: Vec<EngineAction> = self.state()?.actions.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.guid.cmp(&b.guid)));
        Ok(all)
    }
}

impl MetadataReader for MemoryRepository {
    fn get_element(&self, _user: &str, guid: &str) -> Result<MetadataElement> {
        self.state()?
            .elements
            .get(guid)
            .cloned()
            .ok_or_else(|| unknown_element(guid))
    }

    fn find_elements(&self, _user: &str, type_name: &str) -> Result<Vec<MetadataElement>> {
        let mut found: Vec<MetadataElement> = self
            .state()?
            .elements
            .values()
            .filter(|e| e.type_name == type_name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    fn relationships(&self, _user: &str, guid: &str) -> Result<Vec<Relationship>> {
        let mut found: Vec<Relationship> = self
            .state()?
            .relationships
            .values()
            .filter(|r| r.touches(guid))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }
}

impl OpenMetadataStore for MemoryRepository {
    fn create_element(
        &self,
        user: &str,
        type_name: &str,
        properties: PropertyBag,
    ) -> Result<String> {
        let element = MetadataElement::new(type_name, properties, user);
        let guid = element.guid.clone();
        self.state()?.elements.insert(guid.clone(), element);
        self.publish(MetadataEvent::element(
            MetadataEventKind::NewElement,
            &guid,
            type_name,
            user,
        ));
        Ok(guid)
    }

    fn update_element(
        &self,
        user: &str,
        guid: &str,
        properties: PropertyBag,
        replace: bool,
    ) -> Result<()> {
        let type_name = {
            let mut state = self.state()?;
            let element = state
                .elements
                .get_mut(guid)
                .ok_or_else(|| unknown_element(guid))?;
            element.update_properties(properties, replace);
            element.type_name.clone()
        };
        self.publish(MetadataEvent::element(
            MetadataEventKind::UpdatedElement,
            guid,
            type_name,
            user,
        ));
        Ok(())
    }

    fn delete_element(&self, user: &str, guid: &str) -> Result<()> {
        let (element, detached) = {
            let mut state = self.state()?;
            let element = state
                .elements
                .remove(guid)
                .ok_or_else(|| unknown_element(guid))?;
            let detached: Vec<Relationship> = state
                .relationships
                .values()
                .filter(|r| r.touches(guid))
                .cloned()
                .collect();
            for rel in &detached {
                state.relationships.remove(&rel.guid);
            }
            (element, detached)
        };
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
        let type_name = {
            let mut state = self.state()?;
            let element = state
                .elements
                .get_mut(guid)
                .ok_or_else(|| unknown_element(guid))?;
            element.classify(classification, properties)?;
            element.type_name.clone()
        };
        self.publish(MetadataEvent::classification(
            MetadataEventKind::Classified,
            guid,
            type_name,
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
        let type_name = {
            let mut state = self.state()?;
            let element = state
                .elements
                .get_mut(guid)
                .ok_or_else(|| unknown_element(guid))?;
            element.reclassify(classification, properties)?;
            element.type_name.clone()
        };
        self.publish(MetadataEvent::classification(
            MetadataEventKind::Reclassified,
            guid,
            type_name,
            classification,
            user,
        ));
        Ok(())
    }

    fn declassify(&self, user: &str, guid: &str, classification: &str) -> Result<()> {
        let type_name = {
            let mut state = self.state()?;
            let element = state
                .elements
                .get_mut(guid)
                .ok_or_else(|| unknown_element(guid))?;
            element.declassify(classification)?;
            element.type_name.clone()
        };
        self.publish(MetadataEvent::classification(
            MetadataEventKind::Declassified,
            guid,
            type_name,
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
        let rel = {
            let mut state = self.state()?;
            for end in [end1_guid, end2_guid] {
                if !state.elements.contains_key(end) {
                    return Err(unknown_element(end));
                }
            }
            let rel = Relationship::new(type_name, end1_guid, end2_guid, properties, user);
            state.relationships.insert(rel.guid.clone(), rel.clone());
            rel
        };
        self.publish(MetadataEvent::relationship(
            MetadataEventKind::NewRelationship,
            &rel,
            user,
        ));
        Ok(rel.guid)
    }

    fn delete_relationship(&self, user: &str, guid: &str) -> Result<()> {
        let rel = self
            .state()?
            .relationships
            .remove(guid)
            .ok_or_else(|| unknown_relationship(guid))?;
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
