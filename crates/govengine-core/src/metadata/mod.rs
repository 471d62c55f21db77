//! Contract the engine requires from the metadata repository.
//!
//! The repository itself is an external collaborator. `MetadataReader` is the
//! read-only half handed to verification-style handlers; `OpenMetadataStore`
//! adds the mutations and the change-event feed watchdogs subscribe to.

pub mod element;
pub mod event;

pub use element::{properties, MetadataElement, PropertyBag, PropertyValue, Relationship};
pub use event::{EventFilter, MetadataEvent, MetadataEventKind};

use tokio::sync::broadcast;

use crate::error::Result;

/// Read access to elements and relationships. A missing guid is an
/// `InvalidParameter` error.
pub trait MetadataReader: Send + Sync {
    fn get_element(&self, user: &str, guid: &str) -> Result<MetadataElement>;

    fn find_elements(&self, user: &str, type_name: &str) -> Result<Vec<MetadataElement>>;

    /// Relationships with `guid` at either end.
    fn relationships(&self, user: &str, guid: &str) -> Result<Vec<Relationship>>;
}

pub trait OpenMetadataStore: MetadataReader {
    fn create_element(&self, user: &str, type_name: &str, properties: PropertyBag)
        -> Result<String>;

    fn update_element(
        &self,
        user: &str,
        guid: &str,
        properties: PropertyBag,
        replace: bool,
    ) -> Result<()>;

    /// Deletes the element and every relationship attached to it.
    fn delete_element(&self, user: &str, guid: &str) -> Result<()>;

    fn classify(
        &self,
        user: &str,
        guid: &str,
        classification: &str,
        properties: PropertyBag,
    ) -> Result<()>;

    fn reclassify(
        &self,
        user: &str,
        guid: &str,
        classification: &str,
        properties: PropertyBag,
    ) -> Result<()>;

    fn declassify(&self, user: &str, guid: &str, classification: &str) -> Result<()>;

    fn create_relationship(
        &self,
        user: &str,
        type_name: &str,
        end1_guid: &str,
        end2_guid: &str,
        properties: PropertyBag,
    ) -> Result<String>;

    fn delete_relationship(&self, user: &str, guid: &str) -> Result<()>;

    /// Subscribe to the change-event feed. Events published before the call
    /// are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<MetadataEvent>;
}
