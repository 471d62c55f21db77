use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// MetadataEventKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataEventKind {
    NewElement,
    UpdatedElement,
    DeletedElement,
    Classified,
    Reclassified,
    Declassified,
    NewRelationship,
    UpdatedRelationship,
    DeletedRelationship,
}

impl MetadataEventKind {
    pub fn is_relationship(self) -> bool {
        matches!(
            self,
            MetadataEventKind::NewRelationship
                | MetadataEventKind::UpdatedRelationship
                | MetadataEventKind::DeletedRelationship
        )
    }
}

impl fmt::Display for MetadataEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetadataEventKind::NewElement => "new_element",
            MetadataEventKind::UpdatedElement => "updated_element",
            MetadataEventKind::DeletedElement => "deleted_element",
            MetadataEventKind::Classified => "classified",
            MetadataEventKind::Reclassified => "reclassified",
            MetadataEventKind::Declassified => "declassified",
            MetadataEventKind::NewRelationship => "new_relationship",
            MetadataEventKind::UpdatedRelationship => "updated_relationship",
            MetadataEventKind::DeletedRelationship => "deleted_relationship",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// MetadataEvent
// ---------------------------------------------------------------------------

/// A change to an element or relationship in the metadata store.
///
/// For relationship events `element_guid` is the relationship's own guid and
/// the two ends are carried separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEvent {
    pub kind: MetadataEventKind,
    pub element_guid: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end1_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end2_guid: Option<String>,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

impl MetadataEvent {
    pub fn element(
        kind: MetadataEventKind,
        guid: impl Into<String>,
        type_name: impl Into<String>,
        user: &str,
    ) -> Self {
        Self {
            kind,
            element_guid: guid.into(),
            type_name: type_name.into(),
            classification: None,
            end1_guid: None,
            end2_guid: None,
            user_id: user.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn classification(
        kind: MetadataEventKind,
        guid: impl Into<String>,
        type_name: impl Into<String>,
        classification: &str,
        user: &str,
    ) -> Self {
        Self {
            classification: Some(classification.to_string()),
            ..Self::element(kind, guid, type_name, user)
        }
    }

    pub fn relationship(
        kind: MetadataEventKind,
        relationship: &super::Relationship,
        user: &str,
    ) -> Self {
        Self {
            end1_guid: Some(relationship.end1_guid.clone()),
            end2_guid: Some(relationship.end2_guid.clone()),
            ..Self::element(kind, &relationship.guid, &relationship.type_name, user)
        }
    }

    /// True if the event is about `guid`, either directly or as a relationship end.
    pub fn concerns(&self, guid: &str) -> bool {
        self.element_guid == guid
            || self.end1_guid.as_deref() == Some(guid)
            || self.end2_guid.as_deref() == Some(guid)
    }
}

// ---------------------------------------------------------------------------
// EventFilter
// ---------------------------------------------------------------------------

/// Selects which events a watchdog listener receives. Empty lists match all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub kinds: Vec<MetadataEventKind>,
    #[serde(default)]
    pub type_names: Vec<String>,
    #[serde(default)]
    pub element_guids: Vec<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = MetadataEventKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_names.push(type_name.into());
        self
    }

    pub fn element(mut self, guid: impl Into<String>) -> Self {
        self.element_guids.push(guid.into());
        self
    }

    pub fn matches(&self, event: &MetadataEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && (self.type_names.is_empty() || self.type_names.contains(&event.type_name))
            && (self.element_guids.is_empty()
                || self.element_guids.iter().any(|g| event.concerns(g)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn updated(guid: &str, type_name: &str) -> MetadataEvent {
        MetadataEvent::element(MetadataEventKind::UpdatedElement, guid, type_name, "u")
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(EventFilter::all().matches(&updated("a", "Asset")));
    }

    #[test]
    fn filter_dimensions_are_anded() {
        let filter = EventFilter::all()
            .kinds([MetadataEventKind::UpdatedElement])
            .type_name("Asset");
        assert!(filter.matches(&updated("a", "Asset")));
        assert!(!filter.matches(&updated("a", "Schema")));
        assert!(!filter.matches(&MetadataEvent::element(
            MetadataEventKind::NewElement,
            "a",
            "Asset",
            "u"
        )));
    }

    #[test]
    fn element_filter_matches_relationship_ends() {
        let rel = crate::metadata::Relationship::new(
            "SchemaAttachment",
            "asset-1",
            "schema-9",
            Default::default(),
            "u",
        );
        let event = MetadataEvent::relationship(MetadataEventKind::NewRelationship, &rel, "u");
        assert!(EventFilter::all().element("schema-9").matches(&event));
        assert!(!EventFilter::all().element("asset-2").matches(&event));
        assert!(event.kind.is_relationship());
    }
}
