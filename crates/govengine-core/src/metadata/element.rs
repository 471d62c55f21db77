use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GovError, Result};

// ---------------------------------------------------------------------------
// PropertyValue / PropertyBag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<u32> for PropertyValue {
    fn from(v: u32) -> Self {
        PropertyValue::Int(i64::from(v))
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

pub type PropertyBag = BTreeMap<String, PropertyValue>;

/// Build a property bag from `(name, value)` pairs.
pub fn properties<I, K, V>(pairs: I) -> PropertyBag
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<PropertyValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// ---------------------------------------------------------------------------
// MetadataElement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataElement {
    pub guid: String,
    pub type_name: String,
    #[serde(default)]
    pub properties: PropertyBag,
    #[serde(default)]
    pub classifications: BTreeMap<String, PropertyBag>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl MetadataElement {
    pub fn new(type_name: impl Into<String>, properties: PropertyBag, user: &str) -> Self {
        let now = Utc::now();
        Self {
            guid: Uuid::new_v4().to_string(),
            type_name: type_name.into(),
            properties,
            classifications: BTreeMap::new(),
            created_by: user.to_string(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn qualified_name(&self) -> Option<&str> {
        self.properties.get("qualifiedName").and_then(PropertyValue::as_str)
    }

    /// Merge (or, with `replace`, swap in) new properties.
    pub fn update_properties(&mut self, properties: PropertyBag, replace: bool) {
        if replace {
            self.properties = properties;
        } else {
            self.properties.extend(properties);
        }
        self.touch();
    }

    pub fn classify(&mut self, classification: &str, properties: PropertyBag) -> Result<()> {
        if self.classifications.contains_key(classification) {
            return Err(GovError::invalid(format!(
                "element {} is already classified as {classification}",
                self.guid
            )));
        }
        self.classifications
            .insert(classification.to_string(), properties);
        self.touch();
        Ok(())
    }

    pub fn reclassify(&mut self, classification: &str, properties: PropertyBag) -> Result<()> {
        let existing = self.classifications.get_mut(classification).ok_or_else(|| {
            GovError::invalid(format!(
                "element {} is not classified as {classification}",
                self.guid
            ))
        })?;
        *existing = properties;
        self.touch();
        Ok(())
    }

    pub fn declassify(&mut self, classification: &str) -> Result<()> {
        if self.classifications.remove(classification).is_none() {
            return Err(GovError::invalid(format!(
                "element {} is not classified as {classification}",
                self.guid
            )));
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

// ---------------------------------------------------------------------------
// Relationship
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub guid: String,
    pub type_name: String,
    pub end1_guid: String,
    pub end2_guid: String,
    #[serde(default)]
    pub properties: PropertyBag,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        type_name: impl Into<String>,
        end1_guid: impl Into<String>,
        end2_guid: impl Into<String>,
        properties: PropertyBag,
        user: &str,
    ) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            type_name: type_name.into(),
            end1_guid: end1_guid.into(),
            end2_guid: end2_guid.into(),
            properties,
            created_by: user.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn touches(&self, guid: &str) -> bool {
        self.end1_guid == guid || self.end2_guid == guid
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
