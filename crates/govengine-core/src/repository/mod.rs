//! Repository implementations backing both `EngineActionStore` and
//! `OpenMetadataStore`.
//!
//! `MemoryRepository` is process-local and used by tests and embedders;
//! `RedbRepository` persists to a single redb file and is what the CLI uses.

pub mod memory;
pub mod persistent;

pub use self::memory::MemoryRepository;
pub use self::persistent::RedbRepository;

use crate::action::EngineAction;
use crate::error::{GovError, Result};

/// Capacity of the change-event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Decide whether `incoming` may replace `stored`, returning the record to
/// persist (with its version bumped).
pub(crate) fn prepare_update(stored: &EngineAction, incoming: &EngineAction) -> Result<EngineAction> {
    if stored.version != incoming.version {
        return Err(GovError::Conflict {
            guid: stored.guid.clone(),
            expected: incoming.version,
            found: stored.version,
        });
    }
    if stored.is_terminal() {
        return Err(GovError::invalid(format!(
            "engine action {} is {} and can no longer be modified",
            stored.guid, stored.status
        )));
    }
    if stored.qualified_name != incoming.qualified_name {
        return Err(GovError::invalid("qualified name cannot change after creation"));
    }
    if stored.request_source_guids != incoming.request_source_guids {
        return Err(GovError::invalid(
            "request sources cannot change after creation",
        ));
    }
    let mut next = incoming.clone();
    next.version = stored.version + 1;
    Ok(next)
}

pub(crate) fn duplicate_name(qualified_name: &str) -> GovError {
    GovError::invalid(format!(
        "an engine action with qualified name '{qualified_name}' already exists"
    ))
}

pub(crate) fn unknown_element(guid: &str) -> GovError {
    GovError::invalid(format!("unknown metadata element {guid}"))
}

pub(crate) fn unknown_relationship(guid: &str) -> GovError {
    GovError::invalid(format!("unknown relationship {guid}"))
}
