//! Persistence contract for engine actions.
//!
//! Every update is conditional on the version the caller last read. That is
//! the only coordination between dispatch workers: whoever commits first wins,
//! everybody else gets `GovError::Conflict` and must walk away.

use crate::action::EngineAction;
use crate::error::Result;
use crate::types::EngineActionStatus;

pub trait EngineActionStore: Send + Sync {
    /// Persist a new action. Fails with `InvalidParameter` if another action
    /// already uses the same qualified name.
    fn insert(&self, action: &EngineAction) -> Result<()>;

    fn get(&self, guid: &str) -> Result<Option<EngineAction>>;

    fn find_by_qualified_name(&self, qualified_name: &str) -> Result<Option<EngineAction>>;

    /// Replace the stored record if its version still equals `action.version`.
    ///
    /// Returns the stored record with its version bumped. Fails with
    /// `Conflict` when the version moved on, and with `InvalidParameter` when
    /// the stored record is already terminal.
    fn update(&self, action: &EngineAction) -> Result<EngineAction>;

    /// All actions, oldest first.
    fn list(&self) -> Result<Vec<EngineAction>>;

    fn list_by_status(&self, statuses: &[EngineActionStatus]) -> Result<Vec<EngineAction>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|a| statuses.contains(&a.status))
            .collect())
    }
}
