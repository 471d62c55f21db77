pub mod action;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod io;
pub mod metadata;
pub mod paths;
pub mod process;
pub mod registry;
pub mod repository;
pub mod script;
pub mod store;
pub mod types;
pub mod watchdog;

pub use action::{Completion, EngineAction, NewEngineAction};
pub use engine::{DispatchOutcome, DispatchReport, GovernanceEngine};
pub use error::{ErrorKind, GovError, Result};
pub use handler::{GovernanceHandler, HandlerFailure, HandlerResult};
pub use types::{ActionTargetStatus, CompletionStatus, EngineActionStatus, ServiceRole};
