//! Core module - Instance reconciliation, clone factory, and coordination

pub mod clone_factory;
pub mod coordinator;
pub mod error;
pub mod instance;
pub mod monitor;
pub mod reconciler;
pub mod settings;

pub use coordinator::{Command, Coordinator, CoordinatorHandle, Event};
pub use instance::{IdentityFamily, Instance};
pub use settings::Settings;
