//! Lifecycle events and filter hooks.

pub mod bus;
pub mod hooks;

pub use bus::{EventBus, ListenerOutcome};
pub use hooks::{HookChain, HookFailure, HookRun};
