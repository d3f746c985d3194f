// ABOUTME: groups the intent firewall rule model, its privileged file access, and the per-package store.
// ABOUTME: rule files block components at the framework level without touching package-manager state.

pub mod fs;
pub mod rules;
pub mod store;

pub use rules::{ComponentFilter, IntentFilter, RuleSection, Rules};
pub use store::{IfwStore, RuleFile};
