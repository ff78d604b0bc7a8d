//! Versioned response cache.
//!
//! This module provides the cache side of the offline layer:
//! - Named cache generations (namespaces), exactly one of them active
//! - Bulk provisioning of the portal shell at install time
//! - Activation that deletes every superseded generation
//! - Per-request reads and writes scoped to the active generation

mod lifecycle;
mod storage;

pub use lifecycle::{ActivationReport, CacheLifecycleManager, ProvisionReport};
pub use storage::{CacheStorage, NamespaceInfo, SqliteStorage, StoredResponse};
