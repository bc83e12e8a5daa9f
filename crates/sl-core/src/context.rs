//! Shared collaborators handed to every thread operation.
//!
//! Threads hold no references back to the registry or scheduler; callers pass
//! the context in instead, which keeps ownership a tree.

use std::sync::Arc;

use crate::config::ConfigCache;
use crate::registry::ThreadRegistry;
use crate::scheduler::ClosureScheduler;
use crate::traits::{ChatTransport, RelayStore};

pub struct RelayContext {
    pub transport: Arc<dyn ChatTransport>,
    pub store: Arc<dyn RelayStore>,
    pub config: Arc<ConfigCache>,
    pub registry: ThreadRegistry,
    pub scheduler: ClosureScheduler,
}
