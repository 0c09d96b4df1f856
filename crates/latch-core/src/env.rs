//! Hooking environment
//!
//! All shared state lives in one explicitly constructed [`HookingEnv`]: the
//! allocator facade, the resolver with its watcher thread, and the
//! registration cache. Nothing here is a global; embedders create an
//! environment, hook through it, and shut it down (or drop it) when done.
//! Owned memory regions are released with the environment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use latch_common::{MethodDescriptor, MethodId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocator::{AllocatorConfig, MethodAllocator};
use crate::registry::MethodHook;
use crate::resolver::Resolver;

/// Runtime knobs; [`Default`] supplies production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Bound on blocking native-state resolution.
    pub resolve_timeout: Duration,
    /// Sleep between watcher passes over the in-flight methods.
    pub watcher_poll: Duration,
    pub routine_region_size: usize,
    pub node_region_size: usize,
    pub indirect_region_size: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let alloc = AllocatorConfig::default();
        Self {
            resolve_timeout: Duration::from_secs(5),
            watcher_poll: Duration::from_millis(2),
            routine_region_size: alloc.routine_region_size,
            node_region_size: alloc.node_region_size,
            indirect_region_size: alloc.indirect_region_size,
        }
    }
}

pub struct HookingEnv {
    allocator: Mutex<MethodAllocator>,
    resolver: Resolver,
    registrations: Mutex<HashMap<MethodId, Arc<MethodHook>>>,
}

impl HookingEnv {
    pub fn new(config: EnvConfig) -> Arc<Self> {
        info!(target: "latch_core::env", "starting hooking environment");
        Arc::new(Self {
            allocator: Mutex::new(MethodAllocator::new(AllocatorConfig {
                routine_region_size: config.routine_region_size,
                node_region_size: config.node_region_size,
                indirect_region_size: config.indirect_region_size,
            })),
            resolver: Resolver::new(config.resolve_timeout, config.watcher_poll),
            registrations: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(EnvConfig::default())
    }

    /// Idempotent per method identity; see [`MethodHook::create`].
    pub fn hook(self: &Arc<Self>, method: Arc<dyn MethodDescriptor>) -> Result<Arc<MethodHook>> {
        MethodHook::create(self, method)
    }

    /// Existing registration for `id`, if any.
    pub fn registration(&self, id: MethodId) -> Option<Arc<MethodHook>> {
        self.registrations.lock().get(&id).cloned()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Stops the watcher thread. Runs at most once; drop calls it too.
    pub fn shutdown(&self) {
        self.resolver.shutdown();
    }

    pub(crate) fn allocator(&self) -> &Mutex<MethodAllocator> {
        &self.allocator
    }

    pub(crate) fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub(crate) fn registrations(&self) -> &Mutex<HashMap<MethodId, Arc<MethodHook>>> {
        &self.registrations
    }
}

impl Drop for HookingEnv {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EnvConfig::default();
        assert_eq!(config.resolve_timeout, Duration::from_secs(5));
        assert_eq!(config.routine_region_size, 0x10000);
        assert_eq!(config.indirect_region_size, 0x1000);
    }

    #[test]
    fn test_env_starts_and_shuts_down() {
        let env = HookingEnv::with_defaults();
        assert_eq!(env.registration_count(), 0);
        env.shutdown();
        // Idempotent.
        env.shutdown();
    }
}
