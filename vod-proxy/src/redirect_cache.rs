// Remembers where a resource was last served from, so later requests skip
// the redirect chain or go straight to the backup origin. Entries are hints:
// they are overwritten on re-resolution and never expire.
use crate::keys::ResourceKey;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct RedirectCache {
    redirects: Mutex<HashMap<ResourceKey, ResourceKey>>,
}

impl RedirectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &ResourceKey) -> Option<ResourceKey> {
        self.redirects.lock().get(resource).cloned()
    }

    pub fn insert(&self, resource: ResourceKey, resolved: ResourceKey) {
        tracing::debug!(resource = %resource, resolved = %resolved, "Caching redirect");
        self.redirects.lock().insert(resource, resolved);
    }

    pub fn len(&self) -> usize {
        self.redirects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
