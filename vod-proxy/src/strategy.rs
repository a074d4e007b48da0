use crate::errors::Result;
use crate::keys::OriginKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-origin failover configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Strategy {
    /// Origin tried with the same path when the primary fails.
    pub backup: OriginKey,
    /// First-bytes origin. Accepted and validated, but no request path uses it yet.
    pub boot: Option<OriginKey>,
}

impl Strategy {
    /// Validates the backup and boot urls the same way as the origin they belong to.
    pub fn parse(backup: &str, boot: Option<&str>) -> Result<Self> {
        Ok(Strategy {
            backup: OriginKey::parse(backup)?,
            boot: boot.map(OriginKey::parse).transpose()?,
        })
    }
}

/// Origins governed by the proxy, with their strategies.
///
/// Written during setup, read by every request. Setting a strategy for an
/// origin that already has one replaces it.
#[derive(Default)]
pub struct StrategyTable {
    strategies: RwLock<HashMap<OriginKey, Arc<Strategy>>>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, origin: OriginKey, strategy: Strategy) {
        tracing::debug!(origin = %origin, backup = %strategy.backup, "Setting strategy");
        self.strategies.write().insert(origin, Arc::new(strategy));
    }

    pub fn get(&self, origin: &OriginKey) -> Option<Arc<Strategy>> {
        self.strategies.read().get(origin).cloned()
    }

    pub fn contains(&self, origin: &OriginKey) -> bool {
        self.strategies.read().contains_key(origin)
    }

    pub fn len(&self) -> usize {
        self.strategies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
