//! Broker catalog cache keyed by broker name.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

use tsuru_types::BrokerCatalog;

use crate::error::{Result, TsuruError};

pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(15 * 60);

struct CachedCatalog {
    catalog: BrokerCatalog,
    expires_at: Instant,
}

pub struct CatalogCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedCatalog>>,
}

impl Default for CatalogCache {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_TTL)
    }
}

impl CatalogCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// `None` on a miss or an expired entry.
    pub fn load(&self, broker: &str) -> Result<Option<BrokerCatalog>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| TsuruError::Storage(format!("lock: {e}")))?;
        Ok(entries
            .get(broker)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.catalog.clone()))
    }

    /// Stores with the default TTL, or `ttl` when given.
    pub fn save(&self, broker: &str, catalog: BrokerCatalog, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| TsuruError::Storage(format!("lock: {e}")))?;
        entries.insert(
            broker.to_string(),
            CachedCatalog {
                catalog,
                expires_at: Instant::now() + ttl.unwrap_or(self.ttl),
            },
        );
        Ok(())
    }

    pub fn invalidate(&self, broker: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(broker);
        }
    }
}
