//! Certificate lookup: cache first, coordinated upstream fetch on a miss

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::cache::{CacheStatsSnapshot, CertificateCache};
use crate::config::Config;
use crate::coordinator::{CoordinatorStatsSnapshot, FetchCoordinator};
use crate::upstream::{CertificateSource, HttpUpstream};
use crate::{Error, Result};

/// Cache plus fetch coordinator behind a single `lookup` call
pub struct CertificateService {
    cache: Arc<CertificateCache>,
    coordinator: FetchCoordinator,
}

impl CertificateService {
    /// Build the service from configuration, talking to the configured
    /// upstream over HTTP.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let upstream = HttpUpstream::new(&config.upstream)?;
        Ok(Self::with_source(config, Arc::new(upstream)))
    }

    /// Build the service around any certificate source
    pub fn with_source(config: &Config, source: Arc<dyn CertificateSource>) -> Self {
        let cache = Arc::new(CertificateCache::new(&config.cache));
        let coordinator = FetchCoordinator::new(
            &config.coordinator,
            config.upstream.timeout,
            source,
            Arc::clone(&cache),
        );
        Self { cache, coordinator }
    }

    /// Look up the certificate for `control_number`
    ///
    /// Surrounding whitespace is ignored. Cached records are returned without
    /// touching the upstream; misses go through the fetch coordinator, which
    /// caches the record before it is returned here.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an empty control number, [`Error::Fetch`]
    /// when the upstream fetch fails.
    pub async fn lookup(&self, control_number: &str) -> Result<Value> {
        let control_number = control_number.trim();
        if control_number.is_empty() {
            return Err(Error::Validation("Control number required".to_string()));
        }

        if let Some(record) = self.cache.get(control_number) {
            trace!(control_number, "Cache hit");
            return Ok(record);
        }

        debug!(control_number, "Cache miss, fetching from upstream");
        Ok(self.coordinator.fetch(control_number).await?)
    }

    /// The underlying cache
    pub fn cache(&self) -> &CertificateCache {
        &self.cache
    }

    /// Combined statistics
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            coordinator: self.coordinator.stats(),
        }
    }
}

/// Statistics reported by the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Cache counters
    pub cache: CacheStatsSnapshot,
    /// Fetch coordinator counters
    pub coordinator: CoordinatorStatsSnapshot,
}
