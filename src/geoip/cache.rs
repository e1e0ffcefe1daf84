//! Bounded LRU cache in front of the geolocation client.
//!
//! Success entries live long (24 h); failure entries are negative-cached
//! for a short, configurable TTL so an upstream outage is absorbed instead
//! of hammered. Exactly one entry variant per key; a state change replaces
//! the prior entry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;

use super::client::{GeoClient, GeoError, GeoInfo};

/// Successful entries are valid for 24 hours.
pub const SUCCESS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default cache capacity (entries).
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Where a resolution came from, for the log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMarker {
    /// Served from a live success entry.
    Cached,
    /// Served from a live negative entry.
    CachedFailure,
    /// Upstream was consulted.
    Fresh,
}

impl CacheMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMarker::Cached => "cached",
            CacheMarker::CachedFailure => "cached-failure",
            CacheMarker::Fresh => "-",
        }
    }
}

/// One cache slot: a success with its expiry, or a negative entry.
#[derive(Debug, Clone)]
pub enum GeoEntry {
    Success {
        country_code: String,
        region: String,
        expires_at: Instant,
    },
    Failure {
        failure_until: Instant,
    },
}

/// Shared geolocation resolver: bounded LRU over a `GeoClient`.
///
/// Safe for concurrent lookups from every listener; lookups touch recency
/// and eviction is least-recently-used on insert.
pub struct GeoResolver {
    client: Arc<dyn GeoClient>,
    cache: Cache<IpAddr, GeoEntry>,
    failure_ttl: Duration,
}

impl GeoResolver {
    /// `failure_ttl` of zero disables negative caching entirely.
    pub fn new(client: Arc<dyn GeoClient>, capacity: u64, failure_ttl: Duration) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CACHE_CAPACITY
        } else {
            capacity
        };
        Self {
            client,
            cache: Cache::builder().max_capacity(capacity).build(),
            failure_ttl,
        }
    }

    /// Resolve `ip` to country/region through the cache.
    ///
    /// Contract, in order: live success hit -> cached value; expired success
    /// -> evict and refill; live failure hit -> cached failure; expired
    /// failure -> evict and refill; miss -> upstream call, caching the
    /// outcome (failures only when a positive TTL is configured).
    pub async fn resolve(&self, ip: IpAddr) -> (Result<GeoInfo, GeoError>, CacheMarker) {
        if let Some(entry) = self.cache.get(&ip) {
            match entry {
                GeoEntry::Success {
                    country_code,
                    region,
                    expires_at,
                } => {
                    if Instant::now() < expires_at {
                        return (
                            Ok(GeoInfo {
                                country_code,
                                region,
                            }),
                            CacheMarker::Cached,
                        );
                    }
                    self.cache.invalidate(&ip);
                }
                GeoEntry::Failure { failure_until } => {
                    if Instant::now() < failure_until {
                        return (Err(GeoError::CachedFailure(ip)), CacheMarker::CachedFailure);
                    }
                    self.cache.invalidate(&ip);
                }
            }
        }

        match self.client.lookup(ip).await {
            Ok(info) => {
                self.cache.insert(
                    ip,
                    GeoEntry::Success {
                        country_code: info.country_code.clone(),
                        region: info.region.clone(),
                        expires_at: Instant::now() + SUCCESS_TTL,
                    },
                );
                (Ok(info), CacheMarker::Fresh)
            }
            Err(e) => {
                if !self.failure_ttl.is_zero() {
                    self.cache.insert(
                        ip,
                        GeoEntry::Failure {
                            failure_until: Instant::now() + self.failure_ttl,
                        },
                    );
                }
                (Err(e), CacheMarker::Fresh)
            }
        }
    }

    /// Insert an entry directly; used to pre-seed state in tests.
    #[cfg(test)]
    pub(crate) fn insert_entry(&self, ip: IpAddr, entry: GeoEntry) {
        self.cache.insert(ip, entry);
    }

    /// Entry count after flushing pending cache maintenance.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}
