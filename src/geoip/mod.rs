//! Geolocation lookup: HTTP upstream client and the bounded LRU cache.

pub mod cache;
pub mod client;

pub use cache::{CacheMarker, GeoEntry, GeoResolver, DEFAULT_CACHE_CAPACITY, SUCCESS_TTL};
pub use client::{GeoClient, GeoError, GeoInfo, HttpGeoClient};
