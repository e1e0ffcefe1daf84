//! HTTP client for the IP geolocation upstream.
//!
//! GET `<endpoint>/<escaped-ip>?fields=countryCode,region,status`, API key
//! (if any) in a request header. No retry here; retry policy belongs to the
//! cache layer.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

/// Header carrying the upstream API key.
const API_KEY_HEADER: &str = "X-API-Key";

/// Fields requested from the upstream; everything else is ignored.
const REQUESTED_FIELDS: &str = "countryCode,region,status";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default response body bound.
pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 1 << 20;

/// A successful geolocation answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub country_code: String,
    pub region: String,
}

/// Geolocation lookup failure.
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("invalid geolocation endpoint: {0}")]
    Endpoint(String),

    #[error("geolocation request failed: {0}")]
    Request(String),

    #[error("geolocation upstream returned non-200 status: {0}")]
    Status(u16),

    #[error("geolocation response exceeded {0} bytes")]
    ResponseTooLarge(u64),

    #[error("failed to decode geolocation response: {0}")]
    Decode(String),

    #[error("geolocation lookup failed for ip: {0}")]
    LookupFailed(IpAddr),

    #[error("cached geolocation lookup failure for ip: {0}")]
    CachedFailure(IpAddr),
}

/// Lookup seam so the cache layer can be driven by a scripted client in
/// tests.
#[async_trait]
pub trait GeoClient: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError>;
}

#[derive(Debug, Deserialize)]
struct GeoApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default, rename = "countryCode")]
    country_code: String,
    #[serde(default)]
    region: String,
}

/// Real upstream client over reqwest.
pub struct HttpGeoClient {
    endpoint: Url,
    api_key: Option<String>,
    max_response_bytes: u64,
    client: reqwest::Client,
}

impl HttpGeoClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        timeout: Duration,
        max_response_bytes: u64,
    ) -> Result<Self, GeoError> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| GeoError::Endpoint(format!("{}: {}", endpoint, e)))?;
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        let max_response_bytes = if max_response_bytes == 0 {
            DEFAULT_MAX_RESPONSE_BYTES
        } else {
            max_response_bytes
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeoError::Request(e.to_string()))?;
        Ok(Self {
            endpoint,
            api_key,
            max_response_bytes,
            client,
        })
    }

    /// Join `<endpoint>/<ip>` with exactly one slash and the fixed fields
    /// query. The IP lands in a path segment, so it is percent-escaped.
    fn build_url(&self, ip: &str) -> Result<Url, GeoError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| GeoError::Endpoint("endpoint cannot be a base URL".to_string()))?
            .pop_if_empty()
            .push(ip);
        url.query_pairs_mut().append_pair("fields", REQUESTED_FIELDS);
        Ok(url)
    }

    async fn read_bounded_body(&self, response: reqwest::Response) -> Result<Vec<u8>, GeoError> {
        let mut response = response;
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| GeoError::Request(e.to_string()))?
        {
            if body.len() as u64 + chunk.len() as u64 > self.max_response_bytes {
                return Err(GeoError::ResponseTooLarge(self.max_response_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl GeoClient for HttpGeoClient {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, GeoError> {
        let url = self.build_url(&ip.to_string())?;

        let mut request = self.client.get(url);
        if let Some(ref key) = self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GeoError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(GeoError::Status(status));
        }

        let body = self.read_bounded_body(response).await?;
        let data: GeoApiResponse =
            serde_json::from_slice(&body).map_err(|e| GeoError::Decode(e.to_string()))?;

        if data.status != "success" {
            return Err(GeoError::LookupFailed(ip));
        }
        Ok(GeoInfo {
            country_code: data.country_code,
            region: data.region,
        })
    }
}
