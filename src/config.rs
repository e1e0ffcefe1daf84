//! Configuration: CLI arguments and the YAML server document.
//!
//! CLI flags (with GEOPROXY_ environment fallbacks) carry the process-wide
//! tuning knobs; the YAML file declares the listeners and their admission
//! rules. Validation refuses to start on any malformed entry.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, NaiveTime, Weekday};
use clap::Parser;
use serde::Deserialize;

use crate::core::Schedule;
use crate::error::GeoProxyError;
use crate::logger::log;

/// Endpoint used when an API key is configured; not overridable.
pub const PRO_ENDPOINT: &str = "https://pro.ip-api.com/json/";

/// Default endpoint for keyless accounts.
pub const FREE_ENDPOINT: &str = "http://ip-api.com/json/";

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// CLI arguments.
///
/// Supports environment variables with GEOPROXY_ prefix.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Geolocation-aware TCP reverse proxy")]
pub struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(long, env = "GEOPROXY_CONFIG", default_value = "geoproxy.yaml")]
    pub config: PathBuf,

    /// Geolocation endpoint override (keyless accounts only). When apiKey is
    /// set the endpoint is forced to the pro endpoint and cannot be
    /// overridden.
    #[arg(long = "geoip-endpoint", env = "GEOPROXY_GEOIP_ENDPOINT", default_value = "")]
    pub geoip_endpoint: String,

    /// Timeout for geolocation HTTP requests (e.g. "5s")
    #[arg(long = "geoip-timeout", env = "GEOPROXY_GEOIP_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub geoip_timeout: Duration,

    /// Maximum bytes to read from geolocation responses
    #[arg(
        long = "geoip-max-bytes",
        env = "GEOPROXY_GEOIP_MAX_BYTES",
        default_value_t = 1 << 20
    )]
    pub geoip_max_bytes: u64,

    /// Negative-cache TTL for failed geolocation lookups (0 disables)
    #[arg(long = "geoip-failure-ttl", env = "GEOPROXY_GEOIP_FAILURE_TTL", default_value = "30s", value_parser = parse_duration)]
    pub geoip_failure_ttl: Duration,

    /// Timeout for backend TCP dials (e.g. "5s")
    #[arg(long = "backend-dial-timeout", env = "GEOPROXY_BACKEND_DIAL_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub backend_dial_timeout: Duration,

    /// Idle timeout for proxied connections (0 disables)
    #[arg(long = "idle-timeout", env = "GEOPROXY_IDLE_TIMEOUT", default_value = "0s", value_parser = parse_duration)]
    pub idle_timeout: Duration,

    /// Maximum lifetime for a proxied connection (0 disables)
    #[arg(long = "max-conn-lifetime", env = "GEOPROXY_MAX_CONN_LIFETIME", default_value = "24h", value_parser = parse_duration)]
    pub max_conn_lifetime: Duration,

    /// Maximum concurrent client connections per server (0 disables)
    #[arg(
        long = "max-conns",
        env = "GEOPROXY_MAX_CONNS",
        default_value_t = 1024
    )]
    pub max_conns: usize,

    /// Maximum concurrent connections from a single source IP (0 disables)
    #[arg(
        long = "max-conns-per-source",
        env = "GEOPROXY_MAX_CONNS_PER_SOURCE",
        default_value_t = 0
    )]
    pub max_conns_per_source: usize,

    /// Timeout for receiving PROXY protocol headers from trusted proxies
    #[arg(long = "proxyproto-timeout", env = "GEOPROXY_PROXYPROTO_TIMEOUT", default_value = "1s", value_parser = parse_duration)]
    pub proxyproto_timeout: Duration,

    /// Capacity of the geolocation LRU cache
    #[arg(
        long = "cache-size",
        env = "GEOPROXY_CACHE_SIZE",
        default_value_t = 10_000
    )]
    pub cache_size: u64,

    /// Log mode: debug, info, warn, error
    #[arg(long = "log-mode", env = "GEOPROXY_LOG_MODE", default_value = "info")]
    pub log_mode: String,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.proxyproto_timeout.is_zero() {
            return Err(anyhow!("--proxyproto-timeout must be > 0"));
        }
        if self.geoip_timeout.is_zero() {
            return Err(anyhow!("--geoip-timeout must be > 0"));
        }
        if self.backend_dial_timeout.is_zero() {
            return Err(anyhow!("--backend-dial-timeout must be > 0"));
        }
        if self.cache_size == 0 {
            return Err(anyhow!("--cache-size must be > 0"));
        }
        Ok(())
    }
}

/// Resolve the effective geolocation endpoint from the API key and the
/// optional CLI override.
///
/// Pro accounts are pinned to HTTPS; keyless overrides must be plain-HTTP
/// URLs with a host and no userinfo.
pub fn resolve_geoip_endpoint(api_key: &str, override_endpoint: &str) -> Result<String> {
    if !api_key.is_empty() {
        if !override_endpoint.trim().is_empty() {
            return Err(anyhow!(
                "--geoip-endpoint cannot be used when apiKey is set; endpoint is forced to {}",
                PRO_ENDPOINT
            ));
        }
        return Ok(PRO_ENDPOINT.to_string());
    }

    let endpoint = override_endpoint.trim();
    if endpoint.is_empty() {
        return Ok(FREE_ENDPOINT.to_string());
    }

    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| anyhow!("invalid geoip endpoint {:?}: {}", endpoint, e))?;
    match url.scheme() {
        "https" => {
            return Err(anyhow!(
                "geoip endpoint {:?} uses https but apiKey is empty; the free tier does not support SSL",
                endpoint
            ));
        }
        "http" => {}
        other => {
            return Err(anyhow!(
                "invalid geoip endpoint {:?}: scheme must be http, got {:?}",
                endpoint,
                other
            ));
        }
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(anyhow!(
            "invalid geoip endpoint {:?}: userinfo not allowed",
            endpoint
        ));
    }
    if url.host_str().map(str::trim).unwrap_or("").is_empty() {
        return Err(anyhow!("invalid geoip endpoint {:?}: missing host", endpoint));
    }
    Ok(endpoint.to_string())
}

/// Top-level YAML document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// One `servers:` entry as written in YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    #[serde(rename = "listenIP")]
    pub listen_ip: String,
    #[serde(rename = "listenPort")]
    pub listen_port: u16,
    #[serde(rename = "backendIP")]
    pub backend_ip: String,
    #[serde(rename = "backendPort")]
    pub backend_port: u16,
    #[serde(default, rename = "allowedCountries")]
    pub allowed_countries: Vec<String>,
    #[serde(default, rename = "allowedRegions")]
    pub allowed_regions: Vec<String>,
    #[serde(default, rename = "deniedCountries")]
    pub denied_countries: Vec<String>,
    #[serde(default, rename = "deniedRegions")]
    pub denied_regions: Vec<String>,
    #[serde(default, rename = "alwaysAllowed")]
    pub always_allowed: Vec<String>,
    #[serde(default, rename = "alwaysDenied")]
    pub always_denied: Vec<String>,
    #[serde(default, rename = "recvProxyProtocol")]
    pub recv_proxy_protocol: bool,
    #[serde(default, rename = "sendProxyProtocol")]
    pub send_proxy_protocol: bool,
    #[serde(default, rename = "proxyProtocolVersion")]
    pub proxy_protocol_version: u8,
    #[serde(default, rename = "trustedProxies")]
    pub trusted_proxies: Vec<String>,
    #[serde(default, rename = "daysOfWeek")]
    pub days_of_week: Vec<String>,
    #[serde(default, rename = "startDate")]
    pub start_date: String,
    #[serde(default, rename = "endDate")]
    pub end_date: String,
    #[serde(default, rename = "startTime")]
    pub start_time: String,
    #[serde(default, rename = "endTime")]
    pub end_time: String,
}

/// Process-wide connection tuning from the CLI.
#[derive(Debug, Clone, Copy)]
pub struct ConnLimits {
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub dial_timeout: Duration,
    pub proxy_header_timeout: Duration,
    pub max_conns: usize,
    pub max_conns_per_source: usize,
}

impl ConnLimits {
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.idle_timeout,
            max_lifetime: cli.max_conn_lifetime,
            dial_timeout: cli.backend_dial_timeout,
            proxy_header_timeout: cli.proxyproto_timeout,
            max_conns: cli.max_conns,
            max_conns_per_source: cli.max_conns_per_source,
        }
    }
}

/// Compiled per-listener configuration, immutable after start.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub listen_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    /// Country sets are uppercased at load so lookups compare normalized
    /// codes on both sides.
    pub allowed_countries: HashSet<String>,
    pub denied_countries: HashSet<String>,
    /// Region sets are kept exactly as configured; comparisons are
    /// case-sensitive, so entries must match the upstream's spelling.
    pub allowed_regions: HashSet<String>,
    pub denied_regions: HashSet<String>,
    pub always_allowed: Vec<String>,
    pub always_denied: Vec<String>,
    pub schedule: Schedule,
    pub recv_proxy_protocol: bool,
    pub send_proxy_protocol: bool,
    pub proxy_protocol_version: u8,
    pub trusted_proxies: HashSet<IpAddr>,
    pub limits: ConnLimits,
}

/// Read and validate the YAML config file.
pub fn read_config(path: &Path) -> Result<Config> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    let config: Config = serde_yaml::from_str(&data)
        .map_err(|e| anyhow!("failed to parse {}: {}", path.display(), e))?;
    if config.servers.is_empty() {
        return Err(anyhow!("no servers defined in {}", path.display()));
    }
    Ok(config)
}

impl ServerEntry {
    fn listen_tuple(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }

    /// Validate this entry and compile it into a runtime listener config.
    pub fn compile(&self, limits: ConnLimits) -> Result<ListenerConfig> {
        let tuple = self.listen_tuple();

        let listen_ip: IpAddr = self
            .listen_ip
            .parse()
            .map_err(|_| anyhow!("invalid listenIP {:?} for server {}", self.listen_ip, tuple))?;
        let backend_ip: IpAddr = self.backend_ip.parse().map_err(|_| {
            anyhow!("invalid backendIP {:?} for server {}", self.backend_ip, tuple)
        })?;

        if self.allowed_countries.is_empty() && self.denied_countries.is_empty() {
            return Err(anyhow!("no countries specified for server {}", tuple));
        }

        if self.send_proxy_protocol
            && self.proxy_protocol_version != 1
            && self.proxy_protocol_version != 2
        {
            return Err(anyhow!(
                "invalid proxyProtocolVersion {} for server {} (expected 1 or 2)",
                self.proxy_protocol_version,
                tuple
            ));
        }

        let trusted_proxies = if self.recv_proxy_protocol {
            if self.trusted_proxies.is_empty() {
                return Err(anyhow!(
                    "recvProxyProtocol is true but trustedProxies is empty for server {}; \
                     configure trustedProxies to avoid PROXY protocol spoofing",
                    tuple
                ));
            }
            validate_trusted_proxies(&self.trusted_proxies)
                .map_err(|e| anyhow!("server {} trustedProxies: {}", tuple, e))?
        } else {
            if !self.trusted_proxies.is_empty() {
                log::warn!(
                    server = %tuple,
                    "trustedProxies ignored because recvProxyProtocol is false"
                );
            }
            HashSet::new()
        };

        validate_ip_or_cidr_entries(&self.always_allowed)
            .map_err(|e| anyhow!("server {} alwaysAllowed: {}", tuple, e))?;
        validate_ip_or_cidr_entries(&self.always_denied)
            .map_err(|e| anyhow!("server {} alwaysDenied: {}", tuple, e))?;

        let schedule = self.compile_schedule(&tuple)?;

        Ok(ListenerConfig {
            listen_addr: SocketAddr::new(listen_ip, self.listen_port),
            backend_addr: SocketAddr::new(backend_ip, self.backend_port),
            allowed_countries: normalize_country_set(&self.allowed_countries),
            denied_countries: normalize_country_set(&self.denied_countries),
            allowed_regions: trim_set(&self.allowed_regions),
            denied_regions: trim_set(&self.denied_regions),
            always_allowed: self.always_allowed.clone(),
            always_denied: self.always_denied.clone(),
            schedule,
            recv_proxy_protocol: self.recv_proxy_protocol,
            send_proxy_protocol: self.send_proxy_protocol,
            proxy_protocol_version: self.proxy_protocol_version,
            trusted_proxies,
            limits,
        })
    }

    fn compile_schedule(&self, tuple: &str) -> Result<Schedule> {
        if (self.start_date.is_empty()) != (self.end_date.is_empty()) {
            return Err(anyhow!(
                "both startDate and endDate must be set for server {}",
                tuple
            ));
        }
        if !self.days_of_week.is_empty() && !self.start_date.is_empty() {
            return Err(anyhow!(
                "daysOfWeek cannot be combined with startDate/endDate for server {}",
                tuple
            ));
        }
        if (self.start_time.is_empty()) != (self.end_time.is_empty()) {
            return Err(anyhow!(
                "both startTime and endTime must be set for server {}",
                tuple
            ));
        }

        let date_range = if !self.start_date.is_empty() {
            let start = NaiveDate::parse_from_str(&self.start_date, "%Y-%m-%d")
                .map_err(|e| anyhow!("failed to parse start date {}: {}", self.start_date, e))?;
            let end = NaiveDate::parse_from_str(&self.end_date, "%Y-%m-%d")
                .map_err(|e| anyhow!("failed to parse end date {}: {}", self.end_date, e))?;
            if start > end {
                return Err(anyhow!(
                    "start date {} is after end date {}",
                    self.start_date,
                    self.end_date
                ));
            }
            Some((start, end))
        } else {
            None
        };

        let window = if !self.start_time.is_empty() {
            let start = NaiveTime::parse_from_str(&self.start_time, "%H:%M")
                .map_err(|e| anyhow!("failed to parse start time {}: {}", self.start_time, e))?;
            let end = NaiveTime::parse_from_str(&self.end_time, "%H:%M")
                .map_err(|e| anyhow!("failed to parse end time {}: {}", self.end_time, e))?;
            Some((start, end))
        } else {
            None
        };

        let days = parse_days_of_week(&self.days_of_week)
            .map_err(|e| anyhow!("failed to parse days of week for server {}: {}", tuple, e))?;

        Ok(Schedule {
            date_range,
            days,
            window,
        })
    }
}

fn normalize_country_set(entries: &[String]) -> HashSet<String> {
    entries
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn trim_set(entries: &[String]) -> HashSet<String> {
    entries
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Trusted proxies are plain IPs; CIDRs are rejected outright.
fn validate_trusted_proxies(entries: &[String]) -> crate::error::Result<HashSet<IpAddr>> {
    let mut set = HashSet::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(GeoProxyError::Config(format!("invalid IP {:?}", entry)));
        }
        if entry.parse::<ipnet::IpNet>().is_ok() {
            return Err(GeoProxyError::Config(format!(
                "CIDRs are not allowed in trustedProxies (got {:?}); use a plain IPv4/IPv6 address",
                entry
            )));
        }
        let ip: IpAddr = entry
            .parse()
            .map_err(|_| GeoProxyError::Config(format!("invalid IP {:?}", entry)))?;
        set.insert(ip);
    }
    Ok(set)
}

fn validate_ip_or_cidr_entries(entries: &[String]) -> crate::error::Result<()> {
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(GeoProxyError::Config(format!("invalid IP/CIDR {:?}", entry)));
        }
        if entry.parse::<IpAddr>().is_ok() {
            continue;
        }
        if entry.parse::<ipnet::IpNet>().is_ok() {
            continue;
        }
        return Err(GeoProxyError::Config(format!("invalid IP/CIDR {:?}", entry)));
    }
    Ok(())
}

/// Parse a weekday name: long and common short forms, case-insensitive.
pub fn parse_weekday(day: &str) -> Result<Weekday> {
    match day.trim().to_lowercase().as_str() {
        "sun" | "sunday" => Ok(Weekday::Sun),
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tues" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thurs" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        _ => Err(anyhow!("invalid weekday: {}", day)),
    }
}

fn parse_days_of_week(days: &[String]) -> Result<HashSet<Weekday>> {
    let mut parsed = HashSet::with_capacity(days.len());
    for day in days {
        parsed.insert(parse_weekday(day)?);
    }
    Ok(parsed)
}
