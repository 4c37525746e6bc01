//! Service configuration: TOML file plus `RPCX_*` environment overrides.
//!
//! The file is read once at startup, overridden from the environment, and
//! resolved against the host identity into a validated [`ServiceConfig`].
//! Any missing essential value is a startup error; the process must not serve.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `RPCX_CONFIG` | `service.toml` | Config file path (binary only) |
//! | `RPCX_SERVICE_NAME` | file value | Service name |
//! | `RPCX_SERVICE_ADDR` | file value | Bind address |
//! | `RPCX_LOG_DIR` | file value | Log directory |
//! | `RPCX_CALL_TIMEOUT_MS` | 15000 | Outbound call deadline (ms) |
//! | `RPCX_RENEW_ONE_IN` | 111 | Forced pool renewal odds (0 disables) |
//! | `RPCX_LOG_SINK_CAPACITY` | 100 | Max resident named log sinks |

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::client::balance::{FailMode, SelectMode};
use crate::client::xclient::ClientOptions;
use crate::host::{self, ServiceIdentity, DEVELOP_MODE};
use crate::notify::NotifyConfig;
use crate::service::dispatch::DispatchConfig;
use crate::service::session::SessionConfig;
use crate::service::signature::SignConfig;

const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 30;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_RENEW_ONE_IN: u32 = 111;
const DEFAULT_LOG_SINK_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file '{path}' error: {reason}")]
    Io { path: String, reason: String },

    #[error("parse config error: {0}")]
    Parse(String),

    #[error("{0}")]
    Invalid(String),
}

/// `[global]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GlobalSection {
    pub mode_key: String,
    pub development_server: DevelopmentServer,
    pub public_ip_url: String,
}

/// Shared development machine that hosts the discovery backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DevelopmentServer {
    pub hostname: String,
    pub ip: String,
}

/// `[service.discovery.<mode>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub base_path: String,
    pub addr: String,
    pub update_interval_secs: i64,
}

/// `[service]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
    pub addr: String,
    pub log_dir: String,
    pub version: String,
    pub version_key: String,
    pub debug_key: String,
    pub debug_value: String,
    pub sign_key: String,
    pub time_key: String,
    pub sign_secret: String,
    pub sign_expire_secs: u64,
    pub token_key: String,
    pub session_key_prefix: String,
    pub error_robot_token: String,
    pub graceful_robot_token: String,
    pub robot_url_prefix: String,
    pub call_timeout_ms: u64,
    pub renew_one_in: u32,
    pub retries: u32,
    pub connect_timeout_ms: u64,
    pub backup_latency_ms: u64,
    pub breaker_failures: u32,
    pub breaker_cooldown_secs: u64,
    pub log_sink_capacity: usize,
    pub discovery: HashMap<String, DiscoverySection>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        let client = ClientOptions::default();
        Self {
            name: String::new(),
            addr: "0.0.0.0:9000".to_string(),
            log_dir: String::new(),
            version: String::new(),
            version_key: "version".to_string(),
            debug_key: "debug".to_string(),
            debug_value: String::new(),
            sign_key: "sign".to_string(),
            time_key: "utime".to_string(),
            sign_secret: String::new(),
            sign_expire_secs: 300,
            token_key: "token".to_string(),
            session_key_prefix: String::new(),
            error_robot_token: String::new(),
            graceful_robot_token: String::new(),
            robot_url_prefix: NotifyConfig::default().url_prefix,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            renew_one_in: DEFAULT_RENEW_ONE_IN,
            retries: client.retries,
            connect_timeout_ms: client.connect_timeout.as_millis() as u64,
            backup_latency_ms: client.backup_latency.as_millis() as u64,
            breaker_failures: client.breaker_failures,
            breaker_cooldown_secs: client.breaker_cooldown.as_secs(),
            log_sink_capacity: DEFAULT_LOG_SINK_CAPACITY,
            discovery: HashMap::new(),
        }
    }
}

/// Raw config file contents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub global: GlobalSection,
    pub service: ServiceSection,
}

/// Host facts the config is resolved against.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub hostname: String,
    pub system_ip: String,
    pub public_ip: String,
}

impl HostInfo {
    pub fn detect(public_ip_url: &str) -> Self {
        Self {
            hostname: host::hostname(),
            system_ip: host::system_ip().unwrap_or_default(),
            public_ip: host::public_ip(public_ip_url),
        }
    }
}

/// Resolved discovery coordinates for the current mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub base_path: String,
    pub endpoints: Vec<String>,
    pub update_interval: Duration,
}

/// Validated configuration for a running service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub identity: ServiceIdentity,
    pub bind_addr: String,
    pub log_dir: String,
    pub dispatch: DispatchConfig,
    pub discovery: DiscoveryConfig,
    pub notify: NotifyConfig,
    pub client: ClientOptions,
    pub renew_one_in: u32,
    pub log_sink_capacity: usize,
}

/// Effective values, printable by `config show`.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub mode: String,
    pub name: String,
    pub addr: String,
    pub log_dir: String,
    pub version: String,
    pub discovery_base_path: String,
    pub discovery_endpoints: String,
    pub discovery_update_interval_secs: u64,
    pub call_timeout_ms: u64,
    pub renew_one_in: u32,
    pub log_sink_capacity: usize,
    pub fail_mode: FailMode,
    pub select_mode: SelectMode,
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Read a string env var, returning `default` when missing or empty.
fn parse_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => default.to_string(),
    }
}

/// Parse config text.
pub fn parse(text: &str) -> Result<FileConfig, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Read and parse a config file.
pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse(&text)
}

impl FileConfig {
    /// Apply `RPCX_*` overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        let s = &mut self.service;
        s.name = parse_string("RPCX_SERVICE_NAME", &s.name);
        s.addr = parse_string("RPCX_SERVICE_ADDR", &s.addr);
        s.log_dir = parse_string("RPCX_LOG_DIR", &s.log_dir);
        s.call_timeout_ms = parse_u64("RPCX_CALL_TIMEOUT_MS", s.call_timeout_ms).max(1);
        s.renew_one_in = parse_u32("RPCX_RENEW_ONE_IN", s.renew_one_in);
        s.log_sink_capacity = parse_usize("RPCX_LOG_SINK_CAPACITY", s.log_sink_capacity).max(2);
    }

    /// Discovery coordinates for `mode`, rewritten for personal dev hosts.
    pub fn discovery_for_mode(&self, mode: &str, hostname: &str) -> Option<DiscoveryConfig> {
        let section = self.service.discovery.get(mode)?;
        let mut base_path = section.base_path.clone();
        if base_path.is_empty() {
            return None;
        }

        let mut addr = section.addr.clone();
        if let Some(var) = addr.strip_prefix('$') {
            addr = std::env::var(var).unwrap_or_default();
        }
        if addr.is_empty() {
            return None;
        }

        let dev = &self.global.development_server;
        if mode == DEVELOP_MODE && hostname != dev.hostname {
            let owner = match std::env::var("developer_docker_hostname") {
                Ok(h) if !h.is_empty() => h,
                _ => hostname.to_string(),
            };
            base_path = base_path.replacen(DEVELOP_MODE, &format!("developer@{}", owner), 1);
            if !dev.ip.is_empty() {
                addr = addr.replacen("127.0.0.1", &dev.ip, 1);
            }
        }

        let interval = if section.update_interval_secs <= 0 {
            DEFAULT_UPDATE_INTERVAL_SECS
        } else {
            section.update_interval_secs as u64
        };

        Some(DiscoveryConfig {
            base_path,
            endpoints: addr
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect(),
            update_interval: Duration::from_secs(interval),
        })
    }
}

impl ServiceConfig {
    /// Resolve and validate file values against the host.
    pub fn resolve(file: &FileConfig, mode: &str, host: &HostInfo) -> Result<Self, ConfigError> {
        if host.system_ip.is_empty() || host.system_ip == "unknown" {
            return Err(ConfigError::Invalid("system ip is unknown or empty".into()));
        }
        if host.hostname.is_empty() {
            return Err(ConfigError::Invalid("system hostname is empty".into()));
        }

        let s = &file.service;
        if s.name.is_empty() {
            return Err(ConfigError::Invalid("service name is empty".into()));
        }
        if s.log_dir.is_empty() {
            return Err(ConfigError::Invalid("service log dir is empty".into()));
        }

        let discovery = file
            .discovery_for_mode(mode, &host.hostname)
            .ok_or_else(|| ConfigError::Invalid("discovery base path or address is empty".into()))?;
        if discovery.endpoints.is_empty() {
            return Err(ConfigError::Invalid("discovery address is empty".into()));
        }

        let identity = ServiceIdentity {
            mode: mode.to_string(),
            name: s.name.clone(),
            hostname: host.hostname.clone(),
            system_ip: host.system_ip.clone(),
            public_ip: host.public_ip.clone(),
            addr: host::advertised_addr(&s.addr, &host.system_ip),
        };

        let dispatch = DispatchConfig {
            version_key: s.version_key.clone(),
            default_version: s.version.clone(),
            debug_key: s.debug_key.clone(),
            debug_value: s.debug_value.clone(),
            sign: SignConfig {
                sign_key: s.sign_key.clone(),
                time_key: s.time_key.clone(),
                secret: s.sign_secret.clone(),
                expire: Duration::from_secs(s.sign_expire_secs),
            },
            session: SessionConfig {
                token_key: s.token_key.clone(),
                key_prefix: s.session_key_prefix.clone(),
            },
        };

        let client = ClientOptions {
            retries: s.retries.max(1),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms.max(1)),
            backup_latency: Duration::from_millis(s.backup_latency_ms),
            breaker_failures: s.breaker_failures.max(1),
            breaker_cooldown: Duration::from_secs(s.breaker_cooldown_secs),
            call_timeout: Duration::from_millis(s.call_timeout_ms.max(1)),
            ..ClientOptions::for_mode(mode)
        };

        Ok(Self {
            identity,
            bind_addr: s.addr.clone(),
            log_dir: s.log_dir.clone(),
            dispatch,
            discovery,
            notify: NotifyConfig {
                error_token: s.error_robot_token.clone(),
                graceful_token: s.graceful_robot_token.clone(),
                url_prefix: s.robot_url_prefix.clone(),
                ..NotifyConfig::default()
            },
            client,
            renew_one_in: s.renew_one_in,
            log_sink_capacity: s.log_sink_capacity.max(2),
        })
    }

    /// Return a printable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            mode: self.identity.mode.clone(),
            name: self.identity.name.clone(),
            addr: self.identity.addr.clone(),
            log_dir: self.log_dir.clone(),
            version: self.dispatch.default_version.clone(),
            discovery_base_path: self.discovery.base_path.clone(),
            discovery_endpoints: self.discovery.endpoints.join(","),
            discovery_update_interval_secs: self.discovery.update_interval.as_secs(),
            call_timeout_ms: self.client.call_timeout.as_millis() as u64,
            renew_one_in: self.renew_one_in,
            log_sink_capacity: self.log_sink_capacity,
            fail_mode: self.client.fail_mode,
            select_mode: self.client.select_mode,
        }
    }
}

/// Load, override and resolve the config at `path` for the current host.
pub fn load(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let mut file = load_file(path)?;
    file.apply_env_overrides();
    let mode = host::run_mode(&file.global.mode_key);
    let host = HostInfo::detect(&file.global.public_ip_url);
    ServiceConfig::resolve(&file, &mode, &host)
}
