// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker and emulator configuration.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, WorkerError};

const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:5000/";
const DEFAULT_ENDPOINTS: &str = "127.0.0.1:7933";
const DEFAULT_IDENTITY: &str = "cadenza-worker";

/// Worker configuration for talking to the sidecar proxy.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Proxy URL that requests and replies are POSTed to (default: "http://127.0.0.1:5000/")
    pub proxy_url: String,
    /// Address the inbound listener binds (default: "127.0.0.1:5001")
    pub listen_addr: SocketAddr,
    /// Client id stamped on every message (default: 1)
    pub client_id: u64,
    /// Orchestration server endpoints forwarded on connect (default: "127.0.0.1:7933")
    pub endpoints: String,
    /// Default domain sent on connect
    pub domain: Option<String>,
    /// Worker identity sent on connect (default: "cadenza-worker")
    pub identity: String,
    /// Client timeout forwarded to the proxy in milliseconds (default: 30_000)
    pub client_timeout_ms: u64,
    /// Background heartbeat interval in milliseconds (default: 5_000).
    /// Set to 0 to disable automatic heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Sticky workflow cache size sent on connect (default: 10_000)
    pub workflow_cache_size: i32,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `CADENZA_PROXY_URL` - Proxy URL (default: "http://127.0.0.1:5000/")
    /// - `CADENZA_LISTEN_ADDR` - Inbound listener address (default: "127.0.0.1:5001")
    /// - `CADENZA_CLIENT_ID` - Client id (default: 1)
    /// - `CADENZA_ENDPOINTS` - Orchestration server endpoints (default: "127.0.0.1:7933")
    /// - `CADENZA_DOMAIN` - Default domain (default: none)
    /// - `CADENZA_IDENTITY` - Worker identity (default: "cadenza-worker")
    /// - `CADENZA_CLIENT_TIMEOUT_MS` - Client timeout (default: 30000)
    /// - `CADENZA_HEARTBEAT_INTERVAL_MS` - Background heartbeat interval (default: 5000, 0 to disable)
    /// - `CADENZA_WORKFLOW_CACHE_SIZE` - Workflow cache size (default: 10000)
    pub fn from_env() -> Result<Self> {
        let proxy_url =
            env::var("CADENZA_PROXY_URL").unwrap_or_else(|_| DEFAULT_PROXY_URL.to_string());
        if !proxy_url.starts_with("http://") && !proxy_url.starts_with("https://") {
            return Err(WorkerError::Config(format!(
                "invalid CADENZA_PROXY_URL: {proxy_url}"
            )));
        }

        let listen_addr = parse_var("CADENZA_LISTEN_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 5001)));

        let endpoints =
            env::var("CADENZA_ENDPOINTS").unwrap_or_else(|_| DEFAULT_ENDPOINTS.to_string());

        let domain = env::var("CADENZA_DOMAIN").ok().filter(|d| !d.is_empty());

        let identity =
            env::var("CADENZA_IDENTITY").unwrap_or_else(|_| DEFAULT_IDENTITY.to_string());

        Ok(Self {
            proxy_url,
            listen_addr,
            client_id: parse_var("CADENZA_CLIENT_ID")?.unwrap_or(1),
            endpoints,
            domain,
            identity,
            client_timeout_ms: parse_var("CADENZA_CLIENT_TIMEOUT_MS")?.unwrap_or(30_000),
            heartbeat_interval_ms: parse_var("CADENZA_HEARTBEAT_INTERVAL_MS")?.unwrap_or(5_000),
            workflow_cache_size: parse_var("CADENZA_WORKFLOW_CACHE_SIZE")?.unwrap_or(10_000),
        })
    }

    /// Create a configuration for a proxy running on this machine.
    pub fn localhost() -> Self {
        Self {
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5001)),
            client_id: 1,
            endpoints: DEFAULT_ENDPOINTS.to_string(),
            domain: None,
            identity: DEFAULT_IDENTITY.to_string(),
            client_timeout_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            workflow_cache_size: 10_000,
        }
    }

    /// Create a new configuration for the given proxy URL.
    pub fn new(proxy_url: impl Into<String>) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            ..Self::localhost()
        }
    }

    /// Set the inbound listener address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the client id.
    pub fn with_client_id(mut self, client_id: u64) -> Self {
        self.client_id = client_id;
        self
    }

    /// Set the default domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Set the worker identity.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Set the background heartbeat interval.
    /// Set to 0 to disable automatic heartbeats.
    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set the workflow cache size.
    pub fn with_workflow_cache_size(mut self, size: i32) -> Self {
        self.workflow_cache_size = size;
        self
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}

/// Emulator configuration.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// How often the poll loop matches pending workflows to workers (default: 1_000)
    pub poll_interval_ms: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
        }
    }
}

impl EmulatorConfig {
    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `CADENZA_EMULATOR_POLL_INTERVAL_MS` - Poll interval (default: 1000)
    pub fn from_env() -> Result<Self> {
        let poll_interval_ms = parse_var("CADENZA_EMULATOR_POLL_INTERVAL_MS")?.unwrap_or(1_000);
        if poll_interval_ms == 0 {
            return Err(WorkerError::Config(
                "CADENZA_EMULATOR_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }
        Ok(Self { poll_interval_ms })
    }

    /// Set the poll interval.
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| WorkerError::Config(format!("invalid {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "CADENZA_PROXY_URL",
        "CADENZA_LISTEN_ADDR",
        "CADENZA_CLIENT_ID",
        "CADENZA_ENDPOINTS",
        "CADENZA_DOMAIN",
        "CADENZA_IDENTITY",
        "CADENZA_CLIENT_TIMEOUT_MS",
        "CADENZA_HEARTBEAT_INTERVAL_MS",
        "CADENZA_WORKFLOW_CACHE_SIZE",
        "CADENZA_EMULATOR_POLL_INTERVAL_MS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_from_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.proxy_url, "http://127.0.0.1:5000/");
        assert_eq!(config.listen_addr.port(), 5001);
        assert_eq!(config.client_id, 1);
        assert_eq!(config.domain, None);
        assert_eq!(config.identity, "cadenza-worker");
        assert_eq!(config.client_timeout_ms, 30_000);
        assert_eq!(config.heartbeat_interval_ms, 5_000);
        assert_eq!(config.workflow_cache_size, 10_000);
    }

    #[test]
    fn test_from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("CADENZA_PROXY_URL", "http://10.0.0.5:5000/");
        guard.set("CADENZA_LISTEN_ADDR", "0.0.0.0:6001");
        guard.set("CADENZA_CLIENT_ID", "7");
        guard.set("CADENZA_DOMAIN", "billing");
        guard.set("CADENZA_HEARTBEAT_INTERVAL_MS", "0");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.proxy_url, "http://10.0.0.5:5000/");
        assert_eq!(config.listen_addr, "0.0.0.0:6001".parse().unwrap());
        assert_eq!(config.client_id, 7);
        assert_eq!(config.domain.as_deref(), Some("billing"));
        assert_eq!(config.heartbeat_interval_ms, 0);
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("CADENZA_CLIENT_TIMEOUT_MS", "soon");

        let err = WorkerConfig::from_env().unwrap_err();
        assert!(matches!(err, WorkerError::Config(ref msg) if msg.contains("CADENZA_CLIENT_TIMEOUT_MS")));
    }

    #[test]
    fn test_invalid_proxy_url_is_config_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("CADENZA_PROXY_URL", "localhost:5000");

        assert!(matches!(
            WorkerConfig::from_env(),
            Err(WorkerError::Config(_))
        ));
    }

    #[test]
    fn test_emulator_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        assert_eq!(EmulatorConfig::from_env().unwrap().poll_interval_ms, 1_000);

        guard.set("CADENZA_EMULATOR_POLL_INTERVAL_MS", "25");
        assert_eq!(EmulatorConfig::from_env().unwrap().poll_interval_ms, 25);

        guard.set("CADENZA_EMULATOR_POLL_INTERVAL_MS", "0");
        assert!(EmulatorConfig::from_env().is_err());
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new("http://proxy:5000/")
            .with_client_id(3)
            .with_domain("D")
            .with_identity("test-worker")
            .with_heartbeat_interval_ms(0)
            .with_workflow_cache_size(50);

        assert_eq!(config.proxy_url, "http://proxy:5000/");
        assert_eq!(config.client_id, 3);
        assert_eq!(config.domain.as_deref(), Some("D"));
        assert_eq!(config.identity, "test-worker");
        assert_eq!(config.heartbeat_interval_ms, 0);
        assert_eq!(config.workflow_cache_size, 50);
        assert_eq!(config.client_timeout(), Duration::from_secs(30));
    }
}
