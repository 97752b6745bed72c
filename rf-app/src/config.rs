//! rapidfire configuration loader.
//!
//! Layering: built-in defaults, then the TOML file, then environment
//! overrides, then validation.

use anyhow::{Context, Result, anyhow};
use rf_batch::{BatchSettings, DEFAULT_KEY_PREFIX};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RapidfireConfig {
    pub batch: BatchSettings,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Http,
    /// Log merged batches instead of delivering them. Development only.
    Log,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    pub url: Option<String>,
    pub auth_token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Log,
            url: None,
            auth_token: None,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub http_timeout_seconds: u64,
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            http_timeout_seconds: 30,
            http_max_in_flight: 256,
        }
    }
}

impl RapidfireConfig {
    /// An explicit path must exist. Without one, the default path is used if
    /// present and built-in defaults otherwise.
    pub async fn load_with_path(path: Option<PathBuf>) -> Result<(Self, Option<PathBuf>)> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (default_config_path(), false),
        };

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .with_context(|| format!("parse config {}", path.display()))?,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                let mut cfg = Self::default();
                cfg.apply_env_overrides()?;
                cfg.validate()?;
                return Ok((cfg, None));
            }
            Err(e) => return Err(anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok((cfg, Some(path)))
    }

    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RAPIDFIRE_MAX_BATCH_SIZE") {
            self.batch.max_batch_size = parse_override("RAPIDFIRE_MAX_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("RAPIDFIRE_IDLE_TIMEOUT_MS") {
            self.batch.idle_timeout_ms = parse_override("RAPIDFIRE_IDLE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("RAPIDFIRE_ENTRY_TTL_SECONDS") {
            self.batch.entry_ttl_seconds = parse_override("RAPIDFIRE_ENTRY_TTL_SECONDS", &v)?;
        }
        if let Some(v) = get("RAPIDFIRE_SCAN_INTERVAL_MS") {
            self.batch.scan_interval_ms = parse_override("RAPIDFIRE_SCAN_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("REDIS_URL") {
            self.store.redis_url = v;
            self.store.backend = StoreBackend::Redis;
        }
        if let Some(v) = get("RAPIDFIRE_KEY_PREFIX") {
            self.store.key_prefix = v;
        }
        if let Some(v) = get("RAPIDFIRE_DISPATCH_URL") {
            self.dispatch.url = Some(v);
            self.dispatch.mode = DispatchMode::Http;
        }
        if let Some(v) = get("RAPIDFIRE_DISPATCH_TOKEN") {
            self.dispatch.auth_token = Some(v);
        }
        if let Some(v) = get("RAPIDFIRE_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.batch.validate()?;
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(anyhow!("store.redis_url is required for the redis backend"));
        }
        if self.dispatch.mode == DispatchMode::Http {
            let url = self
                .dispatch
                .url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or_else(|| anyhow!("dispatch.url is required when dispatch.mode = \"http\""))?;
            reqwest::Url::parse(url).map_err(|e| anyhow!("invalid dispatch.url {url:?}: {e}"))?;
        }
        if self.dispatch.timeout_ms == 0 {
            return Err(anyhow!("dispatch.timeout_ms must be > 0"));
        }
        if self.batch.claim_lease_ms <= self.dispatch.timeout_ms {
            return Err(anyhow!(
                "batch.claim_lease_ms ({}) must exceed dispatch.timeout_ms ({})",
                self.batch.claim_lease_ms,
                self.dispatch.timeout_ms
            ));
        }
        self.bind_addr()?;
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow!("server.http_max_in_flight must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn dispatch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dispatch.timeout_ms)
    }
}

fn parse_override<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}"))
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".rapidfire").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::{DispatchMode, RapidfireConfig, StoreBackend};
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        let cfg = RapidfireConfig::default();
        cfg.validate().expect("defaults valid");
        assert_eq!(cfg.store.backend, StoreBackend::Redis);
        assert_eq!(cfg.dispatch.mode, DispatchMode::Log);
        assert_eq!(cfg.batch.idle_timeout_ms, 9_000);
        assert_eq!(cfg.batch.entry_ttl_seconds, 120);
    }

    #[test]
    fn parses_full_file() {
        let cfg = RapidfireConfig::parse(
            r#"
[batch]
max_batch_size = 4
idle_timeout_ms = 3000
entry_ttl_seconds = 60
scan_interval_ms = 500
joiner = "\n"

[store]
backend = "memory"
key_prefix = "salon"

[dispatch]
mode = "http"
url = "http://127.0.0.1:9000/jobs"
timeout_ms = 2000

[server]
bind_addr = "0.0.0.0:9090"
"#,
        )
        .expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.batch.max_batch_size, 4);
        assert_eq!(cfg.batch.joiner, "\n");
        assert_eq!(cfg.batch.claim_lease_ms, 30_000);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.store.key_prefix, "salon");
        assert_eq!(cfg.dispatch.mode, DispatchMode::Http);
        assert_eq!(cfg.bind_addr().expect("addr").port(), 9090);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RapidfireConfig::parse("[batch]\nmax_size = 3\n").expect_err("unknown key");
        assert!(err.to_string().contains("max_size"));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut cfg = RapidfireConfig::parse("[store]\nbackend = \"memory\"\n").expect("parse");
        cfg.apply_overrides(lookup(&[
            ("RAPIDFIRE_IDLE_TIMEOUT_MS", "5000"),
            ("REDIS_URL", "redis://cache:6379"),
            ("RAPIDFIRE_DISPATCH_URL", "https://queue.internal/jobs"),
            ("RAPIDFIRE_KEY_PREFIX", "   "),
        ]))
        .expect("overrides");
        assert_eq!(cfg.batch.idle_timeout_ms, 5_000);
        assert_eq!(cfg.store.backend, StoreBackend::Redis);
        assert_eq!(cfg.store.redis_url, "redis://cache:6379");
        assert_eq!(cfg.dispatch.mode, DispatchMode::Http);
        assert_eq!(cfg.store.key_prefix, "rapidfire");
        cfg.validate().expect("valid");
    }

    #[test]
    fn malformed_numeric_override_is_an_error() {
        let mut cfg = RapidfireConfig::default();
        let err = cfg
            .apply_overrides(lookup(&[("RAPIDFIRE_MAX_BATCH_SIZE", "ten")]))
            .expect_err("bad number");
        assert!(err.to_string().contains("RAPIDFIRE_MAX_BATCH_SIZE"));
    }

    #[test]
    fn http_dispatch_requires_url() {
        let cfg = RapidfireConfig::parse("[dispatch]\nmode = \"http\"\n").expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn claim_lease_must_outlive_dispatch_timeout() {
        let cfg = RapidfireConfig::parse(
            "[batch]\nclaim_lease_ms = 5000\n[dispatch]\ntimeout_ms = 5000\n",
        )
        .expect("parse");
        let err = cfg.validate().expect_err("lease too short");
        assert!(err.to_string().contains("claim_lease_ms"));
    }

    #[test]
    fn short_ttl_is_rejected() {
        let cfg = RapidfireConfig::parse("[batch]\nidle_timeout_ms = 9000\nentry_ttl_seconds = 9\n")
            .expect("parse");
        assert!(cfg.validate().is_err());
    }
}
