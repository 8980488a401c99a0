//! delve.toml configuration and `DELVE_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Deployment flavour. Development shortens the reservation grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Production,
    Development,
}

impl std::str::FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => anyhow::bail!("unknown run mode '{other}'"),
        }
    }
}

/// Network probe settings for pool instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    pub attempts: u32,
    pub timeout_ms: u64,
    /// Port used when an instance address carries none.
    pub port: u16,
    /// Upper bound on in-flight probe chains.
    pub max_concurrent: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_ms: 1000,
            port: 25565,
            max_concurrent: 32,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackfillConfig {
    pub workers: usize,
    /// Runs younger than this without an end time are left alone.
    pub incomplete_window_secs: u64,
    /// Maximum number of run ids picked up per pass.
    pub batch_limit: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            incomplete_window_secs: 3600,
            batch_limit: 500,
        }
    }
}

/// Top-level daemon configuration.
///
/// Every field has a default so an empty file (or no file at all) yields
/// a working production setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DelveConfig {
    /// Regex a server name must match to be schedulable.
    pub pool_pattern: String,
    pub run_mode: RunMode,
    pub tick_interval_secs: u64,
    /// Explicit reservation grace; falls back to the run-mode default.
    pub reservation_grace_secs: Option<u64>,
    pub idle_teardown_grace_secs: u64,
    pub eviction_grace_secs: u64,
    pub healthy_debounce_secs: u64,
    pub queue_recency_secs: u64,
    pub reconcile_debounce_secs: u64,
    pub teardown_lock_secs: u64,
    pub automation_lock_secs: u64,
    pub trade_throttle_secs: u64,
    pub cleanup_retention_secs: u64,
    /// Server players are sent back to when a run ends or fails.
    pub lobby_server: String,
    pub webhook_url: Option<String>,
    pub probe: ProbeConfig,
    pub backfill: BackfillConfig,
}

impl Default for DelveConfig {
    fn default() -> Self {
        Self {
            pool_pattern: "^d[0-9]{3}".to_string(),
            run_mode: RunMode::Production,
            tick_interval_secs: 5,
            reservation_grace_secs: None,
            idle_teardown_grace_secs: 60,
            eviction_grace_secs: 300,
            healthy_debounce_secs: 15,
            queue_recency_secs: 180,
            reconcile_debounce_secs: 30,
            teardown_lock_secs: 60,
            automation_lock_secs: 60,
            trade_throttle_secs: 30,
            cleanup_retention_secs: 2 * 24 * 60 * 60,
            lobby_server: "lobby".to_string(),
            webhook_url: None,
            probe: ProbeConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

impl DelveConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: DelveConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from an optional file, then apply the process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => {
                info!(path = %p.display(), "loading config file");
                Self::from_file(p)?
            }
            None => {
                debug!("no config file given, using defaults");
                Self::default()
            }
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        info!(
            run_mode = ?config.run_mode,
            pool_pattern = %config.pool_pattern,
            reservation_grace_secs = config.reservation_grace_secs(),
            webhook = config.webhook_url.is_some(),
            "config loaded"
        );
        Ok(config)
    }

    /// Apply `DELVE_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            let value = lookup(key);
            if value.is_some() {
                debug!(key, "applying environment override");
            }
            value
        };
        if let Some(v) = lookup("DELVE_POOL_PATTERN") {
            self.pool_pattern = v;
        }
        if let Some(v) = lookup("DELVE_RUN_MODE") {
            self.run_mode = v.parse()?;
        }
        if let Some(v) = lookup("DELVE_TICK_INTERVAL_SECS") {
            self.tick_interval_secs = parse_secs("DELVE_TICK_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("DELVE_RESERVATION_GRACE_SECS") {
            self.reservation_grace_secs = Some(parse_secs("DELVE_RESERVATION_GRACE_SECS", &v)?);
        }
        if let Some(v) = lookup("DELVE_IDLE_TEARDOWN_GRACE_SECS") {
            self.idle_teardown_grace_secs = parse_secs("DELVE_IDLE_TEARDOWN_GRACE_SECS", &v)?;
        }
        if let Some(v) = lookup("DELVE_EVICTION_GRACE_SECS") {
            self.eviction_grace_secs = parse_secs("DELVE_EVICTION_GRACE_SECS", &v)?;
        }
        if let Some(v) = lookup("DELVE_PROBE_PORT") {
            self.probe.port = v
                .trim()
                .parse()
                .with_context(|| format!("DELVE_PROBE_PORT: invalid port '{v}'"))?;
        }
        if let Some(v) = lookup("DELVE_LOBBY_SERVER") {
            self.lobby_server = v;
        }
        if let Some(v) = lookup("DELVE_WEBHOOK_URL") {
            self.webhook_url = (!v.trim().is_empty()).then_some(v);
        }
        Ok(())
    }

    /// How long a reservation may sit unused before it is reclaimed.
    pub fn reservation_grace_secs(&self) -> u64 {
        self.reservation_grace_secs.unwrap_or(match self.run_mode {
            RunMode::Production => 300,
            RunMode::Development => 60,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

fn parse_secs(key: &str, value: &str) -> anyhow::Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{key}: expected seconds, got '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_production() {
        let config = DelveConfig::default();
        assert_eq!(config.pool_pattern, "^d[0-9]{3}");
        assert_eq!(config.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.reservation_grace_secs(), 300);
        assert_eq!(config.probe.attempts, 3);
        assert_eq!(config.probe.timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn development_shortens_reservation_grace() {
        let config = DelveConfig {
            run_mode: RunMode::Development,
            ..Default::default()
        };
        assert_eq!(config.reservation_grace_secs(), 60);

        let explicit = DelveConfig {
            run_mode: RunMode::Development,
            reservation_grace_secs: Some(90),
            ..Default::default()
        };
        assert_eq!(explicit.reservation_grace_secs(), 90);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml = r#"
            pool_pattern = "^x[0-9]+"
            run_mode = "development"

            [probe]
            port = 30000
        "#;
        let config: DelveConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.pool_pattern, "^x[0-9]+");
        assert_eq!(config.run_mode, RunMode::Development);
        assert_eq!(config.probe.port, 30000);
        assert_eq!(config.probe.attempts, 3);
        assert_eq!(config.idle_teardown_grace_secs, 60);
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delve.toml");
        std::fs::write(&path, "lobby_server = \"hub\"\n").unwrap();

        let config = DelveConfig::from_file(&path).unwrap();
        assert_eq!(config.lobby_server, "hub");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = DelveConfig::default();
        config
            .apply_env_from(env(&[
                ("DELVE_RUN_MODE", "dev"),
                ("DELVE_TICK_INTERVAL_SECS", "2"),
                ("DELVE_PROBE_PORT", "25570"),
                ("DELVE_WEBHOOK_URL", "https://hooks.example/abc"),
            ]))
            .unwrap();

        assert_eq!(config.run_mode, RunMode::Development);
        assert_eq!(config.tick_interval_secs, 2);
        assert_eq!(config.probe.port, 25570);
        assert_eq!(config.webhook_url.as_deref(), Some("https://hooks.example/abc"));
    }

    #[test]
    fn env_rejects_garbage() {
        let mut config = DelveConfig::default();
        assert!(config.apply_env_from(env(&[("DELVE_EVICTION_GRACE_SECS", "soon")])).is_err());
        assert!(config.apply_env_from(env(&[("DELVE_RUN_MODE", "staging")])).is_err());
    }
}
