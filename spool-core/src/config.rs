// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Covers bus flow control, retry policy, scheduler tick, and router limits with validated defaults

use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_path")]
    pub path: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
        }
    }
}

/// Message bus polling, retry, and flow-control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Upper bound on one message's handler run; also the staleness threshold
    /// for `processing` rows and `running` ledger entries
    pub processing_timeout_ms: u64,
    /// Hard ceiling on pending+processing inbound rows; beyond it publishes are dead-lettered
    pub max_pending_inbound: u64,
    pub max_pending_outbound: u64,
    /// Soft threshold; beyond it publishes are accepted but deferred
    pub overload_threshold: u64,
    pub overload_backoff_ms: u64,
    pub rate_limit_window_ms: u64,
    /// Publishes allowed per conversation per window (0 disables)
    pub rate_limit_max: u32,
    /// Bound on the number of rate-limit windows kept in memory
    pub rate_limit_max_keys: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 50,
            max_attempts: 5,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
            processing_timeout_ms: 300_000, // 5 minutes
            max_pending_inbound: 5_000,
            max_pending_outbound: 5_000,
            overload_threshold: 2_000,
            overload_backoff_ms: 2_000,
            rate_limit_window_ms: 60_000,
            rate_limit_max: 30,
            rate_limit_max_keys: 10_000,
        }
    }
}

impl BusConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    /// Backoff before the given (1-based) failed attempt is retried:
    /// `min(base * 2^(attempts-1), max)`
    pub fn retry_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.retry_base_ms
            .saturating_mul(factor)
            .min(self.retry_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Timezone for evaluating cron expressions (IANA name, e.g. "America/Chicago")
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            timezone: default_timezone(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid timezone {}: {}", self.timezone, e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Messages of prior history handed to the agent
    pub history_limit: usize,
    /// Idle time after which a conversation's serial queue slot may be evicted
    pub idle_evict_secs: u64,
    /// Slot count at which idle eviction runs
    pub max_tracked_keys: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            idle_evict_secs: 600,
            max_tracked_keys: 1_024,
        }
    }
}

impl RouterConfig {
    pub fn idle_evict_after(&self) -> Duration {
        Duration::from_secs(self.idle_evict_secs)
    }
}

/// Upper bound for any configured duration; keeps timestamp arithmetic in range
pub const MAX_DURATION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

fn default_workspace_path() -> String {
    paths::data_dir().to_string_lossy().to_string()
}

fn default_tick_interval_ms() -> u64 {
    15_000
}

fn default_timezone() -> String {
    // Try to detect system timezone, fall back to UTC
    if let Ok(tz) = std::env::var("TZ") {
        if tz.parse::<chrono_tz::Tz>().is_ok() {
            return tz;
        }
    }
    #[cfg(unix)]
    {
        if let Ok(link) = std::fs::read_link("/etc/localtime") {
            if let Some(tz) = link.to_str() {
                if let Some(pos) = tz.find("zoneinfo/") {
                    let detected = tz[pos + 9..].to_string();
                    if detected.parse::<chrono_tz::Tz>().is_ok() {
                        return detected;
                    }
                }
            }
        }
    }
    "UTC".to_string()
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(path = %path, "Failed to expand tilde: could not determine home directory");
    }
    path.to_string()
}

/// Overwrite `target` with the parsed value of env var `name`, if set
fn env_override<T>(name: &str, target: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(val) = std::env::var(name) {
        *target = val
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} must be a valid number, got: {} ({})", name, val, e))?;
    }
    Ok(())
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. SPOOL_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/spool/config.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("SPOOL_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %env_path, "SPOOL_CONFIG_PATH does not exist, ignoring");
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Parse a TOML document and validate it, without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from config.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(path = %config_path.display(), "Loading configuration from file");
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.workspace.path = expand_tilde(&config.workspace.path);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("WORKSPACE_PATH") {
            self.workspace.path = val;
        }

        let bus = &mut self.bus;
        env_override("BUS_POLL_INTERVAL_MS", &mut bus.poll_interval_ms)?;
        env_override("BUS_BATCH_SIZE", &mut bus.batch_size)?;
        env_override("BUS_MAX_ATTEMPTS", &mut bus.max_attempts)?;
        env_override("BUS_RETRY_BASE_MS", &mut bus.retry_base_ms)?;
        env_override("BUS_RETRY_MAX_MS", &mut bus.retry_max_ms)?;
        env_override("BUS_PROCESSING_TIMEOUT_MS", &mut bus.processing_timeout_ms)?;
        env_override("BUS_MAX_PENDING_INBOUND", &mut bus.max_pending_inbound)?;
        env_override("BUS_MAX_PENDING_OUTBOUND", &mut bus.max_pending_outbound)?;
        env_override("BUS_OVERLOAD_THRESHOLD", &mut bus.overload_threshold)?;
        env_override("BUS_OVERLOAD_BACKOFF_MS", &mut bus.overload_backoff_ms)?;
        env_override("BUS_RATE_LIMIT_WINDOW_MS", &mut bus.rate_limit_window_ms)?;
        env_override("BUS_RATE_LIMIT_MAX", &mut bus.rate_limit_max)?;

        env_override("SCHEDULER_TICK_MS", &mut self.scheduler.tick_interval_ms)?;
        if let Ok(val) = std::env::var("SCHEDULER_TIMEZONE") {
            self.scheduler.timezone = val;
        }

        env_override("ROUTER_HISTORY_LIMIT", &mut self.router.history_limit)?;
        env_override("ROUTER_IDLE_EVICT_SECS", &mut self.router.idle_evict_secs)?;
        env_override("ROUTER_MAX_TRACKED_KEYS", &mut self.router.max_tracked_keys)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let bus = &self.bus;
        if bus.max_attempts == 0 {
            anyhow::bail!("bus.max_attempts must be at least 1");
        }
        if bus.batch_size == 0 {
            anyhow::bail!("bus.batch_size must be at least 1");
        }
        if bus.poll_interval_ms == 0 || bus.processing_timeout_ms == 0 {
            anyhow::bail!("bus.poll_interval_ms and bus.processing_timeout_ms must be positive");
        }
        if bus.retry_base_ms > bus.retry_max_ms {
            anyhow::bail!(
                "bus.retry_base_ms ({}) must not exceed bus.retry_max_ms ({})",
                bus.retry_base_ms,
                bus.retry_max_ms
            );
        }
        for (name, value) in [
            ("bus.poll_interval_ms", bus.poll_interval_ms),
            ("bus.retry_max_ms", bus.retry_max_ms),
            ("bus.processing_timeout_ms", bus.processing_timeout_ms),
            ("bus.overload_backoff_ms", bus.overload_backoff_ms),
            ("bus.rate_limit_window_ms", bus.rate_limit_window_ms),
            ("scheduler.tick_interval_ms", self.scheduler.tick_interval_ms),
        ] {
            if value > MAX_DURATION_MS {
                anyhow::bail!(
                    "{} ({}) must not exceed {} (7 days)",
                    name,
                    value,
                    MAX_DURATION_MS
                );
            }
        }
        // Deferral engages only while the active count is above the threshold and below the ceiling
        if bus.overload_threshold.saturating_add(1)
            >= bus.max_pending_inbound.min(bus.max_pending_outbound)
        {
            tracing::warn!(
                overload_threshold = bus.overload_threshold,
                max_pending_inbound = bus.max_pending_inbound,
                max_pending_outbound = bus.max_pending_outbound,
                "Overload threshold is not below the hard ceilings; soft backoff will never engage"
            );
        }
        if self.scheduler.tick_interval_ms == 0 {
            anyhow::bail!("scheduler.tick_interval_ms must be positive");
        }
        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            anyhow::bail!(
                "Invalid timezone '{}'. Use IANA timezone names like 'America/Chicago', 'Europe/London', 'UTC'",
                self.scheduler.timezone
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let bus = BusConfig {
            retry_base_ms: 100,
            retry_max_ms: 1_000,
            ..BusConfig::default()
        };
        assert_eq!(bus.retry_delay_ms(1), 100);
        assert_eq!(bus.retry_delay_ms(2), 200);
        assert_eq!(bus.retry_delay_ms(4), 800);
        assert_eq!(bus.retry_delay_ms(5), 1_000);
        assert_eq!(bus.retry_delay_ms(200), 1_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
[bus]
max_attempts = 3

[scheduler]
timezone = "UTC"
"#,
        )
        .unwrap();
        assert_eq!(config.bus.max_attempts, 3);
        assert_eq!(config.bus.batch_size, 50);
        assert_eq!(config.router.history_limit, 20);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::from_toml_str("[bus]\nmax_attempts = 0\n[scheduler]\ntimezone = \"UTC\"").is_err());
        assert!(Config::from_toml_str(
            "[bus]\nretry_base_ms = 10\nretry_max_ms = 5\n[scheduler]\ntimezone = \"UTC\""
        )
        .is_err());
        assert!(Config::from_toml_str("[scheduler]\ntimezone = \"Mars/Olympus\"").is_err());
    }

    #[test]
    fn test_validation_rejects_durations_past_the_cap() {
        for section in [
            "[bus]\nretry_max_ms = 9223372036854775807",
            "[bus]\nprocessing_timeout_ms = 9223372036854775807",
            "[bus]\noverload_backoff_ms = 604800001",
            "[scheduler]\ntick_interval_ms = 604800001",
        ] {
            let doc = if section.starts_with("[scheduler]") {
                format!("{}\ntimezone = \"UTC\"", section)
            } else {
                format!("{}\n[scheduler]\ntimezone = \"UTC\"", section)
            };
            let err = Config::from_toml_str(&doc).unwrap_err();
            assert!(err.to_string().contains("must not exceed"), "{}: {}", section, err);
        }

        let at_cap = format!(
            "[bus]\nretry_max_ms = {}\noverload_backoff_ms = {}\n[scheduler]\ntimezone = \"UTC\"",
            MAX_DURATION_MS, MAX_DURATION_MS
        );
        assert!(Config::from_toml_str(&at_cap).is_ok());
    }
}
