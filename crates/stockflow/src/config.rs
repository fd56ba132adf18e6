use std::time::Duration;

/// Runtime configuration, read once at startup from the environment
/// (and `.env` when present).
#[derive(Clone, Debug)]
pub struct Config {
    /// `None` runs everything against the in-process store.
    pub database_url: Option<String>,
    pub http_addr: String,
    pub scheduler_interval: Duration,
    pub heartbeat_interval: Duration,
    pub migrate_on_startup: bool,
    /// Frames buffered per event stream before a slow client is dropped.
    pub observer_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            http_addr: "0.0.0.0:3000".to_string(),
            scheduler_interval: Duration::from_millis(2_000),
            heartbeat_interval: Duration::from_millis(30_000),
            migrate_on_startup: false,
            observer_buffer: 64,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let database_url = env_or_fallback("STOCKFLOW_DATABASE_URL", "DATABASE_URL")
            .and_then(|s| normalize_optional(&s));

        let http_addr =
            env_or_fallback("STOCKFLOW_HTTP_ADDR", "HTTP_ADDR").unwrap_or(defaults.http_addr);

        let scheduler_interval = env_millis("STOCKFLOW_SCHEDULER_INTERVAL_MS")?
            .unwrap_or(defaults.scheduler_interval);

        let heartbeat_interval = env_millis("STOCKFLOW_HEARTBEAT_INTERVAL_MS")?
            .unwrap_or(defaults.heartbeat_interval);

        let migrate_on_startup =
            env_bool("STOCKFLOW_MIGRATE_ON_STARTUP").unwrap_or(defaults.migrate_on_startup);

        let observer_buffer = std::env::var("STOCKFLOW_OBSERVER_BUFFER")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(defaults.observer_buffer)
            .clamp(1, 4096);

        Ok(Self {
            database_url,
            http_addr,
            scheduler_interval,
            heartbeat_interval,
            migrate_on_startup,
            observer_buffer,
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Interval in milliseconds. Zero would spin a timer, so it is rejected.
fn env_millis(key: &str) -> anyhow::Result<Option<Duration>> {
    let Some(raw) = std::env::var(key).ok().filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let ms: u64 = raw
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{key} must be a number of milliseconds, got {raw:?}"))?;
    if ms == 0 {
        anyhow::bail!("{key} must be greater than zero");
    }
    Ok(Some(Duration::from_millis(ms)))
}

fn normalize_optional(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || matches!(v.to_lowercase().as_str(), "off" | "none" | "memory") {
        return None;
    }
    Some(v.to_string())
}
