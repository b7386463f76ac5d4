use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::SwitchboardConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchboard.toml",
    "switchboard.yaml",
    "switchboard.yml",
    "switchboard.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply environment
/// overrides.
///
/// Search order:
/// 1. `./switchboard.{toml,yaml,yml,json}`
/// 2. `~/.config/switchboard/switchboard.{toml,yaml,yml,json}`
///
/// Falls back to defaults when no file is found or the file is invalid.
pub fn discover_and_load() -> SwitchboardConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                SwitchboardConfig::default()
            })
        },
        None => {
            debug!("no config file found, using defaults");
            SwitchboardConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    config
}

/// Load an explicit file (if given) or discover one, then apply env overrides.
pub fn load_or_discover(path: Option<&Path>) -> anyhow::Result<SwitchboardConfig> {
    match path {
        Some(path) => {
            let mut config = load_config(path)?;
            apply_env_overrides(&mut config);
            Ok(config)
        },
        None => Ok(discover_and_load()),
    }
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/switchboard/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "switchboard").map(|d| d.config_dir().to_path_buf())
}

/// Apply `SWITCHBOARD_*` environment overrides on top of file values.
pub fn apply_env_overrides(config: &mut SwitchboardConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

/// Override application with an injectable lookup.
///
/// Values that fail to parse are ignored with a warning so a typo in one
/// variable never prevents startup.
pub fn apply_env_overrides_with(
    config: &mut SwitchboardConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        name: &str,
    ) -> Option<T> {
        let raw = lookup(name)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(var = name, value = %raw, "ignoring unparseable env override");
                None
            },
        }
    }

    if let Some(url) = lookup("SWITCHBOARD_DATABASE_URL") {
        config.store.database_url = url;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_MAX_RETRIES") {
        config.queue.max_attempts = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_BACKOFF_BASE_MS") {
        config.queue.backoff_base_ms = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_BACKOFF_MULTIPLIER") {
        config.queue.backoff_multiplier = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_IDEMPOTENCY_TTL_SECS") {
        config.idempotency.ttl_secs = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_LOCK_TTL_SECS") {
        config.locks.ttl_secs = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_BREAKER_TIMEOUT_MS") {
        config.breaker.timeout_ms = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_BREAKER_ERROR_THRESHOLD") {
        config.breaker.error_threshold_percentage = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_BREAKER_RESET_TIMEOUT_MS") {
        config.breaker.reset_timeout_ms = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_HOURLY_LIMIT") {
        config.rate_limit.hourly_max = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_DAILY_LIMIT") {
        config.rate_limit.daily_max = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_CONCURRENCY") {
        config.workers.concurrency = v;
    }
    if let Some(v) = parsed(&lookup, "SWITCHBOARD_SEND_TIMEOUT_MS") {
        config.workers.send_timeout_ms = v;
    }
    if let Some(account) = lookup("SWITCHBOARD_ACCOUNT_ID") {
        config.workers.account_id = account;
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Render a config as pretty TOML.
pub fn to_toml(config: &SwitchboardConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))
}
