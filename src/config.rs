use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::feed::synthetic::SyntheticParams;
use crate::feed::FeedSettings;
use crate::schedule::MarketSchedule;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub feed: FeedConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
    #[serde(default)]
    pub symbols: SymbolsConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub ws_url: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout: String,
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial: String,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max: String,
    #[serde(default = "default_reconnect_factor")]
    pub reconnect_factor: f64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub timezone: String,
    pub open: String,
    pub close: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".to_string(),
            open: "09:15".to_string(),
            close: "15:30".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub force: bool,
    pub interval: String,
    pub start_min: f64,
    pub start_span: f64,
    pub max_step: f64,
    pub floor: f64,
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        let params = SyntheticParams::default();
        Self {
            force: false,
            interval: "1s".to_string(),
            start_min: params.start_min,
            start_span: params.start_span,
            max_step: params.max_step,
            floor: params.floor,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SymbolsConfig {
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub tree_path: PathBuf,
    pub min_rules: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            tree_path: PathBuf::from("config/strategy.json"),
            min_rules: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_source() -> String {
    "angel_one".to_string()
}

fn default_liveness_timeout() -> String {
    "20s".to_string()
}

fn default_reconnect_initial() -> String {
    "1500ms".to_string()
}

fn default_reconnect_max() -> String {
    "30s".to_string()
}

fn default_reconnect_factor() -> f64 {
    2.0
}

fn default_write_timeout() -> String {
    "2s".to_string()
}

/// Parse a duration string such as "1500ms", "20s", "5m" or "1h".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .with_context(|| format!("invalid duration '{}': missing unit (ms/s/m/h)", s))?;
    let (num_str, unit) = s.split_at(split);
    if num_str.is_empty() {
        bail!("invalid duration '{}': expected format like '20s'", s);
    }
    let n: u64 = num_str.parse().with_context(|| {
        format!(
            "invalid duration '{}': quantity must be a positive integer",
            s
        )
    })?;
    if n == 0 {
        bail!("invalid duration '{}': quantity must be > 0", s);
    }

    let unit_ms: u64 = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => bail!(
            "invalid duration '{}': unsupported unit '{}', expected one of ms/s/m/h",
            s,
            unit
        ),
    };

    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .with_context(|| format!("invalid duration '{}': value is too large", s))
}

fn parse_flag(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl SessionConfig {
    pub fn schedule(&self) -> Result<MarketSchedule> {
        MarketSchedule::parse(&self.timezone, &self.open, &self.close)
            .context("invalid [session] settings")
    }
}

impl SyntheticConfig {
    pub fn params(&self) -> Result<SyntheticParams> {
        if self.floor.is_nan() || self.floor <= 0.0 {
            bail!("synthetic.floor must be > 0, got {}", self.floor);
        }
        if self.start_span < 0.0 || self.max_step < 0.0 {
            bail!("synthetic.start_span and synthetic.max_step must be >= 0");
        }
        Ok(SyntheticParams {
            interval: parse_duration(&self.interval).context("synthetic.interval is invalid")?,
            start_min: self.start_min,
            start_span: self.start_span,
            max_step: self.max_step,
            floor: self.floor,
            seed: self.seed,
        })
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH), |key| std::env::var(key).ok())
    }

    /// Read `path`, apply overrides from `env`, and validate.
    pub fn load_from<F>(path: &Path, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = env("TICKWATCH_FEED_URL").filter(|v| !v.trim().is_empty()) {
            self.feed.ws_url = url.trim().to_string();
        }
        if let Some(url) = env("TICKWATCH_SYMBOLS_URL").filter(|v| !v.trim().is_empty()) {
            self.symbols.base_url = Some(url.trim().to_string());
        }
        if let Some(flag) = env("TICKWATCH_FORCE_SYNTHETIC") {
            self.synthetic.force = parse_flag(&flag);
        }
    }

    /// Fail fast on anything the runtime could not recover from later.
    pub fn validate(&self) -> Result<()> {
        self.feed_settings()?;
        self.session.schedule()?;
        if self.feed.source.trim().is_empty() {
            bail!("feed.source must not be empty");
        }
        Ok(())
    }

    pub fn feed_url(&self) -> Result<Url> {
        let raw = self.feed.ws_url.trim();
        if raw.is_empty() {
            bail!("feed.ws_url is empty and TICKWATCH_FEED_URL is not set");
        }
        let url = Url::parse(raw).with_context(|| format!("feed.ws_url '{}' is not a URL", raw))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("feed.ws_url must use ws:// or wss://, got '{}'", url.scheme());
        }
        Ok(url)
    }

    pub fn feed_settings(&self) -> Result<FeedSettings> {
        let mut settings = FeedSettings::new(self.feed_url()?);
        settings.liveness_timeout = parse_duration(&self.feed.liveness_timeout)
            .context("feed.liveness_timeout is invalid")?;
        settings.reconnect_initial = parse_duration(&self.feed.reconnect_initial)
            .context("feed.reconnect_initial is invalid")?;
        settings.reconnect_max =
            parse_duration(&self.feed.reconnect_max).context("feed.reconnect_max is invalid")?;
        if settings.reconnect_max < settings.reconnect_initial {
            bail!("feed.reconnect_max must be >= feed.reconnect_initial");
        }
        settings.reconnect_factor = self.feed.reconnect_factor;
        settings.write_timeout =
            parse_duration(&self.feed.write_timeout).context("feed.write_timeout is invalid")?;
        settings.synthetic = self.synthetic.params()?;
        settings.force_synthetic = self.synthetic.force;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_valid() {
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("20s").unwrap(), Duration::from_secs(20));
        assert_eq!(parse_duration(" 2m ").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_rejects_invalid_inputs() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("20").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn parse_flag_accepts_common_truthy_values() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" on "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("nope"));
    }
}
