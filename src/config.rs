use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Deserializer};
use std::{path::Path, time::Duration};

pub const DEFAULT_DAILY_LIMIT: usize = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_RETRY_BUDGET: u32 = 1;
pub const DEFAULT_BACKOFF_MS: u64 = 2000;
pub const DEFAULT_DATA_DIR: &str = "./data";

const ENV_BOT_TOKEN: &str = "BOT_TOKEN";
const ENV_OWNER_ID: &str = "OWNER_ID";
const ENV_API_URL: &str = "LIKE_API_URL";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bot: BotConfig,
    #[serde(default, deserialize_with = "opt_id")]
    pub owner_id: Option<String>,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    #[serde(default)]
    pub token: String,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub url: String,
    pub timeout_secs: Option<u64>,
    pub retry_budget: Option<u32>,
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct QuotaConfig {
    pub daily_limit: Option<usize>,
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    pub data_dir: Option<String>,
    pub strict_reads: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub timeout: Duration,
    pub retry_budget: u32,
    pub backoff: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry_budget: DEFAULT_RETRY_BUDGET,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

/// Daily quota size and the offset that defines where a calendar day starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub daily_limit: usize,
    pub offset: FixedOffset,
}

impl QuotaPolicy {
    pub fn new(daily_limit: usize) -> Self {
        Self {
            daily_limit,
            offset: FixedOffset::east_opt(0).unwrap_or_else(|| Utc.fix()),
        }
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DAILY_LIMIT)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Int(i64),
    Str(String),
}

// Telegram ids show up as bare YAML integers as often as strings.
fn opt_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<IdRepr>::deserialize(d)?.map(|v| match v {
        IdRepr::Int(n) => n.to_string(),
        IdRepr::Str(s) => s.trim().to_string(),
    }))
}

impl Config {
    pub fn owner_id(&self) -> &str {
        self.owner_id.as_deref().unwrap_or_default()
    }

    pub fn log_level(&self) -> String {
        self.bot.log_level.clone().unwrap_or_else(|| "info".into())
    }

    pub fn data_dir(&self) -> String {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string())
    }

    pub fn strict_reads(&self) -> bool {
        self.storage.strict_reads.unwrap_or(false)
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            timeout: Duration::from_secs(self.upstream.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            retry_budget: self.upstream.retry_budget.unwrap_or(DEFAULT_RETRY_BUDGET),
            backoff: Duration::from_millis(self.upstream.backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS)),
        }
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        let minutes = self.quota.utc_offset_minutes.unwrap_or(0);
        let offset = FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix());
        QuotaPolicy {
            daily_limit: self.quota.daily_limit.unwrap_or(DEFAULT_DAILY_LIMIT),
            offset,
        }
    }

    /// Environment variables win over the file for secrets and deployment
    /// specific values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_BOT_TOKEN).filter(|v| !v.trim().is_empty()) {
            self.bot.token = token.trim().to_string();
        }
        if let Some(owner) = lookup(ENV_OWNER_ID).filter(|v| !v.trim().is_empty()) {
            self.owner_id = Some(owner.trim().to_string());
        }
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.upstream.url = url.trim().to_string();
        }
    }
}

pub fn parse_config(text: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(text).context("parse yaml")?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    parse_config(&text)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.bot.token.trim().is_empty() {
        return Err(anyhow!("bot.token is empty (set it in the config or via {})", ENV_BOT_TOKEN));
    }
    if cfg.owner_id().is_empty() {
        return Err(anyhow!("owner_id is missing (set it in the config or via {})", ENV_OWNER_ID));
    }

    let url = reqwest::Url::parse(cfg.upstream.url.trim())
        .with_context(|| format!("upstream.url is not a valid url: '{}'", cfg.upstream.url))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(anyhow!(
            "upstream.url must be http or https (got scheme '{}')",
            url.scheme()
        ));
    }

    let policy = cfg.dispatch_policy();
    let secs = policy.timeout.as_secs();
    if !(1..=120).contains(&secs) {
        return Err(anyhow!("upstream.timeout_secs={} out of range (1..=120)", secs));
    }
    if policy.retry_budget > 10 {
        return Err(anyhow!(
            "upstream.retry_budget={} out of range (0..=10)",
            policy.retry_budget
        ));
    }

    if cfg.quota.daily_limit == Some(0) {
        return Err(anyhow!("quota.daily_limit must be > 0"));
    }
    if let Some(m) = cfg.quota.utc_offset_minutes {
        if !(-720..=840).contains(&m) {
            return Err(anyhow!("quota.utc_offset_minutes={} out of range (-720..=840)", m));
        }
    }

    if cfg.data_dir().trim().is_empty() {
        return Err(anyhow!("storage.data_dir is empty"));
    }
    Ok(())
}
