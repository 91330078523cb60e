use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MASKED: &str = "***MASKED***";

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Directory for persisted sessions - computed from home, not serialized
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Provider ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider preset: `groq`, `gemini`, or `custom` (requires `base_url`)
    #[serde(default = "default_provider_kind")]
    pub kind: String,

    /// Override the preset's OpenAI-compatible base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// Override the preset's default model
    #[serde(default)]
    pub model: Option<String>,

    /// API key; usually supplied through the environment instead
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Transport-level timeout for a single HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Pricing used to turn token counts into cost
    #[serde(default)]
    pub pricing: ModelPricing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    /// Input price per 1M tokens
    #[serde(default)]
    pub input: f64,

    /// Output price per 1M tokens
    #[serde(default)]
    pub output: f64,
}

impl ModelPricing {
    /// Cost in USD for the given token counts.
    pub fn cost_usd(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let input = (prompt_tokens as f64 / 1_000_000.0) * self.input;
        let output = (completion_tokens as f64 / 1_000_000.0) * self.output;
        input + output
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        // llama-3.1-8b-instant list price on Groq
        Self {
            input: 0.05,
            output: 0.08,
        }
    }
}

fn default_provider_kind() -> String {
    "groq".into()
}

fn default_temperature() -> f64 {
    0.4
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: None,
            model: None,
            api_key: None,
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            pricing: ModelPricing::default(),
        }
    }
}

// ── Session store ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum retained messages per session (default: 50)
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Maximum retained UTF-8 bytes of message content per session (default: 64 KiB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Sessions idle longer than this are reaped (default: 24h)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How often the reaper runs (default: 10 min)
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Emit a capacity warning at this percentage of `max_messages` (default: 80)
    #[serde(default = "default_warn_percent")]
    pub warn_at_percent: u8,

    /// Persist sessions under the data directory so they survive restarts
    #[serde(default)]
    pub persist: bool,
}

fn default_max_messages() -> usize {
    50
}

fn default_max_bytes() -> usize {
    64 * 1024
}

fn default_idle_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_reap_interval_secs() -> u64 {
    10 * 60
}

fn default_warn_percent() -> u8 {
    80
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_bytes: default_max_bytes(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            warn_at_percent: default_warn_percent(),
            persist: false,
        }
    }
}

// ── Rate limiting ─────────────────────────────────────────────────

/// Ceilings evaluated over a rolling window. `None` disables a ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Rolling window length (default: 3600s)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Global call ceiling per window (default: 500)
    #[serde(default = "default_max_calls_per_hour")]
    pub max_calls_per_hour: Option<u32>,

    /// Per-user call ceiling per window (default: 60)
    #[serde(default = "default_max_calls_per_user_per_hour")]
    pub max_calls_per_user_per_hour: Option<u32>,

    /// Global cost ceiling in USD per window (default: 5.00)
    #[serde(default = "default_max_cost_per_hour_usd")]
    pub max_cost_per_hour_usd: Option<f64>,

    /// Upper bound on retained usage entries per window (default: 10000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_window_secs() -> u64 {
    3600
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_calls_per_hour() -> Option<u32> {
    Some(500)
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_calls_per_user_per_hour() -> Option<u32> {
    Some(60)
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_cost_per_hour_usd() -> Option<f64> {
    Some(5.0)
}

fn default_max_entries() -> usize {
    10_000
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Config with every ceiling disabled.
    pub fn unlimited() -> Self {
        Self {
            max_calls_per_hour: None,
            max_calls_per_user_per_hour: None,
            max_cost_per_hour_usd: None,
            ..Self::default()
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_calls_per_hour: default_max_calls_per_hour(),
            max_calls_per_user_per_hour: default_max_calls_per_user_per_hour(),
            max_cost_per_hour_usd: default_max_cost_per_hour_usd(),
            max_entries: default_max_entries(),
        }
    }
}

// ── Circuit breaker ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the breaker (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close it again (default: 2)
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Cool-down before a trial call is allowed (default: 60s)
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    /// Trial calls allowed in flight while half-open (default: 1)
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_secs() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl CircuitConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    /// Fast-fail preset - a single failure opens the breaker
    pub fn fast_fail() -> Self {
        Self {
            failure_threshold: 1,
            open_timeout_secs: 30,
            ..Self::default()
        }
    }

    /// Lenient preset - tolerate more failures before opening
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            open_timeout_secs: 120,
            ..Self::default()
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Deadline for one LLM call; expiry counts as a breaker failure (default: 30s)
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    /// Prior messages sent to the LLM as context (default: 10)
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_history_window() -> usize {
    10
}

fn default_system_prompt() -> String {
    "You are a support assistant that helps people fix problems syncing health and \
     fitness data between apps, wearables and their phone's health platform. \
     Placeholders such as [NUMBER], [TIME], [APP] or [DEVICE] stand in for details \
     the user shared; refer to them generically. Give short, concrete, step-by-step \
     troubleshooting advice and never ask for personal information."
        .into()
}

impl PipelineConfig {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            llm_timeout_secs: default_llm_timeout_secs(),
            history_window: default_history_window(),
            system_prompt: default_system_prompt(),
        }
    }
}

// ── Observability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// "none" | "log"
    #[serde(default = "default_observability_backend")]
    pub backend: String,

    /// Default `tracing` filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_observability_backend() -> String {
    "log".into()
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_observability_backend(),
            log_level: default_log_level(),
        }
    }
}

// ── Loading / saving ──────────────────────────────────────────────

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let syncmate_dir = home.join(".syncmate");
        let config_path = syncmate_dir.join("config.toml");

        if !syncmate_dir.exists() {
            fs::create_dir_all(&syncmate_dir).context("Failed to create .syncmate directory")?;
        }

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let mut config = Config {
                config_path: config_path.clone(),
                data_dir: syncmate_dir.join("sessions"),
                ..Config::default()
            };
            config.save()?;
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Load a config file from an explicit path. Sessions live next to it.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.config_path = path.to_path_buf();
        config.data_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
            .join("sessions");
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Provider: SYNCMATE_PROVIDER
        if let Ok(kind) = std::env::var("SYNCMATE_PROVIDER") {
            let kind = kind.trim().to_lowercase();
            if !kind.is_empty() {
                self.provider.kind = kind;
            }
        }

        // API Key: SYNCMATE_API_KEY, then the provider's own variable
        let provider_var = match self.provider.kind.as_str() {
            "groq" => Some("GROQ_API_KEY"),
            "gemini" => Some("GEMINI_API_KEY"),
            _ => None,
        };
        if let Some(key) = std::env::var("SYNCMATE_API_KEY")
            .ok()
            .or_else(|| provider_var.and_then(|var| std::env::var(var).ok()))
        {
            if !key.trim().is_empty() {
                self.provider.api_key = Some(key.trim().to_string());
            }
        }

        // Model: SYNCMATE_MODEL
        if let Ok(model) = std::env::var("SYNCMATE_MODEL") {
            if !model.trim().is_empty() {
                self.provider.model = Some(model.trim().to_string());
            }
        }

        // Base URL: SYNCMATE_BASE_URL
        if let Ok(url) = std::env::var("SYNCMATE_BASE_URL") {
            if !url.trim().is_empty() {
                self.provider.base_url = Some(url.trim().to_string());
            }
        }

        // Log level: SYNCMATE_LOG_LEVEL
        if let Ok(level) = std::env::var("SYNCMATE_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.observability.log_level = level.trim().to_string();
            }
        }

        // Session data directory: SYNCMATE_DATA_DIR
        if let Ok(dir) = std::env::var("SYNCMATE_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir.trim());
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        crate::util::write_atomic(&self.config_path, toml_str.as_bytes())
            .with_context(|| format!("Failed to write config {}", self.config_path.display()))
    }

    /// Config rendered as JSON with secrets replaced by `***MASKED***`.
    pub fn masked_json(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self).context("Failed to serialize config")?;
        if let Some(key) = value.pointer_mut("/provider/api_key") {
            if key.is_string() {
                *key = serde_json::Value::String(MASKED.to_string());
            }
        }
        Ok(value)
    }
}
