//! Runtime settings, driven by environment variables.
//!
//! Every knob has a safe default; an unparsable value falls back to the
//! default with a warning instead of aborting startup. Only a missing
//! key-value store in `production` is fatal (checked in the binary).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment; gates how hard startup failures bite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnv {
    /// Local development: degraded startup is tolerated.
    #[default]
    Development,
    /// Pre-production.
    Staging,
    /// Production: an unreachable key-value store aborts startup.
    Production,
}

impl FromStr for AppEnv {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(AppEnv::Development),
            "staging" => Ok(AppEnv::Staging),
            "production" | "prod" => Ok(AppEnv::Production),
            _ => Err(()),
        }
    }
}

impl fmt::Display for AppEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppEnv::Development => "development",
            AppEnv::Staging => "staging",
            AppEnv::Production => "production",
        };
        f.write_str(name)
    }
}

/// Per-cloud-provider connection defaults.
#[derive(Debug, Clone)]
pub struct CloudEndpointSettings {
    /// OpenAI base URL.
    pub openai_base_url: String,
    /// Env var holding the OpenAI key.
    pub openai_api_key: Option<String>,
    /// OpenRouter base URL.
    pub openrouter_base_url: String,
    /// OpenRouter key.
    pub openrouter_api_key: Option<String>,
    /// Together base URL.
    pub together_base_url: String,
    /// Together key.
    pub together_api_key: Option<String>,
    /// Local OpenAI-compatible endpoint (LM Studio, vLLM, Ollama).
    pub openai_compatible_base_url: String,
    /// Key for the OpenAI-compatible endpoint, when it wants one.
    pub openai_compatible_api_key: Option<String>,
}

impl Default for CloudEndpointSettings {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
            openrouter_api_key: None,
            together_base_url: "https://api.together.xyz/v1".to_string(),
            together_api_key: None,
            openai_compatible_base_url: "http://localhost:1234/v1".to_string(),
            openai_compatible_api_key: None,
        }
    }
}

/// All runtime settings for the gateway.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Deployment environment.
    pub app_env: AppEnv,
    /// Key-value service endpoint.
    pub redis_url: String,
    /// HTTP bind host.
    pub server_host: String,
    /// HTTP bind port.
    pub server_port: u16,
    /// GPU index to monitor.
    pub gpu_index: u32,
    /// VRAM admission cap as a percentage of total.
    pub max_vram_usage_percent: u32,
    /// VRAM kept back for the system, in MB.
    pub vram_reserve_mb: u64,
    /// Session TTL in hours (sliding, refreshed on writes).
    pub session_ttl_hours: u64,
    /// Idempotency mapping TTL in hours.
    pub idempotency_ttl_hours: u64,
    /// Per-attempt webhook timeout in seconds.
    pub webhook_timeout_seconds: u64,
    /// Webhook retries after the first attempt.
    pub webhook_max_retries: u32,
    /// Provider HTTP timeout in seconds.
    pub http_timeout_seconds: u64,
    /// Provider HTTP retries.
    pub http_max_retries: u32,
    /// GPU telemetry broadcast interval in seconds.
    pub gpu_stats_interval_seconds: u64,
    /// Cap of the cross-task recent-logs ring.
    pub logs_max_recent: u64,
    /// Enqueue backpressure threshold.
    pub queue_max_size: u64,
    /// Provider kind used when a preset does not name one.
    pub default_provider: String,
    /// Directory holding GGUF model files.
    pub models_dir: String,
    /// Directory holding preset YAML files.
    pub presets_dir: String,
    /// Cloud endpoint defaults.
    pub cloud: CloudEndpointSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_env: AppEnv::Development,
            redis_url: "redis://localhost:6379/0".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 8023,
            gpu_index: 0,
            max_vram_usage_percent: 95,
            vram_reserve_mb: 1024,
            session_ttl_hours: 24,
            idempotency_ttl_hours: 24,
            webhook_timeout_seconds: 30,
            webhook_max_retries: 3,
            http_timeout_seconds: 120,
            http_max_retries: 3,
            gpu_stats_interval_seconds: 2,
            logs_max_recent: 1000,
            queue_max_size: 1000,
            default_provider: "local".to_string(),
            models_dir: "/app/models".to_string(),
            presets_dir: "config/model_presets".to_string(),
            cloud: CloudEndpointSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            app_env: env_parsed("APP_ENV", defaults.app_env),
            redis_url: env_string("REDIS_URL", &defaults.redis_url),
            server_host: env_string("SERVER_HOST", &defaults.server_host),
            server_port: env_parsed("SERVER_PORT", defaults.server_port),
            gpu_index: env_parsed("GPU_INDEX", defaults.gpu_index),
            max_vram_usage_percent: env_parsed(
                "MAX_VRAM_USAGE_PERCENT",
                defaults.max_vram_usage_percent,
            )
            .clamp(50, 100),
            vram_reserve_mb: env_parsed("VRAM_RESERVE_MB", defaults.vram_reserve_mb),
            session_ttl_hours: env_parsed("SESSION_TTL_HOURS", defaults.session_ttl_hours).max(1),
            idempotency_ttl_hours: env_parsed(
                "IDEMPOTENCY_TTL_HOURS",
                defaults.idempotency_ttl_hours,
            )
            .max(1),
            webhook_timeout_seconds: env_parsed(
                "WEBHOOK_TIMEOUT_SECONDS",
                defaults.webhook_timeout_seconds,
            )
            .max(1),
            webhook_max_retries: env_parsed("WEBHOOK_MAX_RETRIES", defaults.webhook_max_retries),
            http_timeout_seconds: env_parsed("HTTP_TIMEOUT_SECONDS", defaults.http_timeout_seconds)
                .max(1),
            http_max_retries: env_parsed("HTTP_MAX_RETRIES", defaults.http_max_retries),
            gpu_stats_interval_seconds: env_parsed(
                "GPU_STATS_INTERVAL_SECONDS",
                defaults.gpu_stats_interval_seconds,
            )
            .max(1),
            logs_max_recent: env_parsed("LOGS_MAX_RECENT", defaults.logs_max_recent).max(100),
            queue_max_size: env_parsed("QUEUE_MAX_SIZE", defaults.queue_max_size).max(10),
            default_provider: env_string("DEFAULT_PROVIDER", &defaults.default_provider),
            models_dir: env_string("MODELS_DIR", &defaults.models_dir),
            presets_dir: env_string("PRESETS_DIR", &defaults.presets_dir),
            cloud: CloudEndpointSettings {
                openai_base_url: env_string("OPENAI_BASE_URL", &defaults.cloud.openai_base_url),
                openai_api_key: env_optional("OPENAI_API_KEY"),
                openrouter_base_url: env_string(
                    "OPENROUTER_BASE_URL",
                    &defaults.cloud.openrouter_base_url,
                ),
                openrouter_api_key: env_optional("OPENROUTER_API_KEY"),
                together_base_url: env_string(
                    "TOGETHER_BASE_URL",
                    &defaults.cloud.together_base_url,
                ),
                together_api_key: env_optional("TOGETHER_API_KEY"),
                openai_compatible_base_url: env_string(
                    "OPENAI_COMPATIBLE_BASE_URL",
                    &defaults.cloud.openai_compatible_base_url,
                ),
                openai_compatible_api_key: env_optional("OPENAI_COMPATIBLE_API_KEY"),
            },
        }
    }

    /// Session TTL in seconds.
    pub fn session_ttl_secs(&self) -> u64 {
        self.session_ttl_hours * 3600
    }

    /// Idempotency TTL in seconds.
    pub fn idempotency_ttl_secs(&self) -> u64 {
        self.idempotency_ttl_hours * 3600
    }

    /// Per-attempt webhook timeout.
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_seconds)
    }

    /// Provider HTTP timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    /// GPU telemetry broadcast interval.
    pub fn gpu_stats_interval(&self) -> Duration {
        Duration::from_secs(self.gpu_stats_interval_seconds)
    }

    /// HTTP bind address string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    env_var = name,
                    value = %raw,
                    "invalid env value; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.server_port, 8023);
        assert_eq!(settings.max_vram_usage_percent, 95);
        assert_eq!(settings.vram_reserve_mb, 1024);
        assert_eq!(settings.webhook_timeout_seconds, 30);
        assert_eq!(settings.webhook_max_retries, 3);
        assert_eq!(settings.session_ttl_secs(), 24 * 3600);
    }

    #[test]
    fn app_env_parses_aliases() {
        assert_eq!("prod".parse::<AppEnv>(), Ok(AppEnv::Production));
        assert_eq!("Development".parse::<AppEnv>(), Ok(AppEnv::Development));
        assert!("weird".parse::<AppEnv>().is_err());
    }
}
