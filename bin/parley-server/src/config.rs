//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use parley_core::aggregator::FlushPolicy;
use parley_core::llm::OpenAiConfig;
use parley_core::pipeline::PipelineConfig;
use tracing::warn;

/// Upper bound for `PARLEY_SESSION_EXPIRATION_DAYS`.
pub const MAX_SESSION_EXPIRATION_DAYS: i64 = 3650;

/// Runtime configuration for parley-server.
///
/// Every field has a default so the server starts without any environment
/// variables set; authenticated routes reject every token until
/// `PARLEY_JWT_SECRET` is provided.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// sqlx SQLite URL (default: `"sqlite://parley.db?mode=rwc"`).
    pub database_url: String,

    /// Redis URL. When unset an in-process cache is used instead.
    pub redis_url: Option<String>,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins. `None` allows any origin.
    pub cors_allowed_origins: Option<String>,

    /// HS256 secret used to verify bearer tokens.
    pub jwt_secret: String,

    pub openai_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_idle_timeout: Duration,

    /// File holding the system prompt. `None` uses the built-in prompt.
    pub system_prompt_path: Option<String>,

    pub chunk_min_chars: usize,
    pub chunk_max_interval: Duration,

    /// Past messages handed to the model with each turn.
    pub history_limit: usize,

    /// Lifetime of a new chat session, within `1..=MAX_SESSION_EXPIRATION_DAYS`.
    pub session_expiration_days: i64,

    /// Longest wait for the client's message after the socket opens.
    pub ws_read_timeout: Duration,

    /// Variables that were set but rejected; their defaults (or clamped
    /// values) are in effect.
    pub invalid_keys: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_owned());
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut invalid = Vec::new();
        let expiration_days: i64 =
            parse_or(&lookup, &mut invalid, "PARLEY_SESSION_EXPIRATION_DAYS", 7);
        let session_expiration_days = expiration_days.clamp(1, MAX_SESSION_EXPIRATION_DAYS);
        if session_expiration_days != expiration_days {
            warn!(
                value = expiration_days,
                clamped = session_expiration_days,
                "PARLEY_SESSION_EXPIRATION_DAYS out of range"
            );
            invalid.push("PARLEY_SESSION_EXPIRATION_DAYS".to_owned());
        }

        Self {
            bind_address: env_or("PARLEY_BIND", "0.0.0.0:8000"),
            database_url: env_or("PARLEY_DATABASE_URL", "sqlite://parley.db?mode=rwc"),
            redis_url: optional("PARLEY_REDIS_URL"),
            log_level: env_or("PARLEY_LOG", "info"),
            log_json: lookup("PARLEY_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: optional("PARLEY_CORS_ORIGINS"),
            jwt_secret: env_or("PARLEY_JWT_SECRET", ""),
            openai_api_key: env_or("OPENAI_API_KEY", ""),
            llm_base_url: env_or("PARLEY_LLM_BASE_URL", "https://api.openai.com/v1"),
            llm_model: env_or("PARLEY_LLM_MODEL", "gpt-4o"),
            llm_temperature: parse_or(&lookup, &mut invalid, "PARLEY_LLM_TEMPERATURE", 0.5),
            llm_idle_timeout: Duration::from_secs(parse_or(
                &lookup,
                &mut invalid,
                "PARLEY_LLM_IDLE_TIMEOUT_SECS",
                60,
            )),
            system_prompt_path: optional("PARLEY_SYSTEM_PROMPT_PATH"),
            chunk_min_chars: parse_or(&lookup, &mut invalid, "PARLEY_CHUNK_MIN_CHARS", 25),
            chunk_max_interval: Duration::from_millis(parse_or(
                &lookup,
                &mut invalid,
                "PARLEY_CHUNK_MAX_INTERVAL_MS",
                1000,
            )),
            history_limit: parse_or(&lookup, &mut invalid, "PARLEY_HISTORY_LIMIT", 10),
            session_expiration_days,
            ws_read_timeout: Duration::from_secs(parse_or(
                &lookup,
                &mut invalid,
                "PARLEY_WS_READ_TIMEOUT_SECS",
                30,
            )),
            invalid_keys: invalid,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            flush: FlushPolicy {
                min_chars: self.chunk_min_chars,
                max_interval: self.chunk_max_interval,
            },
            history_limit: self.history_limit,
            model: self.llm_model.clone(),
            temperature: self.llm_temperature,
        }
    }

    pub fn openai(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.llm_base_url.clone(),
            api_key: self.openai_api_key.clone(),
            idle_timeout: self.llm_idle_timeout,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

/// Parse `key` if set; an unparsable value is logged, recorded in `invalid`
/// and replaced by `default`.
fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    invalid: &mut Vec<String>,
    key: &str,
    default: T,
) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, "invalid configuration value; using default");
            invalid.push(key.to_owned());
            default
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use tracing_test::traced_test;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.bind_address, "0.0.0.0:8000");
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.llm_model, "gpt-4o");
        assert_eq!(cfg.chunk_min_chars, 25);
        assert_eq!(cfg.chunk_max_interval, Duration::from_secs(1));
        assert_eq!(cfg.history_limit, 10);
        assert_eq!(cfg.session_expiration_days, 7);
        assert!(!cfg.log_json);
        assert_eq!(cfg.pipeline().flush, FlushPolicy::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = from_pairs(&[
            ("PARLEY_CHUNK_MIN_CHARS", "40"),
            ("PARLEY_CHUNK_MAX_INTERVAL_MS", "250"),
            ("PARLEY_LOG_JSON", "TRUE"),
            ("PARLEY_REDIS_URL", "redis://127.0.0.1/"),
            ("PARLEY_LLM_TEMPERATURE", "0.9"),
        ]);
        assert_eq!(cfg.chunk_min_chars, 40);
        assert_eq!(cfg.chunk_max_interval, Duration::from_millis(250));
        assert!(cfg.log_json);
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert!((cfg.llm_temperature - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    #[traced_test]
    fn unparsable_values_fall_back_to_defaults() {
        let cfg = from_pairs(&[("PARLEY_HISTORY_LIMIT", "lots"), ("PARLEY_REDIS_URL", " ")]);
        assert_eq!(cfg.history_limit, 10);
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.invalid_keys, vec!["PARLEY_HISTORY_LIMIT".to_owned()]);
        assert!(logs_contain("invalid configuration value"));
    }

    #[test]
    fn session_expiration_is_clamped() {
        let cfg = from_pairs(&[("PARLEY_SESSION_EXPIRATION_DAYS", "99999999999999")]);
        assert_eq!(cfg.session_expiration_days, MAX_SESSION_EXPIRATION_DAYS);
        assert_eq!(cfg.invalid_keys, vec!["PARLEY_SESSION_EXPIRATION_DAYS".to_owned()]);

        let cfg = from_pairs(&[("PARLEY_SESSION_EXPIRATION_DAYS", "-3")]);
        assert_eq!(cfg.session_expiration_days, 1);
    }

    #[test]
    fn valid_configuration_has_no_invalid_keys() {
        assert!(Config::default().invalid_keys.is_empty());
    }
}
