use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

/// One year. Longer escalation dedup buckets are clamped to this.
pub const MAX_DEDUP_MINUTES: i64 = 525_600;

/// Engine-facing knobs. Built from the environment in the worker and from
/// `Default` in tests.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub timezone: Tz,
    pub working_hours_start: u32,
    pub working_hours_end: u32,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub intent_confidence_threshold: f64,
    /// Reply to booking intents automatically with the classifier's suggestion.
    pub intent_auto_reply: bool,
    pub max_inline_delay: Duration,
    pub escalation_dedup_minutes: i64,
    pub booking_renotify_minutes: i64,
    /// Rows fetched per sweep query; each window is paged until exhausted.
    pub sweep_page_size: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Seoul,
            working_hours_start: 9,
            working_hours_end: 18,
            llm_model: "gpt-4o-mini".to_string(),
            llm_temperature: 0.1,
            llm_max_tokens: 500,
            intent_confidence_threshold: 0.7,
            intent_auto_reply: true,
            max_inline_delay: Duration::from_secs(24 * 3_600),
            escalation_dedup_minutes: 60,
            booking_renotify_minutes: 30,
            sweep_page_size: 500,
        }
    }
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub incoming_stream: String,
    pub jobs_stream: String,
    pub delayed_jobs_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    pub http_timeout: Duration,
    pub sweep_interval: Duration,
    pub engine: EngineSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = EngineSettings::default();

        let timezone = env::var("CLINIC_TIMEZONE")
            .ok()
            .and_then(|tz| tz.parse::<Tz>().ok())
            .unwrap_or(defaults.timezone);

        let engine = EngineSettings {
            timezone,
            working_hours_start: parse_or("WORKING_HOURS_START", defaults.working_hours_start),
            working_hours_end: parse_or("WORKING_HOURS_END", defaults.working_hours_end),
            llm_model: env::var("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_temperature: parse_or("LLM_TEMPERATURE", defaults.llm_temperature),
            llm_max_tokens: parse_or("LLM_MAX_TOKENS", defaults.llm_max_tokens),
            intent_confidence_threshold: parse_or(
                "INTENT_CONFIDENCE_THRESHOLD",
                defaults.intent_confidence_threshold,
            ),
            intent_auto_reply: parse_or("INTENT_AUTO_REPLY", defaults.intent_auto_reply),
            max_inline_delay: Duration::from_secs(parse_or(
                "MAX_INLINE_DELAY_SECS",
                defaults.max_inline_delay.as_secs(),
            )),
            escalation_dedup_minutes: parse_or(
                "ESCALATION_DEDUP_MINUTES",
                defaults.escalation_dedup_minutes,
            )
            .clamp(1, MAX_DEDUP_MINUTES),
            booking_renotify_minutes: parse_or(
                "BOOKING_RENOTIFY_MINUTES",
                defaults.booking_renotify_minutes,
            ),
            sweep_page_size: parse_or("SWEEP_PAGE_SIZE", defaults.sweep_page_size).max(1),
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 20),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            incoming_stream: env::var("INCOMING_STREAM")
                .unwrap_or_else(|_| "automation:queue:incoming".to_string()),
            jobs_stream: env::var("JOBS_STREAM")
                .unwrap_or_else(|_| "automation:queue:jobs".to_string()),
            delayed_jobs_key: env::var("DELAYED_JOBS_KEY")
                .unwrap_or_else(|_| "automation:queue:delayed".to_string()),
            consumer_group: env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "automation_core_group".to_string()),
            consumer_name: env::var("CONSUMER_NAME")
                .unwrap_or_else(|_| "automation_worker_1".to_string()),
            llm_api_url: env::var("LLM_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key: env::var("LLM_API_KEY").ok(),
            http_timeout: Duration::from_secs(parse_or("HTTP_TIMEOUT_SECS", 30)),
            sweep_interval: Duration::from_secs(parse_or("SWEEP_INTERVAL_SECS", 300)),
            engine,
        })
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
