use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

/// Runtime settings for planning and browser execution.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// Pause after every browser step, to make headed runs watchable.
    pub slow_mo: Duration,
    /// Bound on element lookups and every non-navigation browser call.
    pub default_timeout: Duration,
    pub navigation_timeout: Duration,
    pub capture_step_screenshots: bool,
    pub capture_dom_snapshot: bool,
    pub snapshot_max_chars: usize,
    pub max_attempts: u32,
    pub planner_timeout: Duration,
    pub execution_feedback: bool,
    pub planner: PlannerConfig,
    pub task_store: PathBuf,
}

#[derive(Clone)]
pub struct PlannerConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl std::fmt::Debug for PlannerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannerConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            slow_mo: Duration::ZERO,
            default_timeout: Duration::from_millis(3000),
            navigation_timeout: Duration::from_millis(15_000),
            capture_step_screenshots: false,
            capture_dom_snapshot: true,
            snapshot_max_chars: 8000,
            max_attempts: 2,
            planner_timeout: Duration::from_millis(60_000),
            execution_feedback: true,
            planner: PlannerConfig::default(),
            task_store: default_task_store(),
        }
    }
}

fn default_task_store() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentic-rpa")
        .join("tasks.json")
}

impl AgentConfig {
    /// Build from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RPA_HEADLESS") {
            config.headless = parse_bool("RPA_HEADLESS", &v)?;
        }
        if let Some(v) = get("RPA_CHROME_PATH") {
            config.chrome_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("RPA_SLOW_MO_MS") {
            config.slow_mo = Duration::from_millis(parse("RPA_SLOW_MO_MS", &v)?);
        }
        if let Some(v) = get("RPA_DEFAULT_TIMEOUT_MS") {
            config.default_timeout = Duration::from_millis(parse("RPA_DEFAULT_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("RPA_NAVIGATION_TIMEOUT_MS") {
            config.navigation_timeout =
                Duration::from_millis(parse("RPA_NAVIGATION_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("RPA_CAPTURE_STEP_SCREENSHOTS") {
            config.capture_step_screenshots = parse_bool("RPA_CAPTURE_STEP_SCREENSHOTS", &v)?;
        }
        if let Some(v) = get("RPA_CAPTURE_DOM_SNAPSHOT") {
            config.capture_dom_snapshot = parse_bool("RPA_CAPTURE_DOM_SNAPSHOT", &v)?;
        }
        if let Some(v) = get("RPA_SNAPSHOT_MAX_CHARS") {
            config.snapshot_max_chars = parse("RPA_SNAPSHOT_MAX_CHARS", &v)?;
        }
        if let Some(v) = get("RPA_MAX_ATTEMPTS") {
            let attempts: u32 = parse("RPA_MAX_ATTEMPTS", &v)?;
            if attempts == 0 {
                return Err(anyhow!("RPA_MAX_ATTEMPTS must be at least 1"));
            }
            config.max_attempts = attempts;
        }
        if let Some(v) = get("RPA_PLANNER_TIMEOUT_MS") {
            config.planner_timeout = Duration::from_millis(parse("RPA_PLANNER_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("RPA_EXECUTION_FEEDBACK") {
            config.execution_feedback = parse_bool("RPA_EXECUTION_FEEDBACK", &v)?;
        }
        if let Some(v) = get("RPA_TASK_STORE") {
            config.task_store = PathBuf::from(v);
        }

        config.planner.api_key = get("OPENAI_API_KEY");
        if let Some(v) = get("OPENAI_MODEL") {
            config.planner.model = v;
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            config.planner.base_url = v.trim_end_matches('/').to_string();
        }

        Ok(config)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: '{value}'"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("invalid boolean for {key}: '{value}'")),
    }
}
