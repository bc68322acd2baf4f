use serde_json::{json, Value};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AgentError, AgentResult};
use crate::retry::RetryConfig;
use crate::strategy::InteractionStrategy;

/// Per-strategy attempt timeouts. Tuned to the target app, so all of them
/// are configuration.
#[derive(Debug, Clone)]
pub struct StrategyTimeouts {
    pub structural: Duration,
    pub script: Duration,
    pub vision: Duration,
    pub coordinate: Duration,
}

impl StrategyTimeouts {
    pub fn for_strategy(&self, strategy: InteractionStrategy) -> Duration {
        match strategy {
            InteractionStrategy::StructuralLocate => self.structural,
            InteractionStrategy::ScriptEvaluate => self.script,
            InteractionStrategy::VisionGuidedLocate => self.vision,
            InteractionStrategy::CoordinateFallback => self.coordinate,
        }
    }
}

impl Default for StrategyTimeouts {
    fn default() -> Self {
        Self {
            structural: Duration::from_millis(4000),
            script: Duration::from_millis(4000),
            vision: Duration::from_millis(20000),
            coordinate: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub order: Vec<InteractionStrategy>,
    pub timeouts: StrategyTimeouts,
    /// Extra tries of the same strategy after a transient UI error.
    pub in_strategy_retries: u32,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            order: InteractionStrategy::ALL.to_vec(),
            timeouts: StrategyTimeouts::default(),
            in_strategy_retries: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub settle_timeout: Duration,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(6000),
            poll_interval: Duration::from_millis(400),
            settle_timeout: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub scan_interval: Duration,
    pub cycle_timeout: Duration,
    pub max_retries_per_transition: u32,
    pub chain: ChainSettings,
    pub verifier: VerifierSettings,
    pub login_retry: RetryConfig,
    pub extraction_timeout: Duration,
    pub extraction_retries: u32,
    pub min_caption_chars: usize,
    pub data_dir: PathBuf,
    pub profile_path: Option<PathBuf>,
    pub webdriver_url: String,
    pub webdriver_capabilities: Value,
    pub account_username: Option<String>,
    pub account_password: Option<String>,
    pub vision_api_key: Option<String>,
    pub vision_api_url: String,
    pub vision_model: String,
    pub extraction_url: Option<String>,
    pub render_url: Option<String>,
    pub delivery_url: Option<String>,
    /// May contain `{thread}`, replaced with the thread id.
    pub delivery_destination: String,
    pub reply_template: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5),
            cycle_timeout: Duration::from_secs(600),
            max_retries_per_transition: 3,
            chain: ChainSettings::default(),
            verifier: VerifierSettings::default(),
            login_retry: RetryConfig {
                max_attempts: 4,
                base_delay_ms: 2000,
                max_delay_ms: 30000,
                backoff_multiplier: 2.0,
            },
            extraction_timeout: Duration::from_secs(60),
            extraction_retries: 1,
            min_caption_chars: 100,
            data_dir: default_data_dir(),
            profile_path: None,
            webdriver_url: "http://127.0.0.1:4723".to_string(),
            webdriver_capabilities: json!({
                "platformName": "iOS",
                "appium:automationName": "XCUITest",
                "appium:bundleId": "com.burbn.instagram",
                "appium:noReset": true
            }),
            account_username: None,
            account_password: None,
            vision_api_key: None,
            vision_api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            vision_model: "gpt-4o".to_string(),
            extraction_url: None,
            render_url: None,
            delivery_url: None,
            delivery_destination: "{thread}".to_string(),
            reply_template: "Got it! I'm turning this post into a recipe card for you now.".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> AgentResult<Self> {
        let d = AgentConfig::default();

        let order = match env_string("AGENT_STRATEGY_ORDER") {
            Some(raw) => parse_strategy_order(&raw)?,
            None => d.chain.order.clone(),
        };

        let capabilities = match env_string("AGENT_WEBDRIVER_CAPABILITIES") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| AgentError::Config(format!("AGENT_WEBDRIVER_CAPABILITIES is not JSON: {}", e)))?,
            None => d.webdriver_capabilities.clone(),
        };

        Ok(Self {
            scan_interval: Duration::from_secs(env_u64("AGENT_SCAN_INTERVAL_SECS", 5)),
            cycle_timeout: Duration::from_secs(env_u64("AGENT_CYCLE_TIMEOUT_SECS", 600)),
            max_retries_per_transition: env_u32("AGENT_MAX_RETRIES_PER_TRANSITION", 3).max(1),
            chain: ChainSettings {
                order,
                timeouts: StrategyTimeouts {
                    structural: Duration::from_millis(env_u64("AGENT_STRATEGY_TIMEOUT_MS_STRUCTURAL", 4000)),
                    script: Duration::from_millis(env_u64("AGENT_STRATEGY_TIMEOUT_MS_SCRIPT", 4000)),
                    vision: Duration::from_millis(env_u64("AGENT_STRATEGY_TIMEOUT_MS_VISION", 20000)),
                    coordinate: Duration::from_millis(env_u64("AGENT_STRATEGY_TIMEOUT_MS_COORDINATE", 3000)),
                },
                in_strategy_retries: env_u32("AGENT_IN_STRATEGY_RETRIES", 1),
            },
            verifier: VerifierSettings {
                timeout: Duration::from_millis(env_u64("AGENT_VERIFY_TIMEOUT_MS", 6000)),
                poll_interval: Duration::from_millis(env_u64("AGENT_VERIFY_POLL_MS", 400).max(10)),
                settle_timeout: Duration::from_millis(env_u64("AGENT_SETTLE_TIMEOUT_MS", 2500)),
            },
            login_retry: RetryConfig {
                max_attempts: env_u32("AGENT_LOGIN_MAX_ATTEMPTS", 4).max(1) as usize,
                base_delay_ms: env_u64("AGENT_LOGIN_BACKOFF_BASE_MS", 2000),
                ..d.login_retry
            },
            extraction_timeout: Duration::from_secs(env_u64("AGENT_EXTRACTION_TIMEOUT_SECS", 60)),
            extraction_retries: env_u32("AGENT_EXTRACTION_RETRIES", 1),
            min_caption_chars: env_u64("AGENT_MIN_CAPTION_CHARS", 100) as usize,
            data_dir: env_string("AGENT_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            profile_path: env_string("AGENT_PROFILE_PATH").map(PathBuf::from),
            webdriver_url: env_string("AGENT_WEBDRIVER_URL").unwrap_or(d.webdriver_url),
            webdriver_capabilities: capabilities,
            account_username: env_string("AGENT_ACCOUNT_USERNAME"),
            account_password: env_string("AGENT_ACCOUNT_PASSWORD"),
            vision_api_key: env_string("AGENT_VISION_API_KEY"),
            vision_api_url: env_string("AGENT_VISION_API_URL").unwrap_or(d.vision_api_url),
            vision_model: env_string("AGENT_VISION_MODEL").unwrap_or(d.vision_model),
            extraction_url: env_string("AGENT_EXTRACTION_URL"),
            render_url: env_string("AGENT_RENDER_URL"),
            delivery_url: env_string("AGENT_DELIVERY_URL"),
            delivery_destination: env_string("AGENT_DELIVERY_DESTINATION").unwrap_or(d.delivery_destination),
            reply_template: env_string("AGENT_REPLY_TEMPLATE").unwrap_or(d.reply_template),
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".inbox_agent")
}

/// Comma separated strategy names. Strategies left out are disabled.
pub fn parse_strategy_order(raw: &str) -> AgentResult<Vec<InteractionStrategy>> {
    let mut order = Vec::new();
    for name in raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let strategy: InteractionStrategy = name.parse().map_err(AgentError::Config)?;
        if !order.contains(&strategy) {
            order.push(strategy);
        }
    }
    if order.is_empty() {
        return Err(AgentError::Config("strategy order enables no strategy".into()));
    }
    Ok(order)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default_val: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default_val)
}

fn env_u32(key: &str, default_val: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default_val)
}
