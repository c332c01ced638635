use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_enabled")]
    pub enabled: bool,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// How many weeks (starting with the current one) must be covered by a poll.
    #[serde(default = "default_weeks_ahead")]
    pub weeks_ahead: u32,
    /// How many missing weeks get posted per scheduler run.
    #[serde(default = "default_post_count")]
    pub post_count: u32,
    /// Days of week the check runs on, 0 = Monday .. 6 = Sunday.
    #[serde(default = "default_schedule_days")]
    pub schedule_days: Vec<u8>,
    /// Local time of day as "HH:MM".
    #[serde(default = "default_schedule_time")]
    pub schedule_time: String,
    #[serde(default = "default_check_on_startup")]
    pub check_on_startup: bool,
    /// Prompt template for the optional announcement message posted after
    /// a batch of new polls. Unset disables announcements.
    #[serde(default)]
    pub announcement_prompt: Option<String>,
}

fn default_poll_enabled() -> bool {
    true
}

fn default_state_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("signal-cli")
        .join("signal_poll_weeks.json")
}

fn default_weeks_ahead() -> u32 {
    2
}

fn default_post_count() -> u32 {
    2
}

fn default_schedule_days() -> Vec<u8> {
    vec![0, 1, 2, 3, 4]
}

fn default_schedule_time() -> String {
    "12:30".to_string()
}

fn default_check_on_startup() -> bool {
    true
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: default_poll_enabled(),
            state_file: default_state_file(),
            weeks_ahead: default_weeks_ahead(),
            post_count: default_post_count(),
            schedule_days: default_schedule_days(),
            schedule_time: default_schedule_time(),
            check_on_startup: default_check_on_startup(),
            announcement_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // signal-cli daemon connection
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,
    #[serde(default = "default_daemon_timeout_secs")]
    pub daemon_timeout_secs: u64,

    // Identity
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub bot_number: String,
    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    // LLM endpoint (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_url")]
    pub llm_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    // Conversation history
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,

    #[serde(default)]
    pub poll: PollConfig,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    7583
}

fn default_daemon_timeout_secs() -> u64 {
    10
}

fn default_bot_name() -> String {
    "Marvin".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:8000/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_tokens() -> u32 {
    200
}

fn default_history_file() -> PathBuf {
    PathBuf::from("message_history.json")
}

fn default_context_messages() -> usize {
    15
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            daemon_timeout_secs: default_daemon_timeout_secs(),
            group_id: String::new(),
            bot_number: String::new(),
            bot_name: default_bot_name(),
            llm_url: default_llm_url(),
            model: default_model(),
            llm_api_key: None,
            system_prompt: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            history_file: default_history_file(),
            context_messages: default_context_messages(),
            poll: PollConfig::default(),
        }
    }
}

impl BotConfig {
    /// Path to the config file: `MARVIN_CONFIG` or `marvin.toml` in the
    /// working directory.
    pub fn config_path() -> PathBuf {
        env::var("MARVIN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("marvin.toml"))
    }

    /// Load config from file, then apply env var overrides.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<BotConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(group_id) = env::var("MARVIN_SIGNAL_GROUP_ID") {
            if !group_id.trim().is_empty() {
                self.group_id = group_id;
            }
        }
        if let Ok(number) = env::var("MARVIN_BOT_NUMBER") {
            if !number.trim().is_empty() {
                self.bot_number = number;
            }
        }
    }

    /// Startup validation. Missing identifiers are the only fatal
    /// configuration errors; everything else falls back to defaults.
    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            anyhow::bail!("group_id is not set (config file or MARVIN_SIGNAL_GROUP_ID)");
        }
        if self.bot_number.trim().is_empty() {
            anyhow::bail!("bot_number is not set (config file or MARVIN_BOT_NUMBER)");
        }
        Ok(())
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_all_defaults() {
        let config = BotConfig::parse("").expect("parse empty config");
        assert_eq!(config.daemon_host, "127.0.0.1");
        assert_eq!(config.daemon_port, 7583);
        assert_eq!(config.context_messages, 15);
        assert_eq!(config.temperature, 0.8);
        assert_eq!(config.poll.weeks_ahead, 2);
        assert_eq!(config.poll.post_count, 2);
        assert_eq!(config.poll.schedule_days, vec![0, 1, 2, 3, 4]);
        assert_eq!(config.poll.schedule_time, "12:30");
        assert!(config.poll.check_on_startup);
        assert!(config.poll.announcement_prompt.is_none());
    }

    #[test]
    fn partial_poll_section_keeps_remaining_defaults() {
        let config = BotConfig::parse(
            r#"
group_id = "abc123"
bot_number = "+4915501234567"

[poll]
weeks_ahead = 4
schedule_time = "09:00"
"#,
        )
        .expect("parse config");
        assert_eq!(config.poll.weeks_ahead, 4);
        assert_eq!(config.poll.schedule_time, "09:00");
        assert_eq!(config.poll.post_count, 2);
        assert!(config.poll.enabled);
    }

    #[test]
    fn validate_requires_group_and_bot_number() {
        let mut config = BotConfig::default();
        assert!(config.validate().is_err());

        config.group_id = "group".to_string();
        assert!(config.validate().is_err());

        config.bot_number = "+491234".to_string();
        assert!(config.validate().is_ok());
    }
}
