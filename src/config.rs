// Configuration module
// Loads and validates configuration from CLI args, environment variables,
// an optional configs/config.json file, and defaults

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Kiro Relay - pooled gateway for the Kiro API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Path to the config file (default: configs/config.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Shape of configs/config.json. All fields optional; env vars win over it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    host: Option<String>,
    server_port: Option<u16>,
    required_api_key: Option<String>,
    provider_pools_file_path: Option<String>,
    max_error_count: Option<u32>,
    request_max_retries: Option<u32>,
    request_base_delay: Option<u64>,
    cron_refresh_token: Option<bool>,
    cron_near_minutes: Option<i64>,
    system_prompt_file_path: Option<String>,
    system_prompt_mode: Option<String>,
    prompt_log_mode: Option<String>,
    prompt_log_base_name: Option<String>,
}

/// How a file-backed system prompt combines with the request's own.
#[derive(Clone, Debug, PartialEq)]
pub enum SystemPromptMode {
    Overwrite,
    Append,
}

/// Where outbound prompts are logged.
#[derive(Clone, Debug, PartialEq)]
pub enum PromptLogMode {
    None,
    Console,
    File,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub host: String,
    pub server_port: u16,

    // Gateway caller authentication
    pub required_api_key: String,

    // Pool
    pub provider_pools_file_path: PathBuf,
    pub max_error_count: u32,

    // Upstream retry policy
    pub request_max_retries: u32,
    pub request_base_delay_ms: u64,

    // Token refresh heartbeat
    pub cron_refresh_token: bool,
    pub cron_near_minutes: i64,

    // System prompt overlay
    pub system_prompt_file_path: Option<PathBuf>,
    pub system_prompt_mode: SystemPromptMode,

    // Prompt logging
    pub prompt_log_mode: PromptLogMode,
    pub prompt_log_base_name: String,

    // Diagnostics
    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > config.json > defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let args = CliArgs::parse();
        Self::load_with_args(args)
    }

    pub fn load_with_args(args: CliArgs) -> Result<Self> {
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("configs/config.json"));
        let file = load_file_config(&config_path)?;

        let config = Config {
            host: args
                .host
                .or_else(|| std::env::var("HOST").ok())
                .or(file.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),

            server_port: args
                .port
                .or_else(|| std::env::var("SERVER_PORT").ok().and_then(|s| s.parse().ok()))
                .or(file.server_port)
                .unwrap_or(3000),

            required_api_key: std::env::var("REQUIRED_API_KEY")
                .ok()
                .or(file.required_api_key)
                .context("REQUIRED_API_KEY must be set (env or configs/config.json)")?,

            provider_pools_file_path: std::env::var("PROVIDER_POOLS_FILE_PATH")
                .ok()
                .or(file.provider_pools_file_path)
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(|| PathBuf::from("configs/provider_pools.json")),

            max_error_count: std::env::var("MAX_ERROR_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(file.max_error_count)
                .unwrap_or(3),

            request_max_retries: std::env::var("REQUEST_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(file.request_max_retries)
                .unwrap_or(3),

            request_base_delay_ms: std::env::var("REQUEST_BASE_DELAY")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(file.request_base_delay)
                .unwrap_or(1000),

            cron_refresh_token: std::env::var("CRON_REFRESH_TOKEN")
                .ok()
                .map(|s| parse_bool(&s))
                .or(file.cron_refresh_token)
                .unwrap_or(true),

            cron_near_minutes: std::env::var("CRON_NEAR_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(file.cron_near_minutes)
                .unwrap_or(15),

            system_prompt_file_path: std::env::var("SYSTEM_PROMPT_FILE_PATH")
                .ok()
                .or(file.system_prompt_file_path)
                .filter(|s| !s.is_empty())
                .map(|s| expand_tilde(&s)),

            system_prompt_mode: parse_system_prompt_mode(
                &std::env::var("SYSTEM_PROMPT_MODE")
                    .ok()
                    .or(file.system_prompt_mode)
                    .unwrap_or_default(),
            ),

            prompt_log_mode: parse_prompt_log_mode(
                &std::env::var("PROMPT_LOG_MODE")
                    .ok()
                    .or(file.prompt_log_mode)
                    .unwrap_or_default(),
            ),

            prompt_log_base_name: std::env::var("PROMPT_LOG_BASE_NAME")
                .ok()
                .or(file.prompt_log_base_name)
                .unwrap_or_else(|| "prompt_log".to_string()),

            log_level: args
                .log_level
                .or_else(|| std::env::var("LOG_LEVEL").ok())
                .unwrap_or_else(|| "info".to_string()),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.required_api_key.trim().is_empty() {
            anyhow::bail!("REQUIRED_API_KEY must not be empty");
        }
        if let Some(parent) = self.provider_pools_file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create pool directory: {}", parent.display())
                })?;
            }
        }
        Ok(())
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn parse_bool(s: &str) -> bool {
    !matches!(
        s.to_lowercase().as_str(),
        "false" | "0" | "no" | "disabled" | "off"
    )
}

fn parse_system_prompt_mode(s: &str) -> SystemPromptMode {
    match s.to_lowercase().as_str() {
        "overwrite" => SystemPromptMode::Overwrite,
        _ => SystemPromptMode::Append,
    }
}

fn parse_prompt_log_mode(s: &str) -> PromptLogMode {
    match s.to_lowercase().as_str() {
        "console" => PromptLogMode::Console,
        "file" => PromptLogMode::File,
        _ => PromptLogMode::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with('~'));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));

        let path = expand_tilde("relative/path");
        assert_eq!(path, PathBuf::from("relative/path"));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(parse_bool(""));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("OFF"));
    }

    #[test]
    fn test_parse_system_prompt_mode() {
        assert_eq!(
            parse_system_prompt_mode("overwrite"),
            SystemPromptMode::Overwrite
        );
        assert_eq!(
            parse_system_prompt_mode("OVERWRITE"),
            SystemPromptMode::Overwrite
        );
        assert_eq!(parse_system_prompt_mode("append"), SystemPromptMode::Append);
        assert_eq!(parse_system_prompt_mode(""), SystemPromptMode::Append);
    }

    #[test]
    fn test_parse_prompt_log_mode() {
        assert_eq!(parse_prompt_log_mode("console"), PromptLogMode::Console);
        assert_eq!(parse_prompt_log_mode("FILE"), PromptLogMode::File);
        assert_eq!(parse_prompt_log_mode("none"), PromptLogMode::None);
        assert_eq!(parse_prompt_log_mode(""), PromptLogMode::None);
        assert_eq!(parse_prompt_log_mode("invalid"), PromptLogMode::None);
    }

    #[test]
    fn test_file_config_parses_partial_json() {
        let json = r#"{"serverPort": 8080, "maxErrorCount": 5}"#;
        let file: FileConfig = serde_json::from_str(json).unwrap();
        assert_eq!(file.server_port, Some(8080));
        assert_eq!(file.max_error_count, Some(5));
        assert!(file.required_api_key.is_none());
    }

    #[test]
    fn test_missing_config_file_is_defaults() {
        let file = load_file_config(Path::new("/nonexistent/config.json")).unwrap();
        assert!(file.server_port.is_none());
    }
}
