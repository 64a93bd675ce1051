//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "EASY_TRANSCODER_";

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is syntactically fine but not acceptable
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// A named set of encoder parameters.
///
/// Each entry of `params` becomes `-<key> <value>` on the encoder command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Codec names that exclude a file from directory (batch) submission.
    #[serde(default)]
    pub batch_exclude_codecs: Vec<String>,
}

impl Profile {
    pub fn new<I, K, V>(name: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.to_string(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            batch_exclude_codecs: Vec::new(),
        }
    }
}

fn default_profiles() -> Vec<Profile> {
    vec![
        Profile::new(
            "H264 Ultra Fast",
            [("c:v", "libx264"), ("preset", "ultrafast"), ("c:a", "copy")],
        ),
        Profile::new(
            "H264 Slow",
            [("c:v", "libx264"), ("preset", "slow"), ("c:a", "copy")],
        ),
    ]
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Minimum level or a full tracing filter directive (default "info")
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// External encoder tooling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Program plus leading arguments used to run ffmpeg
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: Vec<String>,
    /// Program plus leading arguments used to run ffprobe
    #[serde(default = "default_ffprobe_command")]
    pub ffprobe_command: Vec<String>,
    /// Scheduling priority for encoder processes (-20..=19, 0 = unchanged)
    #[serde(default)]
    pub niceness: i32,
}

fn default_ffmpeg_command() -> Vec<String> {
    vec!["ffmpeg".to_string()]
}

fn default_ffprobe_command() -> Vec<String> {
    vec!["ffprobe".to_string()]
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: default_ffmpeg_command(),
            ffprobe_command: default_ffprobe_command(),
            niceness: 0,
        }
    }
}

/// Task queue sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of queued tasks; further submissions are rejected
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Tasks processed at the same time (1 = strictly serialized)
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

fn default_queue_capacity() -> usize {
    100
}

fn default_max_concurrent_tasks() -> usize {
    1
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

/// Automatic "keep original" policy for results larger than their input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoRejectConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Reject when output > original * ratio
    #[serde(default = "default_max_size_ratio")]
    pub max_size_ratio: f64,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

fn default_max_size_ratio() -> f64 {
    1.0
}

fn default_scan_interval_secs() -> u64 {
    30
}

impl Default for AutoRejectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size_ratio: default_max_size_ratio(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

/// HTTP query surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Base directory for per-task temp directories ($TMPDIR/easy-transcoder if unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub auto_reject: AutoRejectConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_dir: None,
            profiles: default_profiles(),
            logging: LoggingConfig::default(),
            encoder: EncoderConfig::default(),
            queue: QueueConfig::default(),
            auto_reject: AutoRejectConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - EASY_TRANSCODER_TEMPDIR -> temp_dir
    /// - EASY_TRANSCODER_LOGGING_LEVEL -> logging.level
    /// - EASY_TRANSCODER_LOGGING_FORMAT -> logging.format
    /// - EASY_TRANSCODER_TRANSCODING_NICENESS -> encoder.niceness
    /// - EASY_TRANSCODER_QUEUE_CAPACITY -> queue.capacity
    /// - EASY_TRANSCODER_AUTO_REJECT -> auto_reject.enabled
    /// - EASY_TRANSCODER_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("TEMPDIR") {
            if !val.is_empty() {
                self.temp_dir = Some(PathBuf::from(val));
            }
        }

        if let Some(val) = env_var("LOGGING_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val;
            }
        }

        if let Some(format) = env_var("LOGGING_FORMAT").and_then(|v| LogFormat::parse(&v)) {
            self.logging.format = format;
        }

        if let Some(niceness) = env_var("TRANSCODING_NICENESS").and_then(|v| v.parse().ok()) {
            self.encoder.niceness = niceness;
        }

        if let Some(capacity) = env_var("QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.queue.capacity = capacity;
        }

        if let Some(val) = env_var("AUTO_REJECT") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.auto_reject.enabled = true,
                "false" | "0" | "no" => self.auto_reject.enabled = false,
                _ => {}
            }
        }

        if let Some(val) = env_var("BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }
    }

    /// Check values that TOML typing alone cannot enforce
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-20..=19).contains(&self.encoder.niceness) {
            return Err(ConfigError::Invalid(
                "encoder.niceness must be between -20 and 19".to_string(),
            ));
        }

        if let Some(dir) = &self.temp_dir {
            match fs::metadata(dir) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "temp_dir {} is not a directory",
                        dir.display()
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ConfigError::Invalid(format!(
                        "temp_dir {} does not exist",
                        dir.display()
                    )))
                }
                Err(e) => {
                    return Err(ConfigError::Invalid(format!(
                        "failed to access temp_dir {}: {}",
                        dir.display(),
                        e
                    )))
                }
            }
        }

        if self.encoder.ffmpeg_command.is_empty() || self.encoder.ffprobe_command.is_empty() {
            return Err(ConfigError::Invalid(
                "encoder commands must name a program".to_string(),
            ));
        }

        if self.queue.capacity == 0 || self.queue.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "queue.capacity and queue.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }

        if self.auto_reject.max_size_ratio <= 0.0 || !self.auto_reject.max_size_ratio.is_finite() {
            return Err(ConfigError::Invalid(
                "auto_reject.max_size_ratio must be a positive number".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                return Err(ConfigError::Invalid("profile names must not be empty".to_string()));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate profile name '{}'",
                    profile.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a profile by name
    pub fn get_profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.finish()
    }

    /// Like [`Config::load`], but a missing file means "all defaults"
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };
        config.finish()
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        self.apply_env_overrides();
        self.validate()?;
        Ok(self)
    }
}

fn env_var(suffix: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, suffix)).ok()
}
