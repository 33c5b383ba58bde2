//! Configuration management for Parley
//!
//! Configuration is loaded from `~/.parley/config.json` (or an explicit path)
//! with `PARLEY_*` environment variable overrides applied on top.

mod types;
pub mod validate;

pub use types::*;

use crate::error::{ParleyError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;

impl Config {
    /// Returns the Parley configuration directory path (~/.parley)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".parley")
    }

    /// Returns the path to the config file (~/.parley/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Directory holding recovery snapshots.
    pub fn recovery_dir(&self) -> PathBuf {
        match &self.recovery.dir {
            Some(dir) => PathBuf::from(dir),
            None => Self::dir().join("recovery"),
        }
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Returns every range error as a single `ParleyError::Config`.
    pub fn validate(&self) -> Result<()> {
        let errors: Vec<String> = validate::validate_values(self)
            .into_iter()
            .filter(|d| d.level == validate::DiagnosticLevel::Error)
            .map(|d| d.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ParleyError::Config(errors.join("; ")))
        }
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: PARLEY_SECTION_KEY
    fn apply_env_overrides(&mut self) {
        // Session
        override_parsed("PARLEY_SESSION_MAX_DURATION_SECS", &mut self.session.max_duration_secs);
        override_parsed("PARLEY_SESSION_WARNING_BEFORE_SECS", &mut self.session.warning_before_secs);
        override_parsed("PARLEY_SESSION_IDLE_TIMEOUT_SECS", &mut self.session.idle_timeout_secs);
        override_parsed(
            "PARLEY_SESSION_CHECKPOINT_INTERVAL_SECS",
            &mut self.session.checkpoint_interval_secs,
        );
        if let Ok(val) = std::env::var("PARLEY_SESSION_INSTRUCTIONS") {
            self.session.instructions = val;
        }
        if let Ok(val) = std::env::var("PARLEY_SESSION_VOICE") {
            self.session.voice = val;
        }

        // Tools
        override_parsed("PARLEY_TOOLS_MAX_CONCURRENT", &mut self.tools.max_concurrent);
        override_parsed("PARLEY_TOOLS_DIRECT_TIMEOUT_MS", &mut self.tools.direct_timeout_ms);
        override_parsed("PARLEY_TOOLS_DELEGATED_TIMEOUT_MS", &mut self.tools.delegated_timeout_ms);
        override_parsed("PARLEY_TOOLS_MAX_OUTPUT_CHARS", &mut self.tools.max_output_chars);
        if let Ok(val) = std::env::var("PARLEY_TOOLS_APPROVAL") {
            match val.as_str() {
                "auto_approve" => self.tools.approval = ApprovalPolicy::AutoApprove,
                "safe_only" => self.tools.approval = ApprovalPolicy::SafeOnly,
                other => tracing::warn!(value = other, "Ignoring unknown PARLEY_TOOLS_APPROVAL"),
            }
        }

        // Context
        override_parsed("PARLEY_CONTEXT_CEILING_TOKENS", &mut self.context.ceiling_tokens);
        override_parsed("PARLEY_CONTEXT_KEEP_RECENT", &mut self.context.keep_recent);

        // Recovery
        override_parsed("PARLEY_RECOVERY_ENABLED", &mut self.recovery.enabled);
        if let Ok(val) = std::env::var("PARLEY_RECOVERY_DIR") {
            self.recovery.dir = Some(val);
        }

        // Reconnect
        override_parsed("PARLEY_RECONNECT_MAX_ATTEMPTS", &mut self.reconnect.max_attempts);

        // Logging
        if let Ok(val) = std::env::var("PARLEY_LOGGING_LEVEL") {
            self.logging.level = val;
        }
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        match val.parse() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, value = %val, "Ignoring unparseable config override"),
        }
    }
}
