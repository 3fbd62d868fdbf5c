//! Configuration for phasegate.
//!
//! Settings are read from `<project>/.phasegate/phasegate.toml`, every field
//! optional:
//!
//! ```toml
//! [state]
//! dir = "/custom/state/dir"
//!
//! [breaker]
//! max_retries = 5
//! max_retries_per_state = 3
//! circuit_reset_timeout_ms = 30000
//! max_backoff_ms = 300000
//!
//! [gate]
//! min_architecture_score = 7
//! security_command = "scripts/scan.sh"
//! security_timeout_secs = 60
//!
//! [logging]
//! level = "info"
//! json = false
//! ```
//!
//! Layering is file → environment (`PHASEGATE_STATE_DIR`,
//! `PHASEGATE_SECURITY_CMD`) → CLI (`--state-dir`, `--verbose`).

use crate::drift::BreakerConfig;
use crate::gates::architecture::MAX_SCORE;
use crate::orchestrator::state::{StatePaths, default_state_dir};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = ".phasegate";
pub const CONFIG_FILE: &str = "phasegate.toml";
pub const ENV_STATE_DIR: &str = "PHASEGATE_STATE_DIR";
pub const ENV_SECURITY_CMD: &str = "PHASEGATE_SECURITY_CMD";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSection {
    /// Overrides the per-user default state directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSection {
    #[serde(default = "default_min_architecture_score")]
    pub min_architecture_score: u32,
    /// Shell command run as the security guard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_command: Option<String>,
    #[serde(default = "default_security_timeout_secs")]
    pub security_timeout_secs: u64,
}

fn default_min_architecture_score() -> u32 {
    7
}

fn default_security_timeout_secs() -> u64 {
    60
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            min_architecture_score: default_min_architecture_score(),
            security_command: None,
            security_timeout_secs: default_security_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON on stderr instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Parsed `phasegate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasegateToml {
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PhasegateToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phasegate.toml")
    }

    /// Load `.phasegate/phasegate.toml`, or defaults when it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(self).context("Failed to serialize phasegate.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Human-readable warnings about questionable settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.breaker.max_retries == 0 {
            warnings.push("breaker.max_retries is 0: every failure opens the circuit".to_string());
        }
        if self.breaker.max_retries_per_state == 0 {
            warnings.push(
                "breaker.max_retries_per_state is 0: every repeated failure opens the circuit"
                    .to_string(),
            );
        }
        if self.breaker.max_backoff_ms < self.breaker.circuit_reset_timeout_ms {
            warnings.push(format!(
                "breaker.max_backoff_ms ({}) is below circuit_reset_timeout_ms ({})",
                self.breaker.max_backoff_ms, self.breaker.circuit_reset_timeout_ms
            ));
        }
        if self.gate.min_architecture_score > MAX_SCORE {
            warnings.push(format!(
                "gate.min_architecture_score {} is outside 0-{}: the gate can never pass",
                self.gate.min_architecture_score, MAX_SCORE
            ));
        }
        if self.gate.security_timeout_secs == 0 {
            warnings.push(
                "gate.security_timeout_secs is 0: the security command always times out"
                    .to_string(),
            );
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            warnings.push(format!(
                "Unknown logging.level '{}'. Valid values: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        warnings
    }
}

/// Fully layered configuration for one project.
#[derive(Debug, Clone)]
pub struct PhasegateConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: PhasegateToml,
    /// CLI override for the state directory.
    pub cli_state_dir: Option<PathBuf>,
    /// CLI override: debug logging.
    pub verbose: bool,
}

impl PhasegateConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = PhasegateToml::load_or_default(&config_dir)?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            cli_state_dir: None,
            verbose: false,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        state_dir: Option<PathBuf>,
        verbose: bool,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_state_dir = state_dir;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// State directory (CLI → env → file → per-user default).
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cli_state_dir {
            return Ok(dir.clone());
        }
        if let Ok(dir) = std::env::var(ENV_STATE_DIR)
            && !dir.trim().is_empty()
        {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.toml.state.dir {
            return Ok(if dir.is_absolute() {
                dir.clone()
            } else {
                self.project_dir.join(dir)
            });
        }
        default_state_dir(&self.project_dir)
    }

    pub fn state_paths(&self) -> Result<StatePaths> {
        Ok(StatePaths::new(&self.state_dir()?))
    }

    /// Security command (env → file). Empty means none.
    pub fn security_command(&self) -> Option<String> {
        std::env::var(ENV_SECURITY_CMD)
            .ok()
            .or_else(|| self.toml.gate.security_command.clone())
            .filter(|cmd| !cmd.trim().is_empty())
    }

    pub fn security_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.gate.security_timeout_secs)
    }

    pub fn breaker(&self) -> BreakerConfig {
        self.toml.breaker
    }

    /// Log filter used when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.toml.logging.level
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = PhasegateToml::parse("").unwrap();
        assert_eq!(config, PhasegateToml::default());
        assert_eq!(config.breaker.max_retries, 5);
        assert_eq!(config.breaker.max_backoff_ms, 300_000);
        assert_eq!(config.gate.min_architecture_score, 7);
        assert_eq!(config.gate.security_timeout_secs, 60);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = PhasegateToml::parse(
            r#"
[breaker]
max_retries = 2

[gate]
security_command = "scripts/scan.sh"
"#,
        )
        .unwrap();
        assert_eq!(config.breaker.max_retries, 2);
        assert_eq!(config.breaker.max_retries_per_state, 3);
        assert_eq!(config.gate.security_command.as_deref(), Some("scripts/scan.sh"));
        assert_eq!(config.gate.min_architecture_score, 7);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let err = PhasegateToml::parse("[breaker\nmax_retries = ").unwrap_err();
        assert!(err.to_string().contains("phasegate.toml"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = PhasegateToml::default();
        config.breaker.max_retries = 0;
        config.breaker.max_backoff_ms = 10;
        config.gate.min_architecture_score = 11;
        config.logging.level = "loud".to_string();

        let warnings = config.validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| w.contains("max_retries is 0")));
        assert!(warnings.iter().any(|w| w.contains("loud")));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = PhasegateToml::default();
        config.gate.security_command = Some("scan".to_string());
        config.save(&path).unwrap();

        assert_eq!(PhasegateToml::load(&path).unwrap(), config);
        assert_eq!(
            PhasegateToml::load_or_default(&dir.path().join(CONFIG_DIR)).unwrap(),
            config
        );
    }

    #[test]
    fn test_state_dir_layering() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join(CONFIG_FILE), "[state]\ndir = \"local-state\"\n").unwrap();

        unsafe { std::env::remove_var(ENV_STATE_DIR) };
        let config = PhasegateConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(
            config.state_dir().unwrap(),
            config.project_dir.join("local-state")
        );

        unsafe { std::env::set_var(ENV_STATE_DIR, "/tmp/env-state") };
        assert_eq!(config.state_dir().unwrap(), PathBuf::from("/tmp/env-state"));

        let config = PhasegateConfig::with_cli_args(
            dir.path().to_path_buf(),
            Some(PathBuf::from("/tmp/cli-state")),
            true,
        )
        .unwrap();
        assert_eq!(config.state_dir().unwrap(), PathBuf::from("/tmp/cli-state"));
        assert_eq!(config.log_level(), "debug");

        unsafe { std::env::remove_var(ENV_STATE_DIR) };
    }

    #[test]
    fn test_security_command_env_overrides_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = tempdir().unwrap();
        let mut config = PhasegateConfig::new(dir.path().to_path_buf()).unwrap();
        config.toml.gate.security_command = Some("file-scan".to_string());

        unsafe { std::env::remove_var(ENV_SECURITY_CMD) };
        assert_eq!(config.security_command().as_deref(), Some("file-scan"));

        unsafe { std::env::set_var(ENV_SECURITY_CMD, "env-scan") };
        assert_eq!(config.security_command().as_deref(), Some("env-scan"));

        unsafe { std::env::set_var(ENV_SECURITY_CMD, "  ") };
        assert_eq!(config.security_command(), None);

        unsafe { std::env::remove_var(ENV_SECURITY_CMD) };
    }
}
