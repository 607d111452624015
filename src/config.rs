//! Pipeline configuration.
//!
//! Loaded from a TOML file with every field optional and unknown
//! fields rejected, then overridden by CLI flags. Pass names use the
//! kebab-case spelling that `PassKind` displays with.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::passes::PassKind;

/// Knobs for one pipeline run.
///
/// `enabled_passes` selects which passes run; application order is
/// always the fixed pass order, not the order of this list.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Iterations the driver attempts before giving up on a fixed
    /// point.
    pub max_iterations: u32,
    pub enabled_passes: Vec<PassKind>,
    /// Loops with more iterations than this are grouped rather than
    /// fully expanded.
    pub unroll_factor: usize,
    /// Largest callee body node count inlining will copy.
    pub inline_size_budget: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_iterations: 10,
            enabled_passes: PassKind::ORDERED.to_vec(),
            unroll_factor: 4,
            inline_size_budget: 24,
        }
    }
}

impl Config {
    /// Parse and validate TOML content.
    pub fn from_toml(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Config::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max-iterations must be at least 1".to_string(),
            ));
        }
        if self.unroll_factor == 0 {
            return Err(ConfigError::Invalid(
                "unroll-factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pass_enabled(&self, pass: PassKind) -> bool {
        self.enabled_passes.contains(&pass)
    }

    pub fn disable_pass(&mut self, pass: PassKind) {
        self.enabled_passes.retain(|p| *p != pass);
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String, std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, err) => write!(f, "cannot read {}: {}", path, err),
            ConfigError::Parse(err) => write!(f, "invalid config: {}", err),
            ConfigError::Invalid(what) => write!(f, "invalid config: {}", what),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.unroll_factor, 4);
        assert_eq!(config.inline_size_budget, 24);
        assert_eq!(config.enabled_passes, PassKind::ORDERED.to_vec());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = Config::from_toml("max-iterations = 3\n").unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.unroll_factor, 4);
        assert!(config.pass_enabled(PassKind::ConstantFolding));
    }

    #[test]
    fn test_parse_pass_names() {
        let config = Config::from_toml(
            "enabled-passes = [\"constant-folding\", \"dead-code-elimination\"]\n",
        )
        .unwrap();
        assert_eq!(config.enabled_passes.len(), 2);
        assert!(config.pass_enabled(PassKind::ConstantFolding));
        assert!(!config.pass_enabled(PassKind::Inlining));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(
            Config::from_toml("max-iteration = 3\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_pass_name_rejected() {
        assert!(Config::from_toml("enabled-passes = [\"peephole\"]\n").is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(matches!(
            Config::from_toml("max-iterations = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_unroll_factor_rejected() {
        assert!(Config::from_toml("unroll-factor = 0\n").is_err());
    }

    #[test]
    fn test_disable_pass() {
        let mut config = Config::default();
        config.disable_pass(PassKind::LoopUnrolling);
        assert!(!config.pass_enabled(PassKind::LoopUnrolling));
        assert_eq!(config.enabled_passes.len(), 5);
    }
}
