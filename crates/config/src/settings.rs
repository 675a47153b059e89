// Engine settings
// Loaded from ~/.config/formcalc/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    // Resolver
    #[serde(rename = "resolver.batchSize")]
    pub batch_size: usize,

    #[serde(rename = "resolver.maxDepth")]
    pub max_depth: usize,

    #[serde(rename = "resolver.strictMode")]
    pub strict_mode: bool,

    // Field-dependency closure
    #[serde(rename = "dependencies.closureDepth")]
    pub closure_depth: usize,

    // Evaluator
    #[serde(rename = "evaluator.timeoutMs")]
    pub timeout_ms: u64,

    #[serde(rename = "evaluator.maxMagnitude")]
    pub max_magnitude: f64,

    #[serde(rename = "evaluator.maxLength")]
    pub max_length: usize,

    #[serde(rename = "evaluator.maxNesting")]
    pub max_nesting: usize,

    // Definition cache
    #[serde(rename = "cache.definitionTtlSecs")]
    pub definition_ttl_secs: u64,

    // Output
    #[serde(rename = "format.locale")]
    pub locale: String,

    // Execution log
    #[serde(rename = "executionLog.enabled")]
    pub execution_log_enabled: bool,

    #[serde(rename = "executionLog.queueCapacity")]
    pub execution_log_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_depth: 10,
            strict_mode: false,
            closure_depth: 5,
            timeout_ms: 500,
            max_magnitude: 1e15,
            max_length: 4096,
            max_nesting: 64,
            definition_ttl_secs: 300,
            locale: "fi".to_string(),
            execution_log_enabled: true,
            execution_log_capacity: 256,
        }
    }
}

#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "cannot read settings: {}", e),
            SettingsError::Parse(e) => write!(f, "invalid settings: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {}

impl EngineSettings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("formcalc");
        config_dir.join("settings.json")
    }

    /// Load settings from the default path, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "using default settings");
                Self::default()
            }
        }
    }

    /// Strict load: missing or malformed files are errors.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(SettingsError::Io)?;
        Self::parse(&contents)
    }

    /// Parse settings JSON. Lines starting with `//` are comments.
    pub fn parse(contents: &str) -> Result<Self, SettingsError> {
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        serde_json::from_str(&cleaned).map_err(SettingsError::Parse)
    }

    /// Save to the default path
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path, json).map_err(|e| e.to_string())
    }

    /// Get the config file path for display
    pub fn config_path_display() -> String {
        Self::config_path().to_string_lossy().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = EngineSettings::default();
        assert_eq!(s.batch_size, 10);
        assert_eq!(s.max_depth, 10);
        assert_eq!(s.closure_depth, 5);
        assert_eq!(s.locale, "fi");
        assert!(s.execution_log_enabled);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let s = EngineSettings::parse(
            r#"{
    // tighter budget for tests
    "resolver.maxDepth": 4,
    "format.locale": "en"
}"#,
        )
        .unwrap();
        assert_eq!(s.max_depth, 4);
        assert_eq!(s.locale, "en");
        assert_eq!(s.batch_size, 10);
        assert_eq!(s.timeout_ms, 500);
    }

    #[test]
    fn test_malformed_is_error() {
        assert!(matches!(
            EngineSettings::parse("{ \"resolver.maxDepth\": \"deep\" }"),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = EngineSettings {
            strict_mode: true,
            definition_ttl_secs: 60,
            ..EngineSettings::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = EngineSettings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = EngineSettings::load_from(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(SettingsError::Io(_))));
    }
}
