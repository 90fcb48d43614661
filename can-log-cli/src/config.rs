//! Configuration loading and parsing

use anyhow::{Context, Result};
use can_log_analyzer::{AnalysisConfig, AnalysisKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Thresholds and limits passed straight to the analyzer
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub dbc: Option<PathBuf>,
    /// Analyses to run; empty means all
    #[serde(default)]
    pub analyses: Vec<AnalysisKind>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    /// Write the report here instead of stdout
    pub path: Option<PathBuf>,
    /// Error events listed in the text report
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            path: None,
            max_errors: default_max_errors(),
        }
    }
}

fn default_max_errors() -> usize {
    50
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig =
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .analysis
        .validate()
        .with_context(|| format!("Invalid [analysis] settings in {:?}", path))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [analysis.parser]
            chunk_size = 500

            [analysis.errors]
            timeout_factor = 4.0

            [analysis.correlation]
            window_ms = 250.0

            [input]
            files = ["trace.blf", "console.log"]
            dbc = "powertrain.dbc"
            analyses = ["errors", "correlation"]

            [output]
            format = "json"
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.input.files.len(), 2);
        assert_eq!(config.input.dbc, Some(PathBuf::from("powertrain.dbc")));
        assert_eq!(config.input.analyses, vec![AnalysisKind::Errors, AnalysisKind::Correlation]);
        assert_eq!(config.analysis.parser.chunk_size, 500);
        assert_eq!(config.analysis.errors.timeout_factor, 4.0);
        assert_eq!(config.analysis.correlation.window_ms, 250.0);
        // untouched sections keep their defaults
        assert_eq!(config.analysis.patterns.bitrate, 500_000);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.output.max_errors, 50);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.input.files.is_empty());
        assert_eq!(config.output.format, OutputFormat::Text);
        assert_eq!(config.analysis.parser.chunk_size, 10_000);
    }

    #[test]
    fn test_load_config_rejects_invalid_analysis() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[analysis.parser]\nchunk_size = 0").unwrap();
        assert!(load_config(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[input]\nfiles = [\"a.asc\"]").unwrap();
        assert_eq!(load_config(file.path()).unwrap().input.files.len(), 1);
    }
}
