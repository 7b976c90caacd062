//! Analysis Configuration
//!
//! Tunables shared by the disassembler, decompiler and string scanner. Loaded
//! from JSON by the CLI's `--config` option; every field is optional in the file.

use crate::error::{BaretkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Analysis tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Upper bound on decoded instructions across the whole program
    pub max_instructions: usize,
    /// Structure functions on the rayon thread pool
    pub parallel: bool,
    /// Seed the sweep with function symbols and use them for function names
    pub use_symbols: bool,
    /// Run the expression folding passes after lifting
    pub fold_expressions: bool,
    /// Minimum run length reported by the string scanner
    pub min_string_length: usize,
    /// Reject `\n` and `\r` inside string runs
    pub printable_only: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            parallel: true,
            use_symbols: true,
            fold_expressions: true,
            min_string_length: 4,
            printable_only: false,
        }
    }
}

impl AnalysisConfig {
    /// Parse a JSON document. Missing fields take their default value.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: AnalysisConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path: &Path = path.as_ref();
        let text: String = std::fs::read_to_string(path)
            .map_err(|e| BaretkError::io(path.display().to_string(), e))?;
        log::debug!("loading analysis config from {}", path.display());
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.max_instructions == 0 {
            return Err(BaretkError::Config {
                message: "max_instructions must be at least 1".to_string(),
            });
        }
        if self.min_string_length == 0 {
            return Err(BaretkError::Config {
                message: "min_string_length must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = AnalysisConfig::from_json(r#"{ "parallel": false }"#).unwrap();
        assert!(!config.parallel);
        assert_eq!(config.max_instructions, 1_000_000);
        assert_eq!(config.min_string_length, 4);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = AnalysisConfig::from_json(r#"{ "max_instructions": 0 }"#).unwrap_err();
        assert!(matches!(err, BaretkError::Config { .. }));
    }

    #[test]
    fn bad_json_is_config_error() {
        let err = AnalysisConfig::from_json("{ parallel: yes").unwrap_err();
        assert!(matches!(err, BaretkError::Config { .. }));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "min_string_length": 8, "printable_only": true }}"#).unwrap();
        let config = AnalysisConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.min_string_length, 8);
        assert!(config.printable_only);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = AnalysisConfig::from_json_file("/nonexistent/baretk.json").unwrap_err();
        assert!(matches!(err, BaretkError::Io { .. }));
    }
}
