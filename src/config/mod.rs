pub mod merge;
pub mod settings;

pub use merge::deep_merge;
pub use settings::{
    expand_path, merge_over_defaults, parse_settings, validate_settings, versioned_path,
    ApiConfig, DependencyConfig, EngineConfig, LogConfig, LogLevel, PipelineConfig, PoolSettings,
    ServerConfig, SettingsError, SslConfig,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    SettingsError(#[from] SettingsError),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a server configuration file from disk.
/// This is the I/O boundary - it reads the file and delegates to pure parsing functions.
pub fn load_config_file(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = ServerConfig::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config_file() {
        let content = r#"
port: 9000
api:
  - version: "1"
    route: /echo
    pipeline:
      node:
        - {name: out, type: response}
"#;

        let file = create_temp_file(content);
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.api.len(), 1);
    }

    #[test]
    fn test_load_json_config_file() {
        let file = create_temp_file(r#"{"port": 1234, "log": {"level": "trace"}}"#);
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.port, 1234);
        assert_eq!(config.log.level, LogLevel::Trace);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config_file(Path::new("/nonexistent/flowapi-server.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_load_invalid_file() {
        let file = create_temp_file("port: [not, a, port");
        let result = load_config_file(file.path());
        assert!(matches!(result, Err(ConfigError::SettingsError(_))));
    }
}
