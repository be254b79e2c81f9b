use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file read when `--config` is not given. Absent is fine.
pub const DEFAULT_CONFIG_FILE: &str = "childfeed.toml";

/// Top-level configuration loaded from childfeed.toml.
///
/// Only the child command is configurable; the frame interval and payload
/// are fixed by the wire protocol.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FeedConfig {
    pub child: ChildConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ChildConfig {
    /// Path of the executable to supervise. Spawned without arguments.
    pub command: Option<String>,
}

/// Errors that can occur while resolving configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this layout.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Neither the command line nor the config file names a child command.
    MissingCommand,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::MissingCommand => {
                write!(f, "missing arguments: process (pass --process or set [child].command)")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::MissingCommand => None,
        }
    }
}

impl FeedConfig {
    /// Load config from `path`.
    ///
    /// A missing file yields the defaults unless `required` is set.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Command-line value wins over the file.
    pub fn with_command_override(mut self, command: Option<String>) -> Self {
        if command.is_some() {
            self.child.command = command;
        }
        self
    }

    /// The resolved child command. Blank counts as missing.
    pub fn command(&self) -> Result<&str, ConfigError> {
        match self.child.command.as_deref().map(str::trim) {
            Some(command) if !command.is_empty() => Ok(command),
            _ => Err(ConfigError::MissingCommand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_has_no_command() {
        let config = FeedConfig::default();
        assert!(matches!(config.command(), Err(ConfigError::MissingCommand)));
    }

    #[test]
    fn test_parse_child_command() {
        let config: FeedConfig = toml::from_str("[child]\ncommand = \"/usr/bin/cat\"\n").unwrap();
        assert_eq!(config.command().unwrap(), "/usr/bin/cat");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: FeedConfig = toml::from_str("").unwrap();
        assert!(config.child.command.is_none());
    }

    #[test]
    fn test_override_wins_over_file() {
        let config: FeedConfig = toml::from_str("[child]\ncommand = \"from-file\"\n").unwrap();
        let config = config.with_command_override(Some("from-cli".to_string()));
        assert_eq!(config.command().unwrap(), "from-cli");
    }

    #[test]
    fn test_no_override_keeps_file_value() {
        let config: FeedConfig = toml::from_str("[child]\ncommand = \"from-file\"\n").unwrap();
        let config = config.with_command_override(None);
        assert_eq!(config.command().unwrap(), "from-file");
    }

    #[test]
    fn test_blank_command_is_missing() {
        let config = FeedConfig::default().with_command_override(Some("   ".to_string()));
        let err = config.command().unwrap_err();
        assert!(err.to_string().contains("missing arguments: process"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("childfeed.toml");
        std::fs::write(&path, "[child]\ncommand = \"./child\"\n").unwrap();

        let config = FeedConfig::load(&path, true).unwrap();
        assert_eq!(config.command().unwrap(), "./child");
    }

    #[test]
    fn test_load_missing_optional_file() {
        let dir = tempdir().unwrap();
        let config = FeedConfig::load(&dir.path().join("absent.toml"), false).unwrap();
        assert!(config.child.command.is_none());
    }

    #[test]
    fn test_load_missing_required_file() {
        let dir = tempdir().unwrap();
        let err = FeedConfig::load(&dir.path().join("absent.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[child\ncommand = ").unwrap();

        let err = FeedConfig::load(&path, true).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }
}
