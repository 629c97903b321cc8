//! Configuration loading

use anyhow::{Context, Result};
use daisy_discovery::SourceConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Capture file to replay when none is given on the command line
    #[serde(default)]
    pub capture: Option<PathBuf>,
    /// Print topology snapshots as JSON lines
    #[serde(default)]
    pub json: bool,
    /// How long `--once` waits for a topology before giving up
    #[serde(default = "default_once_timeout")]
    pub once_timeout_secs: u64,
    /// Also print touch, button and program events
    #[serde(default = "default_true")]
    pub show_input: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            capture: None,
            json: false,
            once_timeout_secs: default_once_timeout(),
            show_input: true,
        }
    }
}

fn default_once_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert!(config.daemon.capture.is_none());
        assert_eq!(config.daemon.once_timeout_secs, 10);
        assert_eq!(config.source.ping_interval_ms, 400);
    }

    #[test]
    fn test_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[daemon]
json = true

[source]
device_timeout_ms = 0
lock_dir = "/tmp/daisy-locks"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert!(config.daemon.json);
        assert!(config.daemon.show_input);
        assert_eq!(config.source.device_timeout(), None);
        assert_eq!(config.source.lock_dir, Some(PathBuf::from("/tmp/daisy-locks")));
        assert_eq!(config.source.scan_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[source]\nping_interval_ms = \"soon\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
