use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::FleetError;

/// Project-level configuration, read from `fleet.yaml` in the repository root.
///
/// Every field is optional; a missing file yields the defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// Command used to start a dev server inside a worker's worktree.
    /// `$PORT` is replaced with the allocated port. When absent, workers get
    /// no port (recorded as 0).
    #[serde(default)]
    pub dev_command: Option<String>,

    /// Inclusive port range for dev servers, e.g. "3000-3010".
    #[serde(default = "default_port_range")]
    pub port_range: String,

    /// Agent command to launch when none is given on the command line.
    #[serde(default = "default_model")]
    pub default_model: String,
}

fn default_port_range() -> String {
    "3000-3100".to_string()
}

fn default_model() -> String {
    "claude".to_string()
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            dev_command: None,
            port_range: default_port_range(),
            default_model: default_model(),
        }
    }
}

impl FleetConfig {
    /// Load config from the given path, falling back to defaults when the
    /// file does not exist. A present-but-invalid file is an input error.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).context(format!("failed to read {}", path.display()));
            }
        };
        serde_yaml::from_str(&raw)
            .map_err(|e| FleetError::Input(format!("invalid config {}: {e}", path.display())).into())
    }

    /// Parse `port_range` into an inclusive (start, end) pair.
    pub fn port_range(&self) -> Result<(u16, u16)> {
        parse_port_range(&self.port_range)
    }
}

fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let invalid = || FleetError::Input(format!("invalid port range {raw:?}, expected START-END"));
    let (start, end) = raw.split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    if start > end {
        return Err(invalid().into());
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_range() {
        assert_eq!(parse_port_range("3000-3010").unwrap(), (3000, 3010));
        assert_eq!(parse_port_range("3000-3000").unwrap(), (3000, 3000));
        assert!(parse_port_range("3010-3000").is_err());
        assert!(parse_port_range("3000").is_err());
        assert!(parse_port_range("a-b").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = FleetConfig::load(Path::new("/nonexistent/fleet.yaml")).unwrap();
        assert!(config.dev_command.is_none());
        assert_eq!(config.port_range().unwrap(), (3000, 3100));
        assert_eq!(config.default_model, "claude");
    }

    #[test]
    fn parses_yaml_fields() {
        let config: FleetConfig =
            serde_yaml::from_str("devCommand: npm run dev -- --port $PORT\nportRange: 4000-4005\n")
                .unwrap();
        assert_eq!(
            config.dev_command.as_deref(),
            Some("npm run dev -- --port $PORT")
        );
        assert_eq!(config.port_range().unwrap(), (4000, 4005));
    }
}
