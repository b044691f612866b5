//! Configuration loading for the sorter daemon

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::{Result, SortError};

pub const DEFAULT_ROBOT_HOST: &str = "172.20.254.208";
/// URScript secondary interface on the robot controller
pub const DEFAULT_COMMAND_PORT: u16 = 30002;
/// Must match the port the robot scripts open back towards the PC
pub const DEFAULT_TELEMETRY_PORT: u16 = 45123;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SorterConfig {
    pub robot: RobotConfig,
    pub telemetry: TelemetryConfig,
    pub scripts: ScriptsConfig,
    pub inventory: InventoryConfig,
    pub sequence: SequenceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RobotConfig {
    pub host: String,
    pub command_port: u16,
    pub connect_timeout_ms: u64,
    /// How long the command socket stays open after the script is written
    pub send_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub bind_host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScriptsConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// JSON file backing the inventory; counts are kept in memory when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepConfig {
    pub script: String,
    pub ack: String,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_ROBOT_HOST.to_string(),
            command_port: DEFAULT_COMMAND_PORT,
            connect_timeout_ms: 5000,
            send_grace_ms: 200,
        }
    }
}

impl RobotConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_grace(&self) -> Duration {
        Duration::from_millis(self.send_grace_ms)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_TELEMETRY_PORT,
        }
    }
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("scripts"),
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        // Blue -> Green -> Red
        let steps = [
            ("blaa_26.script", "blaa_26"),
            ("groen_26.script", "groen_26"),
            ("roed_26.script", "roed_26"),
        ];
        Self {
            steps: steps
                .iter()
                .map(|(script, ack)| StepConfig {
                    script: script.to_string(),
                    ack: ack.to_string(),
                })
                .collect(),
        }
    }
}

impl SorterConfig {
    pub fn load_from_path(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| SortError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: SorterConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(SortError::Config("robot.host must not be empty".to_string()));
        }
        for (index, step) in self.sequence.steps.iter().enumerate() {
            if step.script.trim().is_empty() || step.ack.trim().is_empty() {
                return Err(SortError::Config(format!(
                    "sequence step {} needs both a script and an ack name",
                    index
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SorterConfig::load_from_str("{}").unwrap();
        assert_eq!(config.robot.host, DEFAULT_ROBOT_HOST);
        assert_eq!(config.robot.command_port, 30002);
        assert_eq!(config.robot.send_grace(), Duration::from_millis(200));
        assert_eq!(config.telemetry.port, 45123);
        assert!(config.inventory.path.is_none());

        let acks: Vec<&str> = config.sequence.steps.iter().map(|s| s.ack.as_str()).collect();
        assert_eq!(acks, vec!["blaa_26", "groen_26", "roed_26"]);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = r#"
robot:
  host: 10.0.0.5
telemetry:
  port: 5000
sequence:
  steps:
    - script: a.script
      ack: a
"#;
        let config = SorterConfig::load_from_str(yaml).unwrap();
        assert_eq!(config.robot.host, "10.0.0.5");
        assert_eq!(config.robot.command_port, DEFAULT_COMMAND_PORT);
        assert_eq!(config.telemetry.port, 5000);
        assert_eq!(config.telemetry.bind_host, "0.0.0.0");
        assert_eq!(
            config.sequence.steps,
            vec![StepConfig { script: "a.script".to_string(), ack: "a".to_string() }]
        );
    }

    #[test]
    fn rejects_step_without_ack() {
        let yaml = "sequence:\n  steps:\n    - script: a.script\n      ack: \"\"\n";
        let err = SorterConfig::load_from_str(yaml).unwrap_err();
        assert!(matches!(err, SortError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let yaml = "inventory:\n  path: /tmp/counts.json\nscripts:\n  dir: /opt/scripts";
        writeln!(file, "{}", yaml).unwrap();
        file.flush().unwrap();

        let config = SorterConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.inventory.path, Some(PathBuf::from("/tmp/counts.json")));
        assert_eq!(config.scripts.dir, PathBuf::from("/opt/scripts"));
    }

    #[test]
    fn shipped_default_config_parses() {
        let yaml = include_str!("../config/default_config.yaml");
        let config = SorterConfig::load_from_str(yaml).unwrap();
        assert_eq!(config.telemetry.port, DEFAULT_TELEMETRY_PORT);
        assert_eq!(config.sequence.steps, SequenceConfig::default().steps);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = SorterConfig::load_from_path("/nonexistent/sortd.yaml").unwrap_err();
        assert!(matches!(err, SortError::Config(_)));
    }
}
