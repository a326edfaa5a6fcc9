use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::{ProcessRunner, ToolKind};
use crate::error::Result;

fn default_enabled() -> bool {
    true
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

/// Per-tool overrides loaded from the tools YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Launcher argv prefix, e.g. `["docker", "run", "--rm", "instrumentisto/nmap"]`.
    /// Empty means the tool's own binary name on the command path.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
    #[serde(default = "default_exit_codes")]
    pub accepted_exit_codes: Vec<i32>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            command: Vec::new(),
            deadline_secs: None,
            accepted_exit_codes: default_exit_codes(),
        }
    }
}

impl ToolSettings {
    pub fn deadline(&self, kind: ToolKind) -> Duration {
        self.deadline_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| kind.default_deadline())
    }

    pub fn launcher(&self, kind: ToolKind) -> Vec<String> {
        if self.command.is_empty() {
            vec![kind.name().to_string()]
        } else {
            self.command.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub tools: BTreeMap<ToolKind, ToolSettings>,
}

impl ToolsConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml(&content)?;
        tracing::info!(
            "Loaded tool settings from {} ({} overrides)",
            path.as_ref().display(),
            config.tools.len()
        );
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn settings(&self, kind: ToolKind) -> ToolSettings {
        self.tools.get(&kind).cloned().unwrap_or_default()
    }

    /// One runner per enabled tool, in the fixed tool order.
    pub fn runners(&self) -> Vec<ProcessRunner> {
        ToolKind::ALL
            .into_iter()
            .map(|kind| (kind, self.settings(kind)))
            .filter(|(_, settings)| settings.enabled)
            .map(|(kind, settings)| ProcessRunner::new(kind, settings))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRunner;

    #[test]
    fn defaults_cover_every_tool() {
        let config = ToolsConfig::default();
        let kinds: Vec<ToolKind> = config.runners().iter().map(|r| r.kind()).collect();
        assert_eq!(kinds, ToolKind::ALL.to_vec());
        assert_eq!(config.settings(ToolKind::Nmap).launcher(ToolKind::Nmap), vec!["nmap"]);
    }

    #[test]
    fn yaml_overrides_are_applied() {
        let yaml = r#"
tools:
  nikto:
    enabled: false
  nmap:
    command: ["docker", "run", "--rm", "instrumentisto/nmap"]
    deadline_secs: 120
    accepted_exit_codes: [0, 1]
"#;
        let config = ToolsConfig::from_yaml(yaml).unwrap();
        let kinds: Vec<ToolKind> = config.runners().iter().map(|r| r.kind()).collect();
        assert_eq!(kinds, vec![ToolKind::Sqlmap, ToolKind::Nmap]);

        let nmap = config.settings(ToolKind::Nmap);
        assert_eq!(nmap.deadline(ToolKind::Nmap), Duration::from_secs(120));
        assert_eq!(nmap.launcher(ToolKind::Nmap)[0], "docker");
        assert_eq!(nmap.accepted_exit_codes, vec![0, 1]);

        let sqlmap = config.settings(ToolKind::Sqlmap);
        assert_eq!(sqlmap.deadline(ToolKind::Sqlmap), Duration::from_secs(300));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.yaml");
        fs::write(&path, "tools:\n  sqlmap:\n    deadline_secs: 30\n").unwrap();
        let config = ToolsConfig::load(&path).unwrap();
        assert_eq!(
            config.settings(ToolKind::Sqlmap).deadline(ToolKind::Sqlmap),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn unknown_tool_names_are_rejected() {
        assert!(ToolsConfig::from_yaml("tools:\n  zap:\n    enabled: true\n").is_err());
    }
}
