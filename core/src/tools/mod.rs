// Tool module - 外部扫描工具
// 定义工具运行器的核心接口和类型

pub mod config;
pub mod nikto;
pub mod nmap;
pub mod process;
pub mod runner;
pub mod sqlmap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;
use crate::model::Severity;

pub use config::{ToolSettings, ToolsConfig};
pub use runner::ProcessRunner;

/// The fixed set of external scanners the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Sqlmap,
    Nmap,
    Nikto,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [ToolKind::Sqlmap, ToolKind::Nmap, ToolKind::Nikto];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Sqlmap => "sqlmap",
            ToolKind::Nmap => "nmap",
            ToolKind::Nikto => "nikto",
        }
    }

    /// 工具特定的超时配置
    pub fn default_deadline(&self) -> Duration {
        match self {
            // 网络/注入工具 - 5分钟
            ToolKind::Sqlmap | ToolKind::Nmap => Duration::from_secs(300),
            // 内容扫描工具 - 10分钟
            ToolKind::Nikto => Duration::from_secs(600),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "sqlmap" => Some(ToolKind::Sqlmap),
            "nmap" => Some(ToolKind::Nmap),
            "nikto" => Some(ToolKind::Nikto),
            _ => None,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ToolKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| CoreError::Parse(format!("unknown tool '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Timeout,
    ToolNotFound,
    ParseError,
    NonzeroExit,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::ToolNotFound => "tool_not_found",
            OutcomeKind::ParseError => "parse_error",
            OutcomeKind::NonzeroExit => "nonzero_exit",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionMatch {
    pub vuln_type: String,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebFinding {
    pub vuln_type: String,
    pub description: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
}

/// Minimal structured summary a parser extracts from one tool's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedSummary {
    Injection {
        matches: Vec<InjectionMatch>,
    },
    Ports {
        open_ports: Vec<OpenPort>,
        services: Vec<String>,
    },
    WebFindings {
        findings: Vec<WebFinding>,
    },
}

impl ParsedSummary {
    /// Tool-specific counting rule: injection lines, open ports or web findings.
    pub fn finding_count(&self) -> usize {
        match self {
            ParsedSummary::Injection { matches } => matches.len(),
            ParsedSummary::Ports { open_ports, .. } => open_ports.len(),
            ParsedSummary::WebFindings { findings } => findings.len(),
        }
    }
}

/// Raw artifact persisted for every tool run, whatever its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutput {
    pub command: String,
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub return_code: Option<i32>,
    /// Content of the file-based report (nmap XML, nikto JSON).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<ParsedSummary>,
}

impl RawOutput {
    pub fn failure(command: String, outcome: OutcomeKind, error: String) -> Self {
        Self {
            command,
            outcome,
            target: None,
            stdout: String::new(),
            stderr: String::new(),
            return_code: None,
            report: None,
            error: Some(error),
            summary: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool: ToolKind,
    pub kind: OutcomeKind,
    pub raw_output: RawOutput,
    pub tool_version: Option<String>,
    pub duration: Duration,
}

impl ToolOutcome {
    /// Outcome for a runner that never produced one of its own.
    pub fn crashed(tool: ToolKind, error: String, duration: Duration) -> Self {
        Self {
            tool,
            kind: OutcomeKind::ParseError,
            raw_output: RawOutput::failure(tool.name().to_string(), OutcomeKind::ParseError, error),
            tool_version: None,
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    pub fn vulnerabilities_found(&self) -> usize {
        self.raw_output
            .summary
            .as_ref()
            .map(ParsedSummary::finding_count)
            .unwrap_or(0)
    }

    pub fn error(&self) -> Option<&str> {
        self.raw_output.error.as_deref()
    }
}

/// 工具运行器 trait - 每个外部工具都需要实现此接口
///
/// Implementations never fail past this boundary: every run ends in a
/// [`ToolOutcome`], including timeouts and missing executables.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    fn kind(&self) -> ToolKind;

    async fn run(&self, target: &str) -> ToolOutcome;
}

/// Host part of a URL target; bare hosts are returned unchanged.
pub fn target_host(target: &str) -> String {
    reqwest::Url::parse(target)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| target.trim().to_string())
}
