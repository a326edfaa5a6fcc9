use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::tools::RawOutput;

pub type ScanId = i64;
pub type ToolResultId = i64;
pub type UserId = i64;

/// Progress reported once a worker owns the scan.
pub const PROGRESS_STARTED: u8 = 10;
/// Progress reported right before the tools are fanned out.
pub const PROGRESS_DISPATCHING: u8 = 25;
/// Progress reported once every tool reached a terminal outcome.
pub const PROGRESS_DISPATCHED: u8 = 80;
/// Progress reported once inline analysis finished.
pub const PROGRESS_ANALYZED: u8 = 90;
pub const PROGRESS_DONE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(CoreError::Parse(format!("unknown scan status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    #[default]
    Full,
    Quick,
    Custom,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Full => "full",
            ScanType::Quick => "quick",
            ScanType::Custom => "custom",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(ScanType::Full),
            "quick" => Ok(ScanType::Quick),
            "custom" => Ok(ScanType::Custom),
            other => Err(CoreError::Parse(format!("unknown scan type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次扫描请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub user_id: UserId,
    pub target_url: String,
    pub scan_type: ScanType,
    pub status: ScanStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_vulnerabilities: i64,
    pub high_severity_count: i64,
    pub medium_severity_count: i64,
    pub low_severity_count: i64,
    pub scan_config: serde_json::Value,
    pub error_message: Option<String>,
}

impl Scan {
    /// Tool names requested through `scan_config.tools` on a custom scan.
    pub fn requested_tools(&self) -> Option<Vec<String>> {
        if self.scan_type != ScanType::Custom {
            return None;
        }
        let tools = self.scan_config.get("tools")?.as_array()?;
        Some(
            tools
                .iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.to_lowercase())
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewScan {
    pub user_id: UserId,
    pub target_url: String,
    #[serde(default)]
    pub scan_type: ScanType,
    #[serde(default)]
    pub scan_config: serde_json::Value,
}

impl NewScan {
    pub fn new(user_id: UserId, target_url: impl Into<String>, scan_type: ScanType) -> Self {
        Self {
            user_id,
            target_url: target_url.into(),
            scan_type,
            scan_config: serde_json::Value::Null,
        }
    }
}

/// Partial update; `None` leaves the stored column untouched.
#[derive(Debug, Clone, Default)]
pub struct ScanUpdate {
    pub status: Option<ScanStatus>,
    pub progress: Option<u8>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_vulnerabilities: Option<i64>,
    pub high_severity_count: Option<i64>,
    pub medium_severity_count: Option<i64>,
    pub low_severity_count: Option<i64>,
    pub error_message: Option<String>,
}

impl ScanUpdate {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub(crate) fn apply_to(&self, scan: &mut Scan) {
        if let Some(status) = self.status {
            scan.status = status;
        }
        if let Some(progress) = self.progress {
            scan.progress = progress;
        }
        if let Some(started_at) = self.started_at {
            scan.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            scan.completed_at = Some(completed_at);
        }
        if let Some(total) = self.total_vulnerabilities {
            scan.total_vulnerabilities = total;
        }
        if let Some(high) = self.high_severity_count {
            scan.high_severity_count = high;
        }
        if let Some(medium) = self.medium_severity_count {
            scan.medium_severity_count = medium;
        }
        if let Some(low) = self.low_severity_count {
            scan.low_severity_count = low;
        }
        if let Some(ref message) = self.error_message {
            scan.error_message = Some(message.clone());
        }
    }
}

/// Structured judgment attached to one raw tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisVerdict {
    pub has_vulnerabilities: bool,
    pub vulnerability: String,
    pub severity: Severity,
    pub description: String,
    #[serde(alias = "solution")]
    pub remediation: String,
}

/// 单个工具的原始扫描结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: ToolResultId,
    pub scan_id: ScanId,
    pub tool_name: String,
    pub tool_version: Option<String>,
    pub raw_output: RawOutput,
    pub ai_analysis: Option<AnalysisVerdict>,
    pub processing_time: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewToolResult {
    pub scan_id: ScanId,
    pub tool_name: String,
    pub tool_version: Option<String>,
    pub raw_output: RawOutput,
    pub processing_time: f64,
}
