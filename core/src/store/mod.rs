// Store module - 持久化存储
// 扫描记录与工具结果的存储接口

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    AnalysisVerdict, NewScan, NewToolResult, Scan, ScanId, ScanStatus, ScanUpdate, ToolResult,
    ToolResultId, UserId,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable storage for scans and their raw tool results.
///
/// Updates are last-write-wins on the named fields. The only conditional
/// write is [`ScanStore::try_start_scan`], which hands out the execution lease.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn create_scan(&self, scan: NewScan) -> Result<Scan>;

    async fn get_scan(&self, id: ScanId) -> Result<Option<Scan>>;

    /// A user's scans, newest first.
    async fn list_scans(&self, user_id: UserId) -> Result<Vec<Scan>>;

    async fn list_scans_by_status(&self, status: ScanStatus) -> Result<Vec<Scan>>;

    /// Atomically moves a `pending` scan to `running`.
    ///
    /// Returns `false` when the scan is missing or no longer pending; exactly
    /// one concurrent caller can observe `true` for a given scan.
    async fn try_start_scan(&self, id: ScanId, started_at: DateTime<Utc>, progress: u8) -> Result<bool>;

    async fn update_scan(&self, id: ScanId, update: ScanUpdate) -> Result<()>;

    /// Deletes the scan and its tool results. Returns `false` if it did not exist.
    async fn delete_scan(&self, id: ScanId) -> Result<bool>;

    async fn create_tool_result(&self, result: NewToolResult) -> Result<ToolResult>;

    async fn update_tool_result_analysis(&self, id: ToolResultId, verdict: &AnalysisVerdict) -> Result<()>;

    async fn list_tool_results(&self, scan_id: ScanId) -> Result<Vec<ToolResult>>;
}
