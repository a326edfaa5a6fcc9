use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::ScanStore;
use crate::error::{CoreError, Result};
use crate::model::{
    AnalysisVerdict, NewScan, NewToolResult, Scan, ScanId, ScanStatus, ScanUpdate, ToolResult,
    ToolResultId, UserId,
};

#[derive(Default)]
struct Tables {
    next_scan_id: ScanId,
    next_result_id: ToolResultId,
    scans: BTreeMap<ScanId, Scan>,
    results: BTreeMap<ToolResultId, ToolResult>,
}

/// Process-local store backed by ordered maps.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create_scan(&self, scan: NewScan) -> Result<Scan> {
        let mut tables = self.tables.lock().await;
        tables.next_scan_id += 1;
        let record = Scan {
            id: tables.next_scan_id,
            user_id: scan.user_id,
            target_url: scan.target_url,
            scan_type: scan.scan_type,
            status: ScanStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_vulnerabilities: 0,
            high_severity_count: 0,
            medium_severity_count: 0,
            low_severity_count: 0,
            scan_config: scan.scan_config,
            error_message: None,
        };
        tables.scans.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_scan(&self, id: ScanId) -> Result<Option<Scan>> {
        Ok(self.tables.lock().await.scans.get(&id).cloned())
    }

    async fn list_scans(&self, user_id: UserId) -> Result<Vec<Scan>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .scans
            .values()
            .rev()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_scans_by_status(&self, status: ScanStatus) -> Result<Vec<Scan>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .scans
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn try_start_scan(&self, id: ScanId, started_at: DateTime<Utc>, progress: u8) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.scans.get_mut(&id) {
            Some(scan) if scan.status == ScanStatus::Pending => {
                scan.status = ScanStatus::Running;
                scan.started_at = Some(started_at);
                scan.progress = progress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_scan(&self, id: ScanId, update: ScanUpdate) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let scan = tables
            .scans
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("Scan {} not found", id)))?;
        update.apply_to(scan);
        Ok(())
    }

    async fn delete_scan(&self, id: ScanId) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        if tables.scans.remove(&id).is_none() {
            return Ok(false);
        }
        tables.results.retain(|_, r| r.scan_id != id);
        Ok(true)
    }

    async fn create_tool_result(&self, result: NewToolResult) -> Result<ToolResult> {
        let mut tables = self.tables.lock().await;
        if !tables.scans.contains_key(&result.scan_id) {
            return Err(CoreError::NotFound(format!("Scan {} not found", result.scan_id)));
        }
        if tables
            .results
            .values()
            .any(|r| r.scan_id == result.scan_id && r.tool_name == result.tool_name)
        {
            return Err(CoreError::Conflict(format!(
                "Scan {} already has a {} result",
                result.scan_id, result.tool_name
            )));
        }

        tables.next_result_id += 1;
        let record = ToolResult {
            id: tables.next_result_id,
            scan_id: result.scan_id,
            tool_name: result.tool_name,
            tool_version: result.tool_version,
            raw_output: result.raw_output,
            ai_analysis: None,
            processing_time: result.processing_time,
            created_at: Utc::now(),
        };
        tables.results.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_tool_result_analysis(&self, id: ToolResultId, verdict: &AnalysisVerdict) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let result = tables
            .results
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("Tool result {} not found", id)))?;
        result.ai_analysis = Some(verdict.clone());
        Ok(())
    }

    async fn list_tool_results(&self, scan_id: ScanId) -> Result<Vec<ToolResult>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .results
            .values()
            .filter(|r| r.scan_id == scan_id)
            .cloned()
            .collect())
    }
}
