use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use super::ScanStore;
use crate::error::{CoreError, Result};
use crate::model::{
    AnalysisVerdict, NewScan, NewToolResult, Scan, ScanId, ScanStatus, ScanUpdate, ToolResult,
    ToolResultId, UserId,
};

const SCAN_COLUMNS: &str = "id, user_id, target_url, scan_type, status, progress, created_at, \
     started_at, completed_at, total_vulnerabilities, high_severity_count, \
     medium_severity_count, low_severity_count, scan_config, error_message";

const RESULT_COLUMNS: &str =
    "id, scan_id, tool_name, tool_version, raw_output, ai_analysis, processing_time, created_at";

/// SQLite-backed store used by the web service and the workers.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self> {
        // 使用 SqliteConnectOptions 来确保数据库文件可以被创建
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!("Database initialized at {}", url);
        Ok(store)
    }

    /// Private in-memory database; a single connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        // 创建表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                target_url TEXT NOT NULL,
                scan_type TEXT NOT NULL DEFAULT 'full',
                status TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                total_vulnerabilities INTEGER NOT NULL DEFAULT 0,
                high_severity_count INTEGER NOT NULL DEFAULT 0,
                medium_severity_count INTEGER NOT NULL DEFAULT 0,
                low_severity_count INTEGER NOT NULL DEFAULT 0,
                scan_config TEXT NOT NULL DEFAULT 'null',
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_scans_user ON scans(user_id);
            CREATE INDEX IF NOT EXISTS idx_scans_status ON scans(status);

            CREATE TABLE IF NOT EXISTS tool_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_id INTEGER NOT NULL,
                tool_name TEXT NOT NULL,
                tool_version TEXT,
                raw_output TEXT NOT NULL,
                ai_analysis TEXT,
                processing_time REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(scan_id, tool_name),
                FOREIGN KEY(scan_id) REFERENCES scans(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::Parse(format!("invalid timestamp '{}': {}", value, e)))
}

fn parse_optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

fn scan_from_row(row: &SqliteRow) -> Result<Scan> {
    let scan_type: String = row.try_get("scan_type")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let scan_config: String = row.try_get("scan_config")?;
    let progress: i64 = row.try_get("progress")?;

    Ok(Scan {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        target_url: row.try_get("target_url")?,
        scan_type: scan_type.parse()?,
        status: status.parse()?,
        progress: progress.clamp(0, 100) as u8,
        created_at: parse_time(&created_at)?,
        started_at: parse_optional_time(row.try_get("started_at")?)?,
        completed_at: parse_optional_time(row.try_get("completed_at")?)?,
        total_vulnerabilities: row.try_get("total_vulnerabilities")?,
        high_severity_count: row.try_get("high_severity_count")?,
        medium_severity_count: row.try_get("medium_severity_count")?,
        low_severity_count: row.try_get("low_severity_count")?,
        scan_config: serde_json::from_str(&scan_config)?,
        error_message: row.try_get("error_message")?,
    })
}

fn tool_result_from_row(row: &SqliteRow) -> Result<ToolResult> {
    let raw_output: String = row.try_get("raw_output")?;
    let ai_analysis: Option<String> = row.try_get("ai_analysis")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ToolResult {
        id: row.try_get("id")?,
        scan_id: row.try_get("scan_id")?,
        tool_name: row.try_get("tool_name")?,
        tool_version: row.try_get("tool_version")?,
        raw_output: serde_json::from_str(&raw_output)?,
        ai_analysis: ai_analysis.as_deref().map(serde_json::from_str).transpose()?,
        processing_time: row.try_get("processing_time")?,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl ScanStore for SqliteStore {
    async fn create_scan(&self, scan: NewScan) -> Result<Scan> {
        let now = Utc::now();
        let scan_config = serde_json::to_string(&scan.scan_config)?;

        let result = sqlx::query(
            r#"
            INSERT INTO scans (user_id, target_url, scan_type, status, progress, created_at, scan_config)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(scan.user_id)
        .bind(&scan.target_url)
        .bind(scan.scan_type.as_str())
        .bind(ScanStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .bind(&scan_config)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_scan(id)
            .await?
            .ok_or_else(|| CoreError::Store(format!("Scan {} vanished after insert", id)))
    }

    async fn get_scan(&self, id: ScanId) -> Result<Option<Scan>> {
        let row = sqlx::query(&format!("SELECT {} FROM scans WHERE id = ?", SCAN_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(scan_from_row).transpose()
    }

    async fn list_scans(&self, user_id: UserId) -> Result<Vec<Scan>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scans WHERE user_id = ? ORDER BY id DESC",
            SCAN_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(scan_from_row).collect()
    }

    async fn list_scans_by_status(&self, status: ScanStatus) -> Result<Vec<Scan>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scans WHERE status = ? ORDER BY id ASC",
            SCAN_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(scan_from_row).collect()
    }

    async fn try_start_scan(&self, id: ScanId, started_at: DateTime<Utc>, progress: u8) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scans
            SET status = ?, started_at = ?, progress = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(ScanStatus::Running.as_str())
        .bind(started_at.to_rfc3339())
        .bind(progress as i64)
        .bind(id)
        .bind(ScanStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_scan(&self, id: ScanId, update: ScanUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scans SET
                status = COALESCE(?, status),
                progress = COALESCE(?, progress),
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                total_vulnerabilities = COALESCE(?, total_vulnerabilities),
                high_severity_count = COALESCE(?, high_severity_count),
                medium_severity_count = COALESCE(?, medium_severity_count),
                low_severity_count = COALESCE(?, low_severity_count),
                error_message = COALESCE(?, error_message)
            WHERE id = ?
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.progress.map(i64::from))
        .bind(update.started_at.map(|t| t.to_rfc3339()))
        .bind(update.completed_at.map(|t| t.to_rfc3339()))
        .bind(update.total_vulnerabilities)
        .bind(update.high_severity_count)
        .bind(update.medium_severity_count)
        .bind(update.low_severity_count)
        .bind(update.error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Scan {} not found", id)));
        }
        Ok(())
    }

    async fn delete_scan(&self, id: ScanId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tool_results WHERE scan_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM scans WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_tool_result(&self, result: NewToolResult) -> Result<ToolResult> {
        let now = Utc::now();
        let raw_output = serde_json::to_string(&result.raw_output)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO tool_results (scan_id, tool_name, tool_version, raw_output, processing_time, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.scan_id)
        .bind(&result.tool_name)
        .bind(&result.tool_version)
        .bind(&raw_output)
        .bind(result.processing_time)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => CoreError::Conflict(format!(
                "Scan {} already has a {} result",
                result.scan_id, result.tool_name
            )),
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                CoreError::NotFound(format!("Scan {} not found", result.scan_id))
            }
            _ => CoreError::Database(e),
        })?;

        Ok(ToolResult {
            id: inserted.last_insert_rowid(),
            scan_id: result.scan_id,
            tool_name: result.tool_name,
            tool_version: result.tool_version,
            raw_output: result.raw_output,
            ai_analysis: None,
            processing_time: result.processing_time,
            created_at: now,
        })
    }

    async fn update_tool_result_analysis(&self, id: ToolResultId, verdict: &AnalysisVerdict) -> Result<()> {
        let analysis = serde_json::to_string(verdict)?;
        let result = sqlx::query("UPDATE tool_results SET ai_analysis = ? WHERE id = ?")
            .bind(&analysis)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Tool result {} not found", id)));
        }
        Ok(())
    }

    async fn list_tool_results(&self, scan_id: ScanId) -> Result<Vec<ToolResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tool_results WHERE scan_id = ? ORDER BY id ASC",
            RESULT_COLUMNS
        ))
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tool_result_from_row).collect()
    }
}
