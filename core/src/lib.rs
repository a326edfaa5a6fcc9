// VulnScan Core Library
// 扫描编排引擎：工具运行、并行调度、结果研判、状态机与后台任务

pub mod analysis;
pub mod dispatcher;
pub mod engine;
pub mod model;
pub mod queue;
pub mod store;
pub mod tools;

// 重新导出常用类型
pub use analysis::{Analyzer, Classifier, OpenAiClassifier};
pub use dispatcher::{DispatchOutcome, DispatchReport, Dispatcher};
pub use engine::{AnalysisMode, ScanEngine, ScanStateMachine, TaskSummary};
pub use model::{
    AnalysisVerdict, NewScan, Scan, ScanId, ScanStatus, ScanType, Severity, ToolResult, UserId,
};
pub use queue::{Job, JobQueue, WorkerHandle, WorkerPool};
pub use store::{MemoryStore, ScanStore, SqliteStore};
pub use tools::{OutcomeKind, ProcessRunner, ToolKind, ToolOutcome, ToolRunner, ToolsConfig};

/// Parses and checks a scan target: absolute `http`/`https` URL with a host.
pub fn validate_target(target: &str) -> error::Result<reqwest::Url> {
    let url = reqwest::Url::parse(target.trim())
        .map_err(|e| error::CoreError::Parse(format!("invalid target URL '{}': {}", target, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(error::CoreError::Parse(format!(
            "target must be an http(s) URL with a host: '{}'",
            target
        )));
    }
    Ok(url)
}

pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum CoreError {
        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Parse error: {0}")]
        Parse(String),

        #[error("Database error: {0}")]
        Database(#[from] sqlx::Error),

        #[error("Serialization error: {0}")]
        Serialization(#[from] serde_json::Error),

        #[error("Config file error: {0}")]
        Yaml(#[from] serde_yaml::Error),

        #[error("HTTP error: {0}")]
        Http(#[from] reqwest::Error),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("{0}")]
        NotFound(String),

        #[error("{0}")]
        Conflict(String),

        #[error("Invalid state transition: {0}")]
        InvalidTransition(String),

        #[error("Classifier error: {0}")]
        Classifier(String),

        #[error("Store error: {0}")]
        Store(String),

        #[error("Queue error: {0}")]
        Queue(String),
    }

    pub type Result<T> = std::result::Result<T, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_must_be_http_urls() {
        assert_eq!(
            validate_target(" https://example.com/login ").unwrap().host_str(),
            Some("example.com")
        );
        assert!(validate_target("ftp://example.com").is_err());
        assert!(validate_target("example.com").is_err());
        assert!(validate_target("http://").is_err());
    }
}
