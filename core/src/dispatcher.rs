// Dispatcher - 并行调度所有工具
// 每个工具一个任务，结果完成即落库

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

use crate::error::{CoreError, Result};
use crate::model::{NewToolResult, ScanId, ToolResultId};
use crate::store::ScanStore;
use crate::tools::{OutcomeKind, ToolKind, ToolOutcome, ToolRunner, ToolsConfig};

/// Per-tool summary returned by a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub outcome: OutcomeKind,
    pub vulnerabilities_found: usize,
    pub processing_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<ToolResultId>,
}

impl DispatchOutcome {
    fn from_outcome(outcome: &ToolOutcome, result_id: Option<ToolResultId>) -> Self {
        let success = outcome.is_success();
        Self {
            success,
            outcome: outcome.kind,
            // failed tools never contribute to the totals
            vulnerabilities_found: if success { outcome.vulnerabilities_found() } else { 0 },
            processing_time: outcome.duration.as_secs_f64(),
            error: outcome.error().map(str::to_string),
            result_id,
        }
    }
}

/// Outcomes keyed by tool name.
pub type DispatchReport = BTreeMap<String, DispatchOutcome>;

/// Fans one scan out to every registered tool runner and waits for all of them.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn ScanStore>,
    runners: Vec<Arc<dyn ToolRunner>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self {
            store,
            runners: Vec::new(),
        }
    }

    pub fn from_config(store: Arc<dyn ScanStore>, config: &ToolsConfig) -> Self {
        let mut dispatcher = Self::new(store);
        for runner in config.runners() {
            dispatcher.register_runner(runner);
        }
        dispatcher
    }

    /// Registers a runner, replacing any runner already registered for the same tool.
    pub fn register_runner<R: ToolRunner + 'static>(&mut self, runner: R) {
        self.register_shared(Arc::new(runner));
    }

    pub fn register_shared(&mut self, runner: Arc<dyn ToolRunner>) {
        let kind = runner.kind();
        self.runners.retain(|r| r.kind() != kind);
        self.runners.push(runner);
    }

    pub fn tools(&self) -> Vec<ToolKind> {
        self.runners.iter().map(|r| r.kind()).collect()
    }

    /// Runs every registered tool against `target`.
    pub async fn dispatch(&self, scan_id: ScanId, target: &str) -> Result<DispatchReport> {
        self.dispatch_tools(scan_id, target, None).await
    }

    /// Runs the registered tools, optionally restricted to `only`.
    ///
    /// Tool failures are reported inside the returned map. An `Err` means a
    /// result could not be recorded; it is returned only after every tool
    /// has finished.
    pub async fn dispatch_tools(
        &self,
        scan_id: ScanId,
        target: &str,
        only: Option<&[ToolKind]>,
    ) -> Result<DispatchReport> {
        let selected: Vec<Arc<dyn ToolRunner>> = self
            .runners
            .iter()
            .filter(|r| only.map_or(true, |kinds| kinds.contains(&r.kind())))
            .cloned()
            .collect();

        tracing::info!(scan_id, tools = selected.len(), url = %target, "Dispatching tools");

        let mut set = JoinSet::new();
        for runner in selected {
            let store = self.store.clone();
            let target = target.to_string();

            set.spawn(async move {
                let kind = runner.kind();
                let started = Instant::now();

                // a panicking runner must still leave a record behind
                let outcome = match tokio::spawn(async move { runner.run(&target).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(scan_id, tool = %kind, error = %e, "Tool runner crashed");
                        ToolOutcome::crashed(kind, format!("{} runner crashed: {}", kind, e), started.elapsed())
                    }
                };

                tracing::info!(
                    scan_id,
                    tool = %kind,
                    outcome = %outcome.kind,
                    duration_ms = outcome.duration.as_millis() as u64,
                    findings = outcome.vulnerabilities_found(),
                    "Tool finished"
                );

                let persisted = store
                    .create_tool_result(NewToolResult {
                        scan_id,
                        tool_name: kind.name().to_string(),
                        tool_version: outcome.tool_version.clone(),
                        raw_output: outcome.raw_output.clone(),
                        processing_time: outcome.duration.as_secs_f64(),
                    })
                    .await;

                (kind, outcome, persisted)
            });
        }

        let mut report = DispatchReport::new();
        let mut failure: Option<CoreError> = None;

        // 等待所有工具完成
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((kind, outcome, Ok(record))) => {
                    report.insert(
                        kind.name().to_string(),
                        DispatchOutcome::from_outcome(&outcome, Some(record.id)),
                    );
                }
                Ok((kind, outcome, Err(e))) => {
                    tracing::error!(scan_id, tool = %kind, error = %e, "Failed to record tool result");
                    report.insert(kind.name().to_string(), DispatchOutcome::from_outcome(&outcome, None));
                    failure.get_or_insert(CoreError::Store(format!(
                        "Failed to record {} result: {}",
                        kind, e
                    )));
                }
                Err(e) => {
                    tracing::error!(scan_id, error = %e, "Dispatch task aborted");
                    failure.get_or_insert(CoreError::Store(format!("Dispatch task aborted: {}", e)));
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
