use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use super::state::{ScanStateMachine, SeverityCounts};
use crate::analysis::Analyzer;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::{CoreError, Result};
use crate::model::{
    AnalysisVerdict, Scan, ScanId, Severity, PROGRESS_ANALYZED, PROGRESS_DISPATCHED,
    PROGRESS_DISPATCHING,
};
use crate::store::ScanStore;
use crate::tools::ToolKind;

/// When verdicts are attached to raw results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Analyze before the scan is terminalized; severity counters are filled.
    #[default]
    Inline,
    /// Leave verdicts to a follow-up analysis job.
    Deferred,
}

impl FromStr for AnalysisMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "inline" => Ok(AnalysisMode::Inline),
            "deferred" => Ok(AnalysisMode::Deferred),
            other => Err(CoreError::Config(format!("unknown analysis mode '{}'", other))),
        }
    }
}

/// What one scan execution reports back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub success: bool,
    pub scan_id: ScanId,
    pub results: DispatchReport,
    pub total_vulnerabilities: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskSummary {
    fn failure(scan_id: ScanId, error: String) -> Self {
        Self {
            success: false,
            scan_id,
            results: DispatchReport::new(),
            total_vulnerabilities: 0,
            error: Some(error),
        }
    }
}

/// 扫描任务入口
pub struct ScanEngine {
    store: Arc<dyn ScanStore>,
    dispatcher: Dispatcher,
    analyzer: Analyzer,
    mode: AnalysisMode,
}

impl ScanEngine {
    pub fn new(store: Arc<dyn ScanStore>, dispatcher: Dispatcher, analyzer: Analyzer, mode: AnalysisMode) -> Self {
        Self {
            store,
            dispatcher,
            analyzer,
            mode,
        }
    }

    pub fn store(&self) -> &Arc<dyn ScanStore> {
        &self.store
    }

    pub fn analysis_mode(&self) -> AnalysisMode {
        self.mode
    }

    /// Runs one pending scan to a terminal state. Never returns an error:
    /// failures are recorded on the scan and reported in the summary.
    pub async fn execute(&self, scan_id: ScanId) -> TaskSummary {
        let mut machine = match ScanStateMachine::acquire(self.store.clone(), scan_id).await {
            Ok(Some(machine)) => machine,
            Ok(None) => {
                tracing::warn!(scan_id, "Scan is not pending, skipping execution");
                return TaskSummary::failure(scan_id, format!("Scan {} is not pending", scan_id));
            }
            Err(e) => {
                tracing::error!(scan_id, error = %e, "Could not acquire scan lease");
                return TaskSummary::failure(scan_id, e.to_string());
            }
        };

        match self.orchestrate(&mut machine).await {
            Ok((results, total_vulnerabilities)) => TaskSummary {
                success: true,
                scan_id,
                results,
                total_vulnerabilities,
                error: None,
            },
            Err(e) => {
                let message = e.to_string();
                if let Err(write_err) = machine.fail(&message).await {
                    tracing::error!(scan_id, error = %write_err, "Could not record scan failure");
                }
                TaskSummary::failure(scan_id, message)
            }
        }
    }

    async fn orchestrate(&self, machine: &mut ScanStateMachine) -> Result<(DispatchReport, i64)> {
        let scan_id = machine.scan_id();
        let scan = self
            .store
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Scan {} not found", scan_id)))?;
        let selection = self.tool_selection(&scan)?;

        machine.advance(PROGRESS_DISPATCHING).await?;
        let report = self
            .dispatcher
            .dispatch_tools(scan_id, &scan.target_url, Some(&selection))
            .await?;
        machine.advance(PROGRESS_DISPATCHED).await?;

        let total: i64 = report
            .values()
            .filter(|o| o.success)
            .map(|o| o.vulnerabilities_found as i64)
            .sum();
        let mut counts = SeverityCounts {
            total,
            ..Default::default()
        };

        if self.mode == AnalysisMode::Inline {
            for (tool_name, verdict) in self.analyze_results(scan_id, false).await? {
                let Some(outcome) = report.get(&tool_name) else {
                    continue;
                };
                if !outcome.success || !verdict.has_vulnerabilities {
                    continue;
                }
                let found = outcome.vulnerabilities_found as i64;
                match verdict.severity {
                    Severity::Critical | Severity::High => counts.high += found,
                    Severity::Medium => counts.medium += found,
                    Severity::Low => counts.low += found,
                }
            }
            machine.advance(PROGRESS_ANALYZED).await?;
        }

        machine.complete(counts).await?;
        Ok((report, total))
    }

    /// Enabled tools this scan runs: all of them, or the custom selection.
    fn tool_selection(&self, scan: &Scan) -> Result<Vec<ToolKind>> {
        let enabled = self.dispatcher.tools();
        let selection: Vec<ToolKind> = match scan.requested_tools() {
            None => enabled,
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    let kind = ToolKind::from_name(name);
                    if kind.is_none() {
                        tracing::warn!(scan_id = scan.id, tool = %name, "Ignoring unknown tool");
                    }
                    kind
                })
                .filter(|kind| enabled.contains(kind))
                .collect(),
        };

        if selection.is_empty() {
            return Err(CoreError::Config(format!(
                "No enabled tools selected for scan {}",
                scan.id
            )));
        }
        Ok(selection)
    }

    /// Attaches verdicts to the scan's raw results.
    ///
    /// Results that already carry a verdict are skipped unless `overwrite` is
    /// set, in which case their verdict is replaced. Returns how many results
    /// were analyzed.
    pub async fn analyze_scan_results(&self, scan_id: ScanId, overwrite: bool) -> Result<usize> {
        if self.store.get_scan(scan_id).await?.is_none() {
            return Err(CoreError::NotFound(format!("Scan {} not found", scan_id)));
        }
        let analyzed = self.analyze_results(scan_id, overwrite).await?;
        tracing::info!(scan_id, analyzed = analyzed.len(), overwrite, "Scan results analyzed");
        Ok(analyzed.len())
    }

    async fn analyze_results(&self, scan_id: ScanId, overwrite: bool) -> Result<Vec<(String, AnalysisVerdict)>> {
        let mut verdicts = Vec::new();
        for result in self.store.list_tool_results(scan_id).await? {
            if result.ai_analysis.is_some() && !overwrite {
                continue;
            }
            let verdict = self.analyzer.analyze(&result.raw_output, &result.tool_name).await;
            self.store.update_tool_result_analysis(result.id, &verdict).await?;
            verdicts.push((result.tool_name, verdict));
        }
        Ok(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_mode_parses_from_env_text() {
        assert_eq!("Inline".parse::<AnalysisMode>().unwrap(), AnalysisMode::Inline);
        assert_eq!(" deferred ".parse::<AnalysisMode>().unwrap(), AnalysisMode::Deferred);
        assert!("later".parse::<AnalysisMode>().is_err());
    }
}
