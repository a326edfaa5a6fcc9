use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};

use super::process::{execute, Invocation, ProcessExit};
use super::{nikto, nmap, sqlmap, OutcomeKind, RawOutput, ToolKind, ToolOutcome, ToolRunner, ToolSettings};

/// Per-invocation scratch space, removed when dropped on every exit path.
enum Scratch {
    File(NamedTempFile),
    Dir(TempDir),
}

impl Scratch {
    fn for_tool(kind: ToolKind) -> std::io::Result<Self> {
        match kind {
            ToolKind::Sqlmap => Ok(Scratch::Dir(tempfile::tempdir()?)),
            ToolKind::Nmap => Ok(Scratch::File(
                tempfile::Builder::new().prefix("nmap-").suffix(".xml").tempfile()?,
            )),
            ToolKind::Nikto => Ok(Scratch::File(
                tempfile::Builder::new().prefix("nikto-").suffix(".json").tempfile()?,
            )),
        }
    }

    /// Where the tool is told to write its output.
    fn output_path(&self) -> PathBuf {
        match self {
            Scratch::File(file) => file.path().to_path_buf(),
            Scratch::Dir(dir) => dir.path().join("sqlmap_results"),
        }
    }
}

/// Runs one external scanner as a child process.
pub struct ProcessRunner {
    kind: ToolKind,
    settings: ToolSettings,
    deadline: Duration,
}

impl ProcessRunner {
    pub fn new(kind: ToolKind, settings: ToolSettings) -> Self {
        let deadline = settings.deadline(kind);
        Self {
            kind,
            settings,
            deadline,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn invocation(&self, target: &str, output_path: &Path) -> Invocation {
        let mut launcher = self.settings.launcher(self.kind).into_iter();
        let program = launcher.next().unwrap_or_else(|| self.kind.name().to_string());
        let mut args: Vec<String> = launcher.collect();
        args.extend(match self.kind {
            ToolKind::Sqlmap => sqlmap::args(target, output_path),
            ToolKind::Nmap => nmap::args(target, output_path),
            ToolKind::Nikto => nikto::args(target, output_path),
        });

        Invocation {
            program,
            args,
            deadline: self.deadline,
        }
    }

    fn outcome(&self, raw_output: RawOutput, tool_version: Option<String>, started: Instant) -> ToolOutcome {
        ToolOutcome {
            tool: self.kind,
            kind: raw_output.outcome,
            raw_output,
            tool_version,
            duration: started.elapsed(),
        }
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    async fn run(&self, target: &str) -> ToolOutcome {
        let started = Instant::now();
        let tool = self.kind.name();

        let scratch = match Scratch::for_tool(self.kind) {
            Ok(scratch) => scratch,
            Err(e) => {
                tracing::error!(tool, error = %e, "Failed to create scratch space");
                let raw = RawOutput::failure(
                    tool.to_string(),
                    OutcomeKind::ParseError,
                    format!("Failed to create scratch space for {}: {}", tool, e),
                );
                return self.outcome(raw, None, started);
            }
        };
        let output_path = scratch.output_path();
        let invocation = self.invocation(target, &output_path);
        let command = invocation.command_line();

        tracing::debug!(tool, command = %command, "Launching tool");

        let (stdout, stderr, code) = match execute(&invocation).await {
            ProcessExit::Finished { stdout, stderr, code } => (stdout, stderr, code),
            ProcessExit::TimedOut { stdout, stderr } => {
                tracing::warn!(tool, deadline_secs = self.deadline.as_secs_f64(), "Tool deadline expired");
                let mut raw = RawOutput::failure(
                    command,
                    OutcomeKind::Timeout,
                    format!("{} scan timed out after {}s", tool, self.deadline.as_secs_f64()),
                );
                raw.target = Some(target.to_string());
                raw.stdout = stdout;
                raw.stderr = stderr;
                return self.outcome(raw, None, started);
            }
            ProcessExit::NotFound => {
                let raw = RawOutput::failure(
                    command,
                    OutcomeKind::ToolNotFound,
                    format!("{} not found. Please install {}.", tool, tool),
                );
                return self.outcome(raw, None, started);
            }
            ProcessExit::SpawnFailed(e) => {
                let raw = RawOutput::failure(
                    command,
                    OutcomeKind::ToolNotFound,
                    format!("Failed to launch {}: {}", tool, e),
                );
                return self.outcome(raw, None, started);
            }
        };

        let report = match self.kind {
            ToolKind::Sqlmap => None,
            ToolKind::Nmap | ToolKind::Nikto => {
                Some(tokio::fs::read_to_string(&output_path).await.unwrap_or_default())
            }
        };

        let parsed = match self.kind {
            ToolKind::Sqlmap => Ok(sqlmap::parse(&stdout)),
            ToolKind::Nmap => nmap::parse(report.as_deref().unwrap_or_default()),
            ToolKind::Nikto => nikto::parse(report.as_deref().unwrap_or_default()),
        };
        let tool_version = match self.kind {
            ToolKind::Nmap => report.as_deref().and_then(nmap::parse_version),
            _ => None,
        };

        let exit_accepted = code.is_some_and(|c| self.settings.accepted_exit_codes.contains(&c));
        let (outcome, error, summary) = if !exit_accepted {
            let status = code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            (
                OutcomeKind::NonzeroExit,
                Some(format!("{} exited with status {}", tool, status)),
                parsed.ok(),
            )
        } else {
            match parsed {
                Ok(summary) => (OutcomeKind::Success, None, Some(summary)),
                Err(e) => (OutcomeKind::ParseError, Some(e), None),
            }
        };

        let raw = RawOutput {
            command,
            outcome,
            target: Some(target.to_string()),
            stdout,
            stderr,
            return_code: code,
            report,
            error,
            summary,
        };

        drop(scratch);
        self.outcome(raw, tool_version, started)
    }
}
