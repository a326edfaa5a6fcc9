use std::path::Path;

use super::{InjectionMatch, ParsedSummary};
use crate::model::Severity;

pub fn args(target: &str, output_dir: &Path) -> Vec<String> {
    vec![
        "-u".to_string(),
        target.to_string(),
        "--batch".to_string(),
        "--level=2".to_string(),
        "--risk=1".to_string(),
        format!("--output-dir={}", output_dir.display()),
    ]
}

/// Matched injection lines from sqlmap's console output.
///
/// Lines are only collected once sqlmap reported something as vulnerable.
pub fn parse(stdout: &str) -> ParsedSummary {
    let mut matches = Vec::new();

    if stdout.to_lowercase().contains("vulnerable") {
        for line in stdout.lines() {
            let lower = line.to_lowercase();
            if lower.contains("vulnerable") || lower.contains("injection") {
                matches.push(InjectionMatch {
                    vuln_type: "SQL Injection".to_string(),
                    description: line.trim().to_string(),
                    severity: Severity::High,
                });
            }
        }
    }

    ParsedSummary::Injection { matches }
}
