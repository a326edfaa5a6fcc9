use serde_json::Value;
use std::path::Path;

use super::{ParsedSummary, WebFinding};

pub fn args(target: &str, report_path: &Path) -> Vec<String> {
    vec![
        "-h".to_string(),
        target.to_string(),
        "-o".to_string(),
        report_path.display().to_string(),
        "-Format".to_string(),
        "json".to_string(),
        "-ask".to_string(),
        "no".to_string(),
    ]
}

/// Findings from a `-Format json` report.
///
/// Nikto emits either a single host object or an array of them; both carry a
/// `vulnerabilities` array.
pub fn parse(report: &str) -> Result<ParsedSummary, String> {
    if report.trim().is_empty() {
        return Err("nikto produced an empty JSON report".to_string());
    }

    let findings = match serde_json::from_str::<Value>(report) {
        Ok(Value::Object(host)) => host_findings(&host),
        Ok(Value::Array(hosts)) => hosts
            .iter()
            .filter_map(Value::as_object)
            .flat_map(host_findings)
            .collect(),
        Ok(_) => return Err("nikto report has an unexpected shape".to_string()),
        Err(e) => {
            if report.contains("OSVDB") || report.contains("ERROR") {
                vec![WebFinding {
                    vuln_type: "Web Vulnerability".to_string(),
                    description: "Nikto found potential issues".to_string(),
                    severity: "medium".to_string(),
                    url: None,
                }]
            } else {
                return Err(format!("nikto report is not valid JSON: {}", e));
            }
        }
    };

    Ok(ParsedSummary::WebFindings { findings })
}

fn host_findings(host: &serde_json::Map<String, Value>) -> Vec<WebFinding> {
    let Some(vulns) = host.get("vulnerabilities").and_then(Value::as_array) else {
        return Vec::new();
    };

    vulns
        .iter()
        .map(|v| {
            let text = |key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
            WebFinding {
                vuln_type: text("type").unwrap_or_else(|| "Web Vulnerability".to_string()),
                description: text("description").or_else(|| text("msg")).unwrap_or_default(),
                severity: text("severity").unwrap_or_else(|| "medium".to_string()),
                url: text("url"),
            }
        })
        .collect()
}
