// Analysis module - 结果研判
// 优先调用外部分类器，失败时回退到启发式规则

pub mod provider;

use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::model::{AnalysisVerdict, Severity};
use crate::tools::{ParsedSummary, RawOutput, ToolKind};

pub use provider::{Classifier, MockClassifier, OpenAiClassifier};

pub const DEFAULT_PROMPT_BUDGET: usize = 1000;

const SYSTEM_PROMPT: &str = "You are a cybersecurity expert analyzing vulnerability scan results.";
const DESCRIPTION_LIMIT: usize = 200;
const GENERIC_REMEDIATION: &str = "Review findings and apply security best practices";

/// Turns one raw tool result into a verdict. Never fails.
#[derive(Clone)]
pub struct Analyzer {
    classifier: Option<Arc<dyn Classifier>>,
    prompt_budget: usize,
}

impl Analyzer {
    pub fn new(classifier: Option<Arc<dyn Classifier>>, prompt_budget: usize) -> Self {
        Self {
            classifier,
            prompt_budget,
        }
    }

    pub fn heuristic_only() -> Self {
        Self::new(None, DEFAULT_PROMPT_BUDGET)
    }

    pub fn with_classifier(classifier: Arc<dyn Classifier>) -> Self {
        Self::new(Some(classifier), DEFAULT_PROMPT_BUDGET)
    }

    pub fn with_prompt_budget(mut self, budget: usize) -> Self {
        self.prompt_budget = budget;
        self
    }

    pub fn uses_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    pub async fn analyze(&self, raw: &RawOutput, tool_name: &str) -> AnalysisVerdict {
        let Some(classifier) = &self.classifier else {
            return heuristic_verdict(raw, tool_name);
        };

        let prompt = build_prompt(raw, tool_name, self.prompt_budget);
        match classifier.classify(SYSTEM_PROMPT, &prompt).await {
            Ok(text) => parse_response(&text, tool_name),
            Err(e) => {
                tracing::warn!(
                    tool = tool_name,
                    provider = classifier.name(),
                    error = %e,
                    "Classifier unavailable, using heuristic analysis"
                );
                heuristic_verdict(raw, tool_name)
            }
        }
    }
}

/// Longest prefix of `text` that fits in `budget` bytes without splitting a character.
fn truncate_to(text: &str, budget: usize) -> &str {
    if text.len() <= budget {
        return text;
    }
    let mut end = budget;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub fn build_prompt(raw: &RawOutput, tool_name: &str, budget: usize) -> String {
    let data = serde_json::to_string_pretty(raw).unwrap_or_default();
    let summary = truncate_to(&data, budget);

    format!(
        "Analyze the following {tool} scan results and provide a security assessment:\n\n\
         Scan Data:\n{summary}\n\n\
         Please provide:\n\
         1. Whether vulnerabilities were found (true/false)\n\
         2. Primary vulnerability type\n\
         3. Severity level (low, medium, high, critical)\n\
         4. Brief description of findings\n\
         5. Recommended remediation steps\n\n\
         Format your response as JSON with keys: has_vulnerabilities, vulnerability, severity, description, remediation",
        tool = tool_name,
        summary = summary,
    )
}

fn json_object() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("static regex"))
}

fn remediation_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:remediation|solution)\s*:\s*(.+)").expect("static regex"))
}

/// Strict JSON verdict if the reply contains one, keyword extraction otherwise.
pub fn parse_response(text: &str, tool_name: &str) -> AnalysisVerdict {
    if let Some(m) = json_object().find(text) {
        match serde_json::from_str::<AnalysisVerdict>(m.as_str()) {
            Ok(verdict) => return verdict,
            Err(e) => tracing::debug!(tool = tool_name, error = %e, "Reply is not a strict verdict"),
        }
    }
    keyword_verdict(text, tool_name)
}

fn keyword_verdict(text: &str, tool_name: &str) -> AnalysisVerdict {
    let lower = text.to_lowercase();
    let severity = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ]
    .into_iter()
    .find(|s| lower.contains(s.as_str()))
    .unwrap_or(Severity::Medium);

    let remediation = remediation_line()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| GENERIC_REMEDIATION.to_string());

    AnalysisVerdict {
        has_vulnerabilities: lower.contains("vulnerab") || lower.contains("risk"),
        vulnerability: format!("{} findings", tool_name),
        severity,
        description: text.chars().take(DESCRIPTION_LIMIT).collect(),
        remediation,
    }
}

/// Fixed per-tool rules over the parsed summary.
pub fn heuristic_verdict(raw: &RawOutput, tool_name: &str) -> AnalysisVerdict {
    let count = raw.summary.as_ref().map(ParsedSummary::finding_count).unwrap_or(0);

    let finding = match ToolKind::from_name(tool_name) {
        Some(ToolKind::Sqlmap) if count > 0 => Some((
            "SQL Injection",
            Severity::High,
            format!("Potential SQL injection vulnerabilities detected ({} matches)", count),
            "Use parameterized queries and input validation",
        )),
        Some(ToolKind::Nmap) if count > 0 => Some((
            "Open Ports",
            Severity::Medium,
            format!("{} open ports detected", count),
            "Close unnecessary ports and secure services",
        )),
        Some(ToolKind::Nikto) if count > 0 => Some((
            "Web Vulnerabilities",
            Severity::Medium,
            format!("Web application vulnerabilities detected ({} findings)", count),
            "Update software and configure security headers",
        )),
        _ => None,
    };

    match finding {
        Some((vulnerability, severity, description, remediation)) => AnalysisVerdict {
            has_vulnerabilities: true,
            vulnerability: vulnerability.to_string(),
            severity,
            description,
            remediation: remediation.to_string(),
        },
        None => AnalysisVerdict {
            has_vulnerabilities: false,
            vulnerability: "Unknown".to_string(),
            severity: Severity::Low,
            description: match &raw.error {
                Some(error) => format!("Scan did not complete: {}", error),
                None => "Scan completed".to_string(),
            },
            remediation: "Review results manually".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{OpenPort, OutcomeKind};

    fn nmap_output(ports: u16) -> RawOutput {
        let open_ports = (0..ports)
            .map(|i| OpenPort {
                port: 8000 + i,
                protocol: "tcp".into(),
                state: "open".into(),
                service: "http".into(),
            })
            .collect();
        RawOutput {
            command: "nmap -T4 -F -Pn example.com".into(),
            outcome: OutcomeKind::Success,
            target: Some("example.com".into()),
            stdout: String::new(),
            stderr: String::new(),
            return_code: Some(0),
            report: Some("<nmaprun/>".into()),
            error: None,
            summary: Some(ParsedSummary::Ports {
                open_ports,
                services: vec!["http".into()],
            }),
        }
    }

    #[tokio::test]
    async fn heuristic_open_ports_is_deterministic() {
        let analyzer = Analyzer::heuristic_only();
        let raw = nmap_output(3);
        let first = analyzer.analyze(&raw, "nmap").await;
        let second = analyzer.analyze(&raw, "nmap").await;

        assert_eq!(first, second);
        assert!(first.has_vulnerabilities);
        assert_eq!(first.vulnerability, "Open Ports");
        assert_eq!(first.severity, Severity::Medium);
        assert!(first.description.contains('3'));
    }

    #[test]
    fn unknown_tool_and_empty_results_are_low() {
        let verdict = heuristic_verdict(&nmap_output(2), "zap");
        assert!(!verdict.has_vulnerabilities);
        assert_eq!(verdict.vulnerability, "Unknown");
        assert_eq!(verdict.severity, Severity::Low);

        let verdict = heuristic_verdict(&nmap_output(0), "nmap");
        assert!(!verdict.has_vulnerabilities);

        let failed = RawOutput::failure("sqlmap".into(), OutcomeKind::Timeout, "sqlmap scan timed out".into());
        let verdict = heuristic_verdict(&failed, "sqlmap");
        assert!(verdict.description.contains("timed out"));
    }

    #[test]
    fn strict_json_is_extracted_from_prose() {
        let reply = r#"Here is my assessment:
{"has_vulnerabilities": true, "vulnerability": "SQL Injection", "severity": "critical",
 "description": "id parameter injectable", "solution": "Use prepared statements"}
Thanks."#;
        let verdict = parse_response(reply, "sqlmap");
        assert_eq!(verdict.severity, Severity::Critical);
        assert_eq!(verdict.remediation, "Use prepared statements");
    }

    #[test]
    fn free_text_falls_back_to_keywords() {
        let reply = "The target exposes a HIGH risk service.\nRemediation: disable telnet";
        let verdict = parse_response(reply, "nmap");
        assert!(verdict.has_vulnerabilities);
        assert_eq!(verdict.severity, Severity::High);
        assert_eq!(verdict.vulnerability, "nmap findings");
        assert_eq!(verdict.remediation, "disable telnet");

        let verdict = parse_response("All clear.", "nikto");
        assert!(!verdict.has_vulnerabilities);
        assert_eq!(verdict.severity, Severity::Medium);
        assert_eq!(verdict.remediation, GENERIC_REMEDIATION);
    }

    #[test]
    fn prompt_respects_byte_budget_on_char_boundary() {
        let mut raw = nmap_output(1);
        raw.stdout = "é".repeat(2000);
        let prompt = build_prompt(&raw, "nmap", 101);
        assert!(prompt.contains("Analyze the following nmap scan results"));
        assert_eq!(truncate_to("ééé", 3), "é");
        assert_eq!(truncate_to("abc", 10), "abc");
    }

    #[tokio::test]
    async fn classifier_failure_degrades_to_heuristic() {
        let mock = Arc::new(MockClassifier::failing());
        let analyzer = Analyzer::with_classifier(mock.clone());
        let verdict = analyzer.analyze(&nmap_output(2), "nmap").await;

        assert_eq!(mock.call_count(), 1);
        assert_eq!(verdict, heuristic_verdict(&nmap_output(2), "nmap"));
    }

    #[tokio::test]
    async fn classifier_reply_is_used_when_available() {
        let mock = Arc::new(MockClassifier::replying(
            r#"{"has_vulnerabilities": false, "vulnerability": "None", "severity": "low",
                "description": "nothing found", "remediation": "none"}"#,
        ));
        let analyzer = Analyzer::with_classifier(mock.clone()).with_prompt_budget(64);
        let verdict = analyzer.analyze(&nmap_output(5), "nmap").await;

        assert!(!verdict.has_vulnerabilities);
        assert_eq!(verdict.description, "nothing found");
        assert!(mock.last_prompt().unwrap().contains("nmap"));
    }
}
