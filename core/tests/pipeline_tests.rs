#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use vulnscan_core::tools::ToolSettings;
use vulnscan_core::{
    AnalysisMode, Analyzer, Dispatcher, NewScan, OutcomeKind, ProcessRunner, ScanEngine,
    ScanStatus, ScanStore, ScanType, SqliteStore, ToolKind,
};

const SQLMAP: &str = r#"
echo "[INFO] testing 'AND boolean-based blind'"
echo "GET parameter 'id' is vulnerable. Do you want to keep testing the others?"
"#;

const NMAP: &str = r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "-oX" ]; then out="$2"; fi
  shift
done
cat > "$out" <<'EOF'
<nmaprun scanner="nmap" version="7.94">
<host><ports>
<port protocol="tcp" portid="22"><state state="open"/><service name="ssh"/></port>
<port protocol="tcp" portid="80"><state state="open"/><service name="http"/></port>
<port protocol="tcp" portid="81"><state state="closed"/><service name="hosts2-ns"/></port>
</ports></host></nmaprun>
EOF
"#;

const NIKTO: &str = r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
cat > "$out" <<'EOF'
{"host": "example.com", "vulnerabilities": [
  {"id": "999986", "msg": "The X-Content-Type-Options header is not set.", "url": "/"}
]}
EOF
"#;

fn scripted(kind: ToolKind, script: &str) -> ProcessRunner {
    let settings = ToolSettings {
        command: vec!["sh".into(), "-c".into(), script.into(), kind.name().into()],
        ..Default::default()
    };
    ProcessRunner::new(kind, settings)
}

async fn engine(store: Arc<SqliteStore>, nikto: ProcessRunner) -> ScanEngine {
    let mut dispatcher = Dispatcher::new(store.clone());
    dispatcher.register_runner(scripted(ToolKind::Sqlmap, SQLMAP));
    dispatcher.register_runner(scripted(ToolKind::Nmap, NMAP));
    dispatcher.register_runner(nikto);
    ScanEngine::new(store, dispatcher, Analyzer::heuristic_only(), AnalysisMode::Inline)
}

#[tokio::test]
async fn scripted_tools_flow_through_sqlite() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let engine = engine(store.clone(), scripted(ToolKind::Nikto, NIKTO)).await;
    let scan = store
        .create_scan(NewScan::new(9, "https://example.com/item?id=1", ScanType::Full))
        .await
        .unwrap();

    let summary = engine.execute(scan.id).await;
    assert!(summary.success, "{:?}", summary.error);
    assert_eq!(summary.results["sqlmap"].vulnerabilities_found, 1);
    assert_eq!(summary.results["nmap"].vulnerabilities_found, 2);
    assert_eq!(summary.results["nikto"].vulnerabilities_found, 1);
    assert_eq!(summary.total_vulnerabilities, 4);

    let stored = store.get_scan(scan.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ScanStatus::Completed);
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.high_severity_count, 1);
    assert_eq!(stored.medium_severity_count, 3);

    let results = store.list_tool_results(scan.id).await.unwrap();
    assert_eq!(results.len(), 3);
    let nmap = results.iter().find(|r| r.tool_name == "nmap").unwrap();
    assert_eq!(nmap.tool_version.as_deref(), Some("7.94"));
    assert!(nmap.raw_output.command.contains("-Pn example.com"));
    let verdict = nmap.ai_analysis.as_ref().unwrap();
    assert_eq!(verdict.vulnerability, "Open Ports");
    assert!(verdict.description.contains('2'));
}

#[tokio::test]
async fn slow_tool_times_out_without_failing_the_scan() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let slow = scripted(ToolKind::Nikto, "sleep 30").with_deadline(Duration::from_millis(300));
    let engine = engine(store.clone(), slow).await;
    let scan = store
        .create_scan(NewScan::new(9, "https://example.com/item?id=1", ScanType::Quick))
        .await
        .unwrap();

    let summary = engine.execute(scan.id).await;
    assert!(summary.success);
    let nikto = &summary.results["nikto"];
    assert!(!nikto.success);
    assert_eq!(nikto.outcome, OutcomeKind::Timeout);
    assert_eq!(summary.total_vulnerabilities, 3);

    let results = store.list_tool_results(scan.id).await.unwrap();
    let nikto = results.iter().find(|r| r.tool_name == "nikto").unwrap();
    assert_eq!(nikto.raw_output.outcome, OutcomeKind::Timeout);
    assert!(nikto.raw_output.error.as_deref().unwrap().contains("timed out"));
}
