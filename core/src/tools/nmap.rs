use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use super::{target_host, OpenPort, ParsedSummary};

pub fn args(target: &str, report_path: &Path) -> Vec<String> {
    vec![
        "-T4".to_string(),
        "-F".to_string(),
        "-Pn".to_string(),
        target_host(target),
        "-oX".to_string(),
        report_path.display().to_string(),
    ]
}

fn port_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<port\s([^>]*)>(.*?)</port>").expect("static regex"))
}

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([\w-]+)="([^"]*)""#).expect("static regex"))
}

fn state_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<state\b[^>]*\bstate="([^"]*)""#).expect("static regex"))
}

fn service_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<service\b[^>]*\bname="([^"]*)""#).expect("static regex"))
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<nmaprun\b[^>]*\bversion="([^"]*)""#).expect("static regex"))
}

/// Open ports and the services behind them, from an `-oX` report.
pub fn parse(xml: &str) -> Result<ParsedSummary, String> {
    if xml.trim().is_empty() {
        return Err("nmap produced an empty XML report".to_string());
    }
    if !xml.contains("<nmaprun") {
        return Err("nmap report is not an nmaprun document".to_string());
    }

    let mut open_ports = Vec::new();
    let mut services = BTreeSet::new();

    for caps in port_regex().captures_iter(xml) {
        let mut port_id = None;
        let mut protocol = String::from("unknown");
        for attr in attr_regex().captures_iter(&caps[1]) {
            match &attr[1] {
                "portid" => port_id = attr[2].parse::<u16>().ok(),
                "protocol" => protocol = attr[2].to_string(),
                _ => {}
            }
        }
        let Some(port) = port_id else {
            continue;
        };

        let body = &caps[2];
        let state = state_regex()
            .captures(body)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if state != "open" {
            continue;
        }
        let service = service_regex()
            .captures(body)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "unknown".to_string());

        services.insert(service.clone());
        open_ports.push(OpenPort {
            port,
            protocol,
            state,
            service,
        });
    }

    Ok(ParsedSummary::Ports {
        open_ports,
        services: services.into_iter().collect(),
    })
}

pub fn parse_version(xml: &str) -> Option<String> {
    version_regex().captures(xml).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nmaprun scanner="nmap" args="nmap -T4 -F -Pn example.com" start="1700000000" version="7.94" xmloutputversion="1.05">
<host><status state="up" reason="user-set"/>
<address addr="93.184.216.34" addrtype="ipv4"/>
<ports><extraports state="filtered" count="97"/>
<port protocol="tcp" portid="22"><state state="closed" reason="reset"/><service name="ssh" method="table" conf="3"/></port>
<port protocol="tcp" portid="80"><state state="open" reason="syn-ack"/><service name="http" method="table" conf="3"/></port>
<port protocol="tcp" portid="443"><state state="open" reason="syn-ack"/><service name="https" method="table" conf="3"/></port>
<port protocol="tcp" portid="8080"><state state="open" reason="syn-ack"/><service name="http" method="table" conf="3"/></port>
</ports>
</host>
</nmaprun>"#;

    #[test]
    fn collects_only_open_ports() {
        let summary = parse(REPORT).unwrap();
        match summary {
            ParsedSummary::Ports { open_ports, services } => {
                let ports: Vec<u16> = open_ports.iter().map(|p| p.port).collect();
                assert_eq!(ports, vec![80, 443, 8080]);
                assert!(open_ports.iter().all(|p| p.protocol == "tcp" && p.state == "open"));
                assert_eq!(services, vec!["http".to_string(), "https".to_string()]);
            }
            other => panic!("unexpected summary: {:?}", other),
        }
    }

    #[test]
    fn reads_scanner_version() {
        assert_eq!(parse_version(REPORT).as_deref(), Some("7.94"));
        assert_eq!(parse_version("<nmaprun scanner=\"nmap\">"), None);
    }

    #[test]
    fn empty_or_foreign_reports_are_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("<html>not nmap</html>").is_err());
    }

    #[test]
    fn report_without_ports_has_no_findings() {
        let xml = r#"<nmaprun scanner="nmap" version="7.94"><host><status state="down"/></host></nmaprun>"#;
        assert_eq!(parse(xml).unwrap().finding_count(), 0);
    }

    #[test]
    fn scans_the_host_part_of_the_url() {
        let args = args("https://example.com/app", Path::new("/tmp/scan.xml"));
        assert_eq!(args[3], "example.com");
        assert_eq!(&args[4..], &["-oX".to_string(), "/tmp/scan.xml".to_string()]);
    }
}
