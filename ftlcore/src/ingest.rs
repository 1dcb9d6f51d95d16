//! Ingest candidate list handling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// RTT recorded for a host that never answered the probe.
pub const UNREACHABLE_RTT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCandidate {
    pub name: String,
    #[serde(default)]
    pub ip: String,
    pub hostname: String,
    /// Filled by the probe round.
    #[serde(skip)]
    pub rtt: Option<Duration>,
}

impl IngestCandidate {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: String::new(),
            hostname: hostname.into(),
            rtt: None,
        }
    }

    /// Address to probe: the literal IP when the directory supplied one.
    pub fn probe_host(&self) -> &str {
        if self.ip.is_empty() {
            &self.hostname
        } else {
            &self.ip
        }
    }
}

/// Parses the `[{"name", "ip", "hostname"}, ...]` ingest list format.
/// Entries missing a hostname are skipped.
pub fn parse_ingest_list(json: &str) -> Result<Vec<IngestCandidate>, serde_json::Error> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<IngestCandidate>(entry).ok())
        .filter(|c| !c.hostname.is_empty())
        .collect())
}

/// Lowest measured RTT; unprobed candidates never win.
pub fn best_candidate(candidates: &[IngestCandidate]) -> Option<&IngestCandidate> {
    candidates
        .iter()
        .filter(|c| c.rtt.is_some())
        .min_by_key(|c| c.rtt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ingest_list() {
        let json = r#"[
            {"name": "US: Seattle", "ip": "10.0.0.1", "hostname": "ingest-sea.example.net"},
            {"name": "EU: Amsterdam", "hostname": "ingest-ams.example.net"},
            {"name": "broken"},
            {"name": "blank", "hostname": ""}
        ]"#;
        let list = parse_ingest_list(json).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].probe_host(), "10.0.0.1");
        assert_eq!(list[1].probe_host(), "ingest-ams.example.net");
        assert!(list.iter().all(|c| c.rtt.is_none()));

        assert!(parse_ingest_list("{}").is_err());
    }

    #[test]
    fn test_best_candidate() {
        let mut list = vec![
            IngestCandidate::new("a", "a.example"),
            IngestCandidate::new("b", "b.example"),
            IngestCandidate::new("c", "c.example"),
        ];
        assert!(best_candidate(&list).is_none());

        list[0].rtt = Some(Duration::from_millis(80));
        list[1].rtt = Some(Duration::from_millis(25));
        list[2].rtt = Some(UNREACHABLE_RTT);
        assert_eq!(best_candidate(&list).unwrap().name, "b");
    }
}
