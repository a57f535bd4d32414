//! Netstat/SNMP counters component: parses the paragraph-based procfs
//! format shared by `/proc/net/netstat` and `/proc/net/snmp`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetstatError {
    #[error("netstat paragraph '{0}' has a header/value field/value mismatch")]
    FieldValueMismatch(String),
    #[error("netstat header line missing trailing colon: {0}")]
    MissingColon(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reduced set of counters this component exposes, per the contract.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetstatCounters {
    #[serde(rename = "TCP.RetransSegs")]
    pub tcp_retrans_segs: u64,
    #[serde(rename = "TcpExt.TCPSegRetrans")]
    pub tcp_ext_seg_retrans: u64,
    #[serde(rename = "UDP.InErrors")]
    pub udp_in_errors: u64,
    #[serde(rename = "UDP.RcvbufErrors")]
    pub udp_rcvbuf_errors: u64,
    #[serde(rename = "UDP.SndbufErrors")]
    pub udp_sndbuf_errors: u64,
}

/// One parsed `Proto: field value` table, keyed by field name.
type ProtoFields = BTreeMap<String, BTreeMap<String, i64>>;

/// Parse a full file's worth of paragraphs (alternating header/value
/// line pairs, possibly several protocols per file) into a map of
/// `protocol -> {field: value}`.
pub fn parse_paragraphs(contents: &str) -> Result<ProtoFields, NetstatError> {
    let mut out = ProtoFields::new();
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());

    while let Some(header) = lines.next() {
        let Some(value_line) = lines.next() else {
            break;
        };

        let (proto, fields) = split_header(header)?;
        let (value_proto, values) = split_header(value_line)?;

        if proto != value_proto {
            return Err(NetstatError::FieldValueMismatch(proto));
        }
        if fields.len() != values.len() {
            return Err(NetstatError::FieldValueMismatch(proto));
        }

        let entry = out.entry(proto).or_default();
        for (field, raw_value) in fields.iter().zip(values.iter()) {
            let parsed: i64 = raw_value.parse().unwrap_or(0);
            let normalized = if parsed < 0 { 0 } else { parsed };
            entry.insert((*field).to_string(), normalized);
        }
    }

    Ok(out)
}

fn split_header(line: &str) -> Result<(String, Vec<&str>), NetstatError> {
    let (proto, rest) = line
        .split_once(':')
        .ok_or_else(|| NetstatError::MissingColon(line.to_string()))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Ok((proto.trim().to_string(), fields))
}

fn get(merged: &ProtoFields, proto: &str, field: &str) -> u64 {
    merged
        .get(proto)
        .and_then(|fields| fields.get(field))
        .copied()
        .unwrap_or(0) as u64
}

/// Merge the parsed tables from the netstat and snmp files: later wins on
/// conflicting protocol/field pairs.
fn merge(base: ProtoFields, overlay: ProtoFields) -> ProtoFields {
    let mut merged = base;
    for (proto, fields) in overlay {
        merged.entry(proto).or_default().extend(fields);
    }
    merged
}

fn extract_counters(merged: &ProtoFields) -> NetstatCounters {
    NetstatCounters {
        tcp_retrans_segs: get(merged, "Tcp", "RetransSegs"),
        tcp_ext_seg_retrans: get(merged, "TcpExt", "TCPSegRetrans"),
        udp_in_errors: get(merged, "Udp", "InErrors"),
        udp_rcvbuf_errors: get(merged, "Udp", "RcvbufErrors"),
        udp_sndbuf_errors: get(merged, "Udp", "SndbufErrors"),
    }
}

pub struct NetstatComponent {
    netstat_path: PathBuf,
    snmp_path: PathBuf,
    counter: FailureCounter,
    cache: ResultCache,
}

impl NetstatComponent {
    #[must_use]
    pub fn new(netstat_path: impl Into<PathBuf>, snmp_path: impl Into<PathBuf>) -> Self {
        Self {
            netstat_path: netstat_path.into(),
            snmp_path: snmp_path.into(),
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("netstat"),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new("/proc/net/netstat", "/proc/net/snmp")
    }

    fn read(path: &Path) -> Result<String, NetstatError> {
        std::fs::read_to_string(path).map_err(|source| NetstatError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    fn compute(&self) -> Result<NetstatCounters, NetstatError> {
        let netstat = parse_paragraphs(&Self::read(&self.netstat_path)?)?;
        let snmp = parse_paragraphs(&Self::read(&self.snmp_path)?)?;
        let merged = merge(netstat, snmp);
        Ok(extract_counters(&merged))
    }
}

#[async_trait]
impl Component for NetstatComponent {
    fn name(&self) -> &str {
        "netstat"
    }

    async fn check(&self) -> CheckResult {
        let raw = match self.compute() {
            Ok(counters) => {
                let data = serde_json::to_value(&counters).unwrap_or_default();
                CheckResult::new(self.name(), Health::Healthy, "netstat counters collected")
                    .with_extra_info(ExtraInfo::json(data))
            }
            Err(e) => {
                CheckResult::new(self.name(), Health::Unhealthy, "failed to read netstat counters")
                    .with_error(e.to_string())
            }
        };
        let result = self.counter.apply("read netstat counters", raw);
        self.cache.store(result.clone()).await;
        result
    }

    async fn last_health_states(&self) -> Vec<HealthState> {
        self.cache.last_health_states().await
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_merges_netstat_and_snmp_counters() {
        let netstat_contents = "TcpExt: SyncookiesSent TCPSegRetrans\nTcpExt: 0 123\n";
        let snmp_contents = "Tcp: Foo RetransSegs\nTcp: 1 42\nUdp: InDatagrams NoPorts InErrors OutDatagrams RcvbufErrors SndbufErrors\nUdp: 1000 10 2 1100 7 9\n";

        let netstat = parse_paragraphs(netstat_contents).unwrap();
        let snmp = parse_paragraphs(snmp_contents).unwrap();
        let merged = merge(netstat, snmp);
        let counters = extract_counters(&merged);

        assert_eq!(counters.tcp_retrans_segs, 42);
        assert_eq!(counters.tcp_ext_seg_retrans, 123);
        assert_eq!(counters.udp_in_errors, 2);
        assert_eq!(counters.udp_rcvbuf_errors, 7);
        assert_eq!(counters.udp_sndbuf_errors, 9);
    }

    #[test]
    fn negative_counter_normalizes_to_zero() {
        let contents = "Udp: InErrors\nUdp: -1\n";
        let parsed = parse_paragraphs(contents).unwrap();
        assert_eq!(*parsed.get("Udp").unwrap().get("InErrors").unwrap(), 0);
    }

    #[test]
    fn missing_keys_default_to_zero() {
        let merged = ProtoFields::new();
        let counters = extract_counters(&merged);
        assert_eq!(counters.tcp_retrans_segs, 0);
        assert_eq!(counters.udp_sndbuf_errors, 0);
    }

    #[test]
    fn field_value_count_mismatch_is_rejected() {
        let contents = "Tcp: A B C\nTcp: 1 2\n";
        let err = parse_paragraphs(contents).unwrap_err();
        assert!(matches!(err, NetstatError::FieldValueMismatch(_)));
        assert!(err.to_string().contains("field/value mismatch"));
    }

    #[test]
    fn missing_colon_header_is_rejected() {
        let contents = "Tcp A B\n1 2\n";
        let err = parse_paragraphs(contents).unwrap_err();
        assert!(matches!(err, NetstatError::MissingColon(_)));
    }

    #[test]
    fn mismatched_protocol_between_header_and_value_line_is_rejected() {
        let contents = "Tcp: A\nUdp: 1\n";
        let err = parse_paragraphs(contents).unwrap_err();
        assert!(matches!(err, NetstatError::FieldValueMismatch(_)));
    }
}
