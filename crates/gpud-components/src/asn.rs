//! ASN / cloud-provider lookup.
//!
//! This is a *contract*, not a registered [`gpud_core::Component`]: it is
//! consumed by machine-info gathering, which `spec.md` places out of
//! scope as an external collaborator. The lookup function itself is one
//! of the four illustrative built-in contracts and is implemented here in
//! full, grounded in the same procfs/sysfs-adjacent "parse a small
//! external format defensively" style as [`crate::netstat`] and
//! [`crate::infiniband`].

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

const CYMRU_DNS_SERVER: &str = "8.8.8.8:53";
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AsnError {
    #[error("primary ASN endpoint request failed: {0}")]
    PrimaryRequest(String),
    #[error("cymru DNS lookup failed: {0}")]
    CymruLookup(String),
    #[error("no ASN information available for this address")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsnInfo {
    pub asn: String,
    pub name: String,
    pub country: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub primary_endpoint: Option<String>,
    pub primary_retries: u32,
    pub retry_sleep: Duration,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            primary_endpoint: None,
            primary_retries: 3,
            retry_sleep: Duration::from_millis(200),
        }
    }
}

/// The canonical provider slugs this lookup normalizes towards. Matched as
/// case-insensitive substrings against the raw ASN org name.
const PROVIDER_KEYWORDS: &[(&str, &str)] = &[
    ("amazon", "aws"),
    ("aws", "aws"),
    ("microsoft", "azure"),
    ("azure", "azure"),
    ("google", "gcp"),
    ("gcp", "gcp"),
    ("yotta", "yotta"),
    ("nebius", "nebius"),
    ("oracle", "oci"),
    ("digitalocean", "digitalocean"),
    ("hetzner", "hetzner"),
];

/// Resolve ASN + org name for `ip`, trying the primary HTTP endpoint first
/// and falling back to a two-step Team Cymru TXT DNS lookup when the
/// primary errors or returns an empty name.
pub async fn get_as_lookup(
    client: &reqwest::Client,
    ip: std::net::IpAddr,
    opts: &LookupOptions,
) -> Result<AsnInfo, AsnError> {
    if let Some(endpoint) = &opts.primary_endpoint {
        match query_primary(client, endpoint, ip, opts.primary_retries, opts.retry_sleep).await {
            Ok(info) if !info.name.trim().is_empty() => return Ok(info),
            Ok(_) => debug!("primary ASN endpoint returned an empty name, falling back to cymru"),
            Err(e) => debug!(error = %e, "primary ASN endpoint failed, falling back to cymru"),
        }
    }

    cymru_lookup(ip).await
}

async fn query_primary(
    client: &reqwest::Client,
    endpoint: &str,
    ip: std::net::IpAddr,
    retries: u32,
    sleep: Duration,
) -> Result<AsnInfo, AsnError> {
    let url = format!("{endpoint}?ip={ip}");
    let mut last_err = String::new();

    for attempt in 0..=retries {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| AsnError::PrimaryRequest(e.to_string()))?;
                let asn = body.get("asn").and_then(serde_json::Value::as_str).unwrap_or_default();
                let name = body
                    .get("org")
                    .or_else(|| body.get("name"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                let (clean_name, country) = split_trailing_country(name);
                return Ok(AsnInfo {
                    asn: asn.to_string(),
                    name: clean_name,
                    country,
                });
            }
            Ok(resp) => last_err = format!("HTTP {}", resp.status()),
            Err(e) => last_err = e.to_string(),
        }
        if attempt < retries {
            tokio::time::sleep(sleep).await;
        }
    }

    Err(AsnError::PrimaryRequest(last_err))
}

/// Strip a trailing `", <country>"` suffix from a raw ASN org name,
/// returning the cleaned, lowercased, trimmed name and the country if
/// present.
fn split_trailing_country(raw: &str) -> (String, Option<String>) {
    let trimmed = raw.trim();
    match trimmed.rsplit_once(',') {
        Some((name, country)) => (name.trim().to_lowercase(), Some(country.trim().to_string())),
        None => (trimmed.to_lowercase(), None),
    }
}

/// Canonicalize a raw ASN org/name string to one of the fixed provider
/// slugs, or the lowercased trimmed input when no keyword matches.
#[must_use]
pub fn normalize_asn_name(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    for (keyword, slug) in PROVIDER_KEYWORDS {
        if lower.contains(keyword) {
            return (*slug).to_string();
        }
    }
    lower
}

async fn cymru_lookup(ip: std::net::IpAddr) -> Result<AsnInfo, AsnError> {
    let origin_query = match ip {
        std::net::IpAddr::V4(v4) => format!("{}.origin.asn.cymru.com", reverse_ipv4(v4)),
        std::net::IpAddr::V6(v6) => format!("{}.origin6.asn.cymru.com", reverse_ipv6_nibbles(v6)),
    };

    let origin_txt = dns_txt_query(&origin_query)
        .await
        .map_err(AsnError::CymruLookup)?;
    let (asn, _range) = parse_origin_txt(&origin_txt).ok_or(AsnError::NotFound)?;

    let name_query = format!("AS{asn}.asn.cymru.com");
    let name_txt = dns_txt_query(&name_query).await.map_err(AsnError::CymruLookup)?;
    let (raw_name, country) = parse_name_txt(&name_txt).ok_or(AsnError::NotFound)?;

    Ok(AsnInfo {
        asn,
        name: raw_name.trim().to_lowercase(),
        country,
    })
}

/// Reverse an IPv4 address's octets, e.g. `1.2.3.4` -> `4.3.2.1`.
fn reverse_ipv4(addr: Ipv4Addr) -> String {
    let octets = addr.octets();
    format!("{}.{}.{}.{}", octets[3], octets[2], octets[1], octets[0])
}

/// Reverse an IPv6 address's nibbles, dot-separated, per the `ip6.arpa`
/// convention Cymru's `origin6` zone reuses.
fn reverse_ipv6_nibbles(addr: Ipv6Addr) -> String {
    let segments = addr.octets();
    let mut nibbles = Vec::with_capacity(32);
    for byte in segments {
        nibbles.push(byte & 0x0F);
        nibbles.push(byte >> 4);
    }
    nibbles
        .iter()
        .rev()
        .map(|n| format!("{n:x}"))
        .collect::<Vec<_>>()
        .join(".")
}

/// Parses `"<asn> | <range> | <cc> | <registry> | <date>"` from the
/// origin TXT record.
fn parse_origin_txt(txt: &str) -> Option<(String, String)> {
    let mut parts = txt.split('|').map(str::trim);
    let asn = parts.next()?.split_whitespace().next()?.to_string();
    let range = parts.next().unwrap_or_default().to_string();
    Some((asn, range))
}

/// Parses `"<asn> | <cc> | <registry> | <date> | <name>"` from the
/// AS-name TXT record.
fn parse_name_txt(txt: &str) -> Option<(String, Option<String>)> {
    let parts: Vec<&str> = txt.split('|').map(str::trim).collect();
    let name_field = parts.get(4).copied()?;
    let (name, country) = split_trailing_country(name_field);
    Some((name, country))
}

async fn dns_txt_query(qname: &str) -> Result<String, String> {
    let query = build_dns_txt_query(qname);
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| e.to_string())?;
    socket
        .connect(CYMRU_DNS_SERVER)
        .await
        .map_err(|e| e.to_string())?;
    socket.send(&query).await.map_err(|e| e.to_string())?;

    let mut buf = [0u8; 512];
    let n = timeout(DNS_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| "dns query timed out".to_string())?
        .map_err(|e| e.to_string())?;

    parse_dns_txt_response(&buf[..n])
}

fn build_dns_txt_query(qname: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(32 + qname.len());
    // Header: id, flags (recursion desired), qdcount=1, an/ns/ar=0.
    packet.extend_from_slice(&[0x13, 0x37]);
    packet.extend_from_slice(&[0x01, 0x00]);
    packet.extend_from_slice(&[0x00, 0x01]);
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.extend_from_slice(&[0x00, 0x00]);

    for label in qname.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&[0x00, 0x10]); // QTYPE TXT
    packet.extend_from_slice(&[0x00, 0x01]); // QCLASS IN
    packet
}

fn parse_dns_txt_response(buf: &[u8]) -> Result<String, String> {
    if buf.len() < 12 {
        return Err("dns response too short".to_string());
    }
    let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    if ancount == 0 {
        return Err("dns response carried no answers".to_string());
    }

    let mut pos = 12;
    pos = skip_name(buf, pos)?;
    pos += 4; // qtype + qclass

    let mut texts = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(buf, pos)?;
        if pos + 10 > buf.len() {
            return Err("dns answer record truncated".to_string());
        }
        let rdlength = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > buf.len() {
            return Err("dns answer rdata truncated".to_string());
        }
        let rdata = &buf[pos..pos + rdlength];
        texts.push(parse_txt_rdata(rdata));
        pos += rdlength;
    }

    texts
        .into_iter()
        .next()
        .ok_or_else(|| "no TXT record found".to_string())
}

fn parse_txt_rdata(rdata: &[u8]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < rdata.len() {
        let len = rdata[i] as usize;
        i += 1;
        if i + len > rdata.len() {
            break;
        }
        out.push_str(&String::from_utf8_lossy(&rdata[i..i + len]));
        i += len;
    }
    out
}

fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, String> {
    loop {
        if pos >= buf.len() {
            return Err("dns name ran past buffer end".to_string());
        }
        let len = buf[pos];
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Ok(pos + 2); // compressed pointer
        }
        pos += 1 + len as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverses_ipv4_octets() {
        assert_eq!(reverse_ipv4(Ipv4Addr::new(1, 2, 3, 4)), "4.3.2.1");
    }

    #[test]
    fn reverses_ipv6_nibbles() {
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let reversed = reverse_ipv6_nibbles(addr);
        assert!(reversed.ends_with("8.b.d.0.1.0.0.2"));
        assert!(reversed.starts_with("1.0.0.0"));
    }

    #[test]
    fn normalizes_known_provider_keywords() {
        assert_eq!(normalize_asn_name("AMAZON-AES"), "aws");
        assert_eq!(normalize_asn_name("GOOGLE-CLOUD"), "gcp");
        assert_eq!(normalize_asn_name("Some Random ISP"), "some random isp");
    }

    #[test]
    fn splits_trailing_country_suffix() {
        let (name, country) = split_trailing_country("Some Provider, US");
        assert_eq!(name, "some provider");
        assert_eq!(country.as_deref(), Some("US"));
    }

    #[test]
    fn parses_origin_txt_record() {
        let txt = "15169 | 8.8.8.0/24 | US | arin | 2023-01-01";
        let (asn, range) = parse_origin_txt(txt).unwrap();
        assert_eq!(asn, "15169");
        assert_eq!(range, "8.8.8.0/24");
    }

    #[test]
    fn parses_name_txt_record() {
        let txt = "15169 | US | arin | 2000-03-30 | GOOGLE, US";
        let (name, country) = parse_name_txt(txt).unwrap();
        assert_eq!(name, "google");
        assert_eq!(country.as_deref(), Some("US"));
    }

    #[test]
    fn dns_query_bytes_carry_the_qname_as_labels() {
        let packet = build_dns_txt_query("8.8.8.8.origin.asn.cymru.com");
        assert_eq!(packet[2], 0x01);
        assert!(packet.windows(5).any(|w| w == b"origi"));
    }
}
