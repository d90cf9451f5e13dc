//! Rule matchers.
//!
//! # Responsibilities
//! - Evaluate one condition against connection metadata
//! - Report the rule type and payload for the reporting façade
//! - Say whether the condition needs a resolved destination IP
//!
//! # Design Decisions
//! - Domains are compared lowercase with any trailing dot removed
//! - IP conditions never match a connection without an IP; resolving is the
//!   dispatcher's job, so matching stays pure
//! - No regex: every matcher is a string, CIDR or integer comparison

use std::fmt;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;

use ipnet::IpNet;
use serde::Serialize;

use crate::tunnel::{normalize_host, Metadata, Network};

/// Rule kinds as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleType {
    Domain,
    DomainSuffix,
    DomainKeyword,
    #[serde(rename = "GeoIP")]
    GeoIp,
    #[serde(rename = "IPCIDR")]
    IpCidr,
    #[serde(rename = "SrcIPCIDR")]
    SrcIpCidr,
    SrcPort,
    DstPort,
    Process,
    Network,
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
    #[serde(rename = "NOT")]
    Not,
    Match,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleType::Domain => "Domain",
            RuleType::DomainSuffix => "DomainSuffix",
            RuleType::DomainKeyword => "DomainKeyword",
            RuleType::GeoIp => "GeoIP",
            RuleType::IpCidr => "IPCIDR",
            RuleType::SrcIpCidr => "SrcIPCIDR",
            RuleType::SrcPort => "SrcPort",
            RuleType::DstPort => "DstPort",
            RuleType::Process => "Process",
            RuleType::Network => "Network",
            RuleType::And => "AND",
            RuleType::Or => "OR",
            RuleType::Not => "NOT",
            RuleType::Match => "Match",
        };
        f.write_str(s)
    }
}

/// A single rule condition.
pub trait Matcher: Send + Sync + fmt::Debug {
    /// Returns true if the connection satisfies this condition.
    fn matches(&self, metadata: &Metadata) -> bool;

    fn rule_type(&self) -> RuleType;

    fn payload(&self) -> String;

    /// True when this condition inspects the destination IP and may resolve
    /// a domain to get one.
    fn should_resolve_ip(&self) -> bool {
        false
    }
}

/// Exact domain.
#[derive(Debug, Clone)]
pub struct DomainMatcher {
    domain: String,
}

impl DomainMatcher {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: normalize_host(domain),
        }
    }
}

impl Matcher for DomainMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        !metadata.host.is_empty() && normalize_host(&metadata.host) == self.domain
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Domain
    }

    fn payload(&self) -> String {
        self.domain.clone()
    }
}

/// Domain or any of its subdomains.
#[derive(Debug, Clone)]
pub struct DomainSuffixMatcher {
    suffix: String,
}

impl DomainSuffixMatcher {
    pub fn new(suffix: &str) -> Self {
        Self {
            suffix: normalize_host(suffix.trim_start_matches('.')),
        }
    }
}

impl Matcher for DomainSuffixMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        if metadata.host.is_empty() {
            return false;
        }
        let host = normalize_host(&metadata.host);
        host == self.suffix
            || (host.len() > self.suffix.len()
                && host.ends_with(self.suffix.as_str())
                && host.as_bytes()[host.len() - self.suffix.len() - 1] == b'.')
    }

    fn rule_type(&self) -> RuleType {
        RuleType::DomainSuffix
    }

    fn payload(&self) -> String {
        self.suffix.clone()
    }
}

/// Domain containing a keyword.
#[derive(Debug, Clone)]
pub struct DomainKeywordMatcher {
    keyword: String,
}

impl DomainKeywordMatcher {
    pub fn new(keyword: &str) -> Self {
        Self {
            keyword: keyword.to_ascii_lowercase(),
        }
    }
}

impl Matcher for DomainKeywordMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        !metadata.host.is_empty() && normalize_host(&metadata.host).contains(self.keyword.as_str())
    }

    fn rule_type(&self) -> RuleType {
        RuleType::DomainKeyword
    }

    fn payload(&self) -> String {
        self.keyword.clone()
    }
}

/// Maps an IP address to an ISO country code.
pub trait CountryLookup: Send + Sync + fmt::Debug {
    fn country(&self, ip: IpAddr) -> Option<String>;
}

/// Lookup without a database: reports `LAN` for private, loopback and
/// link-local addresses and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LanCountryLookup;

impl CountryLookup for LanCountryLookup {
    fn country(&self, ip: IpAddr) -> Option<String> {
        is_lan(ip).then(|| "LAN".to_string())
    }
}

fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Destination country.
#[derive(Debug, Clone)]
pub struct GeoIpMatcher {
    country: String,
    lookup: Arc<dyn CountryLookup>,
    no_resolve: bool,
}

impl GeoIpMatcher {
    pub fn new(country: &str, lookup: Arc<dyn CountryLookup>, no_resolve: bool) -> Self {
        Self {
            country: country.to_ascii_uppercase(),
            lookup,
            no_resolve,
        }
    }
}

impl Matcher for GeoIpMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        metadata
            .dst_ip
            .and_then(|ip| self.lookup.country(ip))
            .is_some_and(|c| c.eq_ignore_ascii_case(&self.country))
    }

    fn rule_type(&self) -> RuleType {
        RuleType::GeoIp
    }

    fn payload(&self) -> String {
        self.country.clone()
    }

    fn should_resolve_ip(&self) -> bool {
        !self.no_resolve
    }
}

/// Destination or source address inside a CIDR block.
#[derive(Debug, Clone)]
pub struct IpCidrMatcher {
    net: IpNet,
    source: bool,
    no_resolve: bool,
}

impl IpCidrMatcher {
    pub fn destination(net: IpNet, no_resolve: bool) -> Self {
        Self {
            net,
            source: false,
            no_resolve,
        }
    }

    pub fn source(net: IpNet) -> Self {
        Self {
            net,
            source: true,
            no_resolve: true,
        }
    }
}

impl Matcher for IpCidrMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        let ip = if self.source { metadata.src_ip } else { metadata.dst_ip };
        ip.is_some_and(|ip| self.net.contains(&ip))
    }

    fn rule_type(&self) -> RuleType {
        if self.source {
            RuleType::SrcIpCidr
        } else {
            RuleType::IpCidr
        }
    }

    fn payload(&self) -> String {
        self.net.to_string()
    }

    fn should_resolve_ip(&self) -> bool {
        !self.source && !self.no_resolve
    }
}

/// Source or destination port, single or `low-high`.
#[derive(Debug, Clone)]
pub struct PortMatcher {
    ports: RangeInclusive<u16>,
    source: bool,
}

impl PortMatcher {
    pub fn new(ports: RangeInclusive<u16>, source: bool) -> Self {
        Self { ports, source }
    }
}

impl Matcher for PortMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        let port = if self.source { metadata.src_port } else { metadata.dst_port };
        self.ports.contains(&port)
    }

    fn rule_type(&self) -> RuleType {
        if self.source {
            RuleType::SrcPort
        } else {
            RuleType::DstPort
        }
    }

    fn payload(&self) -> String {
        if self.ports.start() == self.ports.end() {
            self.ports.start().to_string()
        } else {
            format!("{}-{}", self.ports.start(), self.ports.end())
        }
    }
}

/// Originating process name, compared case-insensitively against the
/// final path component.
#[derive(Debug, Clone)]
pub struct ProcessMatcher {
    name: String,
}

impl ProcessMatcher {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

impl Matcher for ProcessMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        metadata.process_name.as_deref().is_some_and(|process| {
            let base = process.rsplit(['/', '\\']).next().unwrap_or(process);
            base.eq_ignore_ascii_case(&self.name)
        })
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Process
    }

    fn payload(&self) -> String {
        self.name.clone()
    }
}

/// Transport network.
#[derive(Debug, Clone)]
pub struct NetworkMatcher {
    network: Network,
}

impl NetworkMatcher {
    pub fn new(network: Network) -> Self {
        Self { network }
    }
}

impl Matcher for NetworkMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        metadata.network == self.network
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Network
    }

    fn payload(&self) -> String {
        self.network.to_string().to_ascii_uppercase()
    }
}

/// Boolean operator over nested conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
    Not,
}

/// `AND`, `OR` or `NOT` over nested conditions.
#[derive(Debug)]
pub struct LogicalMatcher {
    op: LogicOp,
    children: Vec<Box<dyn Matcher>>,
    payload: String,
}

impl LogicalMatcher {
    /// `NOT` takes exactly one child; the parser enforces it.
    pub fn new(op: LogicOp, children: Vec<Box<dyn Matcher>>, payload: impl Into<String>) -> Self {
        Self {
            op,
            children,
            payload: payload.into(),
        }
    }
}

impl Matcher for LogicalMatcher {
    fn matches(&self, metadata: &Metadata) -> bool {
        match self.op {
            LogicOp::And => self.children.iter().all(|m| m.matches(metadata)),
            LogicOp::Or => self.children.iter().any(|m| m.matches(metadata)),
            LogicOp::Not => !self.children.iter().any(|m| m.matches(metadata)),
        }
    }

    fn rule_type(&self) -> RuleType {
        match self.op {
            LogicOp::And => RuleType::And,
            LogicOp::Or => RuleType::Or,
            LogicOp::Not => RuleType::Not,
        }
    }

    fn payload(&self) -> String {
        self.payload.clone()
    }

    fn should_resolve_ip(&self) -> bool {
        self.children.iter().any(|m| m.should_resolve_ip())
    }
}

/// Catch-all.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl Matcher for MatchAll {
    fn matches(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Match
    }

    fn payload(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::InboundType;
    use std::net::SocketAddr;

    fn to(dest: &str) -> Metadata {
        let src: SocketAddr = "192.168.1.20:40000".parse().unwrap();
        Metadata::tcp(InboundType::Tunnel, Some(src), dest).unwrap()
    }

    #[test]
    fn domain_is_case_insensitive_and_ignores_trailing_dot() {
        let m = DomainMatcher::new("Example.com.");
        assert!(m.matches(&to("EXAMPLE.COM:443")));
        assert!(!m.matches(&to("www.example.com:443")));
        assert!(!m.matches(&to("93.184.216.34:443")));
    }

    #[test]
    fn suffix_respects_label_boundary() {
        let m = DomainSuffixMatcher::new("example.com");
        assert!(m.matches(&to("example.com:80")));
        assert!(m.matches(&to("a.b.Example.com:80")));
        assert!(!m.matches(&to("badexample.com:80")));
    }

    #[test]
    fn keyword_matches_substring() {
        let m = DomainKeywordMatcher::new("GOOGLE");
        assert!(m.matches(&to("www.google.co.jp:443")));
        assert!(!m.matches(&to("example.com:443")));
    }

    #[test]
    fn cidr_needs_an_ip() {
        let m = IpCidrMatcher::destination("10.0.0.0/8".parse().unwrap(), false);
        assert!(m.matches(&to("10.1.2.3:22")));
        assert!(!m.matches(&to("example.com:22")));
        assert!(m.should_resolve_ip());
        assert!(!IpCidrMatcher::destination("10.0.0.0/8".parse().unwrap(), true).should_resolve_ip());
    }

    #[test]
    fn source_cidr_and_ports() {
        let src = IpCidrMatcher::source("192.168.0.0/16".parse().unwrap());
        assert!(src.matches(&to("example.com:443")));
        assert!(!src.should_resolve_ip());

        let dst = PortMatcher::new(440..=450, false);
        assert!(dst.matches(&to("example.com:443")));
        assert_eq!(dst.payload(), "440-450");
        assert!(PortMatcher::new(40000..=40000, true).matches(&to("example.com:443")));
    }

    #[test]
    fn geoip_reports_lan() {
        let m = GeoIpMatcher::new("lan", Arc::new(LanCountryLookup), false);
        assert!(m.matches(&to("192.168.1.1:80")));
        assert!(m.matches(&to("[fd00::1]:80")));
        assert!(!m.matches(&to("8.8.8.8:53")));
        assert_eq!(m.payload(), "LAN");
    }

    #[test]
    fn process_matches_basename() {
        let m = ProcessMatcher::new("curl");
        assert!(m.matches(&to("example.com:80").with_process("/usr/bin/curl")));
        assert!(!m.matches(&to("example.com:80").with_process("wget")));
        assert!(!m.matches(&to("example.com:80")));
    }

    #[test]
    fn logical_operators() {
        let and = LogicalMatcher::new(
            LogicOp::And,
            vec![
                Box::new(DomainMatcher::new("a.com")),
                Box::new(NetworkMatcher::new(Network::Tcp)),
            ],
            "((DOMAIN,a.com),(NETWORK,TCP))",
        );
        assert!(and.matches(&to("a.com:80")));
        assert!(!and.matches(&to("b.com:80")));

        let not = LogicalMatcher::new(LogicOp::Not, vec![Box::new(DomainMatcher::new("a.com"))], "((DOMAIN,a.com))");
        assert!(!not.matches(&to("a.com:80")));
        assert!(not.matches(&to("b.com:80")));
        assert_eq!(not.rule_type().to_string(), "NOT");
    }
}
