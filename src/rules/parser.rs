//! Rule text parsing.
//!
//! Forms accepted:
//! ```text
//! TYPE,PAYLOAD,TARGET[,no-resolve]
//! MATCH,TARGET
//! AND,((DOMAIN,a.com),(NETWORK,TCP)),TARGET
//! NOT,((IP-CIDR,10.0.0.0/8,no-resolve)),TARGET
//! ```
//! Logical payloads nest: each item is itself `(TYPE,PAYLOAD[,no-resolve])`.

use std::ops::RangeInclusive;
use std::sync::Arc;

use ipnet::IpNet;
use thiserror::Error;

use crate::rules::matcher::{
    CountryLookup, DomainKeywordMatcher, DomainMatcher, DomainSuffixMatcher, GeoIpMatcher, IpCidrMatcher,
    LogicOp, LogicalMatcher, MatchAll, Matcher, NetworkMatcher, PortMatcher, ProcessMatcher,
};
use crate::rules::Rule;
use crate::tunnel::Network;

const NO_RESOLVE: &str = "no-resolve";

/// Error type for rule parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("malformed rule: {0}")]
    Malformed(String),

    #[error("unknown rule type {0}")]
    UnknownType(String),

    #[error("invalid {rule_type} payload {payload}: {reason}")]
    InvalidPayload {
        rule_type: String,
        payload: String,
        reason: String,
    },
}

/// Parse one rule line.
pub fn parse_rule(line: &str, geoip: &Arc<dyn CountryLookup>) -> Result<Rule, RuleError> {
    let line = line.trim();
    let (kind, rest) = line
        .split_once(',')
        .map(|(k, r)| (k.trim().to_ascii_uppercase(), r.trim()))
        .ok_or_else(|| RuleError::Malformed(line.to_string()))?;

    match kind.as_str() {
        "MATCH" => {
            let target = rest.split(',').next().unwrap_or_default().trim();
            if target.is_empty() {
                return Err(RuleError::Malformed(line.to_string()));
            }
            Ok(Rule::new(Box::new(MatchAll), target))
        }
        "AND" | "OR" | "NOT" => {
            let end = closing_paren(rest).ok_or_else(|| RuleError::Malformed(line.to_string()))?;
            let payload = &rest[..=end];
            let target = rest[end + 1..]
                .trim_start()
                .strip_prefix(',')
                .map(|t| t.split(',').next().unwrap_or_default().trim())
                .filter(|t| !t.is_empty())
                .ok_or_else(|| RuleError::Malformed(line.to_string()))?;
            let matcher = parse_logical(&kind, payload, geoip)?;
            Ok(Rule::new(matcher, target))
        }
        _ => {
            let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
            if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
                return Err(RuleError::Malformed(line.to_string()));
            }
            let no_resolve = parts[2..].iter().any(|p| p.eq_ignore_ascii_case(NO_RESOLVE));
            let matcher = parse_matcher(&kind, parts[0], no_resolve, geoip)?;
            Ok(Rule::new(matcher, parts[1]))
        }
    }
}

/// Build a single condition from its type and payload.
pub fn parse_matcher(
    kind: &str,
    payload: &str,
    no_resolve: bool,
    geoip: &Arc<dyn CountryLookup>,
) -> Result<Box<dyn Matcher>, RuleError> {
    let invalid = |reason: &str| RuleError::InvalidPayload {
        rule_type: kind.to_string(),
        payload: payload.to_string(),
        reason: reason.to_string(),
    };

    let matcher: Box<dyn Matcher> = match kind {
        "DOMAIN" => Box::new(DomainMatcher::new(payload)),
        "DOMAIN-SUFFIX" => Box::new(DomainSuffixMatcher::new(payload)),
        "DOMAIN-KEYWORD" => Box::new(DomainKeywordMatcher::new(payload)),
        "GEOIP" => Box::new(GeoIpMatcher::new(payload, geoip.clone(), no_resolve)),
        "IP-CIDR" | "IP-CIDR6" => {
            let net: IpNet = payload.parse().map_err(|_| invalid("not a CIDR block"))?;
            if kind == "IP-CIDR6" && !matches!(net, IpNet::V6(_)) {
                return Err(invalid("expected an IPv6 block"));
            }
            Box::new(IpCidrMatcher::destination(net.trunc(), no_resolve))
        }
        "SRC-IP-CIDR" => {
            let net: IpNet = payload.parse().map_err(|_| invalid("not a CIDR block"))?;
            Box::new(IpCidrMatcher::source(net.trunc()))
        }
        "SRC-PORT" => Box::new(PortMatcher::new(parse_ports(payload).ok_or_else(|| invalid("not a port"))?, true)),
        "DST-PORT" => Box::new(PortMatcher::new(parse_ports(payload).ok_or_else(|| invalid("not a port"))?, false)),
        "PROCESS-NAME" => Box::new(ProcessMatcher::new(payload)),
        "NETWORK" => {
            let network = match payload.to_ascii_lowercase().as_str() {
                "tcp" => Network::Tcp,
                "udp" => Network::Udp,
                _ => return Err(invalid("expected TCP or UDP")),
            };
            Box::new(NetworkMatcher::new(network))
        }
        "AND" | "OR" | "NOT" => parse_logical(kind, payload, geoip)?,
        "MATCH" => Box::new(MatchAll),
        other => return Err(RuleError::UnknownType(other.to_string())),
    };
    Ok(matcher)
}

fn parse_logical(kind: &str, payload: &str, geoip: &Arc<dyn CountryLookup>) -> Result<Box<dyn Matcher>, RuleError> {
    let malformed = || RuleError::Malformed(format!("{},{}", kind, payload));
    let inner = payload
        .trim()
        .strip_prefix('(')
        .and_then(|p| p.strip_suffix(')'))
        .ok_or_else(malformed)?;

    let mut children = Vec::new();
    for item in split_top_level(inner).ok_or_else(malformed)? {
        let body = item
            .trim()
            .strip_prefix('(')
            .and_then(|p| p.strip_suffix(')'))
            .ok_or_else(malformed)?;
        let (sub_kind, sub_rest) = body.split_once(',').ok_or_else(malformed)?;
        let sub_kind = sub_kind.trim().to_ascii_uppercase();
        let child = if matches!(sub_kind.as_str(), "AND" | "OR" | "NOT") {
            parse_logical(&sub_kind, sub_rest.trim(), geoip)?
        } else {
            let parts: Vec<&str> = sub_rest.split(',').map(str::trim).collect();
            let no_resolve = parts[1..].iter().any(|p| p.eq_ignore_ascii_case(NO_RESOLVE));
            parse_matcher(&sub_kind, parts[0], no_resolve, geoip)?
        };
        children.push(child);
    }

    let op = match kind {
        "AND" => LogicOp::And,
        "OR" => LogicOp::Or,
        _ => LogicOp::Not,
    };
    if children.is_empty() || (op == LogicOp::Not && children.len() != 1) {
        return Err(malformed());
    }
    Ok(Box::new(LogicalMatcher::new(op, children, payload.trim())))
}

/// Index of the parenthesis closing the one `s` starts with.
fn closing_paren(s: &str) -> Option<usize> {
    if !s.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas outside parentheses. `None` when parentheses are unbalanced.
fn split_top_level(s: &str) -> Option<Vec<&str>> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1)?,
            ',' if depth == 0 => {
                items.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    items.push(&s[start..]);
    Some(items.into_iter().filter(|i| !i.trim().is_empty()).collect())
}

fn parse_ports(payload: &str) -> Option<RangeInclusive<u16>> {
    match payload.split_once('-') {
        Some((low, high)) => {
            let low: u16 = low.trim().parse().ok()?;
            let high: u16 = high.trim().parse().ok()?;
            (low <= high).then_some(low..=high)
        }
        None => {
            let port: u16 = payload.trim().parse().ok()?;
            Some(port..=port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::matcher::{LanCountryLookup, RuleType};
    use crate::tunnel::{InboundType, Metadata};

    fn geoip() -> Arc<dyn CountryLookup> {
        Arc::new(LanCountryLookup)
    }

    fn meta(dest: &str) -> Metadata {
        Metadata::tcp(InboundType::Tunnel, None, dest).unwrap()
    }

    #[test]
    fn parses_simple_rules() {
        let rule = parse_rule("DOMAIN-SUFFIX,google.com,Proxy", &geoip()).unwrap();
        assert_eq!(rule.rule_type(), RuleType::DomainSuffix);
        assert_eq!(rule.payload(), "google.com");
        assert_eq!(rule.target(), "Proxy");

        let rule = parse_rule("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve", &geoip()).unwrap();
        assert_eq!(rule.rule_type(), RuleType::IpCidr);
        assert!(!rule.should_resolve_ip());

        let rule = parse_rule("match,REJECT", &geoip()).unwrap();
        assert_eq!(rule.rule_type(), RuleType::Match);
        assert_eq!(rule.target(), "REJECT");
    }

    #[test]
    fn parses_logical_rules() {
        let rule = parse_rule("AND,((DOMAIN,a.com),(NETWORK,TCP)),Proxy", &geoip()).unwrap();
        assert_eq!(rule.rule_type(), RuleType::And);
        assert_eq!(rule.payload(), "((DOMAIN,a.com),(NETWORK,TCP))");
        assert_eq!(rule.target(), "Proxy");
        assert!(rule.matches(&meta("a.com:443")));
        assert!(!rule.matches(&meta("b.com:443")));

        let rule = parse_rule("NOT,((OR,((DOMAIN,a.com),(DOMAIN,b.com)))),DIRECT", &geoip()).unwrap();
        assert!(!rule.matches(&meta("b.com:80")));
        assert!(rule.matches(&meta("c.com:80")));

        let rule = parse_rule("OR,((IP-CIDR,10.0.0.0/8),(DST-PORT,22)),DIRECT", &geoip()).unwrap();
        assert!(rule.should_resolve_ip());
        assert!(rule.matches(&meta("example.com:22")));
    }

    #[test]
    fn rejects_bad_rules() {
        assert!(matches!(parse_rule("DOMAIN,a.com", &geoip()), Err(RuleError::Malformed(_))));
        assert!(matches!(parse_rule("FOO,bar,DIRECT", &geoip()), Err(RuleError::UnknownType(_))));
        assert!(matches!(
            parse_rule("IP-CIDR,10.0.0.300/8,DIRECT", &geoip()),
            Err(RuleError::InvalidPayload { .. })
        ));
        assert!(matches!(
            parse_rule("IP-CIDR6,10.0.0.0/8,DIRECT", &geoip()),
            Err(RuleError::InvalidPayload { .. })
        ));
        assert!(parse_rule("DST-PORT,90-80,DIRECT", &geoip()).is_err());
        assert!(parse_rule("NOT,((DOMAIN,a.com),(DOMAIN,b.com)),DIRECT", &geoip()).is_err());
        assert!(parse_rule("AND,((DOMAIN,a.com),DIRECT", &geoip()).is_err());
        assert!(parse_rule("MATCH", &geoip()).is_err());
    }
}
