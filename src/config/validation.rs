//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (groups, providers and rules reference
//!   existing names)
//! - Reject group cycles and compute a construction order
//! - Validate value ranges (timeouts > 0, ports set, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TunnelConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::adapter::{DIRECT, GLOBAL, REJECT};
use crate::config::schema::{ProxyGroupConfig, TunnelConfig, VehicleKind};
use crate::rules::{parse_rule, CountryLookup, LanCountryLookup};
use crate::tunnel::{split_host_port, InboundType};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate proxy or group name {0}")]
    DuplicateName(String),

    #[error("{0} is a reserved proxy name")]
    ReservedName(String),

    #[error("duplicate inbound name {0}")]
    DuplicateInbound(String),

    #[error("inbound {name}: {reason}")]
    InvalidInbound { name: String, reason: String },

    #[error("group {group} references unknown member {member}")]
    UnknownMember { group: String, member: String },

    #[error("group {group} uses unknown provider {provider}")]
    UnknownProvider { group: String, provider: String },

    #[error("group {0} has no members")]
    EmptyGroup(String),

    #[error("group cycle {}", .0.join(" -> "))]
    GroupCycle(Vec<String>),

    #[error("{owner}: invalid test url {url}")]
    InvalidUrl { owner: String, url: String },

    #[error("provider {name}: {reason}")]
    InvalidProvider { name: String, reason: String },

    #[error("rule {index} ({line}): {reason}")]
    InvalidRule { index: usize, line: String, reason: String },

    #[error("rule {index} targets unknown proxy {target}")]
    UnknownRuleTarget { index: usize, target: String },

    #[error("invalid bind address {0}")]
    InvalidBindAddress(String),

    #[error("invalid metrics address {0}")]
    InvalidMetricsAddress(String),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

/// Check a parsed configuration. All problems are returned together.
pub fn validate_config(config: &TunnelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_general(config, &mut errors);
    validate_inbounds(config, &mut errors);
    let names = validate_names(config, &mut errors);
    validate_providers(config, &mut errors);
    validate_groups(config, &names, &mut errors);
    if let Err(cycle) = group_order(&config.proxy_groups) {
        errors.push(ValidationError::GroupCycle(cycle));
    }
    validate_rules(config, &names, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_general(config: &TunnelConfig, errors: &mut Vec<ValidationError>) {
    if config.bind_address != "*" && config.bind_address.parse::<IpAddr>().is_err() && !config.bind_address.is_empty() {
        errors.push(ValidationError::InvalidBindAddress(config.bind_address.clone()));
    }
    if config.tunnel.dial_timeout_ms == 0 {
        errors.push(ValidationError::ZeroValue("tunnel.dial-timeout-ms"));
    }
    if config.tunnel.dns_timeout_ms == 0 {
        errors.push(ValidationError::ZeroValue("tunnel.dns-timeout-ms"));
    }
    if config.tunnel.queue_size == 0 {
        errors.push(ValidationError::ZeroValue("tunnel.queue-size"));
    }
    if config.health_check.timeout_ms == 0 {
        errors.push(ValidationError::ZeroValue("health-check.timeout-ms"));
    }
    if !is_test_url(&config.health_check.url) {
        errors.push(ValidationError::InvalidUrl {
            owner: "health-check".to_string(),
            url: config.health_check.url.clone(),
        });
    }
    if config.observability.metrics_enabled && config.observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }
}

fn validate_inbounds(config: &TunnelConfig, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for inbound in &config.inbounds {
        if !seen.insert(inbound.name.as_str()) {
            errors.push(ValidationError::DuplicateInbound(inbound.name.clone()));
        }
        let invalid = |reason: &str| ValidationError::InvalidInbound {
            name: inbound.name.clone(),
            reason: reason.to_string(),
        };
        if inbound.port == 0 {
            errors.push(invalid("port must be set"));
        }
        if inbound.listen.parse::<IpAddr>().is_err() {
            errors.push(invalid("listen must be an IP address"));
        }
        if inbound.inbound_type == InboundType::Tunnel {
            match inbound.target.as_deref() {
                Some(target) if split_host_port(target).is_some() => {}
                Some(_) => errors.push(invalid("target must be host:port")),
                None => errors.push(invalid("tunnel inbound needs a target")),
            }
        }
    }
}

/// Proxy and group names, plus the built-ins.
fn validate_names<'a>(config: &'a TunnelConfig, errors: &mut Vec<ValidationError>) -> HashSet<&'a str> {
    let mut names: HashSet<&str> = HashSet::new();
    let declared = config
        .proxies
        .iter()
        .map(|p| p.name())
        .chain(config.proxy_groups.iter().map(|g| g.name.as_str()));
    for name in declared {
        if [DIRECT, REJECT, GLOBAL].contains(&name) {
            errors.push(ValidationError::ReservedName(name.to_string()));
        } else if !names.insert(name) {
            errors.push(ValidationError::DuplicateName(name.to_string()));
        }
    }
    names.insert(DIRECT);
    names.insert(REJECT);
    names
}

fn validate_providers(config: &TunnelConfig, errors: &mut Vec<ValidationError>) {
    for (name, provider) in &config.proxy_providers {
        let invalid = |reason: &str| ValidationError::InvalidProvider {
            name: name.clone(),
            reason: reason.to_string(),
        };
        if provider.path.trim().is_empty() {
            errors.push(invalid("path must be set"));
        }
        if provider.vehicle == VehicleKind::Http {
            match provider.url.as_deref().map(Url::parse) {
                Some(Ok(url)) if matches!(url.scheme(), "http" | "https") => {}
                Some(_) => errors.push(invalid("url must be an http(s) URL")),
                None => errors.push(invalid("http provider needs a url")),
            }
        }
        if let Some(url) = &provider.health_check.url {
            if !is_test_url(url) {
                errors.push(ValidationError::InvalidUrl {
                    owner: format!("provider {}", name),
                    url: url.clone(),
                });
            }
        }
    }
}

fn validate_groups(config: &TunnelConfig, names: &HashSet<&str>, errors: &mut Vec<ValidationError>) {
    for group in &config.proxy_groups {
        if group.proxies.is_empty() && group.uses.is_empty() {
            errors.push(ValidationError::EmptyGroup(group.name.clone()));
        }
        for member in &group.proxies {
            if !names.contains(member.as_str()) {
                errors.push(ValidationError::UnknownMember {
                    group: group.name.clone(),
                    member: member.clone(),
                });
            }
        }
        for provider in &group.uses {
            if !config.proxy_providers.contains_key(provider) {
                errors.push(ValidationError::UnknownProvider {
                    group: group.name.clone(),
                    provider: provider.clone(),
                });
            }
        }
        if let Some(url) = &group.url {
            if !is_test_url(url) {
                errors.push(ValidationError::InvalidUrl {
                    owner: format!("group {}", group.name),
                    url: url.clone(),
                });
            }
        }
    }
}

fn validate_rules(config: &TunnelConfig, names: &HashSet<&str>, errors: &mut Vec<ValidationError>) {
    let geoip: Arc<dyn CountryLookup> = Arc::new(LanCountryLookup);
    for (index, line) in config.rules.iter().enumerate() {
        match parse_rule(line, &geoip) {
            Ok(rule) => {
                let target = rule.target();
                if target != GLOBAL && !names.contains(target) {
                    errors.push(ValidationError::UnknownRuleTarget {
                        index,
                        target: target.to_string(),
                    });
                }
            }
            Err(e) => errors.push(ValidationError::InvalidRule {
                index,
                line: line.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

fn is_test_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// Group indices ordered so every group comes after the groups it contains.
///
/// Unknown member names are ignored here. On a cycle, returns the names
/// along it, first name repeated at the end.
pub fn group_order(groups: &[ProxyGroupConfig]) -> Result<Vec<usize>, Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    fn visit(
        index: usize,
        groups: &[ProxyGroupConfig],
        by_name: &HashMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), Vec<String>> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = stack.iter().position(|&i| i == index).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|&i| groups[i].name.clone()).collect();
                cycle.push(groups[index].name.clone());
                return Err(cycle);
            }
            Mark::Unvisited => {}
        }
        marks[index] = Mark::Visiting;
        stack.push(index);
        for member in &groups[index].proxies {
            if let Some(&child) = by_name.get(member.as_str()) {
                visit(child, groups, by_name, marks, stack, order)?;
            }
        }
        stack.pop();
        marks[index] = Mark::Done;
        order.push(index);
        Ok(())
    }

    let by_name: HashMap<&str, usize> = groups.iter().enumerate().map(|(i, g)| (g.name.as_str(), i)).collect();
    let mut marks = vec![Mark::Unvisited; groups.len()];
    let mut stack = Vec::new();
    let mut order = Vec::with_capacity(groups.len());
    for index in 0..groups.len() {
        visit(index, groups, &by_name, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(doc: &str) -> TunnelConfig {
        toml::from_str(doc).unwrap()
    }

    #[test]
    fn valid_config_passes() {
        let cfg = parse(
            r#"
            rules = ["DOMAIN-SUFFIX,example.com,Proxy", "MATCH,DIRECT"]

            [[proxies]]
            name = "relay"
            type = "relay"
            server = "127.0.0.1"
            port = 1080

            [[proxy-groups]]
            name = "Proxy"
            type = "select"
            proxies = ["auto", "relay"]

            [[proxy-groups]]
            name = "auto"
            type = "url-test"
            proxies = ["relay", "DIRECT"]
            "#,
        );
        assert_eq!(validate_config(&cfg), Ok(()));
        // "auto" is built before "Proxy".
        assert_eq!(group_order(&cfg.proxy_groups).unwrap(), vec![1, 0]);
    }

    #[test]
    fn reports_every_error() {
        let cfg = parse(
            r#"
            bind-address = "not-an-ip"
            rules = ["DOMAIN,a.com,Nowhere", "BOGUS,x,DIRECT"]

            [tunnel]
            dial-timeout-ms = 0

            [[proxies]]
            name = "dup"
            type = "direct"

            [[proxies]]
            name = "dup"
            type = "reject"

            [[proxy-groups]]
            name = "g"
            type = "select"
            proxies = ["missing"]
            use = ["nope"]
            "#,
        );
        let errors = validate_config(&cfg).unwrap_err();
        assert!(errors.contains(&ValidationError::InvalidBindAddress("not-an-ip".into())));
        assert!(errors.contains(&ValidationError::ZeroValue("tunnel.dial-timeout-ms")));
        assert!(errors.contains(&ValidationError::DuplicateName("dup".into())));
        assert!(errors.contains(&ValidationError::UnknownMember {
            group: "g".into(),
            member: "missing".into()
        }));
        assert!(errors.contains(&ValidationError::UnknownProvider {
            group: "g".into(),
            provider: "nope".into()
        }));
        assert!(errors.contains(&ValidationError::UnknownRuleTarget {
            index: 0,
            target: "Nowhere".into()
        }));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidRule { index: 1, .. })));
    }

    #[test]
    fn rejects_group_cycles() {
        let cfg = parse(
            r#"
            [[proxy-groups]]
            name = "a"
            type = "select"
            proxies = ["b"]

            [[proxy-groups]]
            name = "b"
            type = "fallback"
            proxies = ["c"]

            [[proxy-groups]]
            name = "c"
            type = "select"
            proxies = ["a", "DIRECT"]
            "#,
        );
        let errors = validate_config(&cfg).unwrap_err();
        assert!(errors.contains(&ValidationError::GroupCycle(vec![
            "a".into(),
            "b".into(),
            "c".into(),
            "a".into()
        ])));
    }

    #[test]
    fn rejects_reserved_names_and_bad_inbounds() {
        let cfg = parse(
            r#"
            [[proxies]]
            name = "GLOBAL"
            type = "direct"

            [[inbounds]]
            name = "fwd"
            type = "tunnel"
            port = 7000
            "#,
        );
        let errors = validate_config(&cfg).unwrap_err();
        assert!(errors.contains(&ValidationError::ReservedName("GLOBAL".into())));
        assert!(errors.contains(&ValidationError::InvalidInbound {
            name: "fwd".into(),
            reason: "tunnel inbound needs a target".into()
        }));
    }
}
