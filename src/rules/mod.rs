//! Rule matching subsystem.
//!
//! # Data Flow
//! ```text
//! Rule text (config `rules = [...]`)
//!     → parser.rs (TYPE,PAYLOAD,TARGET / logical forms)
//!     → matcher.rs (one condition per rule, nested for AND/OR/NOT)
//!     → RuleSet (ordered, immutable)
//!
//! Per connection:
//!     Metadata → RuleSet::resolve → first matching Rule → target name
//! ```
//!
//! # Design Decisions
//! - Rules compiled once per config epoch, immutable at runtime
//! - First match wins, strictly in declaration order
//! - `resolve` is pure; whether a destination IP is needed is precomputed so
//!   the dispatcher can resolve the domain beforehand
//! - Explicit no-match (`None`) rather than a silent default

pub mod matcher;
pub mod parser;

use std::sync::Arc;

use serde::Serialize;

use crate::tunnel::Metadata;

pub use matcher::{CountryLookup, LanCountryLookup, Matcher, RuleType};
pub use parser::{parse_rule, RuleError};

/// A condition plus the proxy or group it routes to.
#[derive(Debug)]
pub struct Rule {
    matcher: Box<dyn Matcher>,
    target: String,
}

impl Rule {
    pub fn new(matcher: Box<dyn Matcher>, target: impl Into<String>) -> Self {
        Self {
            matcher,
            target: target.into(),
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.matcher.matches(metadata)
    }

    pub fn rule_type(&self) -> RuleType {
        self.matcher.rule_type()
    }

    pub fn payload(&self) -> String {
        self.matcher.payload()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn should_resolve_ip(&self) -> bool {
        self.matcher.should_resolve_ip()
    }
}

/// One rule as listed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleReport {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub payload: String,
    pub proxy: String,
}

/// Ordered rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    needs_ip: bool,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        let needs_ip = rules.iter().any(Rule::should_resolve_ip);
        Self { rules, needs_ip }
    }

    /// Parse rule lines. Every failing line is reported with its index.
    pub fn parse(lines: &[String], geoip: &Arc<dyn CountryLookup>) -> Result<Self, Vec<(usize, RuleError)>> {
        let mut rules = Vec::with_capacity(lines.len());
        let mut errors = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            match parse_rule(line, geoip) {
                Ok(rule) => rules.push(rule),
                Err(e) => errors.push((index, e)),
            }
        }
        if errors.is_empty() {
            Ok(Self::new(rules))
        } else {
            Err(errors)
        }
    }

    /// First rule matching `metadata`.
    pub fn resolve(&self, metadata: &Metadata) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(metadata))
    }

    /// True when some rule may need the destination IP of a domain connection.
    pub fn needs_ip(&self) -> bool {
        self.needs_ip
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn report(&self) -> Vec<RuleReport> {
        self.rules
            .iter()
            .map(|rule| RuleReport {
                rule_type: rule.rule_type(),
                payload: rule.payload(),
                proxy: rule.target().to_string(),
            })
            .collect()
    }
}
