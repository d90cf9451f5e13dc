//! Proxy groups.
//!
//! # Data Flow
//! ```text
//! GroupMembers::resolve()
//!     → static members (declaration order)
//!     → provider members (provider order, name filter applied)
//!     → policy picks one:
//!         selector.rs      (manual choice)
//!         url_test.rs      (lowest mean delay)
//!         fallback.rs      (first alive)
//!         load_balance.rs  (hash / round-robin)
//! ```
//!
//! # Design Decisions
//! - Membership is resolved on every call so provider refreshes are seen
//!   immediately without rebuilding the group
//! - Policies are stateless apart from the selection they cache

mod fallback;
mod load_balance;
mod selector;
mod url_test;

use std::sync::Arc;

use thiserror::Error;

use crate::adapter::Proxy;
use crate::provider::ProxyProvider;

pub use fallback::Fallback;
pub use load_balance::{LoadBalance, Strategy};
pub use selector::Selector;
pub use url_test::UrlTest;

/// Error type for group operations requested from outside the tunnel.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("proxy {0} is not a selector")]
    NotSelector(String),

    #[error("{member} is not a member of {group}")]
    UnknownMember { group: String, member: String },
}

/// Case-insensitive name filter for provider members.
///
/// `"hk|sg"` keeps proxies whose name contains either keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    keywords: Vec<String>,
}

impl NameFilter {
    pub fn parse(filter: &str) -> Option<Self> {
        let keywords: Vec<String> = filter
            .split('|')
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            None
        } else {
            Some(Self { keywords })
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.keywords.iter().any(|k| name.contains(k.as_str()))
    }
}

/// Ordered members of a group.
#[derive(Debug, Default)]
pub struct GroupMembers {
    proxies: Vec<Arc<Proxy>>,
    providers: Vec<Arc<ProxyProvider>>,
    filter: Option<NameFilter>,
}

impl GroupMembers {
    pub fn new(
        proxies: Vec<Arc<Proxy>>,
        providers: Vec<Arc<ProxyProvider>>,
        filter: Option<NameFilter>,
    ) -> Self {
        Self {
            proxies,
            providers,
            filter,
        }
    }

    pub fn from_proxies(proxies: Vec<Arc<Proxy>>) -> Self {
        Self::new(proxies, Vec::new(), None)
    }

    /// Current member list, static members first.
    pub fn resolve(&self) -> Vec<Arc<Proxy>> {
        let mut members = self.proxies.clone();
        for provider in &self.providers {
            members.extend(
                provider
                    .proxies()
                    .iter()
                    .filter(|p| self.filter.as_ref().map_or(true, |f| f.matches(p.name())))
                    .cloned(),
            );
        }
        members
    }

    pub fn names(&self) -> Vec<String> {
        self.resolve().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve().iter().any(|p| p.name() == name)
    }

    pub fn providers(&self) -> &[Arc<ProxyProvider>] {
        &self.providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_keywords_are_case_insensitive() {
        let filter = NameFilter::parse("HK | sg").unwrap();
        assert!(filter.matches("hk-01"));
        assert!(filter.matches("Premium SG"));
        assert!(!filter.matches("jp-01"));
        assert!(NameFilter::parse(" | ").is_none());
    }

    #[test]
    fn static_members_keep_order() {
        let members = GroupMembers::from_proxies(vec![
            Arc::new(Proxy::reject()),
            Arc::new(Proxy::direct()),
        ]);
        assert_eq!(members.names(), vec!["REJECT", "DIRECT"]);
        assert!(members.contains("DIRECT"));
        assert!(!members.contains("GLOBAL"));
    }
}
