//! Manually selected group.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::adapter::group::{GroupError, GroupMembers};
use crate::adapter::Proxy;

/// Routes through whichever member was last chosen with [`Selector::set`].
#[derive(Debug)]
pub struct Selector {
    members: GroupMembers,
    selected: ArcSwap<String>,
}

impl Selector {
    /// The first member starts out selected.
    pub fn new(members: GroupMembers) -> Self {
        let first = members.names().into_iter().next().unwrap_or_default();
        Self {
            members,
            selected: ArcSwap::from_pointee(first),
        }
    }

    pub fn members(&self) -> &GroupMembers {
        &self.members
    }

    /// Pin `member`. Fails if it is not currently a member of `group`.
    pub fn set(&self, group: &str, member: &str) -> Result<(), GroupError> {
        if !self.members.contains(member) {
            return Err(GroupError::UnknownMember {
                group: group.to_string(),
                member: member.to_string(),
            });
        }
        self.selected.store(Arc::new(member.to_string()));
        tracing::info!(group = %group, member = %member, "Selector updated");
        Ok(())
    }

    pub fn selected(&self) -> Arc<String> {
        self.selected.load_full()
    }

    /// The pinned member, or the first member if it has disappeared.
    pub fn now(&self) -> Option<Arc<Proxy>> {
        let members = self.members.resolve();
        let selected = self.selected.load();
        members
            .iter()
            .find(|p| p.name() == selected.as_str())
            .or_else(|| members.first())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Outbound, ProxyKind};

    fn relay(name: &str) -> Arc<Proxy> {
        Arc::new(Proxy::new(
            name,
            ProxyKind::Leaf(Outbound::Relay {
                server: "127.0.0.1".into(),
                port: 1,
            }),
        ))
    }

    #[test]
    fn defaults_to_first_member() {
        let selector = Selector::new(GroupMembers::from_proxies(vec![relay("a"), relay("b")]));
        assert_eq!(selector.selected().as_str(), "a");
        assert_eq!(selector.now().unwrap().name(), "a");
    }

    #[test]
    fn set_pins_member() {
        let selector = Selector::new(GroupMembers::from_proxies(vec![relay("a"), relay("b")]));
        selector.set("g", "b").unwrap();
        assert_eq!(selector.now().unwrap().name(), "b");
    }

    #[test]
    fn set_rejects_non_member() {
        let selector = Selector::new(GroupMembers::from_proxies(vec![relay("a")]));
        let err = selector.set("g", "zz").unwrap_err();
        assert!(matches!(err, GroupError::UnknownMember { ref member, .. } if member == "zz"));
        assert_eq!(selector.selected().as_str(), "a");
    }
}
