//! Latency-ranked group.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::adapter::group::GroupMembers;
use crate::adapter::Proxy;

/// Routes through the alive member with the lowest mean delay.
///
/// Members without delay data are skipped; ties go to the earlier member.
/// Without any delay data the first alive member is used, or the first member
/// when none is alive.
/// With a non-zero tolerance the current choice is kept until another member
/// beats it by more than `tolerance` milliseconds.
#[derive(Debug)]
pub struct UrlTest {
    members: GroupMembers,
    tolerance: u32,
    fastest: ArcSwapOption<Proxy>,
}

impl UrlTest {
    pub fn new(members: GroupMembers, tolerance: u32) -> Self {
        Self {
            members,
            tolerance,
            fastest: ArcSwapOption::empty(),
        }
    }

    pub fn members(&self) -> &GroupMembers {
        &self.members
    }

    pub fn now(&self) -> Option<Arc<Proxy>> {
        let members = self.members.resolve();
        let first = members
            .iter()
            .find(|p| p.is_alive())
            .or_else(|| members.first())?
            .clone();

        let best = members
            .iter()
            .filter(|p| p.is_alive() && p.mean_delay() > 0)
            .min_by_key(|p| p.mean_delay())
            .cloned();
        let Some(best) = best else {
            return Some(first);
        };

        if self.tolerance > 0 {
            if let Some(current) = self.fastest.load_full() {
                let still_member = members.iter().any(|p| Arc::ptr_eq(p, &current));
                if still_member
                    && current.is_alive()
                    && current.mean_delay() > 0
                    && current.mean_delay() <= best.mean_delay().saturating_add(self.tolerance)
                {
                    return Some(current);
                }
            }
        }

        self.fastest.store(Some(best.clone()));
        Some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Outbound, ProxyKind};
    use std::time::Duration;

    fn relay(name: &str, delay_ms: Option<u64>) -> Arc<Proxy> {
        let proxy = Arc::new(Proxy::new(
            name,
            ProxyKind::Leaf(Outbound::Relay {
                server: "127.0.0.1".into(),
                port: 1,
            }),
        ));
        match delay_ms {
            Some(ms) => {
                proxy.health().record_success(Duration::from_millis(ms));
            }
            None => proxy.health().record_failure(1),
        }
        proxy
    }

    #[test]
    fn picks_lowest_mean_delay_and_fails_over() {
        let slow = relay("slow", Some(10));
        let fast = relay("fast", Some(5));
        let dead = relay("dead", None);
        let group = UrlTest::new(
            GroupMembers::from_proxies(vec![slow.clone(), fast.clone(), dead]),
            0,
        );
        assert_eq!(group.now().unwrap().name(), "fast");

        fast.health().record_failure(1);
        assert_eq!(group.now().unwrap().name(), "slow");
    }

    #[test]
    fn ties_go_to_declaration_order() {
        let group = UrlTest::new(
            GroupMembers::from_proxies(vec![relay("a", Some(7)), relay("b", Some(7))]),
            0,
        );
        assert_eq!(group.now().unwrap().name(), "a");
    }

    #[test]
    fn no_data_falls_back_to_first() {
        let group = UrlTest::new(
            GroupMembers::from_proxies(vec![relay("a", None), relay("b", None)]),
            0,
        );
        assert_eq!(group.now().unwrap().name(), "a");
    }

    #[test]
    fn no_data_skips_unhealthy_first_member() {
        let dead = relay("dead", None);
        let fresh = Arc::new(Proxy::new(
            "fresh",
            ProxyKind::Leaf(Outbound::Relay {
                server: "127.0.0.1".into(),
                port: 1,
            }),
        ));
        let group = UrlTest::new(GroupMembers::from_proxies(vec![dead, fresh]), 0);
        let now = group.now().unwrap();
        assert_eq!(now.name(), "fresh");
        assert!(now.is_alive());
    }

    #[test]
    fn tolerance_keeps_current_choice() {
        let a = relay("a", Some(20));
        let b = relay("b", Some(25));
        let group = UrlTest::new(GroupMembers::from_proxies(vec![a.clone(), b.clone()]), 50);
        assert_eq!(group.now().unwrap().name(), "a");

        // b improves slightly; within tolerance, so a stays.
        b.health().record_success(Duration::from_millis(1));
        assert!(b.mean_delay() < a.mean_delay());
        assert_eq!(group.now().unwrap().name(), "a");

        // a dies; b takes over.
        a.health().record_failure(1);
        assert_eq!(group.now().unwrap().name(), "b");
    }
}
