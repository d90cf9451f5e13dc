//! Ordered fallback group.

use std::sync::Arc;

use crate::adapter::group::GroupMembers;
use crate::adapter::Proxy;

/// Tries alive members in declaration order.
#[derive(Debug)]
pub struct Fallback {
    members: GroupMembers,
}

impl Fallback {
    pub fn new(members: GroupMembers) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &GroupMembers {
        &self.members
    }

    /// Members to attempt, in order. When none is alive every member is
    /// returned so a connect is still attempted.
    pub fn candidates(&self) -> Vec<Arc<Proxy>> {
        let members = self.members.resolve();
        let alive: Vec<Arc<Proxy>> = members.iter().filter(|p| p.is_alive()).cloned().collect();
        if alive.is_empty() {
            members
        } else {
            alive
        }
    }

    pub fn now(&self) -> Option<Arc<Proxy>> {
        self.candidates().into_iter().next()
    }
}
