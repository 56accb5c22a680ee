//! Capability checks
//!
//! The core never sees credentials. The embedding layer authenticates the
//! caller, hands over a [`Principal`], and a [`CapabilityCheck`] decides
//! whether that principal may perform each action. Session ownership is
//! enforced separately by the session manager.

use crate::types::{Action, Principal};

/// Pluggable authorization collaborator
#[cfg_attr(test, mockall::automock)]
pub trait CapabilityCheck: Send + Sync {
    /// Whether `principal` may perform `action`
    fn permits(&self, principal: &Principal, action: Action) -> bool;
}

/// Permits every action (single-tenant deployments, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn permits(&self, _principal: &Principal, _action: Action) -> bool {
        true
    }
}

/// Permits only an explicit list of actions, for every principal
#[derive(Debug, Clone, Default)]
pub struct ActionAllowList {
    allowed: Vec<Action>,
}

impl ActionAllowList {
    /// Create allow list
    #[must_use]
    pub fn new(allowed: impl IntoIterator<Item = Action>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl CapabilityCheck for ActionAllowList {
    fn permits(&self, _principal: &Principal, action: Action) -> bool {
        self.allowed.contains(&action)
    }
}
