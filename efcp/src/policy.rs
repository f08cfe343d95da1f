//! Policy-set selection (§6 `select_policy_set`/`set_policy_set_param`,
//! REDESIGN FLAGS Design Notes 1 & 3).
//!
//! The source keeps a singleton registry of named policy-set factories
//! mutated from module init/exit and swapped under RCU. This instead models
//! the registry as a plain name slot per path, swapped under a mutex; readers
//! take a short-lived clone. Only the `"default"` policy set ships in this
//! workspace (dtp::DefaultDtpPolicySet / dtcp::DefaultDtcpPolicySet), so
//! `select_policy_set` only validates the name rather than performing a real
//! dynamic swap — there is nothing else to swap to yet. Exposed anyway since
//! conformance only requires exposing `"default"` (§6), and the slot backs
//! the `ps_name` observability read.
use std::sync::Mutex;

/// One path's (`"dtp"` or `"dtcp"`) currently selected policy-set name.
pub struct PolicySetSlot {
    name: Mutex<String>,
}

impl PolicySetSlot {
    /// Creates a slot defaulting to `"default"`.
    pub fn new() -> Self {
        Self {
            name: Mutex::new("default".to_string()),
        }
    }

    /// Current policy-set name.
    pub fn get(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    /// Swaps in `name`, the only recognized value being `"default"`.
    pub fn select(&self, name: &str) -> bool {
        if name != "default" {
            return false;
        }
        *self.name.lock().unwrap() = name.to_string();
        true
    }
}

impl Default for PolicySetSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_default_and_rejects_unknown_names() {
        let slot = PolicySetSlot::new();
        assert_eq!(slot.get(), "default");
        assert!(!slot.select("exotic"));
        assert_eq!(slot.get(), "default");
        assert!(slot.select("default"));
    }
}
