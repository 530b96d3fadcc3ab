//! Instance model - A logical instance of the managed application family
//!
//! Instances are synthesized on every reconciliation pass from live process
//! state plus persisted clone records; they are never persisted themselves.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The application family being managed: the original bundle identity plus
/// the naming scheme its clones follow.
///
/// Clone identities append the ordinal directly to the base identity, so
/// `com.example.app` spawns `com.example.app1`, `com.example.app2`, ...
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityFamily {
    /// Marketing name of the application ("App" gives clones "App 2", ...)
    pub app_name: String,
    /// Bundle identity of the original, un-cloned application
    pub base_identity: String,
}

impl IdentityFamily {
    pub fn new(app_name: impl Into<String>, base_identity: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            base_identity: base_identity.into(),
        }
    }

    /// Derive the identity for an ordinal. Ordinal 0 is the original.
    pub fn identity_for(&self, ordinal: u32) -> String {
        if ordinal == 0 {
            self.base_identity.clone()
        } else {
            format!("{}{}", self.base_identity, ordinal)
        }
    }

    /// Display name for an ordinal; the first clone reads "App 2" because the
    /// original occupies the unnumbered slot.
    pub fn display_name_for(&self, ordinal: u32) -> String {
        if ordinal == 0 {
            self.app_name.clone()
        } else {
            format!("{} {}", self.app_name, ordinal + 1)
        }
    }

    /// Parse the ordinal back out of an identity string.
    ///
    /// Returns `Some(0)` for the bare base identity, `Some(n)` for a base
    /// identity followed by a decimal suffix, and `None` for identities
    /// outside the family.
    pub fn parse_ordinal(&self, identity: &str) -> Option<u32> {
        if identity == self.base_identity {
            return Some(0);
        }
        let suffix = identity.strip_prefix(self.base_identity.as_str())?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }

    /// Whether an identity belongs to this family.
    pub fn contains(&self, identity: &str) -> bool {
        self.parse_ordinal(identity).is_some()
    }
}

/// A logical instance of the managed application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Bundle identity; unique among all instances
    pub identity: String,
    /// 0 = original, 1..N = clones
    pub ordinal: u32,
    /// Operating system process ID, when running
    pub pid: Option<u32>,
    /// When the process was launched, when known
    pub launch_time: Option<DateTime<Utc>>,
    /// Whether a live process currently backs this instance
    pub running: bool,
    /// Recent CPU usage in percent
    pub cpu_percent: f32,
    /// Resident memory in megabytes
    pub memory_mb: f64,
    /// User-assigned display name, if any
    pub custom_name: Option<String>,
    /// Clone creation is still in flight for this ordinal
    pub creating: bool,
    /// Bundle path on disk, when known
    pub path: Option<PathBuf>,
}

impl Instance {
    pub fn stopped(identity: String, ordinal: u32, path: Option<PathBuf>) -> Self {
        Self {
            identity,
            ordinal,
            pid: None,
            launch_time: None,
            running: false,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            custom_name: None,
            creating: false,
            path,
        }
    }

    pub fn running(identity: String, ordinal: u32, pid: u32, path: Option<PathBuf>) -> Self {
        Self {
            identity,
            ordinal,
            pid: Some(pid),
            launch_time: None,
            running: true,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            custom_name: None,
            creating: false,
            path,
        }
    }

    /// Placeholder shown while the clone factory is still copying.
    pub fn creating(family: &IdentityFamily, ordinal: u32) -> Self {
        Self {
            identity: family.identity_for(ordinal),
            ordinal,
            pid: None,
            launch_time: None,
            running: false,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            custom_name: None,
            creating: true,
            path: None,
        }
    }

    /// Display name: custom name if set, derived family name otherwise.
    pub fn display_name(&self, family: &IdentityFamily) -> String {
        match &self.custom_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => family.display_name_for(self.ordinal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family() -> IdentityFamily {
        IdentityFamily::new("App", "com.example.app")
    }

    #[test]
    fn identity_round_trip() {
        let f = family();
        assert_eq!(f.identity_for(0), "com.example.app");
        assert_eq!(f.identity_for(3), "com.example.app3");
        assert_eq!(f.parse_ordinal("com.example.app"), Some(0));
        assert_eq!(f.parse_ordinal("com.example.app3"), Some(3));
        assert_eq!(f.parse_ordinal("com.example.app12"), Some(12));
    }

    #[test]
    fn foreign_identities_rejected() {
        let f = family();
        assert_eq!(f.parse_ordinal("com.example.other"), None);
        assert_eq!(f.parse_ordinal("com.example.app3beta"), None);
        assert_eq!(f.parse_ordinal("com.example.ap"), None);
        assert!(!f.contains("org.unrelated"));
    }

    #[test]
    fn display_names_skip_the_original_slot() {
        let f = family();
        assert_eq!(f.display_name_for(0), "App");
        assert_eq!(f.display_name_for(1), "App 2");
        assert_eq!(f.display_name_for(4), "App 5");
    }

    #[test]
    fn custom_name_wins_when_present() {
        let f = family();
        let mut inst = Instance::stopped("com.example.app1".into(), 1, None);
        assert_eq!(inst.display_name(&f), "App 2");
        inst.custom_name = Some("Work".into());
        assert_eq!(inst.display_name(&f), "Work");
        inst.custom_name = Some(String::new());
        assert_eq!(inst.display_name(&f), "App 2");
    }
}
