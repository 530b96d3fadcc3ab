//! Application settings management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::instance::IdentityFamily;

/// Settings for the clone manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Managed application family
    /// Marketing name of the managed application
    pub app_name: String,
    /// Bundle identity of the original application
    pub base_identity: String,
    /// Where the original application bundle is installed
    pub original_app_path: PathBuf,

    // Scheduling
    /// Full reconciliation interval in seconds
    pub reconcile_interval_secs: u64,
    /// Lightweight resource refresh interval in seconds
    pub refresh_interval_secs: u64,
    /// Grace period before a terminated process is force-killed, seconds
    pub terminate_grace_secs: u64,

    // Updates
    /// Release feed URL (GitHub-releases-shaped JSON array)
    pub feed_url: String,
    /// Also offer prerelease builds
    pub include_prereleases: bool,
    /// Version string whose interactive prompt is suppressed
    pub ignored_version: Option<String>,

    // Advanced
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "MultiClone Target".to_string(),
            base_identity: "com.example.app".to_string(),
            original_app_path: PathBuf::from("/Applications/App.app"),

            reconcile_interval_secs: 3,
            refresh_interval_secs: 1,
            terminate_grace_secs: 2,

            feed_url: "https://api.github.com/repos/multiclone/multiclone/releases".to_string(),
            include_prereleases: false,
            ignored_version: None,

            data_directory: None,
        }
    }
}

impl Settings {
    /// The identity family derived from these settings.
    pub fn family(&self) -> IdentityFamily {
        IdentityFamily::new(self.app_name.clone(), self.base_identity.clone())
    }

    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("MultiClone")
        })
    }

    /// Directory holding clone bundles
    pub fn clones_directory(&self) -> PathBuf {
        self.get_data_directory().join("clones")
    }

    /// Staging area for downloaded updates
    pub fn staging_directory(&self) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| self.get_data_directory().join("cache"))
            .join("MultiClone")
            .join("updates")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.reconcile_interval_secs = self.reconcile_interval_secs.max(1);
        self.refresh_interval_secs = self.refresh_interval_secs.max(1);
        self.terminate_grace_secs = self.terminate_grace_secs.clamp(1, 30);
        if self.ignored_version.as_deref() == Some("") {
            self.ignored_version = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_clamps_intervals() {
        let mut s = Settings {
            reconcile_interval_secs: 0,
            refresh_interval_secs: 0,
            terminate_grace_secs: 120,
            ignored_version: Some(String::new()),
            ..Default::default()
        };
        s.validate();
        assert_eq!(s.reconcile_interval_secs, 1);
        assert_eq!(s.refresh_interval_secs, 1);
        assert_eq!(s.terminate_grace_secs, 30);
        assert_eq!(s.ignored_version, None);
    }
}
