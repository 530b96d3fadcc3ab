//! Custom display names, keyed by bundle identity

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

/// Persisted JSON object mapping identity -> user-chosen display name.
pub struct CustomNames {
    path: PathBuf,
    map: HashMap<String, String>,
}

impl CustomNames {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("names.json");
        let map: HashMap<String, String> = super::read_json(&path)?.unwrap_or_default();
        Ok(Self { path, map })
    }

    pub fn map(&self) -> &HashMap<String, String> {
        &self.map
    }

    pub fn get(&self, identity: &str) -> Option<&str> {
        self.map.get(identity).map(String::as_str)
    }

    /// Set or clear the name for an identity and persist immediately.
    pub fn set(&mut self, identity: &str, name: Option<String>) -> Result<()> {
        match name {
            Some(name) if !name.trim().is_empty() => {
                self.map.insert(identity.to_string(), name);
            }
            _ => {
                self.map.remove(identity);
            }
        }
        super::write_json(&self.path, &self.map)
    }

    /// Drop the name for an identity whose clone was deleted.
    pub fn remove(&mut self, identity: &str) -> Result<()> {
        self.set(identity, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn names_round_trip_and_blank_clears() {
        let dir = TempDir::new().unwrap();
        let mut names = CustomNames::load(dir.path()).unwrap();
        names.set("com.example.app1", Some("Work".into())).unwrap();
        names.set("com.example.app2", Some("  ".into())).unwrap();

        let reloaded = CustomNames::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("com.example.app1"), Some("Work"));
        assert_eq!(reloaded.get("com.example.app2"), None);
    }
}
