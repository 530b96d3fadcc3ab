//! Clone registry - Persisted records of identity-rewritten bundle copies

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A persisted clone: one identity-rewritten copy of the base bundle.
///
/// The identity is assigned at creation and survives upgrades; external
/// state keyed by it (user data, OS caches) stays valid across a full
/// file replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRecord {
    /// Ordinal id; 1..N, never 0 (the original is not a clone)
    pub id: u32,
    /// Display name baked into the bundle at creation
    pub name: String,
    /// Bundle path on disk
    pub path: PathBuf,
    /// Rewritten bundle identity
    pub identity: String,
    /// When the clone was created
    pub created_at: DateTime<Utc>,
}

/// JSON-array-backed store of clone records.
pub struct CloneRegistry {
    path: PathBuf,
    records: Vec<CloneRecord>,
}

impl CloneRegistry {
    /// Load the registry, starting empty when the file does not exist yet.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("clones.json");
        let records: Vec<CloneRecord> = super::read_json(&path)?.unwrap_or_default();
        info!("Loaded {} clone record(s) from {:?}", records.len(), path);
        Ok(Self { path, records })
    }

    pub fn records(&self) -> &[CloneRecord] {
        &self.records
    }

    pub fn ids(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.id).collect()
    }

    pub fn find_by_identity(&self, identity: &str) -> Option<&CloneRecord> {
        self.records.iter().find(|r| r.identity == identity)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&CloneRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Register a freshly created clone and persist immediately.
    pub fn add(&mut self, record: CloneRecord) -> Result<()> {
        self.records.push(record);
        self.records.sort_by_key(|r| r.id);
        self.save()
    }

    /// Unregister a clone and persist immediately.
    pub fn remove(&mut self, id: u32) -> Result<()> {
        self.records.retain(|r| r.id != id);
        self.save()
    }

    fn save(&self) -> Result<()> {
        super::write_json(&self.path, &self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: u32) -> CloneRecord {
        CloneRecord {
            id,
            name: format!("App {}", id + 1),
            path: PathBuf::from(format!("/tmp/App {}.app", id + 1)),
            identity: format!("com.example.app{}", id),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn registry_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let mut registry = CloneRegistry::load(dir.path()).unwrap();
        assert!(registry.records().is_empty());

        registry.add(record(2)).unwrap();
        registry.add(record(1)).unwrap();

        let reloaded = CloneRegistry::load(dir.path()).unwrap();
        assert_eq!(reloaded.ids(), vec![1, 2]);
        assert_eq!(
            reloaded.find_by_identity("com.example.app2").map(|r| r.id),
            Some(2)
        );
    }

    #[test]
    fn remove_persists() {
        let dir = TempDir::new().unwrap();
        let mut registry = CloneRegistry::load(dir.path()).unwrap();
        registry.add(record(1)).unwrap();
        registry.add(record(2)).unwrap();
        registry.remove(1).unwrap();

        let reloaded = CloneRegistry::load(dir.path()).unwrap();
        assert_eq!(reloaded.ids(), vec![2]);
    }

    #[test]
    fn records_serialize_with_camel_case_keys() {
        let json = serde_json::to_value(record(1)).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("identity").is_some());
    }
}
