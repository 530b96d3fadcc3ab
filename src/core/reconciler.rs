//! Instance reconciliation - Pure derivation of the authoritative instance list
//!
//! Merges live process state, persisted clone records, and transient
//! placeholders into one ordered list. The function is deterministic and
//! idempotent: identical inputs always yield an identical list, so it can be
//! re-run on every timer tick and OS notification without flicker.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::instance::{IdentityFamily, Instance};
use crate::persistence::CloneRecord;

/// A clone creation still in flight; keeps its ordinal visible in the list
/// until a real instance takes the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatingPlaceholder {
    pub ordinal: u32,
    pub started_at: DateTime<Utc>,
}

/// Inputs for one reconciliation pass.
pub struct ReconcileInputs<'a> {
    /// Live identity -> pid map from the process monitor
    pub live: &'a HashMap<String, u32>,
    /// Persisted clone records
    pub records: &'a [CloneRecord],
    /// Whether the original, un-cloned application is installed
    pub original_installed: bool,
    /// Path of the original application bundle
    pub original_path: &'a PathBuf,
    /// Clone creations still in flight
    pub placeholders: &'a [CreatingPlaceholder],
    /// Custom display names keyed by identity
    pub custom_names: &'a HashMap<String, String>,
}

/// Derive the instance list for one pass.
///
/// Ordinals key the merge: every live identity claims its ordinal first,
/// stopped entries fill the remaining slots, and placeholders survive only
/// where no real instance landed. The result is sorted by ordinal and never
/// holds two instances with the same ordinal or identity.
pub fn reconcile(family: &IdentityFamily, inputs: ReconcileInputs<'_>) -> Vec<Instance> {
    let mut by_ordinal: BTreeMap<u32, Instance> = BTreeMap::new();

    let record_by_identity: HashMap<&str, &CloneRecord> = inputs
        .records
        .iter()
        .map(|r| (r.identity.as_str(), r))
        .collect();

    // Running instances claim their ordinals first.
    for (identity, pid) in inputs.live {
        let Some(ordinal) = family.parse_ordinal(identity) else {
            continue;
        };
        let path = record_by_identity
            .get(identity.as_str())
            .map(|r| r.path.clone())
            .or_else(|| (ordinal == 0).then(|| inputs.original_path.clone()));
        by_ordinal
            .entry(ordinal)
            .or_insert_with(|| Instance::running(identity.clone(), ordinal, *pid, path));
    }

    // The original, when installed but not running, shows up stopped.
    if inputs.original_installed && !by_ordinal.contains_key(&0) {
        by_ordinal.insert(
            0,
            Instance::stopped(
                family.base_identity.clone(),
                0,
                Some(inputs.original_path.clone()),
            ),
        );
    }

    // Stopped clones fill their recorded ordinals.
    for record in inputs.records {
        by_ordinal.entry(record.id).or_insert_with(|| {
            Instance::stopped(record.identity.clone(), record.id, Some(record.path.clone()))
        });
    }

    // Placeholders survive only while their ordinal is unclaimed.
    for placeholder in inputs.placeholders {
        by_ordinal
            .entry(placeholder.ordinal)
            .or_insert_with(|| Instance::creating(family, placeholder.ordinal));
    }

    let mut instances: Vec<Instance> = by_ordinal.into_values().collect();
    for instance in &mut instances {
        instance.custom_name = inputs.custom_names.get(&instance.identity).cloned();
    }
    instances
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family() -> IdentityFamily {
        IdentityFamily::new("App", "com.example.app")
    }

    fn record(id: u32) -> CloneRecord {
        CloneRecord {
            id,
            name: format!("App {}", id + 1),
            path: PathBuf::from(format!("/apps/App {}.app", id + 1)),
            identity: format!("com.example.app{}", id),
            created_at: Utc::now(),
        }
    }

    struct Fixture {
        live: HashMap<String, u32>,
        records: Vec<CloneRecord>,
        original_installed: bool,
        original_path: PathBuf,
        placeholders: Vec<CreatingPlaceholder>,
        custom_names: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                live: HashMap::new(),
                records: Vec::new(),
                original_installed: true,
                original_path: PathBuf::from("/Applications/App.app"),
                placeholders: Vec::new(),
                custom_names: HashMap::new(),
            }
        }

        fn run(&self) -> Vec<Instance> {
            reconcile(
                &family(),
                ReconcileInputs {
                    live: &self.live,
                    records: &self.records,
                    original_installed: self.original_installed,
                    original_path: &self.original_path,
                    placeholders: &self.placeholders,
                    custom_names: &self.custom_names,
                },
            )
        }
    }

    #[test]
    fn live_processes_become_running_instances() {
        let mut fx = Fixture::new();
        fx.live.insert("com.example.app".into(), 100);
        fx.live.insert("com.example.app2".into(), 200);
        fx.records = vec![record(2)];

        let list = fx.run();
        assert_eq!(list.len(), 2);
        assert!(list[0].running && list[0].ordinal == 0 && list[0].pid == Some(100));
        assert!(list[1].running && list[1].ordinal == 2 && list[1].pid == Some(200));
        assert_eq!(list[1].path.as_deref(), Some(fx.records[0].path.as_path()));
    }

    #[test]
    fn installed_original_appears_stopped_when_not_live() {
        let fx = Fixture::new();
        let list = fx.run();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].ordinal, 0);
        assert!(!list[0].running);
        assert_eq!(list[0].path.as_deref(), Some(fx.original_path.as_path()));
    }

    #[test]
    fn missing_original_emits_nothing_at_ordinal_zero() {
        let mut fx = Fixture::new();
        fx.original_installed = false;
        fx.records = vec![record(1)];
        let list = fx.run();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].ordinal, 1);
    }

    #[test]
    fn stopped_clones_fill_their_ordinals() {
        let mut fx = Fixture::new();
        fx.records = vec![record(3), record(1)];
        let list = fx.run();
        let ordinals: Vec<u32> = list.iter().map(|i| i.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 3]);
        assert!(list.iter().skip(1).all(|i| !i.running));
    }

    #[test]
    fn placeholder_survives_only_while_unclaimed() {
        let mut fx = Fixture::new();
        fx.placeholders = vec![CreatingPlaceholder {
            ordinal: 2,
            started_at: Utc::now(),
        }];
        let list = fx.run();
        assert!(list.iter().any(|i| i.ordinal == 2 && i.creating));

        // Once the record lands, the placeholder must not duplicate the slot.
        fx.records = vec![record(2)];
        let list = fx.run();
        let at_two: Vec<&Instance> = list.iter().filter(|i| i.ordinal == 2).collect();
        assert_eq!(at_two.len(), 1);
        assert!(!at_two[0].creating);
    }

    #[test]
    fn custom_names_attach_by_identity() {
        let mut fx = Fixture::new();
        fx.records = vec![record(1)];
        fx.custom_names
            .insert("com.example.app1".into(), "Work".into());
        let list = fx.run();
        let clone = list.iter().find(|i| i.ordinal == 1).unwrap();
        assert_eq!(clone.custom_name.as_deref(), Some("Work"));
    }

    #[test]
    fn reconcile_is_deterministic_and_idempotent() {
        let mut fx = Fixture::new();
        fx.live.insert("com.example.app1".into(), 11);
        fx.live.insert("com.example.app4".into(), 44);
        fx.records = vec![record(1), record(2), record(4)];
        fx.placeholders = vec![CreatingPlaceholder {
            ordinal: 5,
            started_at: Utc::now(),
        }];

        let first = fx.run();
        for _ in 0..10 {
            assert_eq!(fx.run(), first);
        }
    }

    #[test]
    fn back_to_back_passes_never_duplicate_ordinals() {
        let mut fx = Fixture::new();
        fx.live.insert("com.example.app".into(), 1);
        fx.live.insert("com.example.app1".into(), 2);
        fx.records = vec![record(1), record(2)];
        fx.placeholders = vec![
            CreatingPlaceholder {
                ordinal: 1,
                started_at: Utc::now(),
            },
            CreatingPlaceholder {
                ordinal: 3,
                started_at: Utc::now(),
            },
        ];

        for _ in 0..2 {
            let list = fx.run();
            let mut ordinals: Vec<u32> = list.iter().map(|i| i.ordinal).collect();
            ordinals.dedup();
            assert_eq!(ordinals.len(), list.len());
            let mut sorted = ordinals.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, ordinals, "list must be ordinal-sorted");
        }
    }

    #[test]
    fn foreign_live_identities_are_ignored() {
        let mut fx = Fixture::new();
        fx.live.insert("com.other.tool".into(), 77);
        let list = fx.run();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].ordinal, 0);
    }
}
