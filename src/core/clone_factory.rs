//! Clone factory - Produces identity-rewritten copies of the trusted bundle

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use super::error::CloneError;
use super::instance::IdentityFamily;
use crate::persistence::CloneRecord;
use crate::platform;

/// Bundle-level operations the factory needs from the OS. The real
/// implementation shells out to the platform tools; tests substitute fakes.
pub trait BundleOps: Send + Sync {
    /// Rewrite the bundle's identity metadata and display name.
    fn rewrite_identity(&self, bundle: &Path, identity: &str, display_name: &str) -> Result<()>;
    /// Strip any download-quarantine marker from the bundle tree.
    fn strip_quarantine(&self, bundle: &Path) -> Result<()>;
    /// Apply a local ad-hoc signature. The clone is a byte copy of an
    /// already-trusted binary; this satisfies execution policy without
    /// establishing any new trust.
    fn sign_adhoc(&self, bundle: &Path) -> Result<()>;
    /// Invalidate the application-discovery cache for the bundle.
    fn refresh_discovery_cache(&self, bundle: &Path) -> Result<()>;
}

/// `BundleOps` backed by the platform tools.
pub struct SystemBundleOps;

impl BundleOps for SystemBundleOps {
    fn rewrite_identity(&self, bundle: &Path, identity: &str, display_name: &str) -> Result<()> {
        platform::rewrite_bundle_identity(bundle, identity, display_name)
    }

    fn strip_quarantine(&self, bundle: &Path) -> Result<()> {
        platform::strip_quarantine(bundle)
    }

    fn sign_adhoc(&self, bundle: &Path) -> Result<()> {
        platform::sign_adhoc(bundle)
    }

    fn refresh_discovery_cache(&self, bundle: &Path) -> Result<()> {
        platform::refresh_discovery_cache(bundle)
    }
}

/// Smallest positive integer not used by any existing clone id.
pub fn next_ordinal(existing: &[u32]) -> u32 {
    let mut ordinal = 1;
    while existing.contains(&ordinal) {
        ordinal += 1;
    }
    ordinal
}

/// Creates, deletes, and upgrades clone bundles on disk.
///
/// The factory never touches the registry; callers register a record only
/// after `create_clone` returns, so a failed creation leaves no state.
#[derive(Clone)]
pub struct CloneFactory {
    family: IdentityFamily,
    clones_dir: PathBuf,
    ops: Arc<dyn BundleOps>,
}

impl CloneFactory {
    pub fn new(family: IdentityFamily, clones_dir: PathBuf, ops: Arc<dyn BundleOps>) -> Self {
        Self {
            family,
            clones_dir,
            ops,
        }
    }

    /// Copy `source` into a fresh clone bundle with a derived identity.
    ///
    /// Steps: allocate ordinal, copy tree, rewrite identity, strip
    /// quarantine, ad-hoc sign, refresh discovery cache. Any failure removes
    /// the partial copy and maps to `CopyCreationFailed`.
    pub fn create_clone(
        &self,
        source: &Path,
        existing_ids: &[u32],
    ) -> Result<CloneRecord, CloneError> {
        if !source.exists() {
            return Err(CloneError::NotInstalled(source.to_path_buf()));
        }

        let ordinal = next_ordinal(existing_ids);
        let identity = self.family.identity_for(ordinal);
        let name = self.family.display_name_for(ordinal);
        let dest = self.bundle_path(ordinal);

        info!("Creating clone {} at {:?}", identity, dest);

        let result = self.materialize(source, &dest, &identity, &name);
        if let Err(e) = result {
            if dest.exists() {
                if let Err(cleanup) = std::fs::remove_dir_all(&dest) {
                    warn!("Failed to remove partial clone {:?}: {}", dest, cleanup);
                }
            }
            return Err(CloneError::CopyCreationFailed(e));
        }

        Ok(CloneRecord {
            id: ordinal,
            name,
            path: dest,
            identity,
            created_at: Utc::now(),
        })
    }

    /// Delete a clone's bundle tree. Rejected when the identity is live.
    pub fn delete_clone(
        &self,
        record: &CloneRecord,
        live: &HashMap<String, u32>,
    ) -> Result<(), CloneError> {
        if live.contains_key(&record.identity) {
            return Err(CloneError::IdentityInUse(record.identity.clone()));
        }

        if record.path.exists() {
            std::fs::remove_dir_all(&record.path)
                .with_context(|| format!("Failed to remove {:?}", record.path))
                .map_err(CloneError::CopyCreationFailed)?;
        }
        info!("Deleted clone {} ({:?})", record.identity, record.path);
        Ok(())
    }

    /// Replace a clone's bundle with a new source while keeping its identity
    /// and display name, so identity-keyed external state survives.
    pub fn upgrade_clone(
        &self,
        record: &CloneRecord,
        new_source: &Path,
        live: &HashMap<String, u32>,
    ) -> Result<(), CloneError> {
        if live.contains_key(&record.identity) {
            return Err(CloneError::IdentityInUse(record.identity.clone()));
        }
        if !new_source.exists() {
            return Err(CloneError::NotInstalled(new_source.to_path_buf()));
        }

        info!("Upgrading clone {} from {:?}", record.identity, new_source);

        if record.path.exists() {
            std::fs::remove_dir_all(&record.path)
                .with_context(|| format!("Failed to remove old bundle {:?}", record.path))
                .map_err(CloneError::CopyCreationFailed)?;
        }

        let result = self.materialize(new_source, &record.path, &record.identity, &record.name);
        if let Err(e) = result {
            if record.path.exists() {
                if let Err(cleanup) = std::fs::remove_dir_all(&record.path) {
                    warn!("Failed to remove partial upgrade {:?}: {}", record.path, cleanup);
                }
            }
            return Err(CloneError::CopyCreationFailed(e));
        }
        Ok(())
    }

    /// Bundle path a clone at `ordinal` will occupy.
    pub fn bundle_path(&self, ordinal: u32) -> PathBuf {
        self.clones_dir
            .join(format!("{}.app", self.family.display_name_for(ordinal)))
    }

    /// Copy + rewrite + seal a bundle at `dest`.
    fn materialize(
        &self,
        source: &Path,
        dest: &Path,
        identity: &str,
        display_name: &str,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.clones_dir)
            .with_context(|| format!("Failed to create {:?}", self.clones_dir))?;
        if dest.exists() {
            anyhow::bail!("Destination {:?} already exists", dest);
        }

        copy_tree(source, dest).with_context(|| format!("Failed to copy {:?}", source))?;
        self.ops.rewrite_identity(dest, identity, display_name)?;
        self.ops.strip_quarantine(dest)?;
        self.ops.sign_adhoc(dest)?;
        self.ops.refresh_discovery_cache(dest)?;
        Ok(())
    }
}

/// Recursively copy a directory tree, preserving symlinks.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(source)?;

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(source)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, dest)?;
        #[cfg(not(unix))]
        std::fs::copy(source, dest).map(|_| ())?;
        return Ok(());
    }

    if meta.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
        return Ok(());
    }

    std::fs::copy(source, dest)?;
    Ok(())
}
