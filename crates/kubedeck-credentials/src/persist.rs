//! Bundle persistence
//!
//! The store keeps bundles in memory; a [`BundlePersistence`] collaborator
//! makes them survive restarts. [`FileBundlePersistence`] keeps one JSON
//! document per bundle in a directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use kubedeck_common::{Error, Result};

use crate::bundle::{BundleId, CredentialBundle};

/// Storage backend for credential bundles
pub trait BundlePersistence: Send + Sync {
    /// Load every stored bundle, oldest first
    fn load_all(&self) -> Result<Vec<CredentialBundle>>;

    /// Store (or overwrite) one bundle
    fn save(&self, bundle: &CredentialBundle) -> Result<()>;

    /// Remove one bundle; removing an absent bundle is not an error
    fn remove(&self, id: BundleId) -> Result<()>;
}

/// Directory-backed persistence, one `<id>.json` file per bundle
pub struct FileBundlePersistence {
    dir: PathBuf,
}

impl FileBundlePersistence {
    /// Open (creating if needed) a bundle directory
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::persistence(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    /// Directory bundles are stored in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: BundleId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl BundlePersistence for FileBundlePersistence {
    fn load_all(&self) -> Result<Vec<CredentialBundle>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Error::persistence(format!("failed to read {}: {}", self.dir.display(), e))
        })?;

        let mut bundles = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|data| {
                    serde_json::from_str::<CredentialBundle>(&data).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(bundle) if !bundle.targets.is_empty() => bundles.push(bundle),
                Ok(_) => warn!(path = %path.display(), "Skipping stored bundle without targets"),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable bundle file"),
            }
        }

        bundles.sort_by(|a, b| {
            a.origin
                .added_at
                .cmp(&b.origin.added_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!(dir = %self.dir.display(), count = bundles.len(), "Loaded stored bundles");
        Ok(bundles)
    }

    fn save(&self, bundle: &CredentialBundle) -> Result<()> {
        let data = serde_json::to_vec_pretty(bundle)
            .map_err(|e| Error::persistence(format!("failed to serialize bundle: {}", e)))?;

        // Write-then-rename so a crash never leaves a truncated bundle behind
        let final_path = self.path_for(bundle.id);
        let tmp_path = final_path.with_extension("json.tmp");
        let mut file = open_private(&tmp_path).map_err(|e| {
            Error::persistence(format!("failed to create {}: {}", tmp_path.display(), e))
        })?;
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                Error::persistence(format!("failed to write {}: {}", tmp_path.display(), e))
            })?;
        fs::rename(&tmp_path, &final_path).map_err(|e| {
            Error::persistence(format!("failed to store {}: {}", final_path.display(), e))
        })
    }

    fn remove(&self, id: BundleId) -> Result<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::persistence(format!(
                "failed to remove bundle {}: {}",
                id, e
            ))),
        }
    }
}

/// Bundle files hold secrets; keep them owner-only
#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}
