//! Credential store
//!
//! Holds normalized credential bundles behind a reader-writer lock. Reads
//! return `Arc` snapshots so a concurrent delete never disturbs a reader that
//! already holds a bundle. The write section covers only the in-memory
//! mutation; persistence I/O happens outside it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{info, warn};

use kubedeck_common::{Error, Result};

use crate::bundle::{
    display_name_from_filename, targets_from_kubeconfig, BundleId, BundleSource, BundleSummary,
    CredentialBundle, Target,
};
use crate::persist::BundlePersistence;

/// Notified when a bundle leaves the store.
///
/// Called while the store's write section is held, so the callee observes the
/// removal atomically with respect to new lookups. Implementations must not
/// call back into the store.
pub trait EvictionListener: Send + Sync {
    /// A bundle was deleted
    fn bundle_removed(&self, id: BundleId);
}

#[derive(Default)]
struct Inner {
    bundles: HashMap<BundleId, Arc<CredentialBundle>>,
    order: Vec<BundleId>,
}

/// Thread-safe store of credential bundles
#[derive(Default)]
pub struct CredentialStore {
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<Weak<dyn EvictionListener>>>,
    persistence: Option<Arc<dyn BundlePersistence>>,
}

impl CredentialStore {
    /// Create an empty, memory-only store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store backed by a persistence collaborator, loading every
    /// bundle it already holds
    pub fn with_persistence(persistence: Arc<dyn BundlePersistence>) -> Result<Self> {
        let mut inner = Inner::default();
        for bundle in persistence.load_all()? {
            if inner.bundles.contains_key(&bundle.id) {
                warn!(bundle = %bundle.id, "Skipping duplicate stored bundle");
                continue;
            }
            inner.order.push(bundle.id);
            inner.bundles.insert(bundle.id, Arc::new(bundle));
        }
        info!(count = inner.order.len(), "Loaded credential bundles");

        Ok(Self {
            inner: RwLock::new(inner),
            listeners: RwLock::new(Vec::new()),
            persistence: Some(persistence),
        })
    }

    /// Add a bundle from kubeconfig content, one target per context.
    ///
    /// An empty display name falls back to the filename stem, then to the
    /// first context name.
    pub fn add(
        &self,
        content: &str,
        display_name: &str,
        filename: Option<&str>,
    ) -> Result<BundleId> {
        let targets = targets_from_kubeconfig(content)?;
        let display_name = match display_name.trim() {
            "" => filename
                .map(display_name_from_filename)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| targets[0].name.clone()),
            name => name.to_string(),
        };
        let bundle = CredentialBundle::assemble(
            display_name,
            BundleSource::Kubeconfig,
            filename.map(str::to_string),
            targets,
        )?;
        self.insert(bundle)
    }

    /// Add a single-target bundle from the bearer-token form
    pub fn add_from_token(&self, name: &str, endpoint: &str, token: &str) -> Result<BundleId> {
        let target = Target::from_token(name, endpoint, token)?;
        let bundle =
            CredentialBundle::assemble(target.name.clone(), BundleSource::Token, None, vec![target])?;
        self.insert(bundle)
    }

    /// Add a single-target bundle from the client-certificate form
    pub fn add_from_certificate(
        &self,
        name: &str,
        endpoint: &str,
        cert_pem: &str,
        key_pem: &str,
        ca_pem: Option<&str>,
    ) -> Result<BundleId> {
        let target = Target::from_certificate(name, endpoint, cert_pem, key_pem, ca_pem)?;
        let bundle = CredentialBundle::assemble(
            target.name.clone(),
            BundleSource::Certificate,
            None,
            vec![target],
        )?;
        self.insert(bundle)
    }

    fn insert(&self, bundle: CredentialBundle) -> Result<BundleId> {
        if let Some(persistence) = &self.persistence {
            persistence.save(&bundle)?;
        }

        let id = bundle.id;
        let target_count = bundle.targets.len();
        let display_name = bundle.display_name.clone();
        {
            let mut inner = self.inner.write();
            inner.order.push(id);
            inner.bundles.insert(id, Arc::new(bundle));
        }

        info!(bundle = %id, name = %display_name, targets = target_count, "Added credential bundle");
        Ok(id)
    }

    /// Get a bundle snapshot
    pub fn get(&self, id: BundleId) -> Result<Arc<CredentialBundle>> {
        self.inner
            .read()
            .bundles
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::bundle_not_found(id.to_string()))
    }

    /// Run `f` against one target while the read section is held.
    ///
    /// A concurrent delete either completes before `f` runs (the lookup
    /// fails) or waits until `f` returns.
    pub(crate) fn with_target<R>(
        &self,
        id: BundleId,
        target: &str,
        f: impl FnOnce(&Target) -> R,
    ) -> Result<R> {
        let inner = self.inner.read();
        let bundle = inner
            .bundles
            .get(&id)
            .ok_or_else(|| Error::bundle_not_found(id.to_string()))?;
        let target = bundle
            .target(target)
            .ok_or_else(|| Error::target_not_found(id, target))?;
        Ok(f(target))
    }

    /// Whether a bundle is currently stored
    pub fn contains(&self, id: BundleId) -> bool {
        self.inner.read().bundles.contains_key(&id)
    }

    /// Ordered snapshot of stored bundles, oldest first
    pub fn list(&self) -> Vec<BundleSummary> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.bundles.get(id))
            .map(|bundle| bundle.summary())
            .collect()
    }

    /// Delete a bundle, evicting every client built from it
    pub fn delete(&self, id: BundleId) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if inner.bundles.remove(&id).is_none() {
                return Err(Error::bundle_not_found(id.to_string()));
            }
            inner.order.retain(|existing| *existing != id);

            let mut listeners = self.listeners.write();
            listeners.retain(|listener| match listener.upgrade() {
                Some(listener) => {
                    listener.bundle_removed(id);
                    true
                }
                None => false,
            });
        }

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.remove(id) {
                warn!(bundle = %id, error = %e, "Failed to remove stored bundle");
            }
        }

        info!(bundle = %id, "Deleted credential bundle");
        Ok(())
    }

    /// Register a listener notified on every delete
    pub fn register_listener(&self, listener: Weak<dyn EvictionListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of stored bundles
    pub fn len(&self) -> usize {
        self.inner.read().bundles.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::{self_signed, two_context_kubeconfig};
    use crate::persist::FileBundlePersistence;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        removed: Mutex<Vec<BundleId>>,
    }

    impl EvictionListener for RecordingListener {
        fn bundle_removed(&self, id: BundleId) {
            self.removed.lock().unwrap().push(id);
        }
    }

    struct FailingPersistence;

    impl BundlePersistence for FailingPersistence {
        fn load_all(&self) -> Result<Vec<CredentialBundle>> {
            Ok(Vec::new())
        }

        fn save(&self, _bundle: &CredentialBundle) -> Result<()> {
            Err(Error::persistence("disk full"))
        }

        fn remove(&self, _id: BundleId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_add_kubeconfig_and_list() {
        let store = CredentialStore::new();
        let id = store
            .add(&two_context_kubeconfig(), "", Some("clusters.yaml"))
            .unwrap();

        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
        assert_eq!(list[0].display_name, "clusters");
        assert_eq!(list[0].target_names, vec!["east", "west"]);

        let bundle = store.get(id).unwrap();
        assert_eq!(bundle.origin.filename.as_deref(), Some("clusters.yaml"));
        assert_eq!(bundle.origin.source, BundleSource::Kubeconfig);
    }

    #[test]
    fn test_explicit_display_name_wins() {
        let store = CredentialStore::new();
        let id = store
            .add(&two_context_kubeconfig(), "Production", Some("clusters.yaml"))
            .unwrap();
        assert_eq!(store.get(id).unwrap().display_name, "Production");
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let store = CredentialStore::new();
        let a = store.add_from_token("a", "https://a.example.com", "t").unwrap();
        let b = store.add_from_token("b", "https://b.example.com", "t").unwrap();
        let c = store.add_from_token("c", "https://c.example.com", "t").unwrap();
        store.delete(b).unwrap();

        let ids: Vec<_> = store.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn test_invalid_token_form_leaves_store_unchanged() {
        let store = CredentialStore::new();
        let err = store.add_from_token("k", "", "tok").unwrap_err();
        assert!(err.is_validation());
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_invalid_kubeconfig_leaves_store_unchanged() {
        let store = CredentialStore::new();
        assert!(store.add("kind: Config\n", "x", None).unwrap_err().is_validation());
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_from_certificate() {
        let store = CredentialStore::new();
        let (cert, key) = self_signed();
        let id = store
            .add_from_certificate("edge", "https://edge.example.com", &cert, &key, None)
            .unwrap();
        let bundle = store.get(id).unwrap();
        assert_eq!(bundle.display_name, "edge");
        assert_eq!(bundle.origin.source, BundleSource::Certificate);
    }

    #[test]
    fn test_same_content_twice_gets_two_ids() {
        let store = CredentialStore::new();
        let content = two_context_kubeconfig();
        let first = store.add(&content, "x", None).unwrap();
        let second = store.add(&content, "x", None).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let store = CredentialStore::new();
        assert!(store.delete(BundleId::new()).unwrap_err().is_not_found());
        assert!(store.get(BundleId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_snapshot_survives_delete() {
        let store = CredentialStore::new();
        let id = store.add_from_token("a", "https://a.example.com", "t").unwrap();
        let snapshot = store.get(id).unwrap();
        store.delete(id).unwrap();
        assert_eq!(snapshot.targets[0].name, "a");
        assert!(!store.contains(id));
    }

    #[test]
    fn test_listeners_notified_and_pruned() {
        let store = CredentialStore::new();
        let listener = Arc::new(RecordingListener::default());
        let as_dyn: Arc<dyn EvictionListener> = listener.clone();
        store.register_listener(Arc::downgrade(&as_dyn));

        let dropped: Arc<dyn EvictionListener> = Arc::new(RecordingListener::default());
        store.register_listener(Arc::downgrade(&dropped));
        drop(dropped);

        let id = store.add_from_token("a", "https://a.example.com", "t").unwrap();
        store.delete(id).unwrap();

        assert_eq!(*listener.removed.lock().unwrap(), vec![id]);
        assert_eq!(store.listeners.read().len(), 1);
    }

    #[test]
    fn test_with_target_reports_missing_target() {
        let store = CredentialStore::new();
        let id = store.add_from_token("a", "https://a.example.com", "t").unwrap();
        let endpoint = store.with_target(id, "a", |t| t.endpoint.clone()).unwrap();
        assert_eq!(endpoint, "https://a.example.com");

        let err = store.with_target(id, "nope", |_| ()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(FileBundlePersistence::new(dir.path()).unwrap());

        let store = CredentialStore::with_persistence(persistence.clone()).unwrap();
        let kept = store.add_from_token("a", "https://a.example.com", "t").unwrap();
        let gone = store.add(&two_context_kubeconfig(), "multi", None).unwrap();
        store.delete(gone).unwrap();
        drop(store);

        let reopened = CredentialStore::with_persistence(persistence).unwrap();
        let ids: Vec<_> = reopened.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![kept]);
    }

    #[test]
    fn test_failed_save_rejects_add() {
        let store = CredentialStore::with_persistence(Arc::new(FailingPersistence)).unwrap();
        let err = store
            .add_from_token("a", "https://a.example.com", "t")
            .unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        assert!(store.is_empty());
    }
}
