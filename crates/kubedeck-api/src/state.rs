//! Shared state handed to request handlers

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use kubedeck_common::{Result, Settings};
use kubedeck_credentials::{
    ApiServerVersionCheck, ConnectionCache, ConnectivityProbe, CredentialStore,
    FileBundlePersistence, KubeClientFactory,
};
use kubedeck_stream::exec::{ExecBridge, KubeExecBackend};

use crate::resources::ResourceAccess;

/// The core components wired together
#[derive(Clone)]
pub struct AppState {
    /// Saved credential bundles
    pub store: Arc<CredentialStore>,
    /// Shared clients, one per target
    pub cache: Arc<ConnectionCache>,
    /// Reachability checks
    pub probe: Arc<ConnectivityProbe>,
    /// Interactive exec sessions
    pub exec: Arc<ExecBridge>,
    /// Generic list/get/delete
    pub resources: Arc<ResourceAccess>,
    /// Interval for live feeds opened by handlers
    pub feed_interval: Duration,
}

impl AppState {
    /// Build every component from settings.
    ///
    /// With a data directory configured, bundles saved there are loaded
    /// and new ones are written back.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let store = match &settings.data_dir {
            Some(dir) => {
                let persistence = Arc::new(FileBundlePersistence::new(dir)?);
                Arc::new(CredentialStore::with_persistence(persistence)?)
            }
            None => Arc::new(CredentialStore::new()),
        };

        let cache = ConnectionCache::new(store.clone(), Arc::new(KubeClientFactory::new(settings)));
        let probe = ConnectivityProbe::with_check(
            cache.clone(),
            Arc::new(ApiServerVersionCheck),
            settings.probe_timeout,
        );
        let exec = ExecBridge::new(cache.clone(), Arc::new(KubeExecBackend), settings);
        let resources = ResourceAccess::new(cache.clone());

        info!(
            bundles = store.len(),
            persistent = settings.data_dir.is_some(),
            "Initialized kubedeck state"
        );

        Ok(Self {
            store,
            cache,
            probe: Arc::new(probe),
            exec: Arc::new(exec),
            resources: Arc::new(resources),
            feed_interval: settings.feed_interval,
        })
    }

    /// End every running exec session
    pub fn shutdown(&self) {
        let sessions = self.exec.registry().len();
        self.exec.registry().cancel_all();
        info!(sessions, "Cancelled exec sessions for shutdown");
    }
}
