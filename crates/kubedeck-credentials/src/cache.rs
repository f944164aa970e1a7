//! Connection cache
//!
//! Builds one Kubernetes client per (bundle, target) and shares it with every
//! caller until the entry is evicted. Entries are shared build futures so
//! callers racing on an uncached key converge on a single build.
//!
//! Lock order is store, then cache. Entry creation happens while the store's
//! read section is held and bundle deletion evicts while the store's write
//! section is held, so no entry can be created for a bundle after its removal.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use kube::config::{KubeConfigOptions, Kubeconfig as KubeKubeconfig};
use kube::{Client, Config};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use kubedeck_common::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use kubedeck_common::{Error, Result, Settings};

use crate::bundle::{AuthMaterial, BundleId, Target};
use crate::kubeconfig::build_target_kubeconfig;
use crate::store::{CredentialStore, EvictionListener};

/// Shared, immutable client for one target
#[derive(Clone)]
pub struct ClientHandle(Arc<HandleInner>);

struct HandleInner {
    bundle_id: Option<BundleId>,
    target: String,
    endpoint: String,
    namespace: Option<String>,
    client: Client,
    built_at: DateTime<Utc>,
}

impl ClientHandle {
    fn new(bundle_id: Option<BundleId>, target: &Target, client: Client) -> Self {
        Self(Arc::new(HandleInner {
            bundle_id,
            target: target.name.clone(),
            endpoint: target.endpoint.clone(),
            namespace: target.namespace.clone(),
            client,
            built_at: Utc::now(),
        }))
    }

    /// Handle built for parameters that are not in the store
    pub fn detached(target: &Target, client: Client) -> Self {
        Self::new(None, target, client)
    }

    /// Bundle this handle was built from; `None` for detached handles
    pub fn bundle_id(&self) -> Option<BundleId> {
        self.0.bundle_id
    }

    /// Target name
    pub fn target(&self) -> &str {
        &self.0.target
    }

    /// API server URL
    pub fn endpoint(&self) -> &str {
        &self.0.endpoint
    }

    /// Default namespace from the kubeconfig context, if any
    pub fn default_namespace(&self) -> Option<&str> {
        self.0.namespace.as_deref()
    }

    /// The underlying client; clone it to issue calls
    pub fn client(&self) -> &Client {
        &self.0.client
    }

    /// When the client was built
    pub fn built_at(&self) -> DateTime<Utc> {
        self.0.built_at
    }

    /// Whether two handles share the same built client
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("bundle_id", &self.0.bundle_id)
            .field("target", &self.0.target)
            .field("endpoint", &self.0.endpoint)
            .field("built_at", &self.0.built_at)
            .finish_non_exhaustive()
    }
}

/// Trait for constructing Kubernetes clients from normalized targets
///
/// Construction is local setup only (TLS material, auth headers); it never
/// contacts the API server.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a client for one target
    async fn build(&self, target: &Target) -> Result<Client>;
}

/// Builds clients through kube's own kubeconfig loader
#[derive(Clone, Debug)]
pub struct KubeClientFactory {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl KubeClientFactory {
    /// Factory using the client timeouts from settings
    pub fn new(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            read_timeout: settings.read_timeout,
        }
    }
}

impl Default for KubeClientFactory {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn build(&self, target: &Target) -> Result<Client> {
        match &target.auth {
            AuthMaterial::None => {
                return Err(Error::build(
                    &target.name,
                    "no usable authentication material",
                ))
            }
            AuthMaterial::Conflicting => {
                return Err(Error::build(
                    &target.name,
                    "both a token and a client certificate are configured",
                ))
            }
            AuthMaterial::Token(_) | AuthMaterial::ClientCertificate { .. } => {}
        }
        install_crypto_provider();

        let rendered = serde_json::to_string(&build_target_kubeconfig(target))
            .map_err(|e| Error::build(&target.name, format!("failed to render kubeconfig: {}", e)))?;
        let kubeconfig = KubeKubeconfig::from_yaml(&rendered)
            .map_err(|e| Error::build(&target.name, format!("failed to load kubeconfig: {}", e)))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::build(&target.name, format!("invalid client config: {}", e)))?;
        config.connect_timeout = Some(self.connect_timeout);
        config.read_timeout = Some(self.read_timeout);
        Client::try_from(config)
            .map_err(|e| Error::build(&target.name, format!("failed to create client: {}", e)))
    }
}

fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

type CacheKey = (BundleId, String);

/// A build shared by every caller waiting on the same key
type PendingBuild = Shared<BoxFuture<'static, std::result::Result<ClientHandle, Arc<Error>>>>;

/// Rebuild a shared failure for one waiter
fn shared_build_error(target: &str, error: &Error) -> Error {
    match error {
        Error::Build { target, message } => Error::build(target, message),
        other => Error::build(target, other.to_string()),
    }
}

/// Per-(bundle, target) client cache
pub struct ConnectionCache {
    store: Arc<CredentialStore>,
    factory: Arc<dyn ClientFactory>,
    entries: RwLock<HashMap<CacheKey, PendingBuild>>,
}

impl ConnectionCache {
    /// Create a cache over `store`, registering for its delete notifications
    pub fn new(store: Arc<CredentialStore>, factory: Arc<dyn ClientFactory>) -> Arc<Self> {
        let cache = Arc::new(Self {
            store: store.clone(),
            factory,
            entries: RwLock::new(HashMap::new()),
        });
        let listener: Arc<dyn EvictionListener> = cache.clone();
        store.register_listener(Arc::downgrade(&listener));
        cache
    }

    /// The store this cache resolves targets from
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Get the client for one target, building it on first use.
    ///
    /// Callers racing on an uncached key share one build and all receive its
    /// outcome, failures included. A failure is not cached: a later call for
    /// the same key makes a fresh attempt.
    pub async fn get(&self, bundle_id: BundleId, target: &str) -> Result<ClientHandle> {
        let key = (bundle_id, target.to_string());
        if let Some(handle) = self.cached(&key) {
            return Ok(handle);
        }

        let build = self.store.with_target(bundle_id, target, |target| {
            let mut entries = self.entries.write();
            let reusable = entries
                .get(&key)
                .filter(|build| !matches!(build.peek(), Some(Err(_))))
                .cloned();
            match reusable {
                Some(build) => build,
                None => {
                    let build = self.start_build(bundle_id, target.clone());
                    entries.insert(key.clone(), build.clone());
                    build
                }
            }
        })?;

        match build.clone().await {
            Ok(handle) => {
                // Evicted while building: only a deleted bundle turns this into an error
                if !self.holds(&key, &build) && !self.store.contains(bundle_id) {
                    return Err(Error::bundle_not_found(bundle_id.to_string()));
                }
                Ok(handle)
            }
            Err(e) => {
                let mut entries = self.entries.write();
                if entries.get(&key).is_some_and(|b| b.ptr_eq(&build)) {
                    entries.remove(&key);
                }
                Err(shared_build_error(target, &e))
            }
        }
    }

    fn start_build(&self, bundle_id: BundleId, target: Target) -> PendingBuild {
        let factory = self.factory.clone();
        async move {
            match factory.build(&target).await {
                Ok(client) => {
                    info!(bundle = %bundle_id, target = %target.name, "Built client");
                    Ok(ClientHandle::new(Some(bundle_id), &target, client))
                }
                Err(e) => {
                    warn!(bundle = %bundle_id, target = %target.name, error = %e, "Client build failed");
                    Err(Arc::new(e))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Build a client for parameters that are not stored, bypassing the cache
    pub async fn build_detached(&self, target: &Target) -> Result<ClientHandle> {
        let client = self.factory.build(target).await?;
        Ok(ClientHandle::detached(target, client))
    }

    /// Drop every cached client of a bundle
    pub fn evict(&self, bundle_id: BundleId) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(id, _), _| *id != bundle_id);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(bundle = %bundle_id, evicted, "Evicted cached clients");
        }
    }

    /// Drop the cached client of one target
    pub fn evict_target(&self, bundle_id: BundleId, target: &str) {
        if self
            .entries
            .write()
            .remove(&(bundle_id, target.to_string()))
            .is_some()
        {
            debug!(bundle = %bundle_id, target, "Evicted cached client");
        }
    }

    /// Number of cache entries, including builds in flight
    pub fn cached_len(&self) -> usize {
        self.entries.read().len()
    }

    fn cached(&self, key: &CacheKey) -> Option<ClientHandle> {
        match self.entries.read().get(key).and_then(|build| build.peek()) {
            Some(Ok(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    fn holds(&self, key: &CacheKey, build: &PendingBuild) -> bool {
        self.entries
            .read()
            .get(key)
            .is_some_and(|current| current.ptr_eq(build))
    }
}

impl EvictionListener for ConnectionCache {
    fn bundle_removed(&self, id: BundleId) {
        self.evict(id);
    }
}
