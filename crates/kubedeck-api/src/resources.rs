//! Kind-parameterized access to remote resources
//!
//! Every dashboard view is "resolve a handle, then one API call". One
//! implementation over [`DynamicObject`] serves all kinds.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use tracing::{debug, info};

use kubedeck_common::{Error, Result};
use kubedeck_credentials::{BundleId, ClientHandle, ConnectionCache};

/// Namespace used for namespaced objects when neither the caller nor the
/// target's context names one
pub const FALLBACK_NAMESPACE: &str = "default";

/// Group, version and naming of one resource kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceKind {
    /// API group; empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind name, e.g. `Deployment`
    pub kind: String,
    /// Plural resource name used in URLs, e.g. `deployments`
    pub plural: String,
    /// Whether objects live in a namespace
    pub namespaced: bool,
}

impl ResourceKind {
    /// Describe a kind explicitly
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    /// Core-group pods
    pub fn pods() -> Self {
        Self::new("", "v1", "Pod", "pods", true)
    }

    /// Core-group namespaces
    pub fn namespaces() -> Self {
        Self::new("", "v1", "Namespace", "namespaces", false)
    }

    /// Core-group nodes
    pub fn nodes() -> Self {
        Self::new("", "v1", "Node", "nodes", false)
    }

    /// Core-group services
    pub fn services() -> Self {
        Self::new("", "v1", "Service", "services", true)
    }

    /// Apps-group deployments
    pub fn deployments() -> Self {
        Self::new("apps", "v1", "Deployment", "deployments", true)
    }

    /// `apiVersion` string as it appears in manifests
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Resource descriptor for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Namespace a single-object call is made in; `None` for cluster-scoped kinds
pub fn object_namespace(
    kind: &ResourceKind,
    requested: Option<&str>,
    context_default: Option<&str>,
) -> Option<String> {
    if !kind.namespaced {
        return None;
    }
    Some(
        requested
            .filter(|ns| !ns.is_empty())
            .or(context_default)
            .unwrap_or(FALLBACK_NAMESPACE)
            .to_string(),
    )
}

/// List, get and delete for any kind on any saved target
pub struct ResourceAccess {
    cache: Arc<ConnectionCache>,
}

impl ResourceAccess {
    /// Create access over a shared connection cache
    pub fn new(cache: Arc<ConnectionCache>) -> Self {
        Self { cache }
    }

    /// List objects; a namespaced kind without a namespace lists across all
    pub async fn list(
        &self,
        bundle_id: BundleId,
        target: &str,
        kind: &ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let handle = self.cache.get(bundle_id, target).await?;
        let namespace = namespace.filter(|ns| kind.namespaced && !ns.is_empty());
        let api = scoped_api(&handle, kind, namespace);

        let list = api.list(&ListParams::default()).await?;
        debug!(
            bundle = %bundle_id,
            target = %target,
            kind = %kind.kind,
            count = list.items.len(),
            "Listed resources"
        );
        Ok(list.items)
    }

    /// Fetch one object
    pub async fn get(
        &self,
        bundle_id: BundleId,
        target: &str,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let handle = self.cache.get(bundle_id, target).await?;
        let namespace = object_namespace(kind, namespace, handle.default_namespace());
        let api = scoped_api(&handle, kind, namespace.as_deref());

        api.get(name)
            .await
            .map_err(|e| not_found_or(e, kind, namespace.as_deref(), name))
    }

    /// Delete one object
    pub async fn delete(
        &self,
        bundle_id: BundleId,
        target: &str,
        kind: &ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let handle = self.cache.get(bundle_id, target).await?;
        let namespace = object_namespace(kind, namespace, handle.default_namespace());
        let api = scoped_api(&handle, kind, namespace.as_deref());

        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| not_found_or(e, kind, namespace.as_deref(), name))?;
        info!(
            bundle = %bundle_id,
            target = %target,
            kind = %kind.kind,
            namespace = ?namespace,
            name = %name,
            "Deleted resource"
        );
        Ok(())
    }

    /// Refresh operation for a live list view
    pub fn list_refresh(
        self: &Arc<Self>,
        bundle_id: BundleId,
        target: impl Into<String>,
        kind: ResourceKind,
        namespace: Option<String>,
    ) -> impl FnMut() -> BoxFuture<'static, Result<Vec<DynamicObject>>> + Send + 'static {
        let access = Arc::clone(self);
        let target = target.into();
        move || {
            let access = Arc::clone(&access);
            let target = target.clone();
            let kind = kind.clone();
            let namespace = namespace.clone();
            async move {
                access
                    .list(bundle_id, &target, &kind, namespace.as_deref())
                    .await
            }
            .boxed()
        }
    }
}

fn scoped_api(
    handle: &ClientHandle,
    kind: &ResourceKind,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    let ar = kind.api_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(handle.client().clone(), ns, &ar),
        None => Api::all_with(handle.client().clone(), &ar),
    }
}

fn not_found_or(
    error: kube::Error,
    kind: &ResourceKind,
    namespace: Option<&str>,
    name: &str,
) -> Error {
    match error {
        kube::Error::Api(ae) if ae.code == 404 => {
            let name = match namespace {
                Some(ns) => format!("{}/{}", ns, name),
                None => name.to_string(),
            };
            Error::resource_not_found(&kind.kind, name)
        }
        e => e.into(),
    }
}
