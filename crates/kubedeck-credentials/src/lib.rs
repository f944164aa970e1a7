//! Credential bundles and the clients built from them
//!
//! - [`store::CredentialStore`] ingests and holds normalized bundles
//! - [`cache::ConnectionCache`] builds and shares one client per target
//! - [`probe::ConnectivityProbe`] checks every target of a bundle

#![deny(missing_docs)]

pub mod bundle;
pub mod cache;
pub mod kubeconfig;
pub mod persist;
pub mod probe;
pub mod store;

pub use bundle::{
    AuthMaterial, BundleId, BundleSummary, CredentialBundle, Secret, Target, TlsTrust,
};
pub use cache::{ClientFactory, ClientHandle, ConnectionCache, KubeClientFactory};
pub use persist::{BundlePersistence, FileBundlePersistence};
pub use probe::{ApiServerVersionCheck, BundleReport, ConnectivityProbe, ProbeAuth, ProbeResult};
pub use store::{CredentialStore, EvictionListener};
