//! Connectivity probe
//!
//! Checks every target of a bundle concurrently with one cheap, time-bounded
//! API call each. A slow or failing target only affects its own entry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kubedeck_common::config::DEFAULT_PROBE_TIMEOUT;
use kubedeck_common::{Error, Result};

use crate::bundle::{BundleId, Target};
use crate::cache::{ClientHandle, ConnectionCache};

/// The existence check issued against a target
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    /// Issue one call, returning a short description of the server on success
    async fn check(&self, handle: &ClientHandle) -> Result<String>;
}

/// Asks the API server for its version
#[derive(Clone, Copy, Debug, Default)]
pub struct ApiServerVersionCheck;

#[async_trait]
impl ReachabilityCheck for ApiServerVersionCheck {
    async fn check(&self, handle: &ClientHandle) -> Result<String> {
        let info = handle.client().apiserver_version().await?;
        Ok(info.git_version)
    }
}

/// Outcome for one target
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    /// Target name
    pub target_name: String,
    /// Whether the check succeeded in time
    pub reachable: bool,
    /// Server version on success, error text otherwise
    pub detail: String,
}

/// Outcomes for every target of one bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleReport {
    /// Bundle id
    pub bundle_id: BundleId,
    /// Bundle display name
    pub display_name: String,
    /// One entry per target, in bundle order
    pub results: Vec<ProbeResult>,
}

/// Unsaved auth material for pre-save validation
#[derive(Clone, Debug)]
pub enum ProbeAuth {
    /// Bearer token
    Token(String),
    /// Client certificate, key and optional CA (PEM)
    Certificate {
        /// Certificate PEM
        cert_pem: String,
        /// Private key PEM
        key_pem: String,
        /// CA bundle PEM
        ca_pem: Option<String>,
    },
}

/// Stateless reachability checker
pub struct ConnectivityProbe {
    cache: Arc<ConnectionCache>,
    check: Arc<dyn ReachabilityCheck>,
    timeout: Duration,
}

impl ConnectivityProbe {
    /// Probe using the API server version call and the default timeout
    pub fn new(cache: Arc<ConnectionCache>) -> Self {
        Self::with_check(cache, Arc::new(ApiServerVersionCheck), DEFAULT_PROBE_TIMEOUT)
    }

    /// Probe with a custom check and timeout
    pub fn with_check(
        cache: Arc<ConnectionCache>,
        check: Arc<dyn ReachabilityCheck>,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            check,
            timeout,
        }
    }

    /// Check every target of a stored bundle
    pub async fn check(&self, bundle_id: BundleId) -> Result<BundleReport> {
        let bundle = self.cache.store().get(bundle_id)?;
        let results = join_all(bundle.targets.iter().map(|target| async move {
            let handle = self.cache.get(bundle_id, &target.name).await;
            self.probe_handle(&target.name, handle).await
        }))
        .await;

        let reachable = results.iter().filter(|r| r.reachable).count();
        info!(
            bundle = %bundle_id,
            reachable,
            total = results.len(),
            "Connectivity check finished"
        );
        Ok(BundleReport {
            bundle_id,
            display_name: bundle.display_name.clone(),
            results,
        })
    }

    /// Probe parameters that have not been saved.
    ///
    /// Malformed input is a validation error; an unreachable server is a
    /// normal result.
    pub async fn check_single(
        &self,
        name: &str,
        endpoint: &str,
        auth: ProbeAuth,
    ) -> Result<ProbeResult> {
        let target = match &auth {
            ProbeAuth::Token(token) => Target::from_token(name, endpoint, token)?,
            ProbeAuth::Certificate {
                cert_pem,
                key_pem,
                ca_pem,
            } => Target::from_certificate(name, endpoint, cert_pem, key_pem, ca_pem.as_deref())?,
        };
        let handle = self.cache.build_detached(&target).await;
        Ok(self.probe_handle(&target.name, handle).await)
    }

    /// Re-check every saved bundle, in list order.
    ///
    /// A bundle deleted between listing and checking is skipped.
    pub async fn check_all(&self) -> Vec<BundleReport> {
        let mut reports = Vec::new();
        for summary in self.cache.store().list() {
            match self.check(summary.id).await {
                Ok(report) => reports.push(report),
                Err(e) => debug!(bundle = %summary.id, error = %e, "Skipping bundle"),
            }
        }
        reports
    }

    async fn probe_handle(&self, target: &str, handle: Result<ClientHandle>) -> ProbeResult {
        let outcome = match handle {
            Ok(handle) => match tokio::time::timeout(self.timeout, self.check.check(&handle)).await
            {
                Ok(Ok(version)) => Ok(version),
                Ok(Err(e)) => Err(Error::unreachable(target, e.to_string())),
                Err(_) => Err(Error::unreachable(
                    target,
                    format!("timed out after {}s", self.timeout.as_secs_f32()),
                )),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(detail) => {
                debug!(target, %detail, "Target reachable");
                ProbeResult {
                    target_name: target.to_string(),
                    reachable: true,
                    detail,
                }
            }
            Err(e) => {
                let detail = match e {
                    Error::Unreachable { detail, .. } => detail,
                    other => other.to_string(),
                };
                debug!(target, %detail, "Target unreachable");
                ProbeResult {
                    target_name: target.to_string(),
                    reachable: false,
                    detail,
                }
            }
        }
    }
}
