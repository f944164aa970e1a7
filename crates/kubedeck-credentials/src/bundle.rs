//! Credential bundles and their normalization
//!
//! A bundle is produced from exactly one of three input shapes:
//! - a kubeconfig file (one target per context)
//! - a bearer-token form
//! - a client-certificate form
//!
//! All three are validated and normalized into [`Target`]s before the store
//! assigns an id. Nothing here touches the network.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use x509_parser::pem::Pem;

use kubedeck_common::{Error, Result};

use crate::kubeconfig::{Kubeconfig, UserConfig};

/// Opaque, immutable bundle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(Uuid);

impl BundleId {
    /// Mint a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BundleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BundleId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::bundle_not_found(s))
    }
}

/// Secret string whose `Debug` output is redacted
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// How the server certificate of a target is verified
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "pem", rename_all = "snake_case")]
pub enum TlsTrust {
    /// Verify against the embedded CA bundle (PEM)
    CaBundle(String),
    /// Do not verify the server certificate
    SkipVerify,
    /// Verify against the platform's root store
    SystemRoots,
}

/// Authentication material for a target
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "material", rename_all = "snake_case")]
pub enum AuthMaterial {
    /// Bearer token
    Token(Secret),
    /// Client certificate and key (PEM)
    ClientCertificate {
        /// Certificate chain PEM
        cert_pem: String,
        /// Private key PEM
        key_pem: Secret,
    },
    /// Both a token and a client certificate were supplied
    Conflicting,
    /// No usable material (e.g. exec plugins, or no user at all)
    None,
}

/// One named, independently addressable endpoint within a bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Logical name (kubeconfig context name or form name)
    pub name: String,
    /// API server URL
    pub endpoint: String,
    /// Server certificate trust
    pub tls: TlsTrust,
    /// Authentication material
    pub auth: AuthMaterial,
    /// Default namespace from the kubeconfig context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Target {
    /// Build a target from the bearer-token form.
    ///
    /// The form carries no trust material, so the server certificate is not verified.
    pub fn from_token(name: &str, endpoint: &str, token: &str) -> Result<Self> {
        let name = require("name", name)?;
        let endpoint = validate_endpoint("endpoint", endpoint)?;
        let token = require("token", token)?;
        Ok(Self {
            name,
            endpoint,
            tls: TlsTrust::SkipVerify,
            auth: AuthMaterial::Token(Secret::new(token)),
            namespace: None,
        })
    }

    /// Build a target from the client-certificate form.
    ///
    /// Without a CA the server certificate is not verified.
    pub fn from_certificate(
        name: &str,
        endpoint: &str,
        cert_pem: &str,
        key_pem: &str,
        ca_pem: Option<&str>,
    ) -> Result<Self> {
        let name = require("name", name)?;
        let endpoint = validate_endpoint("endpoint", endpoint)?;
        validate_certificate_pem("certPEM", cert_pem)?;
        validate_key_pem("keyPEM", key_pem)?;
        let tls = match ca_pem.map(str::trim).filter(|ca| !ca.is_empty()) {
            Some(ca) => {
                validate_certificate_pem("caPEM", ca)?;
                TlsTrust::CaBundle(ca.to_string())
            }
            None => TlsTrust::SkipVerify,
        };
        Ok(Self {
            name,
            endpoint,
            tls,
            auth: AuthMaterial::ClientCertificate {
                cert_pem: cert_pem.trim().to_string(),
                key_pem: Secret::new(key_pem.trim()),
            },
            namespace: None,
        })
    }
}

/// Which input shape a bundle was created from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleSource {
    /// Multi-target kubeconfig file
    Kubeconfig,
    /// Bearer-token form
    Token,
    /// Client-certificate form
    Certificate,
}

/// Ingestion metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleOrigin {
    /// Input shape
    pub source: BundleSource,
    /// Uploaded file name, when the bundle came from a file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// When the bundle was ingested
    pub added_at: DateTime<Utc>,
}

/// A named collection of one or more targets supplied together
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// Opaque id, unique and immutable
    pub id: BundleId,
    /// Display name
    pub display_name: String,
    /// Ingestion metadata
    pub origin: BundleOrigin,
    /// Targets, never empty
    pub targets: Vec<Target>,
}

impl CredentialBundle {
    /// Assemble a bundle with a fresh id, rejecting an empty target set
    pub(crate) fn assemble(
        display_name: String,
        source: BundleSource,
        filename: Option<String>,
        targets: Vec<Target>,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(Error::validation("a bundle needs at least one target"));
        }
        Ok(Self {
            id: BundleId::new(),
            display_name,
            origin: BundleOrigin {
                source,
                filename,
                added_at: Utc::now(),
            },
            targets,
        })
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Target names in bundle order
    pub fn target_names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name.clone()).collect()
    }

    /// List view of this bundle
    pub fn summary(&self) -> BundleSummary {
        BundleSummary {
            id: self.id,
            display_name: self.display_name.clone(),
            target_names: self.target_names(),
            added_at: self.origin.added_at,
        }
    }
}

/// List view entry of a stored bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    /// Bundle id
    pub id: BundleId,
    /// Display name
    pub display_name: String,
    /// Target names in bundle order
    pub target_names: Vec<String>,
    /// When the bundle was ingested
    pub added_at: DateTime<Utc>,
}

/// Normalize kubeconfig content into targets, one per context.
pub fn targets_from_kubeconfig(content: &str) -> Result<Vec<Target>> {
    if content.trim().is_empty() {
        return Err(Error::validation_for_field("content", "kubeconfig is empty"));
    }
    let config = Kubeconfig::parse(content).map_err(|e| {
        Error::validation_for_field("content", format!("kubeconfig is not valid YAML: {}", e))
    })?;
    if config.contexts.is_empty() {
        return Err(Error::validation_for_field(
            "contexts",
            "kubeconfig defines no contexts",
        ));
    }

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(config.contexts.len());
    for (i, entry) in config.contexts.iter().enumerate() {
        let name = require(&format!("contexts[{}].name", i), &entry.name)?;
        if !seen.insert(name.clone()) {
            return Err(Error::validation_for_field(
                format!("contexts[{}].name", i),
                format!("duplicate context name '{}'", name),
            ));
        }

        let cluster = config.cluster(&entry.context.cluster).ok_or_else(|| {
            Error::validation_for_field(
                format!("contexts[{}].context.cluster", i),
                format!(
                    "context '{}' references unknown cluster '{}'",
                    name, entry.context.cluster
                ),
            )
        })?;
        let endpoint = validate_endpoint(&format!("clusters[{}].server", name), &cluster.server)?;

        let tls = if cluster.insecure_skip_tls_verify.unwrap_or(false) {
            TlsTrust::SkipVerify
        } else if let Some(data) = &cluster.certificate_authority_data {
            let pem = decode_pem_data(&format!("{}.certificate-authority-data", name), data)?;
            TlsTrust::CaBundle(pem)
        } else if cluster.certificate_authority.is_some() {
            return Err(Error::validation_for_field(
                format!("{}.certificate-authority", name),
                "file references are not supported; embed certificate-authority-data",
            ));
        } else {
            TlsTrust::SystemRoots
        };

        let auth = if entry.context.user.is_empty() {
            AuthMaterial::None
        } else {
            let user = config.user(&entry.context.user).ok_or_else(|| {
                Error::validation_for_field(
                    format!("contexts[{}].context.user", i),
                    format!(
                        "context '{}' references unknown user '{}'",
                        name, entry.context.user
                    ),
                )
            })?;
            auth_from_user(&name, user)?
        };

        targets.push(Target {
            name,
            endpoint,
            tls,
            auth,
            namespace: entry.context.namespace.clone(),
        });
    }

    Ok(targets)
}

fn auth_from_user(context: &str, user: &UserConfig) -> Result<AuthMaterial> {
    if user.client_certificate.is_some() || user.client_key.is_some() {
        return Err(Error::validation_for_field(
            format!("{}.client-certificate", context),
            "file references are not supported; embed client-certificate-data and client-key-data",
        ));
    }

    let token = user.token.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let cert = match (&user.client_certificate_data, &user.client_key_data) {
        (Some(cert), Some(key)) => {
            let cert_pem = decode_pem_data(&format!("{}.client-certificate-data", context), cert)?;
            let key_pem = decode_pem_data(&format!("{}.client-key-data", context), key)?;
            Some((cert_pem, key_pem))
        }
        (None, None) => None,
        _ => {
            return Err(Error::validation_for_field(
                format!("{}.client-certificate-data", context),
                "client certificate and key must be supplied together",
            ))
        }
    };

    Ok(match (token, cert) {
        (Some(_), Some(_)) => AuthMaterial::Conflicting,
        (Some(token), None) => AuthMaterial::Token(Secret::new(token)),
        (None, Some((cert_pem, key_pem))) => AuthMaterial::ClientCertificate {
            cert_pem,
            key_pem: Secret::new(key_pem),
        },
        (None, None) => AuthMaterial::None,
    })
}

/// Derive a display name from an uploaded file name ("prod.yaml" -> "prod")
pub(crate) fn display_name_from_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base.to_string(),
    }
}

fn require(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation_for_field(
            field,
            format!("{} is required", field),
        ));
    }
    Ok(trimmed.to_string())
}

/// Validate an API server URL, returning it without a trailing slash
pub(crate) fn validate_endpoint(field: &str, endpoint: &str) -> Result<String> {
    let endpoint = require(field, endpoint)?;
    let uri: http::Uri = endpoint.parse().map_err(|e| {
        Error::validation_for_field(field, format!("'{}' is not a valid URL: {}", endpoint, e))
    })?;
    match uri.scheme_str() {
        Some("https") | Some("http") => {}
        _ => {
            return Err(Error::validation_for_field(
                field,
                format!("'{}' must use http or https", endpoint),
            ))
        }
    }
    if uri.host().map(str::is_empty).unwrap_or(true) {
        return Err(Error::validation_for_field(
            field,
            format!("'{}' has no host", endpoint),
        ));
    }
    Ok(endpoint.trim_end_matches('/').to_string())
}

fn decode_pem_data(field: &str, data: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| Error::validation_for_field(field, format!("invalid base64: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|_| Error::validation_for_field(field, "decoded data is not PEM text"))
}

fn pem_blocks(field: &str, pem: &str) -> Result<Vec<Pem>> {
    let blocks = Pem::iter_from_buffer(pem.trim().as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::validation_for_field(field, format!("invalid PEM: {}", e)))?;
    if blocks.is_empty() {
        return Err(Error::validation_for_field(field, "no PEM blocks found"));
    }
    Ok(blocks)
}

fn validate_certificate_pem(field: &str, pem: &str) -> Result<()> {
    for block in pem_blocks(field, pem)? {
        if block.label != "CERTIFICATE" {
            return Err(Error::validation_for_field(
                field,
                format!("expected CERTIFICATE block, found {}", block.label),
            ));
        }
        block.parse_x509().map_err(|e| {
            Error::validation_for_field(field, format!("certificate does not parse: {}", e))
        })?;
    }
    Ok(())
}

fn validate_key_pem(field: &str, pem: &str) -> Result<()> {
    let blocks = pem_blocks(field, pem)?;
    if !blocks.iter().any(|b| b.label.ends_with("PRIVATE KEY")) {
        return Err(Error::validation_for_field(field, "no PRIVATE KEY block found"));
    }
    Ok(())
}
