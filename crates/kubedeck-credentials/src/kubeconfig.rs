//! Kubeconfig model
//!
//! The subset of the kubeconfig format needed to read uploaded multi-target
//! files and to render the single-context config a client is built from.
//! Unknown fields are ignored on input.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::bundle::{AuthMaterial, Target, TlsTrust};

/// Kubeconfig structure
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Kind (always "Config")
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Clusters
    #[serde(default)]
    pub clusters: Vec<KubeconfigCluster>,
    /// Users
    #[serde(default)]
    pub users: Vec<KubeconfigUser>,
    /// Contexts
    #[serde(default)]
    pub contexts: Vec<KubeconfigContext>,
    /// Current context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Config".to_string()
}

/// Cluster entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    #[serde(default)]
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    /// CA certificate file path (not usable for uploaded bundles)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    /// Skip server certificate verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_skip_tls_verify: Option<bool>,
}

/// User entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigUser {
    /// User name
    pub name: String,
    /// User config
    #[serde(default)]
    pub user: UserConfig,
}

/// User configuration
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Client certificate (base64 encoded PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    /// Client key (base64 encoded PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
    /// Client certificate file path (not usable for uploaded bundles)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    /// Client key file path (not usable for uploaded bundles)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// Exec credential plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecConfig>,
}

/// Exec credential plugin configuration
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    /// API version
    #[serde(default)]
    pub api_version: String,
    /// Command to run
    pub command: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
}

/// Context entry in kubeconfig
#[derive(Debug, Serialize, Deserialize)]
pub struct KubeconfigContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    #[serde(default)]
    pub user: String,
    /// Default namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Kubeconfig {
    /// Parse kubeconfig content (YAML or JSON)
    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Look up a cluster entry by name
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.cluster)
    }

    /// Look up a user entry by name
    pub fn user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.name == name).map(|u| &u.user)
    }
}

/// Render a single-context kubeconfig for one normalized target.
///
/// Cluster, user and context all share the target's name, and the context is
/// made current so default load options select it. Material is embedded as
/// base64 data, never as file paths.
pub fn build_target_kubeconfig(target: &Target) -> Kubeconfig {
    let (certificate_authority_data, insecure_skip_tls_verify) = match &target.tls {
        TlsTrust::CaBundle(pem) => (Some(STANDARD.encode(pem.as_bytes())), None),
        TlsTrust::SkipVerify => (None, Some(true)),
        TlsTrust::SystemRoots => (None, None),
    };

    let user = match &target.auth {
        AuthMaterial::Token(token) => UserConfig {
            token: Some(token.expose().to_string()),
            ..Default::default()
        },
        AuthMaterial::ClientCertificate { cert_pem, key_pem } => UserConfig {
            client_certificate_data: Some(STANDARD.encode(cert_pem.as_bytes())),
            client_key_data: Some(STANDARD.encode(key_pem.expose().as_bytes())),
            ..Default::default()
        },
        AuthMaterial::Conflicting | AuthMaterial::None => UserConfig::default(),
    };

    Kubeconfig {
        api_version: default_api_version(),
        kind: default_kind(),
        clusters: vec![KubeconfigCluster {
            name: target.name.clone(),
            cluster: ClusterConfig {
                server: target.endpoint.clone(),
                certificate_authority_data,
                certificate_authority: None,
                insecure_skip_tls_verify,
            },
        }],
        users: vec![KubeconfigUser {
            name: target.name.clone(),
            user,
        }],
        contexts: vec![KubeconfigContext {
            name: target.name.clone(),
            context: ContextConfig {
                cluster: target.name.clone(),
                user: target.name.clone(),
                namespace: target.namespace.clone(),
            },
        }],
        current_context: Some(target.name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Secret;

    const SAMPLE: &str = r#"
apiVersion: v1
kind: Config
current-context: prod
clusters:
- name: prod-cluster
  cluster:
    server: https://prod.example.com:6443
    certificate-authority-data: Zm9v
- name: dev-cluster
  cluster:
    server: https://dev.example.com
    insecure-skip-tls-verify: true
users:
- name: admin
  user:
    token: abc123
- name: sso
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: kubectl
      args: [oidc-login, get-token]
      env: null
contexts:
- name: prod
  context:
    cluster: prod-cluster
    user: admin
    namespace: web
- name: dev
  context:
    cluster: dev-cluster
    user: sso
"#;

    #[test]
    fn test_parse_sample() {
        let config = Kubeconfig::parse(SAMPLE).unwrap();
        assert_eq!(config.contexts.len(), 2);
        assert_eq!(config.current_context.as_deref(), Some("prod"));

        let prod = config.cluster("prod-cluster").unwrap();
        assert_eq!(prod.server, "https://prod.example.com:6443");
        assert_eq!(prod.certificate_authority_data.as_deref(), Some("Zm9v"));

        let dev = config.cluster("dev-cluster").unwrap();
        assert_eq!(dev.insecure_skip_tls_verify, Some(true));

        assert_eq!(config.user("admin").unwrap().token.as_deref(), Some("abc123"));
        assert_eq!(config.user("sso").unwrap().exec.as_ref().unwrap().command, "kubectl");
        assert!(config.user("missing").is_none());
    }

    #[test]
    fn test_parse_json_content() {
        let json = r#"{"contexts":[{"name":"a","context":{"cluster":"c","user":"u"}}]}"#;
        let config = Kubeconfig::parse(json).unwrap();
        assert_eq!(config.api_version, "v1");
        assert_eq!(config.kind, "Config");
        assert_eq!(config.contexts[0].context.user, "u");
    }

    #[test]
    fn test_build_target_kubeconfig_with_token() {
        let target = Target {
            name: "staging".into(),
            endpoint: "https://staging.example.com".into(),
            tls: TlsTrust::SkipVerify,
            auth: AuthMaterial::Token(Secret::new("t0ken")),
            namespace: Some("apps".into()),
        };
        let config = build_target_kubeconfig(&target);

        assert_eq!(config.current_context.as_deref(), Some("staging"));
        assert_eq!(config.clusters[0].cluster.server, "https://staging.example.com");
        assert_eq!(config.clusters[0].cluster.insecure_skip_tls_verify, Some(true));
        assert_eq!(config.users[0].user.token.as_deref(), Some("t0ken"));
        assert_eq!(config.contexts[0].context.namespace.as_deref(), Some("apps"));

        // Rendered output must be loadable by kube's own kubeconfig reader
        let rendered = serde_json::to_string(&config).unwrap();
        let loaded = kube::config::Kubeconfig::from_yaml(&rendered).unwrap();
        assert_eq!(loaded.current_context.as_deref(), Some("staging"));
        assert_eq!(loaded.clusters.len(), 1);
    }

    #[test]
    fn test_build_target_kubeconfig_with_certificate() {
        let target = Target {
            name: "prod".into(),
            endpoint: "https://prod.example.com".into(),
            tls: TlsTrust::CaBundle("CA PEM".into()),
            auth: AuthMaterial::ClientCertificate {
                cert_pem: "CERT PEM".into(),
                key_pem: Secret::new("KEY PEM"),
            },
            namespace: None,
        };
        let config = build_target_kubeconfig(&target);
        let cluster = &config.clusters[0].cluster;
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some(STANDARD.encode("CA PEM").as_str())
        );
        assert!(cluster.insecure_skip_tls_verify.is_none());

        let user = &config.users[0].user;
        assert!(user.token.is_none());
        assert_eq!(
            user.client_key_data.as_deref(),
            Some(STANDARD.encode("KEY PEM").as_str())
        );
    }
}
