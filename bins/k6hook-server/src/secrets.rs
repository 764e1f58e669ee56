// Environment resolution for k6 runs, including Kubernetes secret lookups

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use k6hook_common::LaunchPayload;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Decoded secret data, key -> raw bytes
pub type SecretData = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secrets \"{name}\" not found")]
    NotFound { name: String },

    #[error("{message} (status {status})")]
    Api { status: u16, message: String },

    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid secret data for key {key}: {reason}")]
    InvalidData { key: String, reason: String },
}

/// Failures while building the environment for a run
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("kubernetes client is not configured")]
    NotConfigured,

    #[error("error fetching secret {namespace}/{name}: {source}")]
    Fetch {
        namespace: String,
        name: String,
        #[source]
        source: SecretError,
    },

    #[error("secret {namespace}/{name} does not have key {key}")]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<SecretData, SecretError>;
}

/// Merge the payload's direct environment variables with the ones taken
/// from secrets. Secret references without a namespace are looked up in the
/// payload's namespace. Returns `None` when there is nothing to override.
pub async fn resolve_env_vars(
    payload: &LaunchPayload,
    store: Option<&dyn SecretStore>,
) -> Result<Option<BTreeMap<String, String>>, ResolveError> {
    let mut env = payload.metadata.env_vars.clone();
    let references = &payload.metadata.kubernetes_secrets;

    if !references.is_empty() {
        let store = store.ok_or(ResolveError::NotConfigured)?;
        let mut fetched: BTreeMap<(String, String), SecretData> = BTreeMap::new();

        for (var, reference) in references {
            let namespace = reference.namespace_or(payload.namespace()).to_string();
            let cache_key = (namespace.clone(), reference.name.clone());

            if !fetched.contains_key(&cache_key) {
                debug!(namespace = %namespace, secret = %reference.name, "Fetching secret");
                let data = store
                    .get(&namespace, &reference.name)
                    .await
                    .map_err(|source| ResolveError::Fetch {
                        namespace: namespace.clone(),
                        name: reference.name.clone(),
                        source,
                    })?;
                fetched.insert(cache_key.clone(), data);
            }

            let value = fetched
                .get(&cache_key)
                .and_then(|data| data.get(&reference.key))
                .ok_or_else(|| ResolveError::MissingKey {
                    namespace: namespace.clone(),
                    name: reference.name.clone(),
                    key: reference.key.clone(),
                })?;
            env.insert(var.clone(), String::from_utf8_lossy(value).into_owned());
        }
    }

    Ok((!env.is_empty()).then_some(env))
}

#[derive(Debug, Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StatusObject {
    #[serde(default)]
    message: String,
}

/// Reads secrets straight from the Kubernetes API server
pub struct KubeSecretStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl KubeSecretStore {
    /// Configure from the pod's service account, the way in-cluster
    /// clients do
    pub fn in_cluster() -> anyhow::Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set, not running in a cluster?")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .context("KUBERNETES_SERVICE_PORT is not set, not running in a cluster?")?;

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .context("reading service account token")?;
        let ca = std::fs::read(dir.join("ca.crt")).context("reading service account CA")?;
        let ca = reqwest::Certificate::from_pem(&ca).context("parsing service account CA")?;

        let client = reqwest::Client::builder()
            .add_root_certificate(ca)
            .timeout(Duration::from_secs(30))
            .build()
            .context("building kubernetes http client")?;

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        Ok(Self::new(client, format!("https://{host}:{port}"), token.trim()))
    }

    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<SecretData, SecretError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/secrets/{}",
            self.base_url, namespace, name
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound {
                name: name.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StatusObject>(&body)
                .map(|status| status.message)
                .unwrap_or(body);
            return Err(SecretError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let secret: SecretObject = response.json().await?;
        secret
            .data
            .into_iter()
            .map(|(key, encoded)| {
                general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map(|value| (key.clone(), value))
                    .map_err(|e| SecretError::InvalidData {
                        key,
                        reason: e.to_string(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySecretStore;
    use axum::extract::Path as UrlPath;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn payload(metadata: &str) -> LaunchPayload {
        LaunchPayload::from_json(
            format!(
                r#"{{"name": "test", "namespace": "test-ns", "phase": "pre-rollout", "metadata": {{"script": "my-script", {metadata}}}}}"#
            )
            .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_no_env_is_none() {
        let payload = payload(r#""env_vars": "{}""#);
        assert_eq!(resolve_env_vars(&payload, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_direct_and_secret_values_are_merged() {
        let store = MemorySecretStore::default();
        store.insert("test-ns", "secret", &[("key", "from-default-ns")]);
        store.insert("other", "secret", &[("key", "from-other-ns")]);

        let payload = payload(
            r#""env_vars": "{\"PLAIN\": \"value\", \"A\": \"overridden\"}", "kubernetes_secrets": "{\"A\": \"secret/key\", \"B\": \"other/secret/key\"}""#,
        );
        let env = resolve_env_vars(&payload, Some(&store)).await.unwrap().unwrap();

        assert_eq!(
            env,
            BTreeMap::from([
                ("A".to_string(), "from-default-ns".to_string()),
                ("B".to_string(), "from-other-ns".to_string()),
                ("PLAIN".to_string(), "value".to_string()),
            ])
        );
    }

    #[tokio::test]
    async fn test_resolution_errors() {
        let store = MemorySecretStore::default();
        store.insert("test-ns", "secret", &[("key", "value")]);

        let payload_missing_key = payload(r#""kubernetes_secrets": "{\"A\": \"secret/nope\"}""#);
        let err = resolve_env_vars(&payload_missing_key, Some(&store))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "secret test-ns/secret does not have key nope");

        let payload_missing_secret = payload(r#""kubernetes_secrets": "{\"A\": \"absent/key\"}""#);
        let err = resolve_env_vars(&payload_missing_secret, Some(&store))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "error fetching secret test-ns/absent: secrets \"absent\" not found"
        );

        let err = resolve_env_vars(&payload_missing_key, None).await.unwrap_err();
        assert_eq!(err.to_string(), "kubernetes client is not configured");
    }

    async fn secret_route(
        UrlPath((namespace, name)): UrlPath<(String, String)>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sa-token") {
            return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "Unauthorized" })));
        }
        match (namespace.as_str(), name.as_str()) {
            ("default", "k6") => (
                StatusCode::OK,
                Json(json!({
                    "kind": "Secret",
                    "data": { "token": general_purpose::STANDARD.encode("s3cr3t") },
                })),
            ),
            ("default", "forbidden") => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "kind": "Status",
                    "message": "secrets \"forbidden\" is forbidden",
                })),
            ),
            _ => (
                StatusCode::NOT_FOUND,
                Json(json!({ "kind": "Status", "message": "not found" })),
            ),
        }
    }

    async fn start_fake_api() -> String {
        let app = Router::new().route(
            "/api/v1/namespaces/:namespace/secrets/:name",
            get(secret_route),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base_url
    }

    #[tokio::test]
    async fn test_kube_secret_store() {
        let base_url = start_fake_api().await;
        let store = KubeSecretStore::new(reqwest::Client::new(), base_url.clone(), "sa-token");

        let data = store.get("default", "k6").await.unwrap();
        assert_eq!(data.get("token"), Some(&b"s3cr3t".to_vec()));

        let err = store.get("default", "absent").await.unwrap_err();
        assert!(matches!(err, SecretError::NotFound { .. }));
        assert_eq!(err.to_string(), "secrets \"absent\" not found");

        let err = store.get("default", "forbidden").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "secrets \"forbidden\" is forbidden (status 403)"
        );

        let unauthorized = KubeSecretStore::new(reqwest::Client::new(), base_url, "wrong");
        assert!(matches!(
            unauthorized.get("default", "k6").await,
            Err(SecretError::Api { status: 401, .. })
        ));
    }
}
