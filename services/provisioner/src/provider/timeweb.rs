//! REST client for the Timeweb Cloud API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    generate_password, region_to_location, Bucket, BucketSpec, CloudProvider, ClusterSpec,
    Preset, ProviderCluster, ProviderDatabase, ProviderError, ProviderResult,
};
use crate::status::{map_provider_status, ProvisionStatus};

/// Public API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.timeweb.cloud/api/v1";

/// Per-call timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`TimewebClient`].
#[derive(Clone)]
pub struct TimewebConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for TimewebConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimewebConfig")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TimewebConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Provider backed by the Timeweb Cloud REST API.
#[derive(Debug, Clone)]
pub struct TimewebClient {
    client: reqwest::Client,
    base_url: String,
}

impl TimewebClient {
    pub fn new(config: &TimewebConfig) -> ProviderResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| ProviderError::new(None, "API token contains invalid characters"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::new(None, format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ProviderResult<reqwest::Response> {
        debug!(%method, path, "Provider request");
        let mut request = self.client.request(method, self.url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), path, "Provider request failed");
        Err(ProviderError::new(Some(status.as_u16()), error_message(&text, status)))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ProviderResult<T> {
        let response = self.send(method, path, body).await?;
        let status = response.status().as_u16();
        response.json().await.map_err(|e| {
            ProviderError::new(Some(status), format!("failed to parse provider response: {e}"))
        })
    }

    async fn call_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ProviderResult<()> {
        self.send(method, path, body).await.map(|_| ())
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::new(None, "request timed out")
    } else {
        ProviderError::new(e.status().map(|s| s.as_u16()), e.to_string())
    }
}

/// Pull `message` out of an error body, falling back to the raw text.
fn error_message(body: &str, status: reqwest::StatusCode) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| match v.get("message") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|i| i.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            _ => None,
        });

    match message {
        Some(m) if !m.is_empty() => m,
        _ if !body.is_empty() => body.to_string(),
        _ => status.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ClusterEnvelope {
    db_cluster: WireCluster,
}

#[derive(Debug, Deserialize)]
struct WireCluster {
    id: i64,
    status: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl WireCluster {
    fn into_cluster(self, fallback_login: &str, fallback_password: &str) -> ProviderCluster {
        ProviderCluster {
            cluster_id: self.id,
            host: self.host.unwrap_or_default(),
            port: self.port.unwrap_or(5432),
            login: self.login.unwrap_or_else(|| fallback_login.to_string()),
            password: self.password.unwrap_or_else(|| fallback_password.to_string()),
            status: map_provider_status(&self.status),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatabaseEnvelope {
    db: WireDatabase,
}

#[derive(Debug, Deserialize)]
struct WireDatabase {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PresetsEnvelope {
    databases_presets: Vec<WirePreset>,
}

#[derive(Debug, Deserialize)]
struct WirePreset {
    id: i64,
    #[serde(default)]
    description_short: String,
    /// Bytes.
    disk: i64,
    price: f64,
    cpu: i32,
    /// Megabytes.
    ram: i64,
    #[serde(rename = "type")]
    kind: String,
    location: String,
}

#[derive(Debug, Deserialize)]
struct BucketEnvelope {
    bucket: WireBucket,
}

#[derive(Debug, Deserialize)]
struct WireBucket {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    access_key: String,
    #[serde(default)]
    secret_key: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    disk_stats: Option<DiskStats>,
}

#[derive(Debug, Deserialize)]
struct DiskStats {
    used: i64,
}

impl From<WireBucket> for Bucket {
    fn from(b: WireBucket) -> Self {
        Bucket {
            id: b.id,
            name: b.name,
            public: b.kind == "public",
            access_key: b.access_key,
            secret_key: b.secret_key,
            endpoint: format!("https://{}", b.hostname),
            used_space: b.disk_stats.map(|d| d.used),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateClusterRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    preset_id: i64,
    location: &'static str,
    login: &'a str,
    password: &'a str,
    hash_type: &'static str,
}

fn bucket_type(public: bool) -> &'static str {
    if public {
        "public"
    } else {
        "private"
    }
}

fn to_value<T: Serialize>(body: &T) -> ProviderResult<serde_json::Value> {
    serde_json::to_value(body)
        .map_err(|e| ProviderError::new(None, format!("failed to encode request: {e}")))
}

#[async_trait]
impl CloudProvider for TimewebClient {
    async fn create_cluster(&self, spec: &ClusterSpec) -> ProviderResult<ProviderCluster> {
        let password = generate_password();
        let body = to_value(&CreateClusterRequest {
            name: &spec.name,
            kind: "postgres",
            preset_id: spec.preset_id,
            location: region_to_location(&spec.region),
            login: &spec.login,
            password: &password,
            hash_type: "caching_sha2",
        })?;

        let envelope: ClusterEnvelope = self.call(Method::POST, "/dbs", Some(body)).await?;
        Ok(envelope.db_cluster.into_cluster(&spec.login, &password))
    }

    async fn get_cluster(&self, cluster_id: i64) -> ProviderResult<ProviderCluster> {
        let envelope: ClusterEnvelope = self
            .call(Method::GET, &format!("/dbs/{cluster_id}"), None)
            .await?;
        Ok(envelope.db_cluster.into_cluster("", ""))
    }

    async fn resize_cluster(&self, cluster_id: i64, preset_id: i64) -> ProviderResult<ProvisionStatus> {
        let path = format!("/dbs/{cluster_id}");
        self.call_empty(Method::PATCH, &path, Some(json!({ "preset_id": preset_id })))
            .await?;
        self.get_cluster_status(cluster_id).await
    }

    async fn delete_cluster(&self, cluster_id: i64) -> ProviderResult<()> {
        self.call_empty(Method::DELETE, &format!("/dbs/{cluster_id}"), None)
            .await
    }

    async fn add_database(&self, cluster_id: i64, name: &str) -> ProviderResult<ProviderDatabase> {
        let envelope: DatabaseEnvelope = self
            .call(
                Method::POST,
                &format!("/dbs/{cluster_id}/dbs"),
                Some(json!({ "name": name })),
            )
            .await?;
        Ok(ProviderDatabase {
            db_id: envelope.db.id,
            name: envelope.db.name,
        })
    }

    async fn get_database(&self, cluster_id: i64, db_id: i64) -> ProviderResult<ProviderDatabase> {
        let envelope: DatabaseEnvelope = self
            .call(Method::GET, &format!("/dbs/{cluster_id}/dbs/{db_id}"), None)
            .await?;
        Ok(ProviderDatabase {
            db_id: envelope.db.id,
            name: envelope.db.name,
        })
    }

    async fn delete_database(&self, cluster_id: i64, db_id: i64) -> ProviderResult<()> {
        self.call_empty(Method::DELETE, &format!("/dbs/{cluster_id}/dbs/{db_id}"), None)
            .await
    }

    async fn list_presets(&self, region: &str) -> ProviderResult<Vec<Preset>> {
        let location = region_to_location(region);
        let envelope: PresetsEnvelope = self.call(Method::GET, "/presets/dbs", None).await?;
        Ok(envelope
            .databases_presets
            .into_iter()
            .filter(|p| p.kind == "postgres" && p.location == location)
            .map(|p| Preset {
                id: p.id,
                description: p.description_short,
                disk_mb: p.disk / (1024 * 1024),
                cpu: p.cpu,
                ram_mb: p.ram,
                price_monthly: (p.price * 100.0).round() as i64,
                location: p.location,
            })
            .collect())
    }

    async fn create_bucket(&self, spec: &BucketSpec) -> ProviderResult<Bucket> {
        let body = json!({
            "name": spec.name,
            "type": bucket_type(spec.public),
            "preset_id": spec.preset_id,
        });
        let envelope: BucketEnvelope = self
            .call(Method::POST, "/storages/buckets", Some(body))
            .await?;
        Ok(envelope.bucket.into())
    }

    async fn get_bucket(&self, bucket_id: i64) -> ProviderResult<Bucket> {
        let envelope: BucketEnvelope = self
            .call(Method::GET, &format!("/storages/buckets/{bucket_id}"), None)
            .await?;
        Ok(envelope.bucket.into())
    }

    async fn update_bucket(&self, bucket_id: i64, public: bool) -> ProviderResult<()> {
        self.call_empty(
            Method::PATCH,
            &format!("/storages/buckets/{bucket_id}"),
            Some(json!({ "type": bucket_type(public) })),
        )
        .await
    }

    async fn delete_bucket(&self, bucket_id: i64) -> ProviderResult<()> {
        self.call_empty(Method::DELETE, &format!("/storages/buckets/{bucket_id}"), None)
            .await
    }
}
