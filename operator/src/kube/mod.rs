use std::{collections::HashMap, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use resources::{
    config::OperatorConfig,
    objects::{
        deployment::Deployment, hpa::cpu_utilization_metrics, hpa::HorizontalPodAutoscaler,
        node::Node, pod::Pod, KubeList,
    },
    profiles::ResourceKind,
};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::guard::EndpointGuard;

#[cfg(test)]
pub mod mock;

/// Everything the operator needs from the cluster. The seam exists so the
/// scenario tests can run against an in-memory cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_hpas(&self) -> Result<Vec<HorizontalPodAutoscaler>>;
    async fn get_hpa(&self, namespace: &str, name: &str) -> Result<HorizontalPodAutoscaler>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn patch_hpa_min_replicas(&self, namespace: &str, name: &str, value: u32) -> Result<()>;
    async fn patch_hpa_max_replicas(&self, namespace: &str, name: &str, value: u32) -> Result<()>;
    async fn patch_hpa_target(&self, namespace: &str, name: &str, utilization: u32) -> Result<()>;
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: u32) -> Result<()>;
    async fn patch_container_requests(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        resource: ResourceKind,
        quantity: &str,
    ) -> Result<()>;
}

/// Thin rate-limited, circuit-broken client against the Kubernetes API.
pub struct KubeClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    guard: EndpointGuard,
}

impl KubeClient {
    pub fn new(config: &OperatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.kube_timeout_secs))
            .danger_accept_invalid_certs(config.kube_insecure_tls)
            .build()
            .with_context(|| "Failed to build Kubernetes HTTP client")?;
        Ok(Self {
            http,
            base: config.kube_api_url.trim_end_matches('/').to_owned(),
            token: config.kube_token.clone(),
            guard: EndpointGuard::new("kubernetes", config.k8s_rate_limit),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET with bounded-backoff retries behind the guard.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        self.guard
            .retry(|| async {
                let response = self
                    .authorize(self.http.get(&url))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<T, anyhow::Error>(response.json::<T>().await?)
            })
            .await
            .with_context(|| format!("GET {} failed", path))
    }

    /// PATCH with bounded-backoff retries; merge patches are idempotent,
    /// so a retried send is safe.
    async fn patch_json(
        &self,
        path: &str,
        content_type: &str,
        body: serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}{}", self.base, path);
        let payload = body.to_string();
        self.guard
            .retry(|| async {
                self.authorize(self.http.patch(&url))
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(payload.clone())
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<(), anyhow::Error>(())
            })
            .await
            .with_context(|| format!("PATCH {} failed", path))
    }
}

const MERGE_PATCH: &str = "application/merge-patch+json";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";

fn hpa_path(namespace: &str, name: &str) -> String {
    format!(
        "/apis/autoscaling/v2/namespaces/{}/horizontalpodautoscalers/{}",
        namespace, name
    )
}

fn deployment_path(namespace: &str, name: &str) -> String {
    format!("/apis/apps/v1/namespaces/{}/deployments/{}", namespace, name)
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn list_hpas(&self) -> Result<Vec<HorizontalPodAutoscaler>> {
        let list: KubeList<HorizontalPodAutoscaler> = self
            .get_json("/apis/autoscaling/v2/horizontalpodautoscalers")
            .await?;
        Ok(list.items)
    }

    async fn get_hpa(&self, namespace: &str, name: &str) -> Result<HorizontalPodAutoscaler> {
        self.get_json(&hpa_path(namespace, name)).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.get_json(&deployment_path(namespace, name)).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let path = if label_selector.is_empty() {
            format!("/api/v1/namespaces/{}/pods", namespace)
        } else {
            format!(
                "/api/v1/namespaces/{}/pods?labelSelector={}",
                namespace, label_selector
            )
        };
        let list: KubeList<Pod> = self.get_json(&path).await?;
        Ok(list.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list: KubeList<Node> = self.get_json("/api/v1/nodes").await?;
        Ok(list.items)
    }

    async fn patch_hpa_min_replicas(&self, namespace: &str, name: &str, value: u32) -> Result<()> {
        self.patch_json(
            &hpa_path(namespace, name),
            MERGE_PATCH,
            json!({ "spec": { "minReplicas": value } }),
        )
        .await
    }

    async fn patch_hpa_max_replicas(&self, namespace: &str, name: &str, value: u32) -> Result<()> {
        self.patch_json(
            &hpa_path(namespace, name),
            MERGE_PATCH,
            json!({ "spec": { "maxReplicas": value } }),
        )
        .await
    }

    async fn patch_hpa_target(&self, namespace: &str, name: &str, utilization: u32) -> Result<()> {
        let metrics = serde_json::to_value(cpu_utilization_metrics(utilization))
            .map_err(|e| anyhow!("Failed to encode metrics patch: {}", e))?;
        self.patch_json(
            &hpa_path(namespace, name),
            MERGE_PATCH,
            json!({ "spec": { "metrics": metrics } }),
        )
        .await
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: u32) -> Result<()> {
        self.patch_json(
            &deployment_path(namespace, name),
            MERGE_PATCH,
            json!({ "spec": { "replicas": replicas } }),
        )
        .await
    }

    async fn patch_container_requests(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        resource: ResourceKind,
        quantity: &str,
    ) -> Result<()> {
        let mut requests = serde_json::Map::new();
        requests.insert(
            resource.as_k8s_key().to_owned(),
            serde_json::Value::String(quantity.to_owned()),
        );
        self.patch_json(
            &deployment_path(namespace, name),
            STRATEGIC_MERGE_PATCH,
            json!({
                "spec": {
                    "template": {
                        "spec": {
                            "containers": [{
                                "name": container,
                                "resources": { "requests": requests }
                            }]
                        }
                    }
                }
            }),
        )
        .await
    }
}
