//! In-memory cluster used by the scenario tests.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use resources::{
    objects::{
        deployment::Deployment,
        hpa::{cpu_utilization_metrics, HorizontalPodAutoscaler},
        node::Node,
        pod::Pod,
    },
    profiles::ResourceKind,
};

use super::ClusterApi;

#[derive(Default)]
pub struct MockState {
    pub hpas: HashMap<(String, String), HorizontalPodAutoscaler>,
    pub deployments: HashMap<(String, String), Deployment>,
    pub pods: HashMap<String, Vec<Pod>>,
    pub nodes: Vec<Node>,
    pub patches: Vec<String>,
}

#[derive(Default)]
pub struct MockCluster {
    pub state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_hpa(&self, hpa: HorizontalPodAutoscaler) {
        let key = (hpa.metadata.namespace.clone(), hpa.metadata.name.clone());
        self.state.lock().hpas.insert(key, hpa);
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        let key = (
            deployment.metadata.namespace.clone(),
            deployment.metadata.name.clone(),
        );
        self.state.lock().deployments.insert(key, deployment);
    }

    pub fn set_pods(&self, namespace: &str, pods: Vec<Pod>) {
        self.state.lock().pods.insert(namespace.to_owned(), pods);
    }

    pub fn patch_log(&self) -> Vec<String> {
        self.state.lock().patches.clone()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn list_hpas(&self) -> Result<Vec<HorizontalPodAutoscaler>> {
        Ok(self.state.lock().hpas.values().cloned().collect())
    }

    async fn get_hpa(&self, namespace: &str, name: &str) -> Result<HorizontalPodAutoscaler> {
        self.state
            .lock()
            .hpas
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| anyhow!("HPA {}/{} not found", namespace, name))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.state
            .lock()
            .deployments
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| anyhow!("Deployment {}/{} not found", namespace, name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        _selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .pods
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().nodes.clone())
    }

    async fn patch_hpa_min_replicas(&self, namespace: &str, name: &str, value: u32) -> Result<()> {
        let mut state = self.state.lock();
        let hpa = state
            .hpas
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| anyhow!("HPA {}/{} not found", namespace, name))?;
        hpa.spec.min_replicas = Some(value);
        state
            .patches
            .push(format!("hpa/{}/{}/minReplicas={}", namespace, name, value));
        Ok(())
    }

    async fn patch_hpa_max_replicas(&self, namespace: &str, name: &str, value: u32) -> Result<()> {
        let mut state = self.state.lock();
        let hpa = state
            .hpas
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| anyhow!("HPA {}/{} not found", namespace, name))?;
        hpa.spec.max_replicas = value;
        state
            .patches
            .push(format!("hpa/{}/{}/maxReplicas={}", namespace, name, value));
        Ok(())
    }

    async fn patch_hpa_target(&self, namespace: &str, name: &str, utilization: u32) -> Result<()> {
        let mut state = self.state.lock();
        let hpa = state
            .hpas
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| anyhow!("HPA {}/{} not found", namespace, name))?;
        hpa.spec.metrics = cpu_utilization_metrics(utilization);
        state
            .patches
            .push(format!("hpa/{}/{}/target={}", namespace, name, utilization));
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: u32) -> Result<()> {
        let mut state = self.state.lock();
        let deployment = state
            .deployments
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| anyhow!("Deployment {}/{} not found", namespace, name))?;
        deployment.spec.replicas = replicas;
        state.patches.push(format!(
            "deployment/{}/{}/replicas={}",
            namespace, name, replicas
        ));
        Ok(())
    }

    async fn patch_container_requests(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        resource: ResourceKind,
        quantity: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let deployment = state
            .deployments
            .get_mut(&(namespace.to_owned(), name.to_owned()))
            .ok_or_else(|| anyhow!("Deployment {}/{} not found", namespace, name))?;
        let target = deployment
            .spec
            .template
            .spec
            .containers
            .iter_mut()
            .find(|c| c.name == container)
            .ok_or_else(|| anyhow!("Container {} not found", container))?;
        target
            .resources
            .requests
            .insert(resource.as_k8s_key().to_owned(), quantity.to_owned());
        state.patches.push(format!(
            "deployment/{}/{}/requests/{}/{}={}",
            namespace,
            name,
            container,
            resource.as_k8s_key(),
            quantity
        ));
        Ok(())
    }
}
