use std::{future::Future, sync::Arc};

use anyhow::Result;
use chrono::NaiveDateTime;
use resources::{
    metrics::ScalingEvent,
    objects::{deployment::Deployment, hpa::HorizontalPodAutoscaler},
    profiles::{ActionEffect, AppliedAction, ResourceKind},
    workload::WorkloadRef,
};
use uuid::Uuid;

use crate::{clock::Clock, kube::ClusterApi, store::MetricStore};

/// Idempotent, dry-run-capable wrapper around cluster mutations. The
/// previous value goes on record as a `Pending` audit row before the
/// patch is sent; the same row is finalized to `Applied` or `Failed`
/// once the cluster answered. Equal desired and current values produce a
/// `no-op` row and no call.
pub struct Actuator {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<MetricStore>,
    clock: Arc<dyn Clock>,
    dry_run: bool,
}

impl Actuator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        store: Arc<MetricStore>,
        clock: Arc<dyn Clock>,
        dry_run: bool,
    ) -> Self {
        Self {
            cluster,
            store,
            clock,
            dry_run,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Same id and timestamp rewrite the same row, so a mutation leaves
    /// exactly one audit row whatever its outcome.
    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        id: Uuid,
        timestamp: NaiveDateTime,
        workload: &WorkloadRef,
        field: &str,
        previous: &str,
        desired: &str,
        reason: &str,
        effect: ActionEffect,
    ) -> Result<()> {
        self.store.append_action(&AppliedAction {
            id,
            workload: workload.clone(),
            timestamp,
            field: field.to_owned(),
            previous: previous.to_owned(),
            desired: desired.to_owned(),
            reason: reason.to_owned(),
            dry_run: self.dry_run,
            effect,
        })?;
        Ok(())
    }

    /// Audit-then-patch for one field. A store failure before the send
    /// aborts the mutation; a patch failure finalizes the row as
    /// `Failed` and surfaces the error.
    async fn audited(
        &self,
        workload: &WorkloadRef,
        field: &str,
        previous: String,
        desired: String,
        reason: &str,
        patch: impl Future<Output = Result<()>>,
    ) -> Result<ActionEffect> {
        let id = Uuid::new_v4();
        let timestamp = self.clock.now();
        if previous == desired {
            self.record(
                id,
                timestamp,
                workload,
                field,
                &previous,
                &desired,
                reason,
                ActionEffect::NoOp,
            )?;
            return Ok(ActionEffect::NoOp);
        }
        if self.dry_run {
            self.record(
                id,
                timestamp,
                workload,
                field,
                &previous,
                &desired,
                reason,
                ActionEffect::Applied,
            )?;
            return Ok(ActionEffect::Applied);
        }
        self.record(
            id,
            timestamp,
            workload,
            field,
            &previous,
            &desired,
            reason,
            ActionEffect::Pending,
        )?;
        match patch.await {
            Ok(()) => {
                self.record(
                    id,
                    timestamp,
                    workload,
                    field,
                    &previous,
                    &desired,
                    reason,
                    ActionEffect::Applied,
                )?;
                Ok(ActionEffect::Applied)
            },
            Err(err) => {
                self.record(
                    id,
                    timestamp,
                    workload,
                    field,
                    &previous,
                    &desired,
                    reason,
                    ActionEffect::Failed,
                )?;
                Err(err)
            },
        }
    }

    pub async fn ensure_hpa_min_replicas(
        &self,
        workload: &WorkloadRef,
        hpa: &HorizontalPodAutoscaler,
        desired: u32,
        reason: &str,
    ) -> Result<ActionEffect> {
        let current = hpa.min_replicas();
        let effect = self
            .audited(
                workload,
                "hpa/minReplicas",
                current.to_string(),
                desired.to_string(),
                reason,
                self.cluster.patch_hpa_min_replicas(
                    &hpa.metadata.namespace,
                    &hpa.metadata.name,
                    desired,
                ),
            )
            .await?;
        if effect == ActionEffect::Applied {
            tracing::info!(
                "Set minReplicas of {}/{} from {} to {} ({})",
                hpa.metadata.namespace,
                hpa.metadata.name,
                current,
                desired,
                reason
            );
        }
        Ok(effect)
    }

    pub async fn ensure_hpa_max_replicas(
        &self,
        workload: &WorkloadRef,
        hpa: &HorizontalPodAutoscaler,
        desired: u32,
        reason: &str,
    ) -> Result<ActionEffect> {
        let current = hpa.spec.max_replicas;
        let effect = self
            .audited(
                workload,
                "hpa/maxReplicas",
                current.to_string(),
                desired.to_string(),
                reason,
                self.cluster.patch_hpa_max_replicas(
                    &hpa.metadata.namespace,
                    &hpa.metadata.name,
                    desired,
                ),
            )
            .await?;
        if effect == ActionEffect::Applied {
            tracing::info!(
                "Set maxReplicas of {}/{} from {} to {} ({})",
                hpa.metadata.namespace,
                hpa.metadata.name,
                current,
                desired,
                reason
            );
        }
        Ok(effect)
    }

    pub async fn ensure_hpa_target(
        &self,
        workload: &WorkloadRef,
        hpa: &HorizontalPodAutoscaler,
        desired: u32,
        reason: &str,
    ) -> Result<ActionEffect> {
        let current = hpa.target_utilization();
        let effect = self
            .audited(
                workload,
                "hpa/targetUtilization",
                format_option(current),
                desired.to_string(),
                reason,
                self.cluster.patch_hpa_target(
                    &hpa.metadata.namespace,
                    &hpa.metadata.name,
                    desired,
                ),
            )
            .await?;
        if effect == ActionEffect::Applied {
            tracing::info!(
                "Set target utilization of {}/{} from {} to {} ({})",
                hpa.metadata.namespace,
                hpa.metadata.name,
                format_option(current),
                desired,
                reason
            );
        }
        Ok(effect)
    }

    pub async fn ensure_deployment_replicas(
        &self,
        workload: &WorkloadRef,
        deployment: &Deployment,
        desired: u32,
        reason: &str,
    ) -> Result<ActionEffect> {
        let current = deployment.spec.replicas;
        let effect = self
            .audited(
                workload,
                "deployment/replicas",
                current.to_string(),
                desired.to_string(),
                reason,
                self.cluster.scale_deployment(
                    &deployment.metadata.namespace,
                    &deployment.metadata.name,
                    desired,
                ),
            )
            .await?;
        if effect == ActionEffect::Applied && !self.dry_run {
            self.store.append_event(&ScalingEvent {
                workload: workload.clone(),
                timestamp: self.clock.now(),
                old_replicas: current,
                new_replicas: desired,
                reason: reason.to_owned(),
            })?;
        }
        if effect == ActionEffect::Applied {
            tracing::info!(
                "Scaled {}/{} from {} to {} ({})",
                deployment.metadata.namespace,
                deployment.metadata.name,
                current,
                desired,
                reason
            );
        }
        Ok(effect)
    }

    pub async fn ensure_container_requests(
        &self,
        workload: &WorkloadRef,
        deployment: &Deployment,
        container: &str,
        resource: ResourceKind,
        desired: &str,
        reason: &str,
    ) -> Result<ActionEffect> {
        let current = deployment
            .spec
            .template
            .spec
            .containers
            .iter()
            .find(|c| c.name == container)
            .and_then(|c| c.resources.requests.get(resource.as_k8s_key()))
            .cloned()
            .unwrap_or_default();
        let field = format!("deployment/requests/{}/{}", container, resource.as_k8s_key());
        let effect = self
            .audited(
                workload,
                &field,
                current.clone(),
                desired.to_owned(),
                reason,
                self.cluster.patch_container_requests(
                    &deployment.metadata.namespace,
                    &deployment.metadata.name,
                    container,
                    resource,
                    desired,
                ),
            )
            .await?;
        if effect == ActionEffect::Applied {
            tracing::info!(
                "Set {} request of {}/{}:{} from {} to {} ({})",
                resource,
                deployment.metadata.namespace,
                deployment.metadata.name,
                container,
                if current.is_empty() { "unset" } else { &current },
                desired,
                reason
            );
        }
        Ok(effect)
    }
}

fn format_option(value: Option<u32>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "unset".to_string(),
    }
}
