//! Host-evacuation workflow used for `COMPUTE_HOST` failures in `auto` segments.
//!
//! ```text
//! disable_compute_service_task ──► pre_evacuation_task ──► evacuate_instance_task
//!   host_name                        host_name               host_name
//!   → service_disabled               service_disabled        instances
//!                                    → instances             → evacuation_report
//! ```

use crate::compute::SharedComputeClient;
use crate::engine::{GraphError, RetryPolicy, Slot, Task, TaskError, TaskGraph, Values};
use crate::models::Instance;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const HOST_NAME: Slot<String> = Slot::new("host_name");
pub const SERVICE_DISABLED: Slot<bool> = Slot::new("service_disabled");
pub const INSTANCES: Slot<Vec<Instance>> = Slot::new("instances");
pub const EVACUATION_REPORT: Slot<EvacuationReport> = Slot::new("evacuation_report");

pub const DISABLE_REASON: &str = "host failure detected by vigil";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvacuationReport {
    pub host: String,
    pub evacuated: Vec<String>,
}

pub struct DisableComputeServiceTask {
    compute: SharedComputeClient,
    retry: RetryPolicy,
}

impl DisableComputeServiceTask {
    pub fn new(compute: SharedComputeClient, retry: RetryPolicy) -> Self {
        Self { compute, retry }
    }
}

#[async_trait]
impl Task for DisableComputeServiceTask {
    fn name(&self) -> &str {
        "disable_compute_service_task"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![HOST_NAME.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![SERVICE_DISABLED.name()]
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn execute(&self, inputs: &Values) -> Result<Values, TaskError> {
        let host = inputs.get(HOST_NAME)?;
        self.compute
            .disable_service(host, DISABLE_REASON)
            .await
            .map_err(|e| TaskError::ServiceDisableFailed { host: host.clone(), cause: e.to_string() })?;
        Ok(Values::new().with(SERVICE_DISABLED, true))
    }
}

pub struct PreEvacuationTask {
    compute: SharedComputeClient,
    retry: RetryPolicy,
}

impl PreEvacuationTask {
    pub fn new(compute: SharedComputeClient, retry: RetryPolicy) -> Self {
        Self { compute, retry }
    }
}

#[async_trait]
impl Task for PreEvacuationTask {
    fn name(&self) -> &str {
        "pre_evacuation_task"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![HOST_NAME.name(), SERVICE_DISABLED.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![INSTANCES.name()]
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn execute(&self, inputs: &Values) -> Result<Values, TaskError> {
        let host = inputs.get(HOST_NAME)?;
        let instances = self
            .compute
            .list_instances(host)
            .await
            .map_err(|e| TaskError::InstanceListFailed { host: host.clone(), cause: e.to_string() })?;

        for instance in &instances {
            info!(host = %host, instance = %instance.id, vm_state = %instance.vm_state, "pre-failure state");
        }
        Ok(Values::new().with(INSTANCES, instances))
    }
}

pub struct EvacuateInstancesTask {
    compute: SharedComputeClient,
    retry: RetryPolicy,
}

impl EvacuateInstancesTask {
    pub fn new(compute: SharedComputeClient, retry: RetryPolicy) -> Self {
        Self { compute, retry }
    }
}

#[async_trait]
impl Task for EvacuateInstancesTask {
    fn name(&self) -> &str {
        "evacuate_instance_task"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![HOST_NAME.name(), INSTANCES.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![EVACUATION_REPORT.name()]
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn execute(&self, inputs: &Values) -> Result<Values, TaskError> {
        let host = inputs.get(HOST_NAME)?;
        let instances = inputs.get(INSTANCES)?;

        let calls = instances.iter().map(|instance| async move {
            let result = self.compute.evacuate_instance(&instance.id, None).await;
            (instance.id.clone(), result)
        });

        let mut evacuated = Vec::with_capacity(instances.len());
        let mut rejected = 0;
        for (id, result) in join_all(calls).await {
            match result {
                Ok(()) => evacuated.push(id),
                Err(e) => {
                    warn!(host = %host, instance = %id, "evacuation rejected: {e}");
                    rejected += 1;
                }
            }
        }

        if rejected > 0 {
            return Err(TaskError::EvacuationRejected {
                host: host.clone(),
                rejected,
                total: instances.len(),
            });
        }
        Ok(Values::new().with(EVACUATION_REPORT, EvacuationReport { host: host.clone(), evacuated }))
    }
}

/// Builds the evacuation graph for one failed host
pub fn auto_flow(
    notification: Uuid,
    host_name: &str,
    compute: SharedComputeClient,
    retry: RetryPolicy,
) -> Result<TaskGraph, GraphError> {
    TaskGraph::builder(format!("host_failure_auto:{host_name}"))
        .notification(notification)
        .input(HOST_NAME, host_name.to_string())
        .task(DisableComputeServiceTask::new(compute.clone(), retry))
        .task(PreEvacuationTask::new(compute.clone(), retry))
        .task(EvacuateInstancesTask::new(compute, retry))
        .build()
}
