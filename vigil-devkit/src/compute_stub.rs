/*!
Fake compute control plane

Answers [`ComputeClient`] calls from an in-memory script instead of a broker:
instances per host, hosts whose service cannot be disabled, instances whose
evacuation is refused. Every call is recorded in order for assertions.

A gate can hold `disable_service` calls until the test releases it, which keeps
a recovery in the `running` state long enough to race a second one against it.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;
use vigil_kernel::compute::{ComputeClient, ComputeError};
use vigil_kernel::models::Instance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeCall {
    DisableService { host: String, reason: String },
    ListInstances { host: String },
    EvacuateInstance { instance_id: String, target_host: Option<String> },
}

#[derive(Default)]
struct Script {
    instances: HashMap<String, Vec<Instance>>,
    unreachable_hosts: HashSet<String>,
    refused_evacuations: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct FakeComputeClient {
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<ComputeCall>>>,
    gate: Arc<Mutex<Option<Arc<Notify>>>>,
    /// `disable_service` calls that reached the gate
    parked: Arc<Notify>,
}

impl FakeComputeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances reported as running on `host`
    pub fn with_instances(self, host: &str, ids: &[&str]) -> Self {
        let instances = ids
            .iter()
            .map(|id| Instance {
                id: id.to_string(),
                name: format!("vm-{id}"),
                host: host.to_string(),
                vm_state: "active".to_string(),
            })
            .collect();
        self.script.lock().instances.insert(host.to_string(), instances);
        self
    }

    /// `disable_service` on `host` fails as if the control plane were down
    pub fn unreachable(self, host: &str) -> Self {
        self.script.lock().unreachable_hosts.insert(host.to_string());
        self
    }

    /// Lets `host` answer again after [`FakeComputeClient::unreachable`]
    pub fn recover(&self, host: &str) {
        self.script.lock().unreachable_hosts.remove(host);
    }

    pub fn refuse_evacuation(self, instance_id: &str) -> Self {
        self.script.lock().refused_evacuations.insert(instance_id.to_string());
        self
    }

    /// Holds every `disable_service` call until [`FakeComputeClient::open_gate`]
    pub fn close_gate(&self) {
        *self.gate.lock() = Some(Arc::new(Notify::new()));
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.notify_waiters();
        }
    }

    /// Resolves once a `disable_service` call is waiting at the closed gate
    pub async fn wait_parked(&self) {
        self.parked.notified().await;
    }

    pub fn calls(&self) -> Vec<ComputeCall> {
        self.calls.lock().clone()
    }

    pub fn disabled_hosts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ComputeCall::DisableService { host, .. } => Some(host.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn evacuated(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ComputeCall::EvacuateInstance { instance_id, .. } => Some(instance_id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    fn record(&self, call: ComputeCall) {
        debug!("[fake compute] {call:?}");
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ComputeClient for FakeComputeClient {
    async fn disable_service(&self, host: &str, reason: &str) -> Result<(), ComputeError> {
        self.record(ComputeCall::DisableService { host: host.to_string(), reason: reason.to_string() });

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let opened = gate.notified();
            tokio::pin!(opened);
            // register before announcing so an immediate open_gate is not lost
            opened.as_mut().enable();
            self.parked.notify_one();
            opened.await;
        }

        if self.script.lock().unreachable_hosts.contains(host) {
            return Err(ComputeError::Unavailable(format!("connection to {host} refused")));
        }
        Ok(())
    }

    async fn list_instances(&self, host: &str) -> Result<Vec<Instance>, ComputeError> {
        self.record(ComputeCall::ListInstances { host: host.to_string() });
        Ok(self.script.lock().instances.get(host).cloned().unwrap_or_default())
    }

    async fn evacuate_instance(&self, instance_id: &str, target_host: Option<&str>) -> Result<(), ComputeError> {
        self.record(ComputeCall::EvacuateInstance {
            instance_id: instance_id.to_string(),
            target_host: target_host.map(str::to_string),
        });
        if self.script.lock().refused_evacuations.contains(instance_id) {
            return Err(ComputeError::Rejected {
                action: "evacuate_instance",
                message: format!("no valid host found for {instance_id}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_scripted_answers_and_call_log() {
        let compute = FakeComputeClient::new()
            .with_instances("compute-1", &["a", "b"])
            .unreachable("compute-2")
            .refuse_evacuation("b");

        assert!(compute.disable_service("compute-1", "test").await.is_ok());
        assert!(matches!(
            compute.disable_service("compute-2", "test").await,
            Err(ComputeError::Unavailable(_))
        ));
        assert_eq!(compute.list_instances("compute-1").await.unwrap().len(), 2);
        assert!(compute.list_instances("compute-9").await.unwrap().is_empty());
        assert!(compute.evacuate_instance("a", None).await.is_ok());
        assert!(compute.evacuate_instance("b", None).await.is_err());

        assert_eq!(compute.disabled_hosts(), vec!["compute-1", "compute-2"]);
        assert_eq!(compute.evacuated(), vec!["a", "b"]);
        assert_eq!(compute.calls().len(), 6);
    }

    #[tokio::test]
    async fn test_gate_holds_disable_until_opened() {
        let compute = FakeComputeClient::new();
        compute.close_gate();

        let held = compute.clone();
        let call = tokio::spawn(async move { held.disable_service("compute-1", "test").await });

        compute.wait_parked().await;
        assert!(!call.is_finished());

        compute.open_gate();
        let result = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
