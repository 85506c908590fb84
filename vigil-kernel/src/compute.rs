/**
 * COMPUTE CONTROL CLIENT - Remote operations against the compute control plane
 *
 * ROLE:
 * The recovery tasks never talk to the control plane directly; they go through
 * the [`ComputeClient`] trait. The production implementation is a request/response
 * bridge over MQTT.
 *
 * PROTOCOL:
 * - Commands are published on `vigil/compute/command@v1` with a fresh `request_id`
 * - The control plane agent answers on `vigil/compute/response@v1`
 * - The MQTT listener hands every response to [`MqttComputeClient::handle_response`],
 *   which wakes the waiting caller
 * - A call with no answer before the configured timeout fails with `Timeout`
 */

use crate::models::Instance;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

pub const COMPUTE_COMMAND_TOPIC: &str = "vigil/compute/command@v1";
pub const COMPUTE_RESPONSE_TOPIC: &str = "vigil/compute/response@v1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("{action} timed out after {waited:?}")]
    Timeout { action: &'static str, waited: Duration },
    #[error("control plane unreachable: {0}")]
    Unavailable(String),
    #[error("control plane rejected {action}: {message}")]
    Rejected { action: &'static str, message: String },
    #[error("malformed control plane reply: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Marks the compute service on `host` disabled so nothing new is scheduled there
    async fn disable_service(&self, host: &str, reason: &str) -> Result<(), ComputeError>;

    async fn list_instances(&self, host: &str) -> Result<Vec<Instance>, ComputeError>;

    /// Rebuilds `instance_id` elsewhere. `None` lets the control plane scheduler pick
    async fn evacuate_instance(
        &self,
        instance_id: &str,
        target_host: Option<&str>,
    ) -> Result<(), ComputeError>;
}

pub type SharedComputeClient = Arc<dyn ComputeClient>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ComputeCommand {
    DisableService { host: String, reason: String },
    ListInstances { host: String },
    EvacuateInstance {
        instance_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_host: Option<String>,
    },
}

impl ComputeCommand {
    pub fn action(&self) -> &'static str {
        match self {
            ComputeCommand::DisableService { .. } => "disable_service",
            ComputeCommand::ListInstances { .. } => "list_instances",
            ComputeCommand::EvacuateInstance { .. } => "evacuate_instance",
        }
    }
}

#[derive(Debug, Serialize)]
struct CommandEnvelope<'a> {
    request_id: &'a str,
    #[serde(flatten)]
    command: &'a ComputeCommand,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ComputeResponse {
    Success {
        request_id: String,
        #[serde(default)]
        data: Value,
    },
    Error {
        request_id: String,
        error: String,
    },
}

impl ComputeResponse {
    pub fn request_id(&self) -> &str {
        match self {
            ComputeResponse::Success { request_id, .. } => request_id,
            ComputeResponse::Error { request_id, .. } => request_id,
        }
    }
}

pub struct MqttComputeClient {
    client: AsyncClient,
    /// request_id -> waiting caller
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ComputeResponse>>>>,
    timeout: Duration,
}

impl MqttComputeClient {
    pub fn new(client: AsyncClient, timeout: Duration) -> Self {
        Self { client, pending: Arc::new(Mutex::new(HashMap::new())), timeout }
    }

    /// Number of calls still waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn handle_response(&self, response: ComputeResponse) {
        let request_id = response.request_id().to_string();
        match self.pending.lock().remove(&request_id) {
            Some(sender) => {
                if sender.send(response).is_err() {
                    debug!("caller for compute request {request_id} already gave up");
                }
            }
            None => warn!("received compute response for unknown request {request_id}"),
        }
    }

    async fn send(&self, command: ComputeCommand) -> Result<Value, ComputeError> {
        let action = command.action();
        let request_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&CommandEnvelope { request_id: &request_id, command: &command })
            .map_err(|e| ComputeError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if let Err(e) = self.client.publish(COMPUTE_COMMAND_TOPIC, QoS::AtLeastOnce, false, payload).await {
            self.pending.lock().remove(&request_id);
            return Err(ComputeError::Unavailable(e.to_string()));
        }
        debug!(request_id = %request_id, action, "compute command sent");

        let response = match timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                return Err(ComputeError::Unavailable("response channel closed".into()));
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(ComputeError::Timeout { action, waited: self.timeout });
            }
        };

        match response {
            ComputeResponse::Success { data, .. } => Ok(data),
            ComputeResponse::Error { error, .. } => Err(ComputeError::Rejected { action, message: error }),
        }
    }
}

#[async_trait]
impl ComputeClient for MqttComputeClient {
    async fn disable_service(&self, host: &str, reason: &str) -> Result<(), ComputeError> {
        self.send(ComputeCommand::DisableService { host: host.to_string(), reason: reason.to_string() })
            .await
            .map(|_| ())
    }

    async fn list_instances(&self, host: &str) -> Result<Vec<Instance>, ComputeError> {
        let data = self.send(ComputeCommand::ListInstances { host: host.to_string() }).await?;
        serde_json::from_value(data).map_err(|e| ComputeError::Protocol(e.to_string()))
    }

    async fn evacuate_instance(
        &self,
        instance_id: &str,
        target_host: Option<&str>,
    ) -> Result<(), ComputeError> {
        self.send(ComputeCommand::EvacuateInstance {
            instance_id: instance_id.to_string(),
            target_host: target_host.map(str::to_string),
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;

    fn client(wait: Duration) -> (Arc<MqttComputeClient>, rumqttc::EventLoop) {
        // the event loop is never polled; publish only needs its request channel alive
        let (mqtt, eventloop) = AsyncClient::new(MqttOptions::new("compute-test", "localhost", 1883), 10);
        (Arc::new(MqttComputeClient::new(mqtt, wait)), eventloop)
    }

    async fn pending_request_id(compute: &MqttComputeClient) -> String {
        loop {
            if let Some(id) = compute.pending.lock().keys().next().cloned() {
                return id;
            }
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_command_wire_format() {
        let command = ComputeCommand::EvacuateInstance { instance_id: "vm-1".into(), target_host: None };
        let json = serde_json::to_value(CommandEnvelope { request_id: "r1", command: &command }).unwrap();
        assert_eq!(json, serde_json::json!({"request_id": "r1", "action": "evacuate_instance", "instance_id": "vm-1"}));

        let reply: ComputeResponse =
            serde_json::from_str(r#"{"type":"error","request_id":"r1","error":"no valid host"}"#).unwrap();
        assert_eq!(reply.request_id(), "r1");
    }

    #[tokio::test]
    async fn test_response_completes_pending_call() {
        let (compute, _eventloop) = client(Duration::from_secs(5));
        let caller = {
            let compute = compute.clone();
            tokio::spawn(async move { compute.list_instances("compute-1").await })
        };

        let request_id = pending_request_id(&compute).await;
        compute.handle_response(ComputeResponse::Success {
            request_id,
            data: serde_json::json!([{"id": "vm-1", "name": "web", "host": "compute-1", "vm_state": "active"}]),
        });

        let instances = caller.await.unwrap().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "vm-1");
        assert_eq!(compute.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_rejected() {
        let (compute, _eventloop) = client(Duration::from_secs(5));
        let caller = {
            let compute = compute.clone();
            tokio::spawn(async move { compute.disable_service("compute-1", "host down").await })
        };

        let request_id = pending_request_id(&compute).await;
        compute.handle_response(ComputeResponse::Error { request_id, error: "service not found".into() });

        assert_eq!(
            caller.await.unwrap(),
            Err(ComputeError::Rejected { action: "disable_service", message: "service not found".into() })
        );
    }

    #[tokio::test]
    async fn test_missing_reply_times_out() {
        let (compute, _eventloop) = client(Duration::from_millis(50));
        let err = compute.evacuate_instance("vm-1", None).await.unwrap_err();

        assert!(matches!(err, ComputeError::Timeout { action: "evacuate_instance", .. }));
        assert_eq!(compute.in_flight(), 0);
    }
}
