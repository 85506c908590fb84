/*!
Recovery scenario harness

Wires a real [`Dispatcher`] (store, selector, engine, locks) to an in-memory
topology, the fake compute plane and an event recorder, so a test can publish a
failure and assert on where the notification ends up and what the compute
plane was asked to do.
*/

use crate::compute_stub::FakeComputeClient;
use crate::event_recorder::RecordingEventSink;
use crate::fixtures;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vigil_kernel::coordinator::LockCoordinator;
use vigil_kernel::dispatcher::Dispatcher;
use vigil_kernel::engine::{RetryPolicy, WorkflowEngine};
use vigil_kernel::models::{FailoverSegment, Host, Notification, NotificationIn, RecoveryMethod};
use vigil_kernel::notifications::NotificationStore;
use vigil_kernel::selector::WorkflowSelector;
use vigil_kernel::topology::MemoryTopologyStore;

const DEFAULT_MAX_CONCURRENT: usize = 4;

pub struct TestHarness {
    pub topology: Arc<MemoryTopologyStore>,
    pub compute: FakeComputeClient,
    pub events: RecordingEventSink,
    pub dispatcher: Arc<Dispatcher>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_compute(FakeComputeClient::new())
    }

    pub fn with_compute(compute: FakeComputeClient) -> Self {
        Self::configured(compute, |_| {})
    }

    /// Lets the test register extra flows on top of the built-in ones
    pub fn configured(compute: FakeComputeClient, customize: impl FnOnce(&mut WorkflowSelector)) -> Self {
        Self::configured_with(compute, DEFAULT_MAX_CONCURRENT, customize)
    }

    /// As [`TestHarness::configured`], with at most `max_concurrent` recoveries running at once
    pub fn configured_with(
        compute: FakeComputeClient,
        max_concurrent: usize,
        customize: impl FnOnce(&mut WorkflowSelector),
    ) -> Self {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();

        let topology = Arc::new(MemoryTopologyStore::new());
        let events = RecordingEventSink::new();

        let mut selector = WorkflowSelector::new(Arc::new(compute.clone()), RetryPolicy::default());
        customize(&mut selector);

        let dispatcher = Dispatcher::new(
            Arc::new(NotificationStore::in_memory()),
            topology.clone(),
            Arc::new(selector),
            WorkflowEngine::new(Arc::new(events.clone())),
            LockCoordinator::new(),
            max_concurrent,
        );

        Self { topology, compute, events, dispatcher: Arc::new(dispatcher) }
    }

    pub fn add_segment(&self, name: &str, recovery_method: RecoveryMethod) -> Result<FailoverSegment> {
        let segment = fixtures::segment(name, recovery_method);
        self.topology.insert_segment(segment.clone())?;
        Ok(segment)
    }

    pub fn add_host(&self, name: &str, segment: &FailoverSegment) -> Result<Host> {
        let host = fixtures::host(name, segment);
        self.topology.insert_host(host.clone())?;
        Ok(host)
    }

    /// One `auto` segment holding `hosts`
    pub fn auto_segment_with(&self, hosts: &[&str]) -> Result<FailoverSegment> {
        let segment = self.add_segment("segment-auto", RecoveryMethod::Auto)?;
        for name in hosts {
            self.add_host(name, &segment)?;
        }
        Ok(segment)
    }

    /// Stores a notification without dispatching it
    pub async fn ingest(&self, incoming: NotificationIn) -> Result<Notification> {
        Ok(self.dispatcher.notifications().insert(incoming.into_notification()).await?)
    }

    pub async fn notification(&self, uuid: Uuid) -> Result<Notification> {
        Ok(self.dispatcher.notifications().get(uuid).await?)
    }

    /// Polls until the notification reaches a terminal status
    pub async fn wait_for_terminal(&self, uuid: Uuid, timeout_ms: u64) -> Result<Notification> {
        let start = std::time::Instant::now();
        loop {
            let notification = self.notification(uuid).await?;
            if notification.status.is_terminal() {
                info!(notification = %uuid, status = %notification.status, "notification settled");
                return Ok(notification);
            }
            if start.elapsed() >= Duration::from_millis(timeout_ms) {
                anyhow::bail!("notification {uuid} still {} after {timeout_ms}ms", notification.status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
