/**
 * NOTIFICATION DISPATCHER - From failure notification to terminal status
 *
 * ROLE:
 * Takes a stored notification, finds the target and its segment, asks the
 * selector for a recovery flow, serializes on the target lock, runs the flow
 * and records how it ended.
 *
 * FLOW:
 * new ──► target resolved? ──no──► failed ("target not found")
 *          │ name in several segments ──► failed ("ambiguous target")
 *          │ host on maintenance ──► ignored
 *          ▼
 *        flow selected? ──no──► failed (unsupported) | error (construction)
 *          ▼
 *        target lock free? ──no──► ignored ("recovery already in progress for <key>")
 *          ▼
 *        running ──► finished | failed (task error) | error (engine fault)
 *
 * GUARANTEES:
 * - Only `new` notifications start; handling anything else changes nothing and
 *   takes no claim
 * - Handling the same notification twice, even concurrently, runs it at most once
 * - The target lock is released on every exit path
 * - An operator retry restarts a `failed` or `error` notification; when the retry
 *   cannot start, the notification keeps its status
 */

use crate::coordinator::{LockCoordinator, TargetKey};
use crate::engine::{RunResult, WorkflowEngine};
use crate::models::{Notification, NotificationIn, NotificationStatus, NotificationType, RecoveryMethod};
use crate::notifications::{NotificationStore, StoreError};
use crate::selector::{RecoveryContext, SelectionError, WorkflowSelector};
use crate::topology::TopologyStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const TARGET_NOT_FOUND: &str = "target not found";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("notification {uuid} is {status}; only failed or error notifications can be retried")]
    NotRetryable { uuid: Uuid, status: NotificationStatus },
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The recovery flow ran to completion
    Ran { status: NotificationStatus, result: RunResult },
    /// No flow for this failure type and recovery method, or the flow could not be built
    Unselected { status: NotificationStatus, error: SelectionError },
    TargetNotFound { status: NotificationStatus, reason: String },
    /// The host name is registered in more than one segment
    AmbiguousTarget { status: NotificationStatus, reason: String },
    Ignored { status: NotificationStatus, reason: String },
    /// The engine itself failed while running the flow
    Faulted { status: NotificationStatus, reason: String },
    /// Not in a startable status; nothing was touched
    Unchanged { status: NotificationStatus },
}

impl DispatchOutcome {
    /// Status of the notification once dispatch returned
    pub fn status(&self) -> NotificationStatus {
        match self {
            DispatchOutcome::Ran { status, .. }
            | DispatchOutcome::Unselected { status, .. }
            | DispatchOutcome::TargetNotFound { status, .. }
            | DispatchOutcome::AmbiguousTarget { status, .. }
            | DispatchOutcome::Ignored { status, .. }
            | DispatchOutcome::Faulted { status, .. }
            | DispatchOutcome::Unchanged { status } => *status,
        }
    }
}

/// Where a notification points in the topology
struct Resolved {
    key: TargetKey,
    method: RecoveryMethod,
}

enum Resolution {
    Found(Resolved),
    NotFound,
    Ambiguous(String),
    OnMaintenance(String),
}

pub struct Dispatcher {
    store: Arc<NotificationStore>,
    topology: Arc<dyn TopologyStore>,
    selector: Arc<WorkflowSelector>,
    engine: WorkflowEngine,
    locks: LockCoordinator,
    /// Notifications currently being dispatched, so a duplicate call backs off
    claims: LockCoordinator,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<NotificationStore>,
        topology: Arc<dyn TopologyStore>,
        selector: Arc<WorkflowSelector>,
        engine: WorkflowEngine,
        locks: LockCoordinator,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            topology,
            selector,
            engine,
            locks,
            claims: LockCoordinator::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn notifications(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    pub fn topology(&self) -> &Arc<dyn TopologyStore> {
        &self.topology
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// Recovery slots currently free
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Dispatches a `new` notification; any other status is left as is
    pub async fn handle(&self, uuid: Uuid) -> Result<DispatchOutcome, DispatchError> {
        self.start(uuid, &[NotificationStatus::New]).await
    }

    /// Operator-triggered restart of a `failed` or `error` notification
    pub async fn retry(&self, uuid: Uuid) -> Result<DispatchOutcome, DispatchError> {
        let notification = self.store.get(uuid).await?;
        if !notification.status.is_retryable() {
            return Err(DispatchError::NotRetryable { uuid, status: notification.status });
        }
        info!(notification = %uuid, from = %notification.status, "operator retry");
        self.start(uuid, &[NotificationStatus::Failed, NotificationStatus::Error]).await
    }

    /// Stores an inbound notification and dispatches it in the background
    pub async fn submit(
        self: &Arc<Self>,
        incoming: NotificationIn,
    ) -> Result<(Notification, JoinHandle<Result<DispatchOutcome, DispatchError>>), DispatchError> {
        let notification = self.store.insert(incoming.into_notification()).await?;
        info!(
            notification = %notification.uuid,
            host = %notification.source_host_name,
            kind = %notification.notification_type,
            "notification received"
        );
        let handle = self.spawn_handle(notification.uuid);
        Ok((notification, handle))
    }

    pub fn spawn_handle(self: &Arc<Self>, uuid: Uuid) -> JoinHandle<Result<DispatchOutcome, DispatchError>> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let result = dispatcher.handle(uuid).await;
            if let Err(e) = &result {
                warn!(notification = %uuid, "dispatch failed: {e}");
            }
            result
        })
    }

    /// Startup reconciliation: runs left `running` by a previous process become
    /// `error`, and notifications still `new` are dispatched again
    pub async fn resume(self: &Arc<Self>) -> Vec<JoinHandle<Result<DispatchOutcome, DispatchError>>> {
        for uuid in self.store.fail_interrupted().await {
            warn!(notification = %uuid, "recovery was interrupted by a restart, marked error");
        }
        self.store
            .list(Some(NotificationStatus::New))
            .await
            .into_iter()
            .map(|n| self.spawn_handle(n.uuid))
            .collect()
    }

    async fn start(
        &self,
        uuid: Uuid,
        startable: &[NotificationStatus],
    ) -> Result<DispatchOutcome, DispatchError> {
        let current = self.store.get(uuid).await?.status;
        if !startable.contains(&current) {
            return Ok(DispatchOutcome::Unchanged { status: current });
        }

        let Some(_claim) = self.claims.guard(uuid.to_string()) else {
            let status = self.store.get(uuid).await?.status;
            return Ok(DispatchOutcome::Unchanged { status });
        };
        // another dispatch may have run between the check and the claim
        let notification = self.store.get(uuid).await?;
        if !startable.contains(&notification.status) {
            return Ok(DispatchOutcome::Unchanged { status: notification.status });
        }

        let resolved = match self.resolve(&notification) {
            Resolution::Found(resolved) => resolved,
            Resolution::NotFound => {
                warn!(notification = %uuid, host = %notification.source_host_name, "{}", TARGET_NOT_FOUND);
                let status = self.settle(&notification, NotificationStatus::Failed, TARGET_NOT_FOUND.into()).await?;
                return Ok(DispatchOutcome::TargetNotFound { status, reason: TARGET_NOT_FOUND.into() });
            }
            Resolution::Ambiguous(reason) => {
                warn!(notification = %uuid, "{reason}");
                let status = self.settle(&notification, NotificationStatus::Failed, reason.clone()).await?;
                return Ok(DispatchOutcome::AmbiguousTarget { status, reason });
            }
            Resolution::OnMaintenance(reason) => {
                info!(notification = %uuid, "{reason}");
                let status = self.settle(&notification, NotificationStatus::Ignored, reason.clone()).await?;
                return Ok(DispatchOutcome::Ignored { status, reason });
            }
        };

        let mut ctx = RecoveryContext::for_host(uuid, notification.source_host_name.clone());
        ctx.instance_id = notification.instance_uuid().map(str::to_string);
        let graph = match self.selector.select(resolved.method, notification.notification_type, &ctx) {
            Ok(graph) => graph,
            Err(err) => {
                let to = if err.is_unsupported() { NotificationStatus::Failed } else { NotificationStatus::Error };
                warn!(notification = %uuid, "no recovery flow: {err}");
                let status = self.settle(&notification, to, err.to_string()).await?;
                return Ok(DispatchOutcome::Unselected { status, error: err });
            }
        };

        let Some(_guard) = self.locks.try_lock(&resolved.key) else {
            let reason = format!("recovery already in progress for {}", resolved.key);
            info!(notification = %uuid, "{reason}");
            let status = self.settle(&notification, NotificationStatus::Ignored, reason.clone()).await?;
            return Ok(DispatchOutcome::Ignored { status, reason });
        };

        let _permit = self.permits.acquire().await.map_err(|_| DispatchError::ShuttingDown)?;
        self.store.transition(uuid, startable, NotificationStatus::Running, None).await?;
        info!(notification = %uuid, target = %resolved.key, flow = graph.name(), "recovery started");

        let result = match AssertUnwindSafe(self.engine.run(graph)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(notification = %uuid, "workflow engine panicked");
                let reason = "workflow engine panicked".to_string();
                let updated =
                    self.store.complete(uuid, NotificationStatus::Error, Some(reason.clone()), Default::default()).await?;
                return Ok(DispatchOutcome::Faulted { status: updated.status, reason });
            }
        };

        let (status, reason) = if let Some(fault) = &result.engine_fault {
            (NotificationStatus::Error, Some(fault.clone()))
        } else if result.succeeded {
            (NotificationStatus::Finished, None)
        } else {
            let reason = result
                .first_failure()
                .map(|(task, cause)| format!("{task}: {cause}"))
                .unwrap_or_else(|| "recovery flow did not complete".to_string());
            (NotificationStatus::Failed, Some(reason))
        };

        let updated = self.store.complete(uuid, status, reason, result.outcomes.clone()).await?;
        info!(notification = %uuid, target = %resolved.key, status = %updated.status, "recovery ended");
        Ok(DispatchOutcome::Ran { status: updated.status, result })
    }

    fn resolve(&self, notification: &Notification) -> Resolution {
        let Some(key) = TargetKey::for_notification(notification) else {
            return Resolution::NotFound;
        };

        let mut named = self.topology.hosts_named(&notification.source_host_name);
        if named.len() > 1 {
            return Resolution::Ambiguous(format!(
                "ambiguous target: host '{}' is registered in {} segments",
                notification.source_host_name,
                named.len()
            ));
        }
        let host = named.pop();
        let segment = host.as_ref().and_then(|h| self.topology.get_segment(h.failover_segment_id).ok());

        if notification.notification_type == NotificationType::ComputeHost {
            let (Some(host), Some(segment)) = (host, segment) else {
                return Resolution::NotFound;
            };
            if host.on_maintenance {
                return Resolution::OnMaintenance(format!("host {} is on maintenance", host.name));
            }
            return Resolution::Found(Resolved { key, method: segment.recovery_method });
        }

        // instance and process failures are keyed on the notification itself; the
        // segment only decides the recovery method when it is known
        let method = segment.map(|s| s.recovery_method).unwrap_or_default();
        Resolution::Found(Resolved { key, method })
    }

    /// Ends a dispatch that never reached `running`. A retry that cannot start
    /// leaves the notification in its failed or error status.
    async fn settle(
        &self,
        notification: &Notification,
        to: NotificationStatus,
        reason: String,
    ) -> Result<NotificationStatus, DispatchError> {
        if notification.status != NotificationStatus::New {
            return Ok(notification.status);
        }
        let updated = self
            .store
            .transition(notification.uuid, &[NotificationStatus::New], to, Some(reason))
            .await?;
        Ok(updated.status)
    }
}
