//! Recovery method selection.
//!
//! A table maps `(failure type, recovery method)` to a graph builder. A failure type
//! with no entry at all is unsupported whatever the segment's method is; a known
//! failure type with no entry for the method is an unsupported method.

use crate::compute::SharedComputeClient;
use crate::engine::{GraphError, RetryPolicy, TaskGraph};
use crate::host_failure;
use crate::models::{NotificationType, RecoveryMethod};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What a graph builder knows about the failure it is building for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryContext {
    pub notification: Uuid,
    pub host_name: String,
    /// Failed instance, for VM notifications
    pub instance_id: Option<String>,
}

impl RecoveryContext {
    pub fn for_host(notification: Uuid, host_name: impl Into<String>) -> Self {
        Self { notification, host_name: host_name.into(), instance_id: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("no recovery flow for failure type {0}")]
    UnsupportedFailureType(NotificationType),
    #[error("recovery method '{method}' is not implemented for {failure_type} failures")]
    UnsupportedRecoveryMethod { method: RecoveryMethod, failure_type: NotificationType },
    #[error("failed to build recovery flow for notification {notification}: {source}")]
    GraphConstructionFailed {
        notification: Uuid,
        #[source]
        source: GraphError,
    },
}

impl SelectionError {
    /// Configuration the kernel does not handle, as opposed to an internal fault
    pub fn is_unsupported(&self) -> bool {
        !matches!(self, SelectionError::GraphConstructionFailed { .. })
    }
}

pub type FlowBuilder = Arc<dyn Fn(&RecoveryContext) -> Result<TaskGraph, GraphError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct WorkflowSelector {
    table: HashMap<(NotificationType, RecoveryMethod), FlowBuilder>,
}

impl WorkflowSelector {
    /// Selector with the built-in flows: host evacuation for `COMPUTE_HOST` + `auto`
    pub fn new(compute: SharedComputeClient, retry: RetryPolicy) -> Self {
        let mut selector = Self::default();
        selector.register(NotificationType::ComputeHost, RecoveryMethod::Auto, move |ctx| {
            host_failure::auto_flow(ctx.notification, &ctx.host_name, compute.clone(), retry)
        });
        selector
    }

    pub fn register<F>(&mut self, failure_type: NotificationType, method: RecoveryMethod, builder: F)
    where
        F: Fn(&RecoveryContext) -> Result<TaskGraph, GraphError> + Send + Sync + 'static,
    {
        self.table.insert((failure_type, method), Arc::new(builder));
    }

    pub fn supports(&self, failure_type: NotificationType, method: RecoveryMethod) -> bool {
        self.table.contains_key(&(failure_type, method))
    }

    pub fn select(
        &self,
        method: RecoveryMethod,
        failure_type: NotificationType,
        ctx: &RecoveryContext,
    ) -> Result<TaskGraph, SelectionError> {
        if !self.table.keys().any(|(t, _)| *t == failure_type) {
            return Err(SelectionError::UnsupportedFailureType(failure_type));
        }
        let builder = self
            .table
            .get(&(failure_type, method))
            .ok_or(SelectionError::UnsupportedRecoveryMethod { method, failure_type })?;

        builder(ctx).map_err(|source| SelectionError::GraphConstructionFailed {
            notification: ctx.notification,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeClient, ComputeError};
    use crate::models::Instance;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl ComputeClient for Unreachable {
        async fn disable_service(&self, _: &str, _: &str) -> Result<(), ComputeError> {
            Err(ComputeError::Unavailable("offline".into()))
        }
        async fn list_instances(&self, _: &str) -> Result<Vec<Instance>, ComputeError> {
            Err(ComputeError::Unavailable("offline".into()))
        }
        async fn evacuate_instance(&self, _: &str, _: Option<&str>) -> Result<(), ComputeError> {
            Err(ComputeError::Unavailable("offline".into()))
        }
    }

    fn selector() -> WorkflowSelector {
        WorkflowSelector::new(Arc::new(Unreachable), RetryPolicy::default())
    }

    #[test]
    fn test_compute_host_auto_builds_evacuation_flow() {
        let ctx = RecoveryContext::for_host(Uuid::new_v4(), "compute-1");
        let graph = selector().select(RecoveryMethod::Auto, NotificationType::ComputeHost, &ctx).unwrap();

        assert_eq!(graph.notification(), Some(ctx.notification));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_other_methods_are_unsupported() {
        let ctx = RecoveryContext::for_host(Uuid::new_v4(), "compute-1");
        for method in [RecoveryMethod::ReservedHost, RecoveryMethod::AutoPriority, RecoveryMethod::RhPriority] {
            let err = selector().select(method, NotificationType::ComputeHost, &ctx).unwrap_err();
            assert_eq!(
                err,
                SelectionError::UnsupportedRecoveryMethod { method, failure_type: NotificationType::ComputeHost }
            );
            assert!(err.is_unsupported());
        }
    }

    #[test]
    fn test_failure_type_is_checked_first() {
        let ctx = RecoveryContext::for_host(Uuid::new_v4(), "compute-1");
        for failure_type in [NotificationType::Vm, NotificationType::Process] {
            for method in RecoveryMethod::ALL {
                let err = selector().select(method, failure_type, &ctx).unwrap_err();
                assert_eq!(err, SelectionError::UnsupportedFailureType(failure_type));
            }
        }
    }

    #[test]
    fn test_builder_errors_are_wrapped() {
        let mut selector = selector();
        selector.register(NotificationType::ComputeHost, RecoveryMethod::ReservedHost, |_| {
            TaskGraph::builder("broken").build()
        });

        let ctx = RecoveryContext::for_host(Uuid::new_v4(), "compute-1");
        let err = selector.select(RecoveryMethod::ReservedHost, NotificationType::ComputeHost, &ctx).unwrap_err();
        assert_eq!(
            err,
            SelectionError::GraphConstructionFailed {
                notification: ctx.notification,
                source: GraphError::Empty("broken".into()),
            }
        );
        assert!(!err.is_unsupported());
    }

    #[test]
    fn test_registering_extends_the_table() {
        let mut selector = selector();
        assert!(!selector.supports(NotificationType::Vm, RecoveryMethod::Auto));
        selector.register(NotificationType::Vm, RecoveryMethod::Auto, |ctx| {
            host_failure::auto_flow(ctx.notification, &ctx.host_name, Arc::new(Unreachable), RetryPolicy::default())
        });

        let ctx = RecoveryContext::for_host(Uuid::new_v4(), "compute-1");
        assert!(selector.select(RecoveryMethod::Auto, NotificationType::Vm, &ctx).is_ok());
        assert_eq!(
            selector.select(RecoveryMethod::RhPriority, NotificationType::Vm, &ctx).unwrap_err(),
            SelectionError::UnsupportedRecoveryMethod {
                method: RecoveryMethod::RhPriority,
                failure_type: NotificationType::Vm
            }
        );
    }
}
