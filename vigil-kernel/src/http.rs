/**
 * OPERATOR API - HTTP surface of the recovery kernel
 *
 * ROUTES:
 * - GET  /health                      liveness, no key required
 * - GET  /system/health               kernel health snapshot
 * - GET  /segments                    failover segments (filters, sort, limit, marker)
 * - GET  /segments/{id}               one failover segment
 * - GET  /segments/{id}/hosts         hosts of a segment (filters, sort, limit, marker)
 * - GET  /segments/{id}/hosts/{host}  one host of a segment
 * - GET  /notifications[?status=]     notifications, oldest first
 * - GET  /notifications/{id}          one notification with its task outcomes
 * - POST /notifications               ingest a failure notification and dispatch it
 * - POST /notifications/{id}/retry    restart a failed or errored recovery
 *
 * SECURITY:
 * Every route except /health requires the `x-api-key` header to match `VIGIL_API_KEY`.
 * With no key configured, the API refuses everything.
 */

use crate::dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{FailoverSegment, Host, Notification, NotificationIn, NotificationStatus};
use crate::notifications::StoreError;
use crate::topology::{query_hosts, query_segments, HostPage, SegmentPage, TopologyError};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub const API_KEY_ENV: &str = "VIGIL_API_KEY";

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("{} not set, API access denied", API_KEY_ENV);
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub health_tracker: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/segments", get(list_segments))
        .route("/segments/{id}", get(get_segment))
        .route("/segments/{id}/hosts", get(list_segment_hosts))
        .route("/segments/{id}/hosts/{host_id}", get(get_segment_host))
        .route("/notifications", get(list_notifications).post(create_notification))
        .route("/notifications/{id}", get(get_notification))
        .route("/notifications/{id}/retry", post(retry_notification))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

fn topology_error(e: TopologyError) -> (StatusCode, String) {
    let code = match e {
        TopologyError::InvalidInput(_) | TopologyError::MarkerNotFound(_) => StatusCode::BAD_REQUEST,
        TopologyError::SegmentNotFound(_) | TopologyError::HostNotFound(_) => StatusCode::NOT_FOUND,
        TopologyError::SegmentExists(_) | TopologyError::HostExists { .. } => StatusCode::CONFLICT,
    };
    (code, e.to_string())
}

fn dispatch_error(e: DispatchError) -> (StatusCode, String) {
    let code = match &e {
        DispatchError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        DispatchError::Store(StoreError::AlreadyExists(_) | StoreError::Conflict { .. })
        | DispatchError::NotRetryable { .. } => StatusCode::CONFLICT,
        DispatchError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string())
}

fn parse_uuid(raw: &str) -> Result<Uuid, (StatusCode, String)> {
    Uuid::parse_str(raw).map_err(|_| (StatusCode::BAD_REQUEST, format!("'{raw}' is not a valid uuid")))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.dispatcher).await)
}

// GET /segments
async fn list_segments(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<SegmentPage> {
    query_segments(app.dispatcher.topology().as_ref(), &params).map(Json).map_err(topology_error)
}

// GET /segments/{id}
async fn get_segment(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<FailoverSegment> {
    let uuid = parse_uuid(&id)?;
    app.dispatcher.topology().get_segment(uuid).map(Json).map_err(topology_error)
}

// GET /segments/{id}/hosts
async fn list_segment_hosts(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<HostPage> {
    let uuid = parse_uuid(&id)?;
    query_hosts(app.dispatcher.topology().as_ref(), uuid, &params).map(Json).map_err(topology_error)
}

// GET /segments/{id}/hosts/{host_id}
async fn get_segment_host(
    State(app): State<AppState>,
    Path((id, host_id)): Path<(String, String)>,
) -> ApiResult<Host> {
    let segment = parse_uuid(&id)?;
    let host = parse_uuid(&host_id)?;
    app.dispatcher.topology().get_host(segment, host).map(Json).map_err(topology_error)
}

#[derive(Debug, Deserialize)]
struct NotificationFilter {
    status: Option<String>,
}

// GET /notifications
async fn list_notifications(
    State(app): State<AppState>,
    Query(filter): Query<NotificationFilter>,
) -> ApiResult<Vec<Notification>> {
    let status = filter
        .status
        .as_deref()
        .map(str::parse::<NotificationStatus>)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(app.dispatcher.notifications().list(status).await))
}

// GET /notifications/{id}
async fn get_notification(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Notification> {
    let uuid = parse_uuid(&id)?;
    app.dispatcher
        .notifications()
        .get(uuid)
        .await
        .map(Json)
        .map_err(|e| dispatch_error(e.into()))
}

// POST /notifications
async fn create_notification(
    State(app): State<AppState>,
    Json(incoming): Json<NotificationIn>,
) -> Result<(StatusCode, Json<Notification>), (StatusCode, String)> {
    let (notification, _dispatch) = app.dispatcher.submit(incoming).await.map_err(dispatch_error)?;
    Ok((StatusCode::ACCEPTED, Json(notification)))
}

// POST /notifications/{id}/retry
async fn retry_notification(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Notification> {
    let uuid = parse_uuid(&id)?;
    let outcome = app.dispatcher.retry(uuid).await.map_err(dispatch_error)?;
    if let DispatchOutcome::Unchanged { status } = outcome {
        return Err((StatusCode::CONFLICT, format!("notification {uuid} is {status}")));
    }
    app.dispatcher
        .notifications()
        .get(uuid)
        .await
        .map(Json)
        .map_err(|e| dispatch_error(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeClient, ComputeError};
    use crate::coordinator::LockCoordinator;
    use crate::engine::{RetryPolicy, WorkflowEngine};
    use crate::events::TracingEventSink;
    use crate::models::{Instance, RecoveryMethod};
    use crate::notifications::NotificationStore;
    use crate::selector::WorkflowSelector;
    use crate::topology::MemoryTopologyStore;
    use async_trait::async_trait;

    struct Accepting;

    #[async_trait]
    impl ComputeClient for Accepting {
        async fn disable_service(&self, _: &str, _: &str) -> Result<(), ComputeError> {
            Ok(())
        }
        async fn list_instances(&self, _: &str) -> Result<Vec<Instance>, ComputeError> {
            Ok(vec![])
        }
        async fn evacuate_instance(&self, _: &str, _: Option<&str>) -> Result<(), ComputeError> {
            Ok(())
        }
    }

    fn app() -> (AppState, Uuid) {
        let topology = MemoryTopologyStore::new();
        let segment = FailoverSegment {
            uuid: Uuid::new_v4(),
            name: "rack-a".into(),
            service_type: "compute".into(),
            recovery_method: RecoveryMethod::Auto,
            description: None,
        };
        let segment_id = segment.uuid;
        topology.insert_segment(segment).unwrap();
        topology
            .insert_host(Host {
                uuid: Uuid::new_v4(),
                name: "compute-1".into(),
                failover_segment_id: segment_id,
                host_type: "COMPUTE".into(),
                control_attributes: "SSH".into(),
                reserved: false,
                on_maintenance: false,
            })
            .unwrap();

        let dispatcher = Dispatcher::new(
            Arc::new(NotificationStore::in_memory()),
            Arc::new(topology),
            Arc::new(WorkflowSelector::new(Arc::new(Accepting), RetryPolicy::default())),
            WorkflowEngine::new(Arc::new(TracingEventSink)),
            LockCoordinator::new(),
            4,
        );
        (AppState { dispatcher: Arc::new(dispatcher), health_tracker: HealthTracker::new() }, segment_id)
    }

    fn params(pairs: &[(&str, &str)]) -> Query<HashMap<String, String>> {
        Query(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[tokio::test]
    async fn test_host_listing_status_codes() {
        let (app, segment_id) = app();

        let page = list_segment_hosts(State(app.clone()), Path(segment_id.to_string()), params(&[]))
            .await
            .unwrap();
        assert_eq!(page.hosts.len(), 1);

        let (code, _) = list_segment_hosts(State(app.clone()), Path(segment_id.to_string()), params(&[("limit", "-1")]))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = list_segment_hosts(
            State(app.clone()),
            Path(segment_id.to_string()),
            params(&[("marker", "9b1de8c0-0000-4000-8000-000000000000")]),
        )
        .await
        .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = list_segment_hosts(State(app), Path(Uuid::new_v4().to_string()), params(&[]))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_segment_listing_status_codes() {
        let (app, segment_id) = app();

        let Json(page) = list_segments(State(app.clone()), params(&[])).await.unwrap();
        assert_eq!(page.segments.len(), 1);
        assert_eq!(page.segments[0].uuid, segment_id);
        assert!(page.next_marker.is_none());

        let Json(page) = list_segments(State(app.clone()), params(&[("recovery_method", "reserved_host")]))
            .await
            .unwrap();
        assert!(page.segments.is_empty());

        for bad in [
            params(&[("limit", "-1")]),
            params(&[("sort_dir", "abcd")]),
            params(&[("recovery_method", "rsvd")]),
            params(&[("marker", "9b1de8c0-0000-4000-8000-000000000000")]),
        ] {
            let (code, _) = list_segments(State(app.clone()), bad).await.unwrap_err();
            assert_eq!(code, StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_host_show_status_codes() {
        let (app, segment_id) = app();
        let host_id = app.dispatcher.topology().hosts_named("compute-1")[0].uuid;

        let Json(host) =
            get_segment_host(State(app.clone()), Path((segment_id.to_string(), host_id.to_string()))).await.unwrap();
        assert_eq!(host.name, "compute-1");

        let (code, _) = get_segment_host(State(app.clone()), Path((segment_id.to_string(), Uuid::new_v4().to_string())))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _) = get_segment_host(State(app.clone()), Path((Uuid::new_v4().to_string(), host_id.to_string())))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _) = get_segment_host(State(app), Path((segment_id.to_string(), "compute-1".to_string())))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_notification_ingest_and_retry_conflict() {
        let (app, _) = app();
        let incoming: NotificationIn = serde_json::from_value(serde_json::json!({
            "hostname": "compute-1",
            "type": "COMPUTE_HOST",
            "payload": {"event": "STOPPED"}
        }))
        .unwrap();

        let (code, Json(created)) = create_notification(State(app.clone()), Json(incoming)).await.unwrap();
        assert_eq!(code, StatusCode::ACCEPTED);

        // wait for the background dispatch to settle
        let store = app.dispatcher.notifications().clone();
        let mut status = NotificationStatus::New;
        for _ in 0..100 {
            status = store.get(created.uuid).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, NotificationStatus::Finished);

        let (code, _) = retry_notification(State(app.clone()), Path(created.uuid.to_string())).await.unwrap_err();
        assert_eq!(code, StatusCode::CONFLICT);

        let (code, _) = get_notification(State(app), Path(Uuid::new_v4().to_string())).await.unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
