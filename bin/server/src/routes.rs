//! HTTP surface of the server.
//!
//! Worker coordination:
//!
//! | Method | Path                                  | Success          |
//! |--------|---------------------------------------|------------------|
//! | POST   | `/workers`                            | 201 Worker       |
//! | PUT    | `/workers/{id}/heartbeat`             | 200 `{cancelled}`|
//! | POST   | `/workers/{id}/claim-work`            | 200 `[QueueItem]`|
//! | POST   | `/workers/{id}/complete-work/{item}`  | 200              |
//! | DELETE | `/workers/{id}`                       | 204              |
//!
//! Runs and triggers: `POST /runs`, `GET /runs/{id}`, `POST /runs/{id}/cancel`,
//! `POST /triggers/{id}/fire`, `POST /triggers/reload`, plus `GET /health`.

use crate::error::ApiError;
use crate::state::AppState;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::fmt;
use std::str::FromStr;
use tessera_core::{QueueItemId, RunId, TriggerId, WorkerId, WorkflowId};
use tessera_engine::{
    ClaimRequest, CompleteWorkRequest, CreateRun, HeartbeatResponse, RunDetails, Store,
    WorkerRegistration,
};
use tessera_scheduler::TriggerSource;
use tessera_workflow::{NodeId, QueueItem, Run, Worker};
use tower_http::trace::TraceLayer;

/// Body of `POST /runs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub entry_node: Option<NodeId>,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

impl From<CreateRunRequest> for CreateRun {
    fn from(request: CreateRunRequest) -> Self {
        let mut create = CreateRun::new(request.workflow_id)
            .with_payload(request.payload)
            .with_variables(request.variables);
        if let Some(node_id) = request.entry_node {
            create = create.at_node(node_id);
        }
        if let Some(key) = request.dedupe_key {
            create = create.with_dedupe_key(key);
        }
        create
    }
}

/// Response of `POST /triggers/{id}/fire`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FireResponse {
    pub run_id: RunId,
}

/// Builds the router.
pub fn router<S: Store, T: TriggerSource>(state: AppState<S, T>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workers", post(register_worker::<S, T>))
        .route("/workers/{id}", delete(unregister_worker::<S, T>))
        .route("/workers/{id}/heartbeat", put(heartbeat::<S, T>))
        .route("/workers/{id}/claim-work", post(claim_work::<S, T>))
        .route(
            "/workers/{id}/complete-work/{item_id}",
            post(complete_work::<S, T>),
        )
        .route("/runs", post(create_run::<S, T>))
        .route("/runs/{id}", get(get_run::<S, T>))
        .route("/runs/{id}/cancel", post(cancel_run::<S, T>))
        .route("/triggers/reload", post(reload_triggers::<S, T>))
        .route("/triggers/{id}/fire", post(fire_trigger::<S, T>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse<I>(raw: &str) -> Result<I, ApiError>
where
    I: FromStr,
    I::Err: fmt::Display,
{
    raw.parse()
        .map_err(|e: I::Err| ApiError::bad_request(e.to_string()))
}

async fn health() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

async fn register_worker<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    body: Result<Json<WorkerRegistration>, JsonRejection>,
) -> Result<(StatusCode, Json<Worker>), ApiError> {
    let Json(registration) = body?;
    let worker = state.queue.register(&registration).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn unregister_worker<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let worker_id: WorkerId = parse(&id)?;
    state.queue.unregister(&worker_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    Path(id): Path<String>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let worker_id: WorkerId = parse(&id)?;
    Ok(Json(state.queue.heartbeat(&worker_id).await?))
}

async fn claim_work<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    Path(id): Path<String>,
    body: Result<Json<ClaimRequest>, JsonRejection>,
) -> Result<Json<Vec<QueueItem>>, ApiError> {
    let worker_id: WorkerId = parse(&id)?;
    let Json(request) = body?;
    Ok(Json(state.queue.claim(&worker_id, request.max_items).await?))
}

async fn complete_work<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    Path((id, item_id)): Path<(String, String)>,
    body: Result<Json<CompleteWorkRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let worker_id: WorkerId = parse(&id)?;
    let item_id: QueueItemId = parse(&item_id)?;
    let Json(outcome) = body?;
    state.queue.complete(&worker_id, item_id, outcome).await?;
    Ok(StatusCode::OK)
}

async fn create_run<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    body: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let Json(request) = body?;
    let run = state.engine().create_run(request.into()).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    Path(id): Path<String>,
) -> Result<Json<RunDetails>, ApiError> {
    let run_id: RunId = parse(&id)?;
    Ok(Json(state.engine().run_details(run_id).await?))
}

async fn cancel_run<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    let run_id: RunId = parse(&id)?;
    Ok(Json(state.engine().cancel_run(run_id).await?))
}

async fn fire_trigger<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<FireResponse>), ApiError> {
    let trigger_id: TriggerId = parse(&id)?;
    let payload = if body.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?
    };
    let run_id = state.scheduler.fire(trigger_id, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(FireResponse { run_id })))
}

async fn reload_triggers<S: Store, T: TriggerSource>(
    State(state): State<AppState<S, T>>,
) -> StatusCode {
    state.scheduler.reload();
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::EngineLauncher;
    use axum::body::Body;
    use axum::http::{Method, Request, header};
    use std::sync::Arc;
    use std::time::Duration;
    use tessera_engine::{
        Engine, EngineConfig, ItemOutcome, MemoryStore, QueueConfig, WorkQueue, WorkerConfig,
        WorkerLoop,
    };
    use tessera_remote::RemoteCoordinator;
    use tessera_scheduler::{StaticTriggerSource, TriggerScheduler};
    use tessera_workflow::{
        Edge, NodeRegistry, Platform, RunStatus, Trigger, TriggerConfig, Workflow, WorkflowNode,
    };
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Harness {
        state: AppState<MemoryStore, StaticTriggerSource>,
        triggers: Arc<StaticTriggerSource>,
        workflow_id: WorkflowId,
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let workflow = Workflow::new("linear")
                .node(WorkflowNode::new("a", "passthrough"))
                .node(WorkflowNode::new("b", "passthrough"))
                .node(WorkflowNode::new("c", "passthrough"))
                .edge(Edge::new("a", "b"))
                .edge(Edge::new("b", "c"));
            let workflow_id = workflow.id;
            store.put_workflow(workflow).await;

            let engine = Engine::new(
                store,
                Arc::new(NodeRegistry::with_builtins()),
                EngineConfig::default(),
            );
            let triggers = Arc::new(StaticTriggerSource::default());
            let scheduler = Arc::new(TriggerScheduler::new(
                triggers.clone(),
                Arc::new(EngineLauncher::new(engine.clone())),
            ));
            let queue = Arc::new(WorkQueue::new(engine, QueueConfig::default()));
            Self {
                state: AppState::new(queue, scheduler),
                triggers,
                workflow_id,
            }
        }

        async fn send(
            &self,
            method: Method,
            uri: &str,
            body: Option<JsonValue>,
        ) -> (StatusCode, JsonValue) {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json");
            let request = match body {
                Some(body) => request.body(Body::from(body.to_string())),
                None => request.body(Body::empty()),
            }
            .expect("request");

            let response = router(self.state.clone())
                .oneshot(request)
                .await
                .expect("response");
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body");
            let json = if bytes.is_empty() {
                JsonValue::Null
            } else {
                serde_json::from_slice(&bytes).expect("json body")
            };
            (status, json)
        }

        async fn register(&self, id: &str) {
            let (status, _) = self
                .send(
                    Method::POST,
                    "/workers",
                    Some(json!({"id": id, "name": id, "concurrency": 4})),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        async fn start_run(&self) -> RunId {
            let (status, body) = self
                .send(
                    Method::POST,
                    "/runs",
                    Some(json!({"workflowId": self.workflow_id, "payload": {"x": 1}})),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            serde_json::from_value(body["id"].clone()).expect("run id")
        }
    }

    #[tokio::test]
    async fn health_is_ok() {
        let harness = Harness::new().await;
        let (status, body) = harness.send(Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn worker_protocol_over_http() {
        let harness = Harness::new().await;
        harness.register("w1").await;
        harness.start_run().await;

        let (status, body) = harness
            .send(
                Method::POST,
                "/workers/w1/claim-work",
                Some(json!({"maxItems": 10})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let items: Vec<QueueItem> = serde_json::from_value(body).expect("items");
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.node_id, NodeId::from("a"));

        let outcome = ItemOutcome::Result(item.payload.derive(&item.node_id));
        let uri = format!("/workers/w1/complete-work/{}", item.id);
        let body = serde_json::to_value(&outcome).expect("outcome");
        let (status, _) = harness
            .send(Method::POST, &uri, Some(body.clone()))
            .await;
        assert_eq!(status, StatusCode::OK);

        // a second report of the same attempt is stale
        let (status, body) = harness.send(Method::POST, &uri, Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "lease_conflict");

        let (status, body) = harness
            .send(Method::PUT, "/workers/w1/heartbeat", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"cancelled": []}));

        let (status, _) = harness.send(Method::DELETE, "/workers/w1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = harness
            .send(Method::PUT, "/workers/w1/heartbeat", None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "unknown_worker");
    }

    #[tokio::test]
    async fn unknown_worker_cannot_claim() {
        let harness = Harness::new().await;
        let (status, body) = harness
            .send(
                Method::POST,
                "/workers/ghost/claim-work",
                Some(json!({"maxItems": 1})),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "unknown_worker");
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let harness = Harness::new().await;

        let (status, body) = harness
            .send(
                Method::POST,
                "/workers",
                Some(json!({"id": "w1", "name": "w1", "concurrency": 0})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");

        let (status, body) = harness
            .send(Method::POST, "/workers", Some(json!({"name": "no id"})))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "invalid_body");

        let (status, _) = harness
            .send(Method::PUT, "/workers/bad!id/heartbeat", None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = harness.send(Method::GET, "/runs/not-a-run", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn runs_are_created_read_and_cancelled() {
        let harness = Harness::new().await;
        let run_id = harness.start_run().await;
        let uri = format!("/runs/{run_id}");

        let (status, body) = harness.send(Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["steps"], json!([]));

        let cancel = format!("/runs/{run_id}/cancel");
        let (status, body) = harness.send(Method::POST, &cancel, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, body) = harness.send(Method::POST, &cancel, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "run_terminal");

        let missing = format!("/runs/{}", RunId::new());
        let (status, _) = harness.send(Method::GET, &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_runs_are_rejected_before_enqueue() {
        let harness = Harness::new().await;

        let (status, _) = harness
            .send(
                Method::POST,
                "/runs",
                Some(json!({"workflowId": WorkflowId::new()})),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = harness
            .send(
                Method::POST,
                "/runs",
                Some(json!({"workflowId": harness.workflow_id, "entryNode": "zzz"})),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "validation");
    }

    #[tokio::test]
    async fn triggers_fire_through_the_scheduler() {
        let harness = Harness::new().await;
        let manual = Trigger::new(harness.workflow_id, TriggerConfig::Manual);
        let disabled = Trigger::new(harness.workflow_id, TriggerConfig::Manual).disabled();
        harness.triggers.put(manual.clone()).await;
        harness.triggers.put(disabled.clone()).await;

        let (status, body) = harness
            .send(
                Method::POST,
                &format!("/triggers/{}/fire", manual.id),
                Some(json!({"n": 1})),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let fired: FireResponse = serde_json::from_value(body).expect("fire response");
        let run = harness
            .state
            .engine()
            .run_details(fired.run_id)
            .await
            .expect("run");
        assert_eq!(run.run.trigger_id, Some(manual.id));
        assert_eq!(run.run.context.payload, json!({"n": 1}));

        let (status, _) = harness
            .send(Method::POST, &format!("/triggers/{}/fire", manual.id), None)
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = harness
            .send(Method::POST, &format!("/triggers/{}/fire", disabled.id), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "trigger_disabled");

        let (status, _) = harness
            .send(
                Method::POST,
                &format!("/triggers/{}/fire", TriggerId::new()),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = harness.send(Method::POST, "/triggers/reload", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn remote_worker_completes_a_run() {
        let harness = Harness::new().await;
        let run_id = harness.start_run().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(harness.state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let coordinator = RemoteCoordinator::new(&format!("http://{addr}"), Duration::from_secs(5))
            .expect("client");
        let worker = WorkerLoop::new(
            Arc::new(coordinator),
            Arc::new(NodeRegistry::with_builtins()),
            Platform::new(),
            WorkerRegistration {
                id: WorkerId::new("remote-1").expect("valid id"),
                name: "remote".to_string(),
                concurrency: 2,
            },
            WorkerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(20),
                heartbeat_interval: Duration::from_millis(100),
                ..WorkerConfig::default()
            },
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let mut details = harness.state.engine().run_details(run_id).await.expect("run");
        for _ in 0..250 {
            if details.run.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            details = harness.state.engine().run_details(run_id).await.expect("run");
        }

        assert_eq!(details.run.status, RunStatus::Completed);
        let last = details.steps.last().expect("steps");
        let trace: Vec<_> = last
            .output
            .as_ref()
            .expect("output")
            .trace
            .as_slice()
            .iter()
            .map(NodeId::as_str)
            .collect();
        assert_eq!(trace, ["a", "b", "c"]);

        shutdown.cancel();
        handle.await.expect("join").expect("worker");
        assert!(
            harness
                .state
                .engine()
                .store()
                .get_worker(&WorkerId::new("remote-1").expect("valid id"))
                .await
                .expect("read")
                .is_none()
        );
    }
}
