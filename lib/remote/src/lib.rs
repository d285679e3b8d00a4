//! Coordinator client for workers running in their own process.
//!
//! [`RemoteCoordinator`] speaks the worker coordination surface of the
//! tessera server over HTTP and maps responses onto [`CoordinatorError`]:
//!
//! | Response                      | Error                         |
//! |-------------------------------|-------------------------------|
//! | 404 `unknown_worker`          | `UnknownWorker`               |
//! | 409                           | `LeaseConflict`               |
//! | other 404, 400, 422, 4xx      | `Rejected`                    |
//! | 408, 429, 5xx, no response    | `Transient`                   |

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tessera_core::{QueueItemId, WorkerId};
use tessera_engine::{
    ClaimRequest, Coordinator, CoordinatorError, ErrorBody, HeartbeatResponse, ItemOutcome,
    WorkerRegistration,
};
use tessera_workflow::{QueueItem, Worker};
use tracing::debug;

/// Errors from building a [`RemoteCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The base URL is not an http(s) URL.
    InvalidBaseUrl { url: String },
    /// The HTTP client could not be built.
    ClientBuild { reason: String },
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBaseUrl { url } => write!(f, "invalid coordinator url: {url}"),
            Self::ClientBuild { reason } => write!(f, "could not build http client: {reason}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// A [`Coordinator`] reached over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteCoordinator {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteCoordinator {
    /// Creates a client for the coordinator at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not http(s) or the client cannot be
    /// built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RemoteError::InvalidBaseUrl {
                url: base_url.to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::ClientBuild {
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
    }

    async fn send(
        &self,
        request: RequestBuilder,
        worker_id: &WorkerId,
        item_id: Option<QueueItemId>,
    ) -> Result<Response, CoordinatorError> {
        let response = request.send().await.map_err(|e| {
            debug!(error = %e, "coordinator request failed");
            CoordinatorError::Transient {
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(body) => (Some(body.error.code), body.error.message),
            Err(_) => (None, body),
        };
        Err(classify(status, code.as_deref(), message, worker_id, item_id))
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CoordinatorError> {
    response
        .json()
        .await
        .map_err(|e| CoordinatorError::Rejected {
            message: format!("unexpected response body: {e}"),
        })
}

/// Error code the server uses for workers it does not know.
const UNKNOWN_WORKER: &str = "unknown_worker";

/// Maps an unsuccessful response onto a coordinator error.
///
/// A 404 means an unknown worker only when the body says so; a missing item
/// is rejected like any other request that cannot succeed.
#[must_use]
pub fn classify(
    status: StatusCode,
    code: Option<&str>,
    message: String,
    worker_id: &WorkerId,
    item_id: Option<QueueItemId>,
) -> CoordinatorError {
    match (status, item_id) {
        (StatusCode::NOT_FOUND, _) if code == Some(UNKNOWN_WORKER) => {
            CoordinatorError::UnknownWorker {
                worker_id: worker_id.clone(),
            }
        }
        (StatusCode::CONFLICT, Some(item_id)) => CoordinatorError::LeaseConflict { item_id },
        (StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS, _) => {
            CoordinatorError::Transient { message }
        }
        (status, _) if status.is_server_error() => CoordinatorError::Transient {
            message: format!("HTTP {status}: {message}"),
        },
        (status, _) => CoordinatorError::Rejected {
            message: format!("HTTP {status}: {message}"),
        },
    }
}

#[async_trait]
impl Coordinator for RemoteCoordinator {
    async fn register(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<Worker, CoordinatorError> {
        let request = self.request(Method::POST, "/workers").json(registration);
        decode(self.send(request, &registration.id, None).await?).await
    }

    async fn heartbeat(&self, worker_id: &WorkerId) -> Result<HeartbeatResponse, CoordinatorError> {
        let request = self.request(Method::PUT, &format!("/workers/{worker_id}/heartbeat"));
        decode(self.send(request, worker_id, None).await?).await
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        max_items: u32,
    ) -> Result<Vec<QueueItem>, CoordinatorError> {
        let request = self
            .request(Method::POST, &format!("/workers/{worker_id}/claim-work"))
            .json(&ClaimRequest { max_items });
        decode(self.send(request, worker_id, None).await?).await
    }

    async fn complete(
        &self,
        worker_id: &WorkerId,
        item_id: QueueItemId,
        outcome: ItemOutcome,
    ) -> Result<(), CoordinatorError> {
        let request = self
            .request(
                Method::POST,
                &format!("/workers/{worker_id}/complete-work/{item_id}"),
            )
            .json(&outcome);
        self.send(request, worker_id, Some(item_id)).await?;
        Ok(())
    }

    async fn unregister(&self, worker_id: &WorkerId) -> Result<(), CoordinatorError> {
        let request = self.request(Method::DELETE, &format!("/workers/{worker_id}"));
        self.send(request, worker_id, None).await?;
        Ok(())
    }
}
