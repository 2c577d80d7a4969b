//! Request store interface and the in-memory store.

use crate::broker::{Broker, MemoryBroker};
use crate::error::{TaproomError, TaproomResult};
use crate::protocol::{queue_key, InvocationMessage, QueueKind};
use crate::request::{CommandType, Request, RequestId, LATEST_VERSION};
use crate::status::{RequestStatus, StatusMachine};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info};

/// Status change sent to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

impl StatusUpdate {
    pub fn from_request(request: &Request) -> Self {
        Self {
            status: request.status,
            output: request.output.clone(),
            error: request.error.clone(),
            error_class: request.error_class.clone(),
        }
    }
}

/// Filter for [`RequestStore::list_requests`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(default)]
    pub include_hidden: bool,
}

impl RequestQuery {
    /// Children of `parent`.
    pub fn children_of(parent: impl Into<RequestId>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, request: &Request) -> bool {
        (self.include_hidden || !request.hidden)
            && self
                .parent
                .as_ref()
                .map_or(true, |p| request.parent.as_ref() == Some(p))
            && self.status.map_or(true, |s| request.status == s)
    }
}

/// Server-side request persistence.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new request and return it with its id assigned.
    async fn submit_request(&self, request: &Request) -> TaproomResult<Request>;

    async fn fetch_request(&self, id: &str) -> TaproomResult<Request>;

    /// Persist a status transition. Illegal transitions fail with a
    /// validation-class error.
    async fn update_request_status(&self, id: &str, update: &StatusUpdate)
        -> TaproomResult<Request>;

    async fn list_requests(&self, query: &RequestQuery) -> TaproomResult<Vec<Request>>;
}

/// Resolves the `latest` version token.
#[async_trait]
pub trait VersionResolver: Send + Sync {
    /// Newest registered version of `system` in `namespace`, if any.
    async fn resolve_latest_version(
        &self,
        system: &str,
        namespace: &str,
    ) -> TaproomResult<Option<String>>;
}

/// Order version strings by numeric dot-separated components, falling back
/// to string order for non-numeric parts.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    requests: HashMap<RequestId, Request>,
    order: Vec<RequestId>,
    /// (namespace, system) -> registered versions
    systems: HashMap<(String, String), Vec<String>>,
}

impl MemoryState {
    fn latest(&self, namespace: &str, system: &str) -> Option<String> {
        self.systems
            .get(&(namespace.to_string(), system.to_string()))?
            .iter()
            .max_by(|a, b| compare_versions(a, b))
            .cloned()
    }

    /// Resolve and check the target version. When no systems are registered
    /// at all, every target is accepted.
    fn check_target(&self, request: &mut Request) -> TaproomResult<()> {
        if self.systems.is_empty() {
            return Ok(());
        }
        let key = (request.namespace.clone(), request.system.clone());
        let versions = self.systems.get(&key).ok_or_else(|| {
            TaproomError::Validation(format!(
                "System '{}' is not registered in namespace '{}'",
                request.system, request.namespace
            ))
        })?;
        if request.system_version == LATEST_VERSION {
            if let Some(latest) = self.latest(&request.namespace, &request.system) {
                request.system_version = latest;
            }
            return Ok(());
        }
        if !versions.contains(&request.system_version) {
            return Err(TaproomError::Validation(format!(
                "System '{}' has no version '{}'",
                request.system, request.system_version
            )));
        }
        Ok(())
    }

    fn check_parent(&self, request: &Request) -> TaproomResult<()> {
        let Some(parent_id) = request.parent.as_deref() else {
            return Ok(());
        };
        // Completed children are uploaded after the fact and may outlive
        // their parent's run.
        if request.is_terminal() {
            return Ok(());
        }
        let parent = self
            .requests
            .get(parent_id)
            .ok_or_else(|| TaproomError::Validation(format!("Parent request {parent_id} does not exist")))?;
        if parent.is_terminal() {
            return Err(TaproomError::ParentCompleted {
                parent_id: parent_id.to_string(),
                status: parent.status.to_string(),
            });
        }
        Ok(())
    }
}

/// Request store kept in process memory.
///
/// When built with [`with_router`](Self::with_router), every accepted
/// non-terminal request is also published to its target's queue on the
/// given [`MemoryBroker`], standing in for the server's routing.
#[derive(Default)]
pub struct MemoryRequestStore {
    state: Mutex<MemoryState>,
    router: Option<MemoryBroker>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_router(router: MemoryBroker) -> Self {
        Self {
            state: Mutex::default(),
            router: Some(router),
        }
    }

    /// Register `system` at `version` in `namespace`.
    pub fn register_system(&self, namespace: &str, system: &str, version: &str) {
        let mut state = self.state.lock();
        let versions = state
            .systems
            .entry((namespace.to_string(), system.to_string()))
            .or_default();
        if !versions.iter().any(|v| v == version) {
            versions.push(version.to_string());
        }
    }

    /// Every stored request in submission order.
    pub fn all(&self) -> Vec<Request> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.requests.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn route(&self, request: &Request) -> TaproomResult<()> {
        let Some(router) = &self.router else {
            return Ok(());
        };
        let kind = if request.command_type == CommandType::Admin {
            QueueKind::Admin
        } else {
            QueueKind::Request
        };
        let key = queue_key(&request.target(), kind);
        let payload = InvocationMessage::new(request.clone()).encode()?;
        router.clone().publish(&key, &payload).await?;
        debug!(request_id = %request.id_or_unassigned(), queue = %key, "Routed request");
        Ok(())
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn submit_request(&self, request: &Request) -> TaproomResult<Request> {
        let mut stored = request.clone();
        {
            let mut state = self.state.lock();
            state.check_target(&mut stored)?;
            state.check_parent(&stored)?;

            let id = stored.ensure_id().to_string();
            if state.requests.contains_key(&id) {
                return Err(TaproomError::Validation(format!(
                    "Request {id} already exists"
                )));
            }
            let now = Utc::now();
            stored.created_at.get_or_insert(now);
            stored.updated_at = Some(stored.updated_at.map_or(now, |t| t.max(now)));

            state.order.push(id.clone());
            state.requests.insert(id, stored.clone());
        }

        info!(
            request_id = %stored.id_or_unassigned(),
            command = %stored.command,
            status = %stored.status,
            "Stored request"
        );

        if !stored.is_terminal() {
            if let Err(e) = self.route(&stored).await {
                if let Some(id) = &stored.id {
                    let mut state = self.state.lock();
                    state.requests.remove(id);
                    state.order.retain(|o| o != id);
                }
                return Err(e);
            }
        }
        Ok(stored)
    }

    async fn fetch_request(&self, id: &str) -> TaproomResult<Request> {
        self.state
            .lock()
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| TaproomError::NotFound(format!("request {id}")))
    }

    async fn update_request_status(
        &self,
        id: &str,
        update: &StatusUpdate,
    ) -> TaproomResult<Request> {
        let mut state = self.state.lock();
        let request = state
            .requests
            .get_mut(id)
            .ok_or_else(|| TaproomError::NotFound(format!("request {id}")))?;

        StatusMachine::validate(request.status, update.status)?;

        if update.output.is_some() {
            request.output = update.output.clone();
        }
        if update.error.is_some() {
            request.error = update.error.clone();
            request.error_class = update.error_class.clone();
        }
        request.set_status(update.status);
        Ok(request.clone())
    }

    async fn list_requests(&self, query: &RequestQuery) -> TaproomResult<Vec<Request>> {
        let state = self.state.lock();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.requests.get(id))
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VersionResolver for MemoryRequestStore {
    async fn resolve_latest_version(
        &self,
        system: &str,
        namespace: &str,
    ) -> TaproomResult<Option<String>> {
        Ok(self.state.lock().latest(namespace, system))
    }
}
