//! RPC client for invoking commands on a target system.
//!
//! ```rust,ignore
//! let client = RpcClient::new(RpcClientConfig::new("echo"), store.clone(), store)?;
//! let done = client.invoke("say", params, InvokeOptions::default()).await?;
//! ```

use crate::backoff::BackoffPolicy;
use crate::context::{self, CurrentInvocation};
use crate::error::{TaproomError, TaproomResult};
use crate::request::{Parameters, Request, RequestId, Target, LATEST_VERSION};
use crate::status::RequestStatus;
use crate::store::{RequestQuery, RequestStore, VersionResolver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Client-wide settings.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub system: String,
    /// Concrete version or `latest`.
    pub version: String,
    pub instance: String,
    /// Namespaces rotated through for calls without a parent.
    pub namespaces: Vec<String>,
    /// Retries for submission.
    pub retry: BackoffPolicy,
    /// Spacing between status polls. `max_attempts` caps consecutive
    /// failed fetches.
    pub poll: BackoffPolicy,
    /// Default ceiling on blocking calls.
    pub timeout: Option<Duration>,
    pub blocking: bool,
    pub raise_on_error: bool,
}

impl RpcClientConfig {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            version: LATEST_VERSION.to_string(),
            instance: "default".to_string(),
            namespaces: vec!["default".to_string()],
            retry: BackoffPolicy::default(),
            poll: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 5),
            timeout: None,
            blocking: true,
            raise_on_error: false,
        }
    }

    pub fn validate(&self) -> TaproomResult<()> {
        if self.system.trim().is_empty() {
            return Err(TaproomError::Config("system must not be empty".into()));
        }
        if self.namespaces.is_empty() {
            return Err(TaproomError::Config(
                "at least one namespace is required".into(),
            ));
        }
        self.retry.validate()?;
        self.poll.validate()
    }
}

/// Per-call options. Unset fields fall back to the client configuration.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Explicit parent. Without it the current invocation (if any) is used.
    pub parent: Option<Request>,
    /// Do not default the parent from the current invocation. Calls back
    /// into the current worker still run inline.
    pub detached: bool,
    /// Context to use instead of the task-bound one, for work that runs on
    /// a task the dispatcher did not start.
    pub context: Option<Arc<CurrentInvocation>>,
    pub blocking: Option<bool>,
    pub timeout: Option<Duration>,
    /// Pin the call to this namespace.
    pub namespace: Option<String>,
    pub instance: Option<String>,
    pub comment: Option<String>,
    pub hidden: bool,
    pub raise_on_error: Option<bool>,
}

impl InvokeOptions {
    pub fn with_parent(mut self, parent: Request) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_context(mut self, context: Arc<CurrentInvocation>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = Some(blocking);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn pin_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn raise_on_error(mut self, raise: bool) -> Self {
        self.raise_on_error = Some(raise);
        self
    }
}

struct ParentLink {
    id: RequestId,
    namespace: String,
}

/// Invokes commands on one target system.
pub struct RpcClient {
    config: RpcClientConfig,
    store: Arc<dyn RequestStore>,
    resolver: Arc<dyn VersionResolver>,
    next_namespace: AtomicUsize,
}

impl RpcClient {
    pub fn new(
        config: RpcClientConfig,
        store: Arc<dyn RequestStore>,
        resolver: Arc<dyn VersionResolver>,
    ) -> TaproomResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            resolver,
            next_namespace: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }

    /// Invoke `command` with `parameters`.
    ///
    /// Blocking calls return the request in a terminal status; non-blocking
    /// calls return it as submitted. A call addressed to the worker running
    /// the current invocation is executed inline.
    pub async fn invoke(
        &self,
        command: &str,
        parameters: Parameters,
        options: InvokeOptions,
    ) -> TaproomResult<Request> {
        let context = options.context.clone().or_else(context::current);
        let defaults_from = if options.detached {
            None
        } else {
            context.as_deref()
        };
        let parent = self.resolve_parent(&options, defaults_from).await?;

        let namespace = match (&options.namespace, &parent) {
            (Some(pinned), _) => pinned.clone(),
            (None, Some(parent)) => parent.namespace.clone(),
            (None, None) => self.next_namespace(),
        };
        let instance = options
            .instance
            .clone()
            .unwrap_or_else(|| self.config.instance.clone());
        let target = Target::new(&self.config.system, &self.config.version, namespace, instance);

        let mut request = Request::new(&target, command, parameters);
        request.parent = parent.map(|p| p.id);
        request.comment = options.comment.clone();
        request.hidden = options.hidden;

        let raise = options.raise_on_error.unwrap_or(self.config.raise_on_error);

        if let Some(context) = &context {
            if let Some(version) = self.self_reference_version(context, &target).await {
                request.system_version = version;
                let finished = self.run_self_reference(context, request).await?;
                return Self::finish(finished, raise);
            }
        }

        let submitted = self.submit(request).await?;
        let blocking = options.blocking.unwrap_or(self.config.blocking);
        if !blocking {
            return Ok(submitted);
        }

        let id = submitted.id.clone().ok_or_else(|| {
            TaproomError::Validation("store returned a request without an id".into())
        })?;
        let finished = self
            .wait_for(&id, options.timeout.or(self.config.timeout))
            .await?;
        Self::finish(finished, raise)
    }

    /// Poll until request `id` is terminal, giving up after `timeout`.
    ///
    /// Giving up does not cancel the remote request.
    pub async fn wait_for(&self, id: &str, timeout: Option<Duration>) -> TaproomResult<Request> {
        match timeout {
            None => self.poll_until_done(id).await,
            Some(limit) => tokio::time::timeout(limit, self.poll_until_done(id))
                .await
                .map_err(|_| TaproomError::Timeout {
                    request_id: id.to_string(),
                    waited: limit,
                })?,
        }
    }

    /// Requests whose parent is `parent_id`, hidden ones included.
    pub async fn children(&self, parent_id: &str) -> TaproomResult<Vec<Request>> {
        self.store
            .list_requests(&RequestQuery {
                include_hidden: true,
                ..RequestQuery::children_of(parent_id)
            })
            .await
    }

    /// An explicit parent is checked against its stored status, falling
    /// back to the caller's copy when the store cannot produce it. The
    /// current invocation is checked through its live status.
    async fn resolve_parent(
        &self,
        options: &InvokeOptions,
        context: Option<&CurrentInvocation>,
    ) -> TaproomResult<Option<ParentLink>> {
        let (id, namespace, status) = match (&options.parent, context) {
            (Some(parent), _) => {
                let id = parent.id.clone().ok_or_else(|| {
                    TaproomError::Validation("parent request has no id".into())
                })?;
                let status = match self.store.fetch_request(&id).await {
                    Ok(stored) => stored.status,
                    Err(e) => {
                        debug!(parent_id = %id, error = %e, "Checking parent against the given copy");
                        parent.status
                    }
                };
                (id, parent.namespace.clone(), status)
            }
            (None, Some(current)) => match current.request_id() {
                Some(id) => (
                    id.to_string(),
                    current.request().namespace.clone(),
                    current.status(),
                ),
                None => return Ok(None),
            },
            (None, None) => return Ok(None),
        };

        if status.is_terminal() {
            return Err(TaproomError::ParentCompleted {
                parent_id: id,
                status: status.to_string(),
            });
        }
        Ok(Some(ParentLink { id, namespace }))
    }

    fn next_namespace(&self) -> String {
        let index = self.next_namespace.fetch_add(1, Ordering::Relaxed);
        self.config.namespaces[index % self.config.namespaces.len()].clone()
    }

    /// Concrete version to run at if `target` is the worker behind
    /// `context`.
    async fn self_reference_version(
        &self,
        context: &CurrentInvocation,
        target: &Target,
    ) -> Option<String> {
        let identity = context.identity();
        if !identity.matches_ignoring_version(target) {
            return None;
        }
        let mut resolved = target.clone();
        if resolved.version == LATEST_VERSION {
            match self
                .resolver
                .resolve_latest_version(&target.system, &target.namespace)
                .await
            {
                Ok(Some(version)) => resolved.version = version,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "Could not resolve latest version for self-reference check");
                    return None;
                }
            }
        }
        identity.matches(&resolved).then_some(resolved.version)
    }

    async fn run_self_reference(
        &self,
        context: &CurrentInvocation,
        mut request: Request,
    ) -> TaproomResult<Request> {
        let id = request.ensure_id().to_string();
        debug!(request_id = %id, command = %request.command, "Executing self-reference inline");

        let finished = context.dispatcher().run_inline(request).await?;

        let store = self.store.clone();
        let policy = self.config.retry;
        let upload = finished.clone();
        tokio::spawn(async move {
            if let Err(e) = policy
                .retry("upload inline request", || store.submit_request(&upload))
                .await
            {
                error!(request_id = %id, error = %e, "Failed to upload inline request");
            }
        });
        Ok(finished)
    }

    async fn submit(&self, mut request: Request) -> TaproomResult<Request> {
        let mut resolved = false;
        if request.system_version == LATEST_VERSION {
            match self
                .resolver
                .resolve_latest_version(&request.system, &request.namespace)
                .await
            {
                Ok(Some(version)) => {
                    request.system_version = version;
                    resolved = true;
                }
                Ok(None) => {
                    debug!(system = %request.system, "No concrete latest version, submitting as latest")
                }
                Err(e) => warn!(error = %e, "Latest version lookup failed, submitting as latest"),
            }
        }

        match self.submit_with_retry(&request).await {
            Err(e) if resolved && e.is_validation() => {
                warn!(
                    version = %request.system_version,
                    error = %e,
                    "Resolved version rejected, retrying with latest"
                );
                request.system_version = LATEST_VERSION.to_string();
                self.submit_with_retry(&request).await
            }
            other => other,
        }
    }

    async fn submit_with_retry(&self, request: &Request) -> TaproomResult<Request> {
        let submitted = self
            .config
            .retry
            .retry("submit request", || self.store.submit_request(request))
            .await?;
        info!(
            request_id = %submitted.id_or_unassigned(),
            command = %submitted.command,
            target = %submitted,
            "Submitted request"
        );
        Ok(submitted)
    }

    async fn poll_until_done(&self, id: &str) -> TaproomResult<Request> {
        let poll = self.config.poll;
        let mut step = 0u32;
        let mut failures = 0u32;
        loop {
            match self.store.fetch_request(id).await {
                Ok(request) if request.is_terminal() => return Ok(request),
                Ok(_) => failures = 0,
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= poll.max_attempts {
                        error!(request_id = %id, attempts = failures, error = %e, "Giving up polling");
                        return Err(TaproomError::RetriesExhausted {
                            operation: "fetch request".into(),
                            attempts: failures,
                            last: Box::new(e),
                        });
                    }
                    warn!(request_id = %id, attempt = failures, error = %e, "Fetching request failed");
                }
                Err(e) => return Err(e),
            }
            step = step.saturating_add(1);
            tokio::time::sleep(poll.delay_for(step)).await;
        }
    }

    fn finish(request: Request, raise: bool) -> TaproomResult<Request> {
        if raise && request.status == RequestStatus::Error {
            return Err(TaproomError::RequestFailed {
                request_id: request.id_or_unassigned().to_string(),
                message: request.error.clone().unwrap_or_default(),
            });
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRequestStore, StatusUpdate};

    fn client(namespaces: &[&str]) -> (RpcClient, Arc<MemoryRequestStore>) {
        let store = Arc::new(MemoryRequestStore::new());
        let mut config = RpcClientConfig::new("echo");
        config.namespaces = namespaces.iter().map(|n| n.to_string()).collect();
        config.blocking = false;
        let client = RpcClient::new(config, store.clone(), store.clone()).unwrap();
        (client, store)
    }

    #[test]
    fn test_config_validation() {
        let mut config = RpcClientConfig::new("echo");
        assert!(config.validate().is_ok());
        config.namespaces.clear();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_round_robin_namespaces() {
        let (client, _) = client(&["a", "b", "c"]);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let request = client
                .invoke("say", Parameters::new(), InvokeOptions::default())
                .await
                .unwrap();
            seen.push(request.namespace);
        }
        assert_eq!(seen, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_pinned_namespace_does_not_rotate() {
        let (client, _) = client(&["a", "b"]);
        for _ in 0..3 {
            let request = client
                .invoke(
                    "say",
                    Parameters::new(),
                    InvokeOptions::default().pin_namespace("z"),
                )
                .await
                .unwrap();
            assert_eq!(request.namespace, "z");
        }
    }

    #[tokio::test]
    async fn test_completed_parent_rejected_before_submission() {
        let (client, store) = client(&["default"]);
        let mut parent = Request::new(
            &Target::new("echo", "1.0.0", "default", "default"),
            "say",
            Parameters::new(),
        );
        parent.ensure_id();
        parent.set_status(RequestStatus::Success);

        let err = client
            .invoke("say", Parameters::new(), InvokeOptions::default().with_parent(parent))
            .await
            .unwrap_err();
        assert!(matches!(err, TaproomError::ParentCompleted { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_parent_checked_against_stored_status() {
        let (client, store) = client(&["default"]);
        let parent = store
            .submit_request(&Request::new(
                &Target::new("echo", "1.0.0", "default", "default"),
                "say",
                Parameters::new(),
            ))
            .await
            .unwrap();
        let id = parent.id.clone().unwrap();
        let mut finished = parent.clone();
        finished.succeed(serde_json::json!("done"));
        store
            .update_request_status(&id, &StatusUpdate::from_request(&finished))
            .await
            .unwrap();

        // The caller's copy still says CREATED.
        let err = client
            .invoke("say", Parameters::new(), InvokeOptions::default().with_parent(parent))
            .await
            .unwrap_err();
        assert!(matches!(err, TaproomError::ParentCompleted { ref status, .. } if status == "SUCCESS"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_resolves_to_registered_version() {
        let (client, store) = client(&["default"]);
        store.register_system("default", "echo", "1.0.0");

        let submitted = client
            .invoke("say", Parameters::new(), InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(submitted.system_version, "1.0.0");
    }

    #[tokio::test]
    async fn test_rejected_resolution_falls_back_to_latest() {
        struct StaleResolver;

        #[async_trait::async_trait]
        impl VersionResolver for StaleResolver {
            async fn resolve_latest_version(&self, _: &str, _: &str) -> TaproomResult<Option<String>> {
                Ok(Some("0.9.0".to_string()))
            }
        }

        let store = Arc::new(MemoryRequestStore::new());
        store.register_system("default", "echo", "1.1.0");
        let mut config = RpcClientConfig::new("echo");
        config.blocking = false;
        let client = RpcClient::new(config, store.clone(), Arc::new(StaleResolver)).unwrap();

        let submitted = client
            .invoke("say", Parameters::new(), InvokeOptions::default())
            .await
            .unwrap();
        // The store resolved the literal token itself.
        assert_eq!(submitted.system_version, "1.1.0");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_remote_request() {
        let (client, store) = client(&["default"]);
        let pending = client
            .invoke("say", Parameters::new(), InvokeOptions::default())
            .await
            .unwrap();
        let id = pending.id.unwrap();

        let err = client
            .wait_for(&id, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, TaproomError::Timeout { .. }));
        assert_eq!(
            store.fetch_request(&id).await.unwrap().status,
            RequestStatus::Created
        );
    }

    #[tokio::test]
    async fn test_raise_on_error() {
        let mut failed = Request::new(
            &Target::new("echo", "1.0.0", "default", "default"),
            "say",
            Parameters::new(),
        );
        failed.ensure_id();
        failed.fail(RequestStatus::Error, "boom", "ValueError");

        assert!(RpcClient::finish(failed.clone(), false).is_ok());
        let err = RpcClient::finish(failed, true).unwrap_err();
        assert!(matches!(err, TaproomError::RequestFailed { ref message, .. } if message == "boom"));
    }
}
