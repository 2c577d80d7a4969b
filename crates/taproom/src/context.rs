//! Current-invocation context.
//!
//! While a command runs, the dispatcher binds a [`CurrentInvocation`] to the
//! handler's task. Code running inside the command (the RPC client in
//! particular) reads it through [`current`] to default the parent of child
//! requests and to detect calls back into this worker.
//!
//! This is the only ambient mutable state in the crate. The binding is
//! task-scoped, so it does not follow work moved onto a freshly spawned
//! task; pass [`Invocation::context`](crate::Invocation) along explicitly
//! in that case.

use crate::dispatcher::Dispatcher;
use crate::request::{Request, Target, LATEST_VERSION};
use crate::status::RequestStatus;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Who this worker is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    pub system: String,
    pub version: String,
    pub instance: String,
    pub namespace: String,
}

impl WorkerIdentity {
    pub fn new(
        system: impl Into<String>,
        version: impl Into<String>,
        instance: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            version: version.into(),
            instance: instance.into(),
            namespace: namespace.into(),
        }
    }

    /// `system[instance]-version`
    pub fn unique_name(&self) -> String {
        format!("{}[{}]-{}", self.system, self.instance, self.version)
    }

    pub fn target(&self) -> Target {
        Target::new(&self.system, &self.version, &self.namespace, &self.instance)
    }

    /// Whether `target` addresses this worker. `target.version` must already
    /// be concrete; the literal `latest` never matches.
    pub fn matches(&self, target: &Target) -> bool {
        target.version != LATEST_VERSION
            && target.system == self.system
            && target.version == self.version
            && target.instance == self.instance
            && target.namespace == self.namespace
    }

    /// Same as [`matches`](Self::matches) ignoring the version.
    pub fn matches_ignoring_version(&self, target: &Target) -> bool {
        target.system == self.system
            && target.instance == self.instance
            && target.namespace == self.namespace
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.unique_name())
    }
}

/// The request currently executing on this task and its surroundings.
pub struct CurrentInvocation {
    request: Request,
    status: Mutex<RequestStatus>,
    identity: Arc<WorkerIdentity>,
    dispatcher: Dispatcher,
}

impl CurrentInvocation {
    pub(crate) fn new(
        request: Request,
        identity: Arc<WorkerIdentity>,
        dispatcher: Dispatcher,
    ) -> Self {
        let status = Mutex::new(request.status);
        Self {
            request,
            status,
            identity,
            dispatcher,
        }
    }

    /// Snapshot of the request as it was when the command started.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request.id.as_deref()
    }

    /// Live status of the executing request.
    pub fn status(&self) -> RequestStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: RequestStatus) {
        *self.status.lock() = status;
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl fmt::Debug for CurrentInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentInvocation")
            .field("request_id", &self.request.id)
            .field("command", &self.request.command)
            .field("status", &self.status())
            .field("identity", &self.identity)
            .finish()
    }
}

tokio::task_local! {
    static CURRENT: Arc<CurrentInvocation>;
}

/// The invocation bound to the calling task, if any.
pub fn current() -> Option<Arc<CurrentInvocation>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Run `fut` with `invocation` bound as the current invocation.
pub(crate) async fn scope<F: Future>(invocation: Arc<CurrentInvocation>, fut: F) -> F::Output {
    CURRENT.scope(invocation, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name() {
        let identity = WorkerIdentity::new("echo", "1.0.0", "i1", "default");
        assert_eq!(identity.unique_name(), "echo[i1]-1.0.0");
        assert_eq!(identity.to_string(), "default/echo[i1]-1.0.0");
    }

    #[test]
    fn test_matches_requires_every_coordinate() {
        let identity = WorkerIdentity::new("echo", "1.0.0", "i1", "default");
        assert!(identity.matches(&Target::new("echo", "1.0.0", "default", "i1")));
        assert!(!identity.matches(&Target::new("echo", "1.0.0", "other", "i1")));
        assert!(!identity.matches(&Target::new("echo", "2.0.0", "default", "i1")));
        assert!(!identity.matches(&Target::new("echo", "1.0.0", "default", "i2")));
        assert!(!identity.matches(&Target::new("echo", LATEST_VERSION, "default", "i1")));
        assert!(identity.matches_ignoring_version(&Target::new(
            "echo",
            LATEST_VERSION,
            "default",
            "i1"
        )));
    }

    #[tokio::test]
    async fn test_no_context_outside_invocation() {
        assert!(current().is_none());
    }
}
