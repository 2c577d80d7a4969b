//! Status publishing.

use crate::backoff::BackoffPolicy;
use crate::error::{TaproomError, TaproomResult};
use crate::request::Request;
use crate::status::{RequestStatus, StatusMachine};
use crate::store::{RequestStore, StatusUpdate};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Reports status changes of executing requests.
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    /// Publish `request`'s current status.
    ///
    /// `previous` is the last status this process persisted for the request,
    /// used to validate the transition before any I/O. `None` skips local
    /// validation and leaves the decision to the store.
    async fn update(&self, request: &Request, previous: Option<RequestStatus>)
        -> TaproomResult<()>;
}

/// Updater that reports nothing. Used for admin commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUpdater;

#[async_trait]
impl StatusUpdater for NoopUpdater {
    async fn update(&self, _: &Request, _: Option<RequestStatus>) -> TaproomResult<()> {
        Ok(())
    }
}

/// Publishes status updates to a [`RequestStore`] with bounded retries.
pub struct StatusPublisher {
    store: Arc<dyn RequestStore>,
    policy: BackoffPolicy,
}

impl StatusPublisher {
    pub fn new(store: Arc<dyn RequestStore>, policy: BackoffPolicy) -> Self {
        Self { store, policy }
    }

    async fn give_up(&self, id: &str, request: &Request, cause: &TaproomError) -> TaproomResult<()> {
        let mut fallback = request.clone();
        fallback.fail(
            RequestStatus::Error,
            format!("Unable to publish final status {}: {cause}", request.status),
            "StatusPublishError",
        );
        self.store
            .update_request_status(id, &StatusUpdate::from_request(&fallback))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl StatusUpdater for StatusPublisher {
    async fn update(
        &self,
        request: &Request,
        previous: Option<RequestStatus>,
    ) -> TaproomResult<()> {
        if request.is_ephemeral() {
            debug!(request_id = %request.id_or_unassigned(), "Skipping update for ephemeral request");
            return Ok(());
        }
        let id = request
            .id
            .as_deref()
            .ok_or_else(|| TaproomError::Validation("Cannot publish a request without an id".into()))?;

        if let Some(previous) = previous {
            StatusMachine::validate(previous, request.status)?;
        }

        let update = StatusUpdate::from_request(request);
        let result = self
            .policy
            .retry("publish status", || self.store.update_request_status(id, &update))
            .await;

        match result {
            Ok(_) => {
                debug!(request_id = %id, status = %request.status, "Published status");
                Ok(())
            }
            Err(e) if e.is_validation() => {
                warn!(
                    request_id = %id,
                    status = %request.status,
                    error = %e,
                    "Status update rejected"
                );
                Err(e)
            }
            Err(e) => {
                let gave_up = if request.is_terminal() {
                    self.give_up(id, request, &e).await.is_ok()
                } else {
                    false
                };
                error!(
                    request_id = %id,
                    status = %request.status,
                    error_recorded = gave_up,
                    error = %e,
                    "FATAL: could not publish request status"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CommandType, Parameters, Target};
    use crate::store::{MemoryRequestStore, RequestQuery};
    use crate::tests::harness::ErrorLog;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Store that fails the first `failures` status updates.
    struct FlakyStore {
        inner: MemoryRequestStore,
        failures: Mutex<u32>,
        attempts: Mutex<Vec<RequestStatus>>,
    }

    #[async_trait]
    impl RequestStore for FlakyStore {
        async fn submit_request(&self, request: &Request) -> TaproomResult<Request> {
            self.inner.submit_request(request).await
        }

        async fn fetch_request(&self, id: &str) -> TaproomResult<Request> {
            self.inner.fetch_request(id).await
        }

        async fn update_request_status(
            &self,
            id: &str,
            update: &StatusUpdate,
        ) -> TaproomResult<Request> {
            self.attempts.lock().push(update.status);
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(TaproomError::Transport("store down".into()));
                }
            }
            self.inner.update_request_status(id, update).await
        }

        async fn list_requests(&self, query: &RequestQuery) -> TaproomResult<Vec<Request>> {
            self.inner.list_requests(query).await
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 3)
    }

    async fn setup(failures: u32) -> (Arc<FlakyStore>, Request) {
        let store = Arc::new(FlakyStore {
            inner: MemoryRequestStore::new(),
            failures: Mutex::new(failures),
            attempts: Mutex::new(Vec::new()),
        });
        let request = Request::new(
            &Target::new("echo", "1.0.0", "default", "default"),
            "say",
            Parameters::new(),
        );
        let stored = store.submit_request(&request).await.unwrap();
        (store, stored)
    }

    #[tokio::test]
    async fn test_rejects_illegal_transition_before_io() {
        let (store, mut request) = setup(0).await;
        let publisher = StatusPublisher::new(store.clone(), policy());
        request.set_status(RequestStatus::Created);

        let err = publisher
            .update(&request, Some(RequestStatus::Success))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(store.attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failure() {
        let (store, mut request) = setup(2).await;
        let publisher = StatusPublisher::new(store.clone(), policy());
        request.set_status(RequestStatus::InProgress);

        publisher
            .update(&request, Some(RequestStatus::Created))
            .await
            .unwrap();
        assert_eq!(store.attempts.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_error_after_exhaustion() {
        let (store, mut request) = setup(3).await;
        let publisher = StatusPublisher::new(store.clone(), policy());
        request.succeed(serde_json::json!("ok"));

        let err = publisher
            .update(&request, Some(RequestStatus::Created))
            .await
            .unwrap_err();
        assert!(matches!(err, TaproomError::RetriesExhausted { attempts: 3, .. }));

        // Three tries, then exactly one fallback ERROR update.
        let attempts = store.attempts.lock().clone();
        assert_eq!(
            attempts,
            vec![
                RequestStatus::Success,
                RequestStatus::Success,
                RequestStatus::Success,
                RequestStatus::Error
            ]
        );
        let persisted = store.fetch_request(request.id.as_deref().unwrap()).await.unwrap();
        assert_eq!(persisted.status, RequestStatus::Error);
        assert_eq!(persisted.error_class.as_deref(), Some("StatusPublishError"));
    }

    #[tokio::test]
    async fn test_exhaustion_logs_one_error() {
        let (store, mut request) = setup(3).await;
        let publisher = StatusPublisher::new(store.clone(), policy());
        request.succeed(serde_json::json!("ok"));

        let errors = ErrorLog::default();
        let _guard = errors.install();
        assert!(publisher
            .update(&request, Some(RequestStatus::Created))
            .await
            .is_err());

        let messages = errors.messages();
        assert_eq!(messages.len(), 1, "{messages:?}");
        assert!(messages[0].starts_with("FATAL"));
    }

    #[tokio::test]
    async fn test_ephemeral_requests_are_skipped() {
        let (store, mut request) = setup(0).await;
        let publisher = StatusPublisher::new(store.clone(), policy());
        request.command_type = CommandType::Ephemeral;
        request.set_status(RequestStatus::InProgress);

        publisher
            .update(&request, Some(RequestStatus::Created))
            .await
            .unwrap();
        assert!(store.attempts.lock().is_empty());
    }
}
