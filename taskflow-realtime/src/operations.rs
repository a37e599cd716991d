//! Optimistic edit submission.
//!
//! Every operation carries the version the caller based it on. The server
//! accepts it and bumps the version, or reports a conflict with its current
//! version and state. A conflict is never retried here: the caller discards
//! its optimistic state and resynchronises from what the server returned.

use std::sync::Arc;

use crate::error::RealtimeError;
use crate::protocol::{
    channels, EditOperation, OperationRequest, OperationResult, SubmitOutcome, UserRef, Version,
};
use crate::router::Router;

pub struct OperationSubmitter {
    router: Arc<Router>,
    user: UserRef,
}

impl OperationSubmitter {
    pub fn new(router: Arc<Router>, user: UserRef) -> Self {
        Self { router, user }
    }

    /// Submit `operation` as based on `version`.
    ///
    /// An `Err` whose [`is_outcome_unknown`](RealtimeError::is_outcome_unknown)
    /// is true means the operation may or may not have been applied; fetch
    /// the resource before submitting again.
    pub async fn submit_operation(
        &self,
        operation: &EditOperation,
        version: Version,
    ) -> Result<SubmitOutcome, RealtimeError> {
        let request = OperationRequest {
            operation: operation.payload.clone(),
            resource: operation.target.clone(),
            version,
            user: self.user.clone(),
        };
        let result: OperationResult = self
            .router
            .request(channels::OPERATION_SUBMIT, &request)
            .await?;

        let outcome = SubmitOutcome::from(result);
        match &outcome {
            SubmitOutcome::Accepted { new_version } => {
                log::debug!("{} accepted at {new_version}", operation.target)
            }
            SubmitOutcome::Conflict {
                current_version, ..
            } => log::info!(
                "{} rejected: based on {version}, server at {}",
                operation.target,
                current_version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
            ),
            SubmitOutcome::Failed { reason } => {
                log::warn!("{} failed: {reason}", operation.target)
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::protocol::ResourceRef;
    use crate::registry::SubscriptionRegistry;
    use crate::transport::memory::{MemoryConnector, MemoryPeer};
    use crate::transport::Connection;
    use serde_json::json;
    use std::time::Duration;

    async fn connected() -> (OperationSubmitter, MemoryPeer, Arc<Connection>) {
        let (connector, mut accept) = MemoryConnector::new(16);
        let (connection, events) =
            Connection::new("mem://", connector, BackoffPolicy::default(), 16);
        let connection = Arc::new(connection);
        let (registry, control) = SubscriptionRegistry::new();
        let router = Router::new(connection.clone(), registry, Duration::from_secs(2));
        router.spawn(events, control);
        connection.connect().await.unwrap();
        let peer = accept.recv().await.unwrap();
        (
            OperationSubmitter::new(router, UserRef::new("ada", "Ada")),
            peer,
            connection,
        )
    }

    fn rename_task() -> EditOperation {
        EditOperation::new(ResourceRef::new("task", "t-1"), json!({"title": "Ship it"}))
    }

    #[tokio::test]
    async fn test_accepted_submission_returns_new_version() {
        let (submitter, mut peer, _conn) = connected().await;

        let server = tokio::spawn(async move {
            let request = peer.recv_frame().await.unwrap();
            let body: OperationRequest = request.payload().unwrap();
            assert_eq!(body.version, Version(3));
            assert_eq!(body.resource.resource_id, "t-1");
            assert_eq!(body.operation, json!({"title": "Ship it"}));
            let reply = request.respond(&OperationResult::accepted(Version(4))).unwrap();
            peer.send_frame(&reply).await.unwrap();
            peer
        });

        let outcome = submitter
            .submit_operation(&rename_task(), Version(3))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted { new_version: Version(4) });
        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_version_yields_conflict_with_server_state() {
        let (submitter, mut peer, _conn) = connected().await;

        let server = tokio::spawn(async move {
            let request = peer.recv_frame().await.unwrap();
            let reply = request
                .respond(&OperationResult::conflict(Version(7), json!({"title": "Theirs"})))
                .unwrap();
            peer.send_frame(&reply).await.unwrap();
            // No automatic resubmission follows a conflict.
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(peer.try_recv_frame().is_none());
            peer
        });

        let outcome = submitter
            .submit_operation(&rename_task(), Version(3))
            .await
            .unwrap();
        assert!(outcome.is_conflict());
        match outcome {
            SubmitOutcome::Conflict {
                current_version,
                server_state,
            } => {
                assert_eq!(current_version, Some(Version(7)));
                assert_eq!(server_state, Some(json!({"title": "Theirs"})));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_when_disconnected_fails_fast() {
        let (submitter, _peer, conn) = connected().await;
        conn.disconnect();
        let err = submitter
            .submit_operation(&rename_task(), Version::INITIAL)
            .await
            .unwrap_err();
        assert_eq!(err, RealtimeError::NotConnected);
    }
}
