//! Operator recovery operations.
//!
//! A running processor owns its state, so operations are sent into its task
//! and applied between two events. A stopped processor's state is changed
//! directly in the repository.

use tokio::sync::oneshot;
use tracing::info;

use streamline_core::{DomainError, EventLogSequenceNumber, PartitionId, ProcessorKey};
use streamline_events::{Cancellation, PartitionedState, StreamProcessorState, UnpartitionedState};

use super::error::AdminError;
use crate::resilience::{retry_transient, ResiliencePolicy};
use crate::state_store::{RepositoryError, StreamProcessorStateRepository};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminOperation {
    SkipEventsBefore(EventLogSequenceNumber),
    RemoveFailingPartition(PartitionId),
}

impl AdminOperation {
    pub fn apply(&self, state: &StreamProcessorState) -> Result<StreamProcessorState, DomainError> {
        match self {
            AdminOperation::SkipEventsBefore(target) => Ok(state.skip_events_before(*target)),
            AdminOperation::RemoveFailingPartition(partition) => state.remove_failing_partition(partition),
        }
    }
}

impl std::fmt::Display for AdminOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminOperation::SkipEventsBefore(target) => write!(f, "skip events before {target}"),
            AdminOperation::RemoveFailingPartition(partition) => {
                write!(f, "remove failing partition {partition}")
            }
        }
    }
}

/// State shapes an engine can apply operator commands to.
pub(crate) trait AdminTarget: Clone + Into<StreamProcessorState> {
    fn apply_admin(&self, operation: &AdminOperation) -> Result<Self, DomainError>;
}

impl AdminTarget for UnpartitionedState {
    fn apply_admin(&self, operation: &AdminOperation) -> Result<Self, DomainError> {
        match operation {
            AdminOperation::SkipEventsBefore(target) => Ok(self.skip_events_before(*target)),
            AdminOperation::RemoveFailingPartition(_) => Err(DomainError::invariant(
                "cannot remove a failing partition from a non-partitioned processor",
            )),
        }
    }
}

impl AdminTarget for PartitionedState {
    fn apply_admin(&self, operation: &AdminOperation) -> Result<Self, DomainError> {
        match operation {
            AdminOperation::SkipEventsBefore(target) => Ok(self.skip_events_before(*target)),
            AdminOperation::RemoveFailingPartition(partition) => {
                Ok(self.remove_failing_partition(partition))
            }
        }
    }
}

/// An operation on its way into a running processor's task.
#[derive(Debug)]
pub(crate) struct AdminCommand {
    pub operation: AdminOperation,
    pub reply: oneshot::Sender<Result<StreamProcessorState, AdminError>>,
}

/// Apply `operation` to the stored state of a processor that is not running.
///
/// A processor without stored state starts from its initial state.
pub(crate) async fn apply_to_stored_state(
    repository: &dyn StreamProcessorStateRepository,
    policy: &dyn ResiliencePolicy,
    key: &ProcessorKey,
    partitioned: bool,
    operation: &AdminOperation,
) -> Result<StreamProcessorState, AdminError> {
    let cancellation = Cancellation::new();
    let current = retry_transient(policy, &cancellation, "load_state", RepositoryError::is_transient, move || {
        repository.try_get(key)
    })
        .await
        .map_err(AdminError::Load)?
        .unwrap_or_else(|| StreamProcessorState::initial(partitioned));

    let next = operation.apply(&current)?;
    let persisted = &next;
    retry_transient(policy, &cancellation, "persist_state", RepositoryError::is_transient, move || {
        repository.persist(key, persisted)
    })
        .await
        .map_err(AdminError::Persist)?;

    info!(processor = %key, %operation, position = %next.position(), "applied operator command to stored state");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use streamline_core::{EventProcessorId, ScopeId, StreamId, StreamProcessorId, StreamPosition};
    use streamline_events::{CommittedEvent, ProcessingResult, StreamEvent};

    use crate::resilience::RetryPolicy;
    use crate::state_store::InMemoryStateRepository;

    fn failing_partitioned() -> PartitionedState {
        let event = StreamEvent::new(
            CommittedEvent::new(
                EventLogSequenceNumber::new(0),
                Utc::now(),
                "A",
                "e",
                false,
                serde_json::json!({}),
            ),
            StreamPosition::START,
            StreamId::new(),
            PartitionId::from("A"),
            true,
        );
        PartitionedState::new().with_result(&ProcessingResult::fatal("poison"), &event, Utc::now())
    }

    #[test]
    fn remove_failing_partition_is_rejected_for_unpartitioned_state() {
        let op = AdminOperation::RemoveFailingPartition(PartitionId::from("A"));
        assert!(UnpartitionedState::new().apply_admin(&op).is_err());
        assert!(!failing_partitioned().apply_admin(&op).unwrap().is_failing());
    }

    #[tokio::test]
    async fn stored_state_is_updated_when_not_running() {
        let repository = InMemoryStateRepository::new();
        let policy = RetryPolicy::fixed(1, Duration::from_millis(1));
        let key: ProcessorKey =
            StreamProcessorId::new(ScopeId::DEFAULT, EventProcessorId::new(), StreamId::new()).into();
        repository.persist(&key, &failing_partitioned().into()).await.unwrap();

        let next = apply_to_stored_state(
            &repository,
            &policy,
            &key,
            true,
            &AdminOperation::SkipEventsBefore(EventLogSequenceNumber::new(10)),
        )
        .await
        .unwrap();

        assert!(!next.is_failing());
        assert_eq!(repository.try_get(&key).await.unwrap(), Some(next));
    }
}
