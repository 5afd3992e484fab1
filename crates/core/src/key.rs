//! Identity keys of stream processors.
//!
//! A key is created once when a processor is registered, never changes, and is
//! the persistence key for that processor's state.

use serde::{Deserialize, Serialize};

use crate::id::{EventProcessorId, MicroserviceId, PartitionId, ScopeId, StreamId, TenantId};

/// Identity of a local stream processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamProcessorId {
    pub scope_id: ScopeId,
    pub event_processor_id: EventProcessorId,
    pub source_stream_id: StreamId,
}

impl StreamProcessorId {
    pub fn new(
        scope_id: ScopeId,
        event_processor_id: EventProcessorId,
        source_stream_id: StreamId,
    ) -> Self {
        Self {
            scope_id,
            event_processor_id,
            source_stream_id,
        }
    }
}

impl core::fmt::Display for StreamProcessorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.scope_id, self.event_processor_id, self.source_stream_id
        )
    }
}

/// Identity of an Event Horizon subscription: a consumer tenant pulling one
/// partition of a public stream from a producer microservice's tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId {
    pub consumer_tenant_id: TenantId,
    pub producer_microservice_id: MicroserviceId,
    pub producer_tenant_id: TenantId,
    pub scope_id: ScopeId,
    pub stream_id: StreamId,
    pub partition_id: PartitionId,
}

impl core::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}<-{}:{}/{}/{}/{}",
            self.consumer_tenant_id,
            self.producer_microservice_id,
            self.producer_tenant_id,
            self.scope_id,
            self.stream_id,
            self.partition_id
        )
    }
}

/// Key under which a processor's state is persisted.
///
/// Both local processors and Event Horizon subscriptions share one state
/// repository, so the repository is keyed by this sum of the two identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessorKey {
    StreamProcessor(StreamProcessorId),
    Subscription(SubscriptionId),
}

impl ProcessorKey {
    /// Stable textual key for storage backends.
    pub fn storage_key(&self) -> String {
        match self {
            ProcessorKey::StreamProcessor(id) => format!("processor:{id}"),
            ProcessorKey::Subscription(id) => format!("subscription:{id}"),
        }
    }

    pub fn scope_id(&self) -> ScopeId {
        match self {
            ProcessorKey::StreamProcessor(id) => id.scope_id,
            ProcessorKey::Subscription(id) => id.scope_id,
        }
    }
}

impl core::fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

impl From<StreamProcessorId> for ProcessorKey {
    fn from(value: StreamProcessorId) -> Self {
        Self::StreamProcessor(value)
    }
}

impl From<SubscriptionId> for ProcessorKey {
    fn from(value: SubscriptionId) -> Self {
        Self::Subscription(value)
    }
}
