use serde::{Deserialize, Serialize};
use uuid::Uuid;

use streamline_core::{MicroserviceId, TenantId};

/// Execution context a processor is invoked under.
///
/// Carries the microservice and tenant the processing happens for, plus a
/// correlation id for tracing a chain of work across processors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    microservice_id: MicroserviceId,
    tenant_id: TenantId,
    correlation_id: Uuid,
}

impl ExecutionContext {
    pub fn new(microservice_id: MicroserviceId, tenant_id: TenantId) -> Self {
        Self {
            microservice_id,
            tenant_id,
            correlation_id: Uuid::now_v7(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn microservice_id(&self) -> MicroserviceId {
        self.microservice_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}
