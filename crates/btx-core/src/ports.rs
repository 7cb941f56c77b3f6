//! Hexagonal ports the core consumes. Adapter crates implement these over
//! OpenAI, the admin HTTP API, and the per-client enablement backend.

use async_trait::async_trait;

use crate::{
    activation::{ActivationReport, ActivationRequest},
    commands::QueryKind,
    domain::ClientId,
    health::HealthSnapshot,
    Result,
};

/// Downstream language-model collaborator used by the webhook dispatcher.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, query: &str, kind: QueryKind) -> Result<String>;
}

/// Source of operational metrics consulted by the rollout health gate.
///
/// Implementations must fail (not default to healthy) when the metrics cannot
/// be obtained or parsed.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch_health_snapshot(&self) -> Result<HealthSnapshot>;
}

/// Side-effecting activation of a feature/model for a set of clients.
#[async_trait]
pub trait ActivationSink: Send + Sync {
    async fn activate_clients(&self, req: &ActivationRequest) -> Result<ActivationReport>;
}

/// Per-client model enablement, the backend behind the admin activation endpoint.
#[async_trait]
pub trait ClientModelBackend: Send + Sync {
    async fn enable_model(&self, client_id: &ClientId, model: &str) -> Result<()>;
}
