use std::sync::Arc;

use pagefield_core::{ArtifactStore, Authorizer, JobOrchestrator, SqliteHistory};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: JobOrchestrator,
    pub history: Arc<SqliteHistory>,
    pub artifacts: Arc<ArtifactStore>,
    pub authorizer: Arc<dyn Authorizer>,
}
