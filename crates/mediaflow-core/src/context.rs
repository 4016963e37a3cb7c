use std::sync::Arc;

use mediaflow_providers::GenerationApi;

use crate::config::EngineConfig;
use crate::credentials::CredentialResolver;
use crate::event_log::EventLog;
use crate::ports::Persistence;
use crate::registry::{PollerRegistry, StreamRegistry};
use crate::roles::RoleBook;
use crate::store::TaskStore;

/// Shared collaborators and registries. Cheap to clone; every field is a
/// handle onto shared state.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub config: Arc<EngineConfig>,
    pub store: TaskStore,
    pub log: EventLog,
    pub api: Arc<dyn GenerationApi>,
    pub persistence: Option<Arc<dyn Persistence>>,
    pub credentials: CredentialResolver,
    pub pollers: PollerRegistry,
    pub streams: StreamRegistry,
    pub roles: RoleBook,
}
