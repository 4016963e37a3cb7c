pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod event_log;
pub mod orchestrator;
pub mod poller;
pub mod ports;
pub mod recovery;
pub mod registry;
pub mod roles;
pub mod runner;
pub mod store;

pub use config::{ConfigLayers, EngineConfig, CONFIG_FILE_NAME, DEFAULT_BASE_URL};
pub use credentials::{CredentialResolver, PollCredential, ResolvedCredential};
pub use error::{OrchestratorError, Result};
pub use event_log::EventLog;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, StartupReport};
pub use poller::{PendingPoller, PollTarget, StartOutcome};
pub use ports::{CredentialProvider, Persistence};
pub use recovery::{OrphanRecovery, RecoveryReport};
pub use registry::{PollKey, PollerHandle, PollerRegistry, StreamRegistry};
pub use roles::RoleBook;
pub use runner::{TaskRunner, MANUAL_CANCEL_MESSAGE};
pub use store::{LocalTaskFile, TaskMirror, TaskStore};
