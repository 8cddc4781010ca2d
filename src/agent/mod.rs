pub mod auto_deploy;
pub mod command;
pub mod compose;
pub mod errors;
pub mod git_watcher;
pub mod notifier;
pub mod portainer;
pub mod registry_watcher;
pub mod rest;
pub mod retry;
pub mod settings;
pub mod state;
pub mod subtask;

// Re-export commonly used items
pub use auto_deploy::AutoDeployTask;
pub use errors::{AgentError, Result};
pub use git_watcher::{GitUrlWatcher, RepoStatus};
pub use portainer::PortainerClient;
pub use registry_watcher::RegistryWatcher;
pub use settings::Settings;
pub use state::{SharedState, State};
pub use subtask::{ChangeMap, SubTask};
