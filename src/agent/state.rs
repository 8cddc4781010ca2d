use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle of the deployment agent. There is exactly one of these per
/// process; only the reconciliation loop writes it, the health endpoint
/// reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    Paused,
    Failed,
    Stopped,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Starting => "STARTING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Failed => "FAILED",
            State::Stopped => "STOPPED",
        }
    }

    /// The externally visible status string, e.g. `SERVICE_RUNNING`.
    pub fn service_status(&self) -> String {
        format!("SERVICE_{}", self.name())
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared handle on the lifecycle state.
#[derive(Debug, Clone)]
pub struct SharedState {
    tx: Arc<watch::Sender<State>>,
}

impl SharedState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(State::Starting);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, state: State) {
        self.tx.send_replace(state);
    }

    pub fn get(&self) -> State {
        *self.tx.borrow()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
