use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::agent::errors::Result;

/// Map of change-source key (repository id, image reference) to a
/// human-readable change description.
pub type ChangeMap = BTreeMap<String, String>;

/// A polled change source. The reconciliation loop owns a heterogeneous
/// collection of these and drives them strictly sequentially.
#[async_trait]
pub trait SubTask: Send {
    fn name(&self) -> &str;

    /// Acquire resources and record the initial observed state. Returns a
    /// description of what was observed, keyed like subsequent changes.
    async fn init(&mut self) -> Result<ChangeMap>;

    /// Poll the source and report what changed since the last observation.
    async fn check_for_changes(&mut self) -> Result<ChangeMap>;

    /// Release owned resources, best-effort.
    async fn cleanup(&mut self) -> Result<()>;
}
