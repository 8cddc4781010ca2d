use thiserror::Error;

/// Closed error set for all agent operations.
///
/// The reconciliation loop decides what to do with a failure based on the
/// variant alone: configuration and tag-sync defects are never retried,
/// everything else may be wrapped in a bounded retry by the caller.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("tag sync error: {0}")]
    TagSync(String),

    #[error("dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response ({status}) from {url}: {body}")]
    UnexpectedResponse {
        status: u16,
        url: String,
        body: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Whether a bounded retry may help. Structural defects never go away on
    /// their own, so retrying them only delays the failure report.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AgentError::Configuration(_) | AgentError::TagSync(_)
        )
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::CommandFailed {
            command: "git fetch".to_string(),
            stderr: "fatal: unable to access remote".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command `git fetch` failed: fatal: unable to access remote"
        );

        let err = AgentError::Configuration("stack names must be lowercase".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: stack names must be lowercase"
        );
    }

    #[test]
    fn test_retryability() {
        assert!(!AgentError::Configuration("bad recipe".to_string()).is_retryable());
        assert!(!AgentError::TagSync("no common tag".to_string()).is_retryable());
        assert!(AgentError::CommandFailed {
            command: "git fetch".to_string(),
            stderr: "timeout".to_string(),
        }
        .is_retryable());
        assert!(AgentError::DependencyNotReady("portainer".to_string()).is_retryable());
    }

    #[test]
    fn test_error_traits() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AgentError>();

        let err: &dyn std::error::Error =
            &AgentError::CommandNotFound("git".to_string());
        assert!(err.to_string().contains("git"));
    }
}
