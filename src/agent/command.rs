use std::path::Path;
use std::process::Output;

use log::debug;
use tokio::process::Command;

use crate::agent::errors::{AgentError, Result};

/// Run a program with its arguments, no shell interpretation.
///
/// Returns captured stdout with the trailing newline stripped; nearly every
/// caller compares the output against refs or filenames and an embedded
/// newline breaks those comparisons silently.
pub async fn exec_command(program_and_args: &[String], cwd: &Path) -> Result<String> {
    exec_command_with_output(program_and_args, cwd, true).await
}

/// Same as [`exec_command`] but with control over newline stripping.
pub async fn exec_command_with_output(
    program_and_args: &[String],
    cwd: &Path,
    strip_endline: bool,
) -> Result<String> {
    let (program, args) = program_and_args
        .split_first()
        .ok_or_else(|| AgentError::Other("empty command line".to_string()))?;

    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AgentError::CommandNotFound(program.clone()),
            _ => AgentError::Io(e),
        })?;

    process_output(output, &program_and_args.join(" "), strip_endline)
}

/// Run a command through the shell. Pipes, `cd` and friends work, which also
/// means no quoting safety: only ever pass the operator-authored recipe
/// command through here.
pub async fn shell_command(cmd: &str, cwd: &Path) -> Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .output()
        .await
        .map_err(AgentError::Io)?;

    process_output(output, cmd, true)
}

fn process_output(output: Output, command: &str, strip_endline: bool) -> Result<String> {
    debug!("[{command}] exited with {:?}", output.status.code());

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !stderr.is_empty() {
            debug!("[stderr] {stderr}");
        }
        return Err(AgentError::CommandFailed {
            command: command.to_string(),
            stderr,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !stdout.is_empty() {
        debug!("[stdout] {stdout}");
    }

    if strip_endline {
        Ok(stdout.trim_end_matches('\n').to_string())
    } else {
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cwd() -> PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn test_exec_command_captures_stdout() {
        let cmd = vec!["echo".to_string(), "hello".to_string()];
        let out = exec_command(&cmd, &cwd()).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_exec_command_keeps_newline_when_asked() {
        let cmd = vec!["echo".to_string(), "hello".to_string()];
        let out = exec_command_with_output(&cmd, &cwd(), false).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_distinct_error() {
        let cmd = vec!["definitely-not-a-binary-on-this-host".to_string()];
        let err = exec_command(&cmd, &cwd()).await.unwrap_err();
        assert!(matches!(err, AgentError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let cmd = vec![
            "ls".to_string(),
            "/definitely/not/a/path/anywhere".to_string(),
        ];
        let err = exec_command(&cmd, &cwd()).await.unwrap_err();
        match err {
            AgentError::CommandFailed { command, stderr } => {
                assert!(command.starts_with("ls"));
                assert!(!stderr.is_empty());
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shell_command_supports_pipes() {
        let out = shell_command("echo one two | wc -w", &cwd()).await.unwrap();
        assert_eq!(out.trim(), "2");
    }
}
