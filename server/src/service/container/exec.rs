//! Command execution inside a gitspace container

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::gitspace::GitspaceAccessType;
use crate::error::{Error, Result};
use crate::infra::docker::{ContainerEngine, ExecRequest};

const ROOT_USER: &str = "root";

/// Runs shell commands in one container as its remote user or root
#[derive(Clone)]
pub struct Exec {
    engine: Arc<dyn ContainerEngine>,
    cancel: CancellationToken,
    pub container_name: String,
    pub default_working_dir: String,
    pub remote_user: String,
    pub access_key: String,
    pub access_type: GitspaceAccessType,
    pub os: String,
    pub arch: String,
}

impl Exec {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        cancel: CancellationToken,
        container_name: impl Into<String>,
        remote_user: impl Into<String>,
        default_working_dir: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            cancel,
            container_name: container_name.into(),
            default_working_dir: default_working_dir.into(),
            remote_user: remote_user.into(),
            access_key: String::new(),
            access_type: GitspaceAccessType::UserCredentials,
            os: String::new(),
            arch: String::new(),
        }
    }

    pub fn with_access(mut self, access_type: GitspaceAccessType, access_key: impl Into<String>) -> Self {
        self.access_type = access_type;
        self.access_key = access_key.into();
        self
    }

    pub fn with_platform(mut self, os: impl Into<String>, arch: impl Into<String>) -> Self {
        self.os = os.into();
        self.arch = arch.into();
        self
    }

    /// Run `command` through `/bin/sh -c` and return its stdout.
    ///
    /// A nonzero exit code fails with the command's stderr. Detached commands
    /// return as soon as they are started and yield no output.
    pub async fn execute_command(
        &self,
        command: &str,
        as_root: bool,
        detach: bool,
        working_dir: Option<&str>,
    ) -> Result<String> {
        let user = if as_root { ROOT_USER } else { self.remote_user.as_str() };
        let request = ExecRequest {
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()],
            user: user.to_string(),
            working_dir: Some(working_dir.unwrap_or(&self.default_working_dir).to_string()),
            env: Vec::new(),
            detach,
        };

        debug!(container = %self.container_name, user, detach, "Executing command");

        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            output = self.engine.exec(&self.container_name, request) => output?,
        };

        if detach {
            return Ok(String::new());
        }

        if output.exit_code != 0 {
            let stderr = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(Error::CommandFailed {
                exit_code: output.exit_code,
                stderr,
            });
        }

        Ok(output.stdout)
    }

    /// Run `command` in the default working directory
    pub async fn execute_in_home(&self, command: &str, as_root: bool) -> Result<String> {
        self.execute_command(command, as_root, false, None).await
    }

    /// Extract a tar archive at `path` inside the container
    pub async fn copy_archive(&self, path: &str, archive: Vec<u8>) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self.engine.copy_to_container(&self.container_name, path, archive) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::*;

    use super::*;
    use crate::domain::container::ExecOutput;
    use crate::infra::docker::MockContainerEngine;

    fn exec_with(engine: MockContainerEngine, cancel: CancellationToken) -> Exec {
        Exec::new(Arc::new(engine), cancel, "gitspace-gitspace-app", "vscode", "/home/vscode")
    }

    #[tokio::test]
    async fn test_execute_command_as_remote_user() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_exec()
            .with(eq("gitspace-gitspace-app"), always())
            .returning(|_, request| {
                assert_eq!(request.cmd, vec!["/bin/sh", "-c", "echo hi"]);
                assert_eq!(request.user, "vscode");
                assert_eq!(request.working_dir.as_deref(), Some("/home/vscode"));
                Ok(ExecOutput {
                    stdout: "hi\n".to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                })
            });

        let exec = exec_with(engine, CancellationToken::new());
        assert_eq!(exec.execute_in_home("echo hi", false).await.unwrap(), "hi\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_embeds_stderr() {
        let mut engine = MockContainerEngine::new();
        engine.expect_exec().returning(|_, request| {
            assert_eq!(request.user, "root");
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: "apt-get: not found\n".to_string(),
                exit_code: 127,
            })
        });

        let exec = exec_with(engine, CancellationToken::new());
        let err = exec.execute_in_home("apt-get update", true).await.unwrap_err();
        match err {
            Error::CommandFailed { exit_code, stderr } => {
                assert_eq!(exit_code, 127);
                assert_eq!(stderr, "apt-get: not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_detached_ignores_exit_code() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_exec()
            .returning(|_, request| {
                assert!(request.detach);
                Ok(ExecOutput::default())
            });

        let exec = exec_with(engine, CancellationToken::new());
        let out = exec
            .execute_command("code-server &", false, true, Some("/tmp"))
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_completion() {
        let mut engine = MockContainerEngine::new();
        engine.expect_exec().never();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let exec = exec_with(engine, cancel);
        assert!(matches!(
            exec.execute_in_home("sleep 10", false).await,
            Err(Error::Cancelled)
        ));
    }
}
