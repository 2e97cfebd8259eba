//! SSH server shared by every SSH based IDE

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{IdeService, SSH_PORT};
use crate::domain::ide::{GitspacePort, IdeArgs, IdeType, PortProtocol};
use crate::error::Result;
use crate::infra::template::{ScriptTemplates, TEMPLATE_RUN_SSH_SERVER, TEMPLATE_SETUP_SSH_SERVER};
use crate::service::container::exec::Exec;
use crate::service::logger::{log_and_wrap, GitspaceLogger};

/// Install and configure sshd for the remote user
pub async fn setup_ssh_server(
    templates: &ScriptTemplates,
    exec: &Exec,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let script = templates.generate_script(
        TEMPLATE_SETUP_SSH_SERVER,
        &json!({
            "username": exec.remote_user,
            "access_type": exec.access_type.as_str(),
        }),
    )?;
    logger.info("Setting up SSH server");
    let output = exec
        .execute_in_home(&script, true)
        .await
        .map_err(|e| log_and_wrap(logger, "Failed to set up SSH server", e))?;
    logger.debug(output.trim());
    Ok(())
}

/// Start sshd on the gitspace SSH port
pub async fn run_ssh_server(
    templates: &ScriptTemplates,
    exec: &Exec,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let script = templates.generate_script(TEMPLATE_RUN_SSH_SERVER, &json!({ "port": SSH_PORT }))?;
    logger.info("Starting SSH server");
    let output = exec
        .execute_in_home(&script, true)
        .await
        .map_err(|e| log_and_wrap(logger, "Failed to start SSH server", e))?;
    logger.debug(output.trim());
    Ok(())
}

pub fn ssh_port() -> GitspacePort {
    GitspacePort {
        port: SSH_PORT,
        protocol: PortProtocol::Ssh,
    }
}

/// Terminal access over SSH, no editor installed
pub struct SshIde {
    templates: Arc<ScriptTemplates>,
}

impl SshIde {
    pub fn new(templates: Arc<ScriptTemplates>) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl IdeService for SshIde {
    async fn setup(&self, exec: &Exec, _args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()> {
        setup_ssh_server(&self.templates, exec, logger).await
    }

    async fn run(&self, exec: &Exec, _args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()> {
        run_ssh_server(&self.templates, exec, logger).await
    }

    fn port(&self) -> GitspacePort {
        ssh_port()
    }

    fn ide_type(&self) -> IdeType {
        IdeType::Ssh
    }

    fn generate_url(&self, _repo_path: &str, host: &str, port: &str, user: &str) -> String {
        format!("ssh://{}@{}:{}", user, host, port)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::domain::container::ExecOutput;
    use crate::domain::gitspace::GitspaceAccessType;
    use crate::infra::docker::MockContainerEngine;
    use crate::service::logger::testing::RecordingLogger;

    #[tokio::test]
    async fn test_setup_configures_key_auth() {
        let mut engine = MockContainerEngine::new();
        engine.expect_exec().times(1).returning(|_, request| {
            assert_eq!(request.user, "root");
            let script = &request.cmd[2];
            assert!(script.contains("AllowUsers vscode"));
            assert!(script.contains("PasswordAuthentication no"));
            Ok(ExecOutput::default())
        });

        let exec = Exec::new(
            Arc::new(engine),
            CancellationToken::new(),
            "gitspace-u-app",
            "vscode",
            "/home/vscode",
        )
        .with_access(GitspaceAccessType::SshKey, "ssh-ed25519 AAAA");
        let templates = ScriptTemplates::new().unwrap();
        let logger = RecordingLogger::default();

        SshIde::new(Arc::new(templates))
            .setup(&exec, &IdeArgs::default(), &logger)
            .await
            .unwrap();
        assert!(logger.contains("Setting up SSH server"));
    }

    #[tokio::test]
    async fn test_run_failure_is_logged() {
        let mut engine = MockContainerEngine::new();
        engine.expect_exec().returning(|_, _| {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: "sshd: no hostkeys available".to_string(),
                exit_code: 1,
            })
        });

        let exec = Exec::new(
            Arc::new(engine),
            CancellationToken::new(),
            "gitspace-u-app",
            "vscode",
            "/home/vscode",
        );
        let templates = ScriptTemplates::new().unwrap();
        let logger = RecordingLogger::default();

        let err = run_ssh_server(&templates, &exec, &logger).await.unwrap_err();
        assert!(err.to_string().contains("Failed to start SSH server"));
        assert!(logger.contains("ERROR Failed to start SSH server"));
    }
}
