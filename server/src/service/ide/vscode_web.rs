//! VS Code in the browser via code-server

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{IdeService, VSCODE_WEB_PORT};
use crate::domain::ide::{GitspacePort, IdeArgs, IdeType, PortProtocol};
use crate::error::{Error, Result};
use crate::infra::template::{
    ScriptTemplates, TEMPLATE_INSTALL_VSCODE_WEB, TEMPLATE_RUN_VSCODE_WEB, TEMPLATE_SETUP_VSCODE_WEB,
};
use crate::service::container::exec::Exec;
use crate::service::logger::{log_and_wrap, GitspaceLogger};

const MEDIA_STAGING_DIR: &str = "/tmp/gitspace-media";

const MEDIA_FILES: &[(&str, &[u8])] = &[
    ("favicon.svg", include_bytes!("../../../media/vscode-web/favicon.svg")),
    (
        "favicon-dark-support.svg",
        include_bytes!("../../../media/vscode-web/favicon-dark-support.svg"),
    ),
    ("pwa-icon.svg", include_bytes!("../../../media/vscode-web/pwa-icon.svg")),
];

/// Branding assets as a tar archive
fn media_archive() -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in MEDIA_FILES {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *content)
            .map_err(|e| Error::Internal(format!("failed to pack {}: {}", name, e)))?;
    }
    Ok(builder.into_inner()?)
}

pub struct VsCodeWebIde {
    templates: Arc<ScriptTemplates>,
}

impl VsCodeWebIde {
    pub fn new(templates: Arc<ScriptTemplates>) -> Self {
        Self { templates }
    }

    /// Replace code-server's stock icons with the gitspace ones
    async fn copy_media(&self, exec: &Exec, logger: &dyn GitspaceLogger) -> Result<()> {
        exec.execute_in_home(&format!("mkdir -p {}", MEDIA_STAGING_DIR), true)
            .await?;
        exec.copy_archive(MEDIA_STAGING_DIR, media_archive()?).await?;
        let install = format!(
            "media_dir=\"$(dirname \"$(readlink -f \"$(command -v code-server)\")\")/../src/browser/media\" \
             && mkdir -p \"$media_dir\" && cp -f {}/* \"$media_dir\"/",
            MEDIA_STAGING_DIR
        );
        exec.execute_in_home(&install, true).await?;
        logger.debug("Copied code-server media");
        Ok(())
    }
}

#[async_trait]
impl IdeService for VsCodeWebIde {
    async fn setup(&self, exec: &Exec, args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()> {
        logger.info("Installing code-server");
        let install = self
            .templates
            .generate_script(TEMPLATE_INSTALL_VSCODE_WEB, &json!({}))?;
        let output = exec
            .execute_in_home(&install, true)
            .await
            .map_err(|e| log_and_wrap(logger, "Failed to install code-server", e))?;
        logger.debug(output.trim());

        if let Err(err) = self.copy_media(exec, logger).await {
            logger.warn(&format!("Could not copy code-server media: {}", err));
        }

        let setup = self.templates.generate_script(
            TEMPLATE_SETUP_VSCODE_WEB,
            &json!({
                "port": VSCODE_WEB_PORT,
                "extensions": args.vscode_extensions,
            }),
        )?;
        exec.execute_in_home(&setup, false)
            .await
            .map_err(|e| log_and_wrap(logger, "Failed to configure code-server", e))?;
        logger.info("code-server installed");
        Ok(())
    }

    async fn run(&self, exec: &Exec, args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()> {
        let script = self.templates.generate_script(
            TEMPLATE_RUN_VSCODE_WEB,
            &json!({ "port": VSCODE_WEB_PORT, "repo_name": args.repo_name }),
        )?;
        logger.info("Starting code-server");
        exec.execute_in_home(&script, false)
            .await
            .map_err(|e| log_and_wrap(logger, "Failed to start code-server", e))?;
        Ok(())
    }

    fn port(&self) -> GitspacePort {
        GitspacePort {
            port: VSCODE_WEB_PORT,
            protocol: PortProtocol::Http,
        }
    }

    fn ide_type(&self) -> IdeType {
        IdeType::VsCodeWeb
    }

    fn generate_url(&self, repo_path: &str, host: &str, port: &str, _user: &str) -> String {
        format!(
            "http://{}:{}?folder=/{}",
            host,
            port,
            repo_path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::domain::container::ExecOutput;
    use crate::infra::docker::MockContainerEngine;
    use crate::service::logger::testing::RecordingLogger;

    #[test]
    fn test_media_archive_lists_icons() {
        let archive = media_archive().unwrap();
        let mut archive = tar::Archive::new(archive.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["favicon.svg", "favicon-dark-support.svg", "pwa-icon.svg"]);
    }

    #[tokio::test]
    async fn test_media_failure_does_not_fail_setup() {
        let scripts = Arc::new(Mutex::new(Vec::new()));
        let recorded = scripts.clone();
        let mut engine = MockContainerEngine::new();
        engine.expect_exec().returning(move |_, request| {
            recorded.lock().unwrap().push(request.cmd[2].clone());
            Ok(ExecOutput::default())
        });
        engine
            .expect_copy_to_container()
            .returning(|_, _, _| Err(Error::Internal("copy refused".to_string())));

        let exec = Exec::new(
            Arc::new(engine),
            CancellationToken::new(),
            "gitspace-u-app",
            "dev",
            "/home/dev",
        );
        let logger = RecordingLogger::default();
        VsCodeWebIde::new(Arc::new(ScriptTemplates::new().unwrap()))
            .setup(&exec, &IdeArgs::default(), &logger)
            .await
            .unwrap();

        assert!(logger.contains("Could not copy code-server media"));
        let scripts = scripts.lock().unwrap();
        assert!(scripts.first().unwrap().contains("code-server"));
        assert!(scripts.last().unwrap().contains("bind-addr: 0.0.0.0:8089"));
    }

    #[tokio::test]
    async fn test_run_opens_repository() {
        let mut engine = MockContainerEngine::new();
        engine.expect_exec().times(1).returning(|_, request| {
            assert_eq!(request.user, "dev");
            assert!(request.cmd[2].contains("\"$HOME\"/'app'"));
            Ok(ExecOutput::default())
        });

        let exec = Exec::new(
            Arc::new(engine),
            CancellationToken::new(),
            "gitspace-u-app",
            "dev",
            "/home/dev",
        );
        let args = IdeArgs {
            repo_name: "app".to_string(),
            ..Default::default()
        };
        let logger = RecordingLogger::default();
        VsCodeWebIde::new(Arc::new(ScriptTemplates::new().unwrap()))
            .run(&exec, &args, &logger)
            .await
            .unwrap();
    }
}
