//! Desktop VS Code and its forks, connected over Remote SSH

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::ssh::{run_ssh_server, setup_ssh_server, ssh_port};
use super::IdeService;
use crate::domain::ide::{GitspacePort, IdeArgs, IdeType};
use crate::error::Result;
use crate::infra::template::{ScriptTemplates, TEMPLATE_SETUP_VSCODE_EXTENSIONS};
use crate::service::container::exec::Exec;
use crate::service::logger::{log_and_wrap, GitspaceLogger};

/// Which desktop editor the URL opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsCodeFlavor {
    VsCode,
    Cursor,
    Windsurf,
}

impl VsCodeFlavor {
    fn ide_type(self) -> IdeType {
        match self {
            VsCodeFlavor::VsCode => IdeType::VsCode,
            VsCodeFlavor::Cursor => IdeType::Cursor,
            VsCodeFlavor::Windsurf => IdeType::Windsurf,
        }
    }

    fn url_prefix(self) -> &'static str {
        match self {
            VsCodeFlavor::VsCode => "vscode-remote://",
            VsCodeFlavor::Cursor => "cursor://vscode-remote/",
            VsCodeFlavor::Windsurf => "windsurf://vscode-remote/",
        }
    }
}

pub struct VsCodeIde {
    templates: Arc<ScriptTemplates>,
    flavor: VsCodeFlavor,
}

impl VsCodeIde {
    pub fn new(templates: Arc<ScriptTemplates>, flavor: VsCodeFlavor) -> Self {
        Self { templates, flavor }
    }

    async fn setup_extensions(
        &self,
        exec: &Exec,
        args: &IdeArgs,
        logger: &dyn GitspaceLogger,
    ) -> Result<()> {
        if args.vscode_extensions.is_empty() {
            return Ok(());
        }
        let script = self.templates.generate_script(
            TEMPLATE_SETUP_VSCODE_EXTENSIONS,
            &json!({ "extensions": args.vscode_extensions }),
        )?;
        logger.info(&format!(
            "Configuring {} VS Code extension(s)",
            args.vscode_extensions.len()
        ));
        exec.execute_in_home(&script, false)
            .await
            .map_err(|e| log_and_wrap(logger, "Failed to configure VS Code extensions", e))?;
        Ok(())
    }
}

#[async_trait]
impl IdeService for VsCodeIde {
    async fn setup(&self, exec: &Exec, args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()> {
        setup_ssh_server(&self.templates, exec, logger).await?;
        self.setup_extensions(exec, args, logger).await
    }

    async fn run(&self, exec: &Exec, _args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()> {
        run_ssh_server(&self.templates, exec, logger).await
    }

    fn port(&self) -> GitspacePort {
        ssh_port()
    }

    fn ide_type(&self) -> IdeType {
        self.flavor.ide_type()
    }

    fn generate_url(&self, repo_path: &str, host: &str, port: &str, user: &str) -> String {
        format!(
            "{}ssh-remote+{}@{}:{}/{}",
            self.flavor.url_prefix(),
            user,
            host,
            port,
            repo_path.trim_start_matches('/')
        )
    }
}
