//! IDE strategies: how each IDE is installed, started and reached

pub mod jetbrains;
pub mod ssh;
pub mod vscode;
pub mod vscode_web;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::ide::{GitspacePort, IdeArgs, IdeType};
use crate::error::{Error, Result};
use crate::infra::template::ScriptTemplates;
use crate::service::container::exec::Exec;
use crate::service::logger::GitspaceLogger;

pub use jetbrains::JetBrainsIde;
pub use ssh::SshIde;
pub use vscode::{VsCodeFlavor, VsCodeIde};
pub use vscode_web::VsCodeWebIde;

/// Port SSH based IDEs connect to
pub const SSH_PORT: u16 = 8088;

/// Port code-server listens on
pub const VSCODE_WEB_PORT: u16 = 8089;

#[async_trait]
pub trait IdeService: Send + Sync {
    /// Install the IDE and whatever it needs inside the container
    async fn setup(&self, exec: &Exec, args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()>;

    /// Start the IDE server
    async fn run(&self, exec: &Exec, args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()>;

    fn port(&self) -> GitspacePort;

    fn ide_type(&self) -> IdeType;

    /// URL a user opens to reach the gitspace
    fn generate_url(&self, repo_path: &str, host: &str, port: &str, user: &str) -> String;
}

/// Lookup of IDE strategies by type
#[derive(Clone)]
pub struct IdeFactory {
    services: HashMap<IdeType, Arc<dyn IdeService>>,
}

impl IdeFactory {
    /// Every supported IDE
    pub fn new(templates: Arc<ScriptTemplates>) -> Self {
        let mut services: Vec<Arc<dyn IdeService>> = vec![
            Arc::new(VsCodeWebIde::new(templates.clone())),
            Arc::new(VsCodeIde::new(templates.clone(), VsCodeFlavor::VsCode)),
            Arc::new(VsCodeIde::new(templates.clone(), VsCodeFlavor::Cursor)),
            Arc::new(VsCodeIde::new(templates.clone(), VsCodeFlavor::Windsurf)),
            Arc::new(SshIde::new(templates.clone())),
        ];
        for ide in IdeType::jetbrains() {
            services.push(Arc::new(JetBrainsIde::new(templates.clone(), ide)));
        }
        Self::with_services(services)
    }

    pub fn with_services(services: Vec<Arc<dyn IdeService>>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.ide_type(), s)).collect(),
        }
    }

    pub fn get(&self, ide: IdeType) -> Result<Arc<dyn IdeService>> {
        self.services
            .get(&ide)
            .cloned()
            .ok_or_else(|| Error::UnsupportedIde(ide.to_string()))
    }
}
