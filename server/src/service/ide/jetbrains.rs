//! JetBrains IDE backends reached through JetBrains Gateway

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use super::ssh::{run_ssh_server, setup_ssh_server, ssh_port};
use super::IdeService;
use crate::domain::container::user_home_dir;
use crate::domain::ide::{GitspacePort, IdeArgs, IdeType};
use crate::error::Result;
use crate::infra::template::{
    ScriptTemplates, TEMPLATE_RUN_JETBRAINS_IDE, TEMPLATE_SETUP_JETBRAINS_IDE,
    TEMPLATE_SETUP_JETBRAINS_PLUGINS,
};
use crate::service::container::exec::Exec;
use crate::service::logger::{log_and_wrap, GitspaceLogger};

const DOWNLOAD_BASE: &str = "https://download.jetbrains.com";
const BACKEND_VERSION: &str = "2024.3";

/// Name, install directory and tarball path of one backend
struct Backend {
    name: &'static str,
    dir_name: &'static str,
    /// Path under the download host without the `.tar.gz` suffix
    archive: &'static str,
}

fn backend(ide: IdeType) -> Backend {
    let (name, dir_name, archive) = match ide {
        IdeType::Pycharm => ("PyCharm", "pycharm", "python/pycharm-professional"),
        IdeType::Goland => ("GoLand", "goland", "go/goland"),
        IdeType::Webstorm => ("WebStorm", "webstorm", "webstorm/WebStorm"),
        IdeType::Clion => ("CLion", "clion", "cpp/CLion"),
        IdeType::Phpstorm => ("PhpStorm", "phpstorm", "webide/PhpStorm"),
        IdeType::Rubymine => ("RubyMine", "rubymine", "ruby/RubyMine"),
        IdeType::Rider => ("Rider", "rider", "rider/JetBrains.Rider"),
        _ => ("IntelliJ IDEA", "intellij", "idea/ideaIU"),
    };
    Backend {
        name,
        dir_name,
        archive,
    }
}

#[derive(Debug, Serialize)]
struct IdePayload<'a> {
    ide_dir_name: &'a str,
    ide_name: &'a str,
    download_url_amd64: String,
    download_url_arm64: String,
}

pub struct JetBrainsIde {
    templates: Arc<ScriptTemplates>,
    ide: IdeType,
}

impl JetBrainsIde {
    pub fn new(templates: Arc<ScriptTemplates>, ide: IdeType) -> Self {
        Self { templates, ide }
    }

    fn payload(&self, args: &IdeArgs) -> IdePayload<'static> {
        let backend = backend(self.ide);
        let (amd64, arm64) = match args.jetbrains_download_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => (url.to_string(), url.to_string()),
            None => (
                format!("{}/{}-{}.tar.gz", DOWNLOAD_BASE, backend.archive, BACKEND_VERSION),
                format!(
                    "{}/{}-{}-aarch64.tar.gz",
                    DOWNLOAD_BASE, backend.archive, BACKEND_VERSION
                ),
            ),
        };
        IdePayload {
            ide_dir_name: backend.dir_name,
            ide_name: backend.name,
            download_url_amd64: amd64,
            download_url_arm64: arm64,
        }
    }

    async fn run_script(
        &self,
        exec: &Exec,
        script: &str,
        failure: &str,
        logger: &dyn GitspaceLogger,
    ) -> Result<()> {
        let output = exec
            .execute_in_home(script, false)
            .await
            .map_err(|e| log_and_wrap(logger, failure, e))?;
        logger.debug(output.trim());
        Ok(())
    }
}

#[async_trait]
impl IdeService for JetBrainsIde {
    async fn setup(&self, exec: &Exec, args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()> {
        setup_ssh_server(&self.templates, exec, logger).await?;

        let payload = self.payload(args);
        logger.info(&format!("Installing {} backend", payload.ide_name));
        let script = self
            .templates
            .generate_script(TEMPLATE_SETUP_JETBRAINS_IDE, &payload)?;
        self.run_script(exec, &script, "Failed to install JetBrains backend", logger)
            .await?;

        if !args.jetbrains_plugins.is_empty() {
            let script = self.templates.generate_script(
                TEMPLATE_SETUP_JETBRAINS_PLUGINS,
                &json!({
                    "ide_dir_name": payload.ide_dir_name,
                    "plugins": args.jetbrains_plugins,
                    "repo_name": args.repo_name,
                }),
            )?;
            self.run_script(exec, &script, "Failed to install JetBrains plugins", logger)
                .await?;
        }
        Ok(())
    }

    async fn run(&self, exec: &Exec, args: &IdeArgs, logger: &dyn GitspaceLogger) -> Result<()> {
        run_ssh_server(&self.templates, exec, logger).await?;

        let payload = self.payload(args);
        let script = self.templates.generate_script(
            TEMPLATE_RUN_JETBRAINS_IDE,
            &json!({
                "ide_dir_name": payload.ide_dir_name,
                "ide_name": payload.ide_name,
            }),
        )?;
        self.run_script(exec, &script, "Failed to register JetBrains backend", logger)
            .await
    }

    fn port(&self) -> GitspacePort {
        ssh_port()
    }

    fn ide_type(&self) -> IdeType {
        self.ide
    }

    fn generate_url(&self, repo_path: &str, host: &str, port: &str, user: &str) -> String {
        let ide_path = format!(
            "{}/.cache/JetBrains/RemoteDev/dist/{}",
            user_home_dir(user),
            backend(self.ide).dir_name
        );
        format!(
            "jetbrains-gateway://connect#idePath={}&projectPath={}&host={}&port={}&user={}&type=ssh&deploy=false",
            ide_path, repo_path, host, port, user
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

    fn ide(kind: IdeType) -> JetBrainsIde {
        JetBrainsIde::new(Arc::new(ScriptTemplates::new().unwrap()), kind)
    }

    #[test]
    fn test_default_download_urls() {
        let payload = ide(IdeType::Goland).payload(&IdeArgs::default());
        assert_eq!(payload.ide_dir_name, "goland");
        assert_eq!(
            payload.download_url_amd64,
            "https://download.jetbrains.com/go/goland-2024.3.tar.gz"
        );
        assert_eq!(
            payload.download_url_arm64,
            "https://download.jetbrains.com/go/goland-2024.3-aarch64.tar.gz"
        );
    }

    #[test]
    fn test_download_url_override() {
        let args = IdeArgs {
            jetbrains_download_url: Some("https://mirror.internal/pycharm.tar.gz".to_string()),
            ..Default::default()
        };
        let payload = ide(IdeType::Pycharm).payload(&args);
        assert_eq!(payload.download_url_amd64, "https://mirror.internal/pycharm.tar.gz");
        assert_eq!(payload.download_url_arm64, "https://mirror.internal/pycharm.tar.gz");
    }

    #[tokio::test]
    async fn test_setup_installs_backend_and_plugins() {
        let scripts = Arc::new(Mutex::new(Vec::new()));
        let recorded = scripts.clone();
        let mut engine = MockContainerEngine::new();
        engine.expect_exec().times(3).returning(move |_, request| {
            recorded.lock().unwrap().push(request.cmd[2].clone());
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
            jetbrains_plugins: vec!["org.rust.lang".to_string()],
            ..Default::default()
        };
        let logger = RecordingLogger::default();
        ide(IdeType::Rider).setup(&exec, &args, &logger).await.unwrap();

        let scripts = scripts.lock().unwrap();
        assert!(scripts[1].contains("RemoteDev/dist/rider"));
        assert!(scripts[1].contains("JetBrains.Rider-2024.3.tar.gz"));
        assert!(scripts[2].contains("installPlugins"));
        assert!(scripts[2].contains("'org.rust.lang'"));
    }
}
