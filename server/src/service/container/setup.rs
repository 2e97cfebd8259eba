//! Setup steps run inside a freshly created gitspace container

use futures::FutureExt;
use serde_json::json;

use super::steps::Step;
use crate::domain::container::{LifecycleHooks, PostAction};
use crate::domain::ide::{IdeArgs, IdeType};
use crate::error::{Error, Result};
use crate::infra::scm::{ResolvedCredentials, ResolvedDetails};
use crate::infra::template::{
    ScriptTemplates, TEMPLATE_CLONE_CODE, TEMPLATE_INSTALL_GIT, TEMPLATE_INSTALL_TOOLS,
    TEMPLATE_MANAGE_USER, TEMPLATE_SETUP_GIT_CREDENTIALS, TEMPLATE_SET_ENV,
    TEMPLATE_VALIDATE_SUPPORTED_OS,
};
use crate::service::container::exec::Exec;
use crate::service::ide::IdeService;
use crate::service::logger::{log_and_wrap, GitspaceLogger};

/// Distributions the setup scripts know how to drive
pub const SUPPORTED_OS: &[&str] = &[
    "debian", "ubuntu", "alpine", "centos", "rhel", "fedora", "rocky", "almalinux", "amzn",
];

const COMMON_TOOLS: &[&str] = &["curl", "tar", "gzip"];

/// Commands the IDE needs before it can be installed
pub fn ide_tools(ide: IdeType) -> (Vec<&'static str>, Vec<&'static str>) {
    let mut tools = COMMON_TOOLS.to_vec();
    let mut extra_packages = vec!["ca-certificates"];
    match ide {
        IdeType::VsCodeWeb => extra_packages.push("procps"),
        _ => {
            tools.push("sudo");
            extra_packages.push("procps");
        }
    }
    (tools, extra_packages)
}

async fn run_script(
    exec: &Exec,
    script: &str,
    as_root: bool,
    failure: &str,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let output = exec
        .execute_in_home(script, as_root)
        .await
        .map_err(|e| log_and_wrap(logger, failure, e))?;
    if !output.trim().is_empty() {
        logger.info(output.trim());
    }
    Ok(())
}

pub async fn validate_supported_os(
    templates: &ScriptTemplates,
    exec: &Exec,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let script = templates.generate_script(
        TEMPLATE_VALIDATE_SUPPORTED_OS,
        &json!({ "supported_os": SUPPORTED_OS }),
    )?;
    logger.info("Validating operating system");
    exec.execute_in_home(&script, true)
        .await
        .map(|out| logger.info(out.trim()))
        .map_err(|e| {
            let detail = match &e {
                Error::CommandFailed { stderr, .. } => stderr.clone(),
                other => other.to_string(),
            };
            let err = Error::UnsupportedOs(detail);
            logger.error("Operating system is not supported", &err);
            err
        })
}

pub async fn manage_user(
    templates: &ScriptTemplates,
    exec: &Exec,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let script = templates.generate_script(
        TEMPLATE_MANAGE_USER,
        &json!({
            "username": exec.remote_user,
            "home_dir": exec.default_working_dir,
            "access_type": exec.access_type.as_str(),
            "access_key": exec.access_key,
        }),
    )?;
    logger.info(&format!("Configuring user {}", exec.remote_user));
    run_script(exec, &script, true, "Failed to configure user", logger).await
}

pub async fn set_env(
    templates: &ScriptTemplates,
    exec: &Exec,
    environment: &[String],
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    if environment.is_empty() {
        logger.debug("No environment variables to set");
        return Ok(());
    }
    let script = templates.generate_script(TEMPLATE_SET_ENV, &json!({ "env_variables": environment }))?;
    logger.info(&format!("Setting {} environment variable(s)", environment.len()));
    run_script(exec, &script, true, "Failed to set environment", logger).await
}

pub async fn install_tools(
    templates: &ScriptTemplates,
    exec: &Exec,
    ide: IdeType,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let (tools, extra_packages) = ide_tools(ide);
    let script = templates.generate_script(
        TEMPLATE_INSTALL_TOOLS,
        &json!({ "tools": tools, "extra_packages": extra_packages }),
    )?;
    logger.info(&format!("Installing tools for {}", ide));
    run_script(exec, &script, true, "Failed to install tools", logger).await
}

pub async fn install_git(
    templates: &ScriptTemplates,
    exec: &Exec,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let script = templates.generate_script(TEMPLATE_INSTALL_GIT, &json!({}))?;
    logger.info("Installing git");
    run_script(exec, &script, true, "Failed to install git", logger).await
}

pub async fn setup_git_credentials(
    templates: &ScriptTemplates,
    exec: &Exec,
    clone_url: &str,
    credentials: &ResolvedCredentials,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let script = templates.generate_script(
        TEMPLATE_SETUP_GIT_CREDENTIALS,
        &json!({
            "email": credentials.email,
            "name": credentials.name,
            "user": credentials.user,
            "password": credentials.password,
            "clone_url": clone_url,
        }),
    )?;
    logger.info("Setting up git credentials");
    run_script(exec, &script, false, "Failed to set up git credentials", logger).await
}

pub async fn clone_code(
    templates: &ScriptTemplates,
    exec: &Exec,
    repo: &ResolvedDetails,
    devcontainer_present: bool,
    default_base_image: &str,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    let script = templates.generate_script(
        TEMPLATE_CLONE_CODE,
        &json!({
            "repo_url": repo.clone_url,
            "branch": repo.branch,
            "repo_name": repo.repo_name,
            "devcontainer_present": devcontainer_present,
            "image": default_base_image,
        }),
    )?;
    logger.info(&format!("Cloning {} ({})", repo.repo_name, repo.branch));
    run_script(exec, &script, false, "Failed to clone code", logger).await
}

/// Run lifecycle `commands` one after the other in the repository directory
pub async fn execute_lifecycle_commands(
    exec: &Exec,
    repo_dir: &str,
    commands: &[String],
    action: PostAction,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    if commands.is_empty() {
        logger.debug(&format!("No {} to execute", action));
        return Ok(());
    }
    for command in commands {
        logger.info(&format!("Executing {}: {}", action, command));
        let output = exec
            .execute_command(command, false, false, Some(repo_dir))
            .await
            .map_err(|e| log_and_wrap(logger, &format!("Error executing {}", action), e))?;
        if !output.trim().is_empty() {
            logger.info(output.trim());
        }
    }
    logger.info(&format!("Completed {}", action));
    Ok(())
}

/// Inputs of the setup pipeline of one container
pub struct SetupContext<'a> {
    pub templates: &'a ScriptTemplates,
    pub ide: &'a dyn IdeService,
    pub ide_args: IdeArgs,
    pub repo: &'a ResolvedDetails,
    pub default_base_image: &'a str,
    /// The repository ships its own devcontainer.json
    pub devcontainer_present: bool,
    /// `KEY=value` entries exported for every login shell
    pub environment: Vec<String>,
    pub repo_dir: String,
    pub hooks: LifecycleHooks,
}

/// Steps of a full setup, in execution order
pub fn build_setup_steps<'a>(
    ctx: &'a SetupContext<'a>,
    exec: &'a Exec,
    logger: &'a dyn GitspaceLogger,
) -> Vec<Step<'a>> {
    let templates = ctx.templates;
    let mut steps = vec![
        Step::new(
            "Validate Supported OS",
            true,
            validate_supported_os(templates, exec, logger).boxed(),
        ),
        Step::new("Manage User", true, manage_user(templates, exec, logger).boxed()),
        Step::new(
            "Set environment",
            true,
            set_env(templates, exec, &ctx.environment, logger).boxed(),
        ),
        Step::new(
            "Install Tools",
            true,
            install_tools(templates, exec, ctx.ide.ide_type(), logger).boxed(),
        ),
        Step::new("Install Git", true, install_git(templates, exec, logger).boxed()),
        Step::new(
            "Setup Git Credentials",
            true,
            async move {
                match &ctx.repo.credentials {
                    Some(credentials) => {
                        setup_git_credentials(templates, exec, &ctx.repo.clone_url, credentials, logger)
                            .await
                    }
                    None => Ok(()),
                }
            }
            .boxed(),
        ),
        Step::new(
            "Clone Code",
            true,
            clone_code(
                templates,
                exec,
                ctx.repo,
                ctx.devcontainer_present,
                ctx.default_base_image,
                logger,
            )
            .boxed(),
        ),
        Step::new("Setup IDE", true, ctx.ide.setup(exec, &ctx.ide_args, logger)),
        Step::new("Run IDE", true, ctx.ide.run(exec, &ctx.ide_args, logger)),
    ];

    for action in [PostAction::PostCreate, PostAction::PostStart] {
        for hook in ctx.hooks.get(&action).into_iter().flatten() {
            steps.push(Step::new(
                format!("Execute {} from {}", action, hook.source),
                hook.stop_on_failure,
                async move {
                    let commands = hook.command.to_command_array();
                    execute_lifecycle_commands(exec, &ctx.repo_dir, &commands, action, logger).await
                }
                .boxed(),
            ));
        }
    }
    steps
}
