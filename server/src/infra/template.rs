//! Script template registry
//!
//! Every setup script executed inside a gitspace container is rendered from
//! one of the templates embedded below. The registry is built once at startup
//! and shared read-only afterwards.

use std::collections::HashMap;

use serde::Serialize;
use tera::{Context, Tera, Value};

use crate::error::{Error, Result};

pub const TEMPLATE_VALIDATE_SUPPORTED_OS: &str = "validate_supported_os.sh";
pub const TEMPLATE_MANAGE_USER: &str = "manage_user.sh";
pub const TEMPLATE_SET_ENV: &str = "set_env.sh";
pub const TEMPLATE_INSTALL_TOOLS: &str = "install_tools.sh";
pub const TEMPLATE_INSTALL_GIT: &str = "install_git.sh";
pub const TEMPLATE_SETUP_GIT_CREDENTIALS: &str = "setup_git_credentials.sh";
pub const TEMPLATE_CLONE_CODE: &str = "clone_code.sh";
pub const TEMPLATE_SETUP_SSH_SERVER: &str = "setup_ssh_server.sh";
pub const TEMPLATE_RUN_SSH_SERVER: &str = "run_ssh_server.sh";
pub const TEMPLATE_SETUP_VSCODE_EXTENSIONS: &str = "setup_vscode_extensions.sh";
pub const TEMPLATE_INSTALL_VSCODE_WEB: &str = "install_vscode_web.sh";
pub const TEMPLATE_SETUP_VSCODE_WEB: &str = "setup_vscode_web.sh";
pub const TEMPLATE_RUN_VSCODE_WEB: &str = "run_vscode_web.sh";
pub const TEMPLATE_SETUP_JETBRAINS_IDE: &str = "setup_jetbrains_ide.sh";
pub const TEMPLATE_SETUP_JETBRAINS_PLUGINS: &str = "setup_jetbrains_plugins.sh";
pub const TEMPLATE_RUN_JETBRAINS_IDE: &str = "run_jetbrains_ide.sh";
pub const TEMPLATE_FEATURES_DOCKERFILE: &str = "features.Dockerfile";

const EMBEDDED_TEMPLATES: &[(&str, &str)] = &[
    ("_package_manager.sh", include_str!("../../templates/_package_manager.sh")),
    (TEMPLATE_VALIDATE_SUPPORTED_OS, include_str!("../../templates/validate_supported_os.sh")),
    (TEMPLATE_MANAGE_USER, include_str!("../../templates/manage_user.sh")),
    (TEMPLATE_SET_ENV, include_str!("../../templates/set_env.sh")),
    (TEMPLATE_INSTALL_TOOLS, include_str!("../../templates/install_tools.sh")),
    (TEMPLATE_INSTALL_GIT, include_str!("../../templates/install_git.sh")),
    (TEMPLATE_SETUP_GIT_CREDENTIALS, include_str!("../../templates/setup_git_credentials.sh")),
    (TEMPLATE_CLONE_CODE, include_str!("../../templates/clone_code.sh")),
    (TEMPLATE_SETUP_SSH_SERVER, include_str!("../../templates/setup_ssh_server.sh")),
    (TEMPLATE_RUN_SSH_SERVER, include_str!("../../templates/run_ssh_server.sh")),
    (TEMPLATE_SETUP_VSCODE_EXTENSIONS, include_str!("../../templates/setup_vscode_extensions.sh")),
    (TEMPLATE_INSTALL_VSCODE_WEB, include_str!("../../templates/install_vscode_web.sh")),
    (TEMPLATE_SETUP_VSCODE_WEB, include_str!("../../templates/setup_vscode_web.sh")),
    (TEMPLATE_RUN_VSCODE_WEB, include_str!("../../templates/run_vscode_web.sh")),
    (TEMPLATE_SETUP_JETBRAINS_IDE, include_str!("../../templates/setup_jetbrains_ide.sh")),
    (TEMPLATE_SETUP_JETBRAINS_PLUGINS, include_str!("../../templates/setup_jetbrains_plugins.sh")),
    (TEMPLATE_RUN_JETBRAINS_IDE, include_str!("../../templates/run_jetbrains_ide.sh")),
    (TEMPLATE_FEATURES_DOCKERFILE, include_str!("../../templates/features.Dockerfile")),
];

/// Quote a value for safe interpolation into a POSIX shell script
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn shell_quote_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(Value::String(shell_quote(&raw)))
}

/// Immutable set of named script templates
pub struct ScriptTemplates {
    tera: Tera,
}

impl ScriptTemplates {
    /// Load the embedded template set
    pub fn new() -> Result<Self> {
        Self::from_templates(EMBEDDED_TEMPLATES)
    }

    /// Build a registry from explicit `(name, source)` pairs
    pub fn from_templates(templates: &[(&str, &str)]) -> Result<Self> {
        let mut tera = Tera::default();
        tera.register_filter("shell_quote", shell_quote_filter);
        tera.add_raw_templates(templates.iter().copied())
            .map_err(|e| Error::TemplateRender {
                name: "registry".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { tera })
    }

    /// Render the template `name` with `payload`
    pub fn generate_script<P: Serialize>(&self, name: &str, payload: &P) -> Result<String> {
        if !self.tera.get_template_names().any(|n| n == name) {
            return Err(Error::TemplateNotFound(name.to_string()));
        }

        let context = Context::from_serialize(payload).map_err(|e| Error::TemplateRender {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        self.tera.render(name, &context).map_err(|e| {
            let reason = match std::error::Error::source(&e) {
                Some(source) => format!("{}: {}", e, source),
                None => e.to_string(),
            };
            Error::TemplateRender {
                name: name.to_string(),
                reason,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_embedded_templates_load() {
        let templates = ScriptTemplates::new().expect("embedded templates must parse");
        let script = templates
            .generate_script(TEMPLATE_RUN_SSH_SERVER, &json!({ "port": 8088 }))
            .unwrap();
        assert!(script.contains("-p 8088"));
    }

    #[test]
    fn test_unknown_template() {
        let templates = ScriptTemplates::new().unwrap();
        let err = templates
            .generate_script("missing.sh", &json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(_)));
    }

    #[test]
    fn test_missing_payload_field_fails() {
        let templates = ScriptTemplates::new().unwrap();
        let err = templates
            .generate_script(TEMPLATE_RUN_SSH_SERVER, &json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::TemplateRender { .. }));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");

        let templates = ScriptTemplates::from_templates(&[("t.sh", "echo {{ v | shell_quote }}")])
            .unwrap();
        assert_eq!(
            templates.generate_script("t.sh", &json!({ "v": "a b" })).unwrap(),
            "echo 'a b'"
        );
    }

    #[test]
    fn test_manage_user_renders_access_branch() {
        let templates = ScriptTemplates::new().unwrap();
        let script = templates
            .generate_script(
                TEMPLATE_MANAGE_USER,
                &json!({
                    "username": "gitspace",
                    "home_dir": "/home/gitspace",
                    "access_type": "ssh_key",
                    "access_key": "ssh-ed25519 AAAA",
                }),
            )
            .unwrap();
        assert!(script.contains("authorized_keys"));
        assert!(!script.contains("chpasswd"));
    }
}
