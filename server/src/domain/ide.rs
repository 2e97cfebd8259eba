//! IDE types and ports

use serde::{Deserialize, Serialize};

/// IDE a gitspace is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeType {
    VsCode,
    VsCodeWeb,
    Intellij,
    Pycharm,
    Goland,
    Webstorm,
    Clion,
    Phpstorm,
    Rubymine,
    Rider,
    Cursor,
    Windsurf,
    /// Plain SSH access without an editor
    Ssh,
}

impl IdeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdeType::VsCode => "vs_code",
            IdeType::VsCodeWeb => "vs_code_web",
            IdeType::Intellij => "intellij",
            IdeType::Pycharm => "pycharm",
            IdeType::Goland => "goland",
            IdeType::Webstorm => "webstorm",
            IdeType::Clion => "clion",
            IdeType::Phpstorm => "phpstorm",
            IdeType::Rubymine => "rubymine",
            IdeType::Rider => "rider",
            IdeType::Cursor => "cursor",
            IdeType::Windsurf => "windsurf",
            IdeType::Ssh => "ssh",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "vs_code" => Some(IdeType::VsCode),
            "vs_code_web" => Some(IdeType::VsCodeWeb),
            "intellij" => Some(IdeType::Intellij),
            "pycharm" => Some(IdeType::Pycharm),
            "goland" => Some(IdeType::Goland),
            "webstorm" => Some(IdeType::Webstorm),
            "clion" => Some(IdeType::Clion),
            "phpstorm" => Some(IdeType::Phpstorm),
            "rubymine" => Some(IdeType::Rubymine),
            "rider" => Some(IdeType::Rider),
            "cursor" => Some(IdeType::Cursor),
            "windsurf" => Some(IdeType::Windsurf),
            "ssh" => Some(IdeType::Ssh),
            _ => None,
        }
    }

    /// All JetBrains family members
    pub fn jetbrains() -> [IdeType; 8] {
        [
            IdeType::Intellij,
            IdeType::Pycharm,
            IdeType::Goland,
            IdeType::Webstorm,
            IdeType::Clion,
            IdeType::Phpstorm,
            IdeType::Rubymine,
            IdeType::Rider,
        ]
    }

    pub fn is_jetbrains(&self) -> bool {
        Self::jetbrains().contains(self)
    }
}

impl std::fmt::Display for IdeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol served on an IDE port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortProtocol {
    Http,
    Ssh,
}

/// Port an IDE listens on inside the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitspacePort {
    pub port: u16,
    pub protocol: PortProtocol,
}

/// Arguments handed to IDE setup and run
#[derive(Debug, Clone, Default)]
pub struct IdeArgs {
    pub repo_name: String,
    /// VS Code extensions from `customizations.vscode.extensions`
    pub vscode_extensions: Vec<String>,
    /// JetBrains plugins from `customizations.jetbrains.plugins`
    pub jetbrains_plugins: Vec<String>,
    /// Optional override of the JetBrains backend download URL
    pub jetbrains_download_url: Option<String>,
}
