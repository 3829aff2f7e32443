//! Repository analysis snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use deploy_api::InstallOption;

/// JavaScript package manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
        }
    }

    pub fn install_command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm install",
            PackageManager::Yarn => "yarn install",
            PackageManager::Pnpm => "pnpm install",
        }
    }

    /// `npm run <script>` / `yarn <script>` / `pnpm <script>`
    pub fn run_command(&self, script: &str) -> String {
        match self {
            PackageManager::Npm => format!("npm run {}", script),
            PackageManager::Yarn => format!("yarn {}", script),
            PackageManager::Pnpm => format!("pnpm {}", script),
        }
    }

    pub fn all() -> [PackageManager; 3] {
        [PackageManager::Npm, PackageManager::Yarn, PackageManager::Pnpm]
    }
}

/// Frontend or server framework detected from package.json dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeFramework {
    Next,
    Nuxt,
    React,
    Vue,
    SvelteKit,
    Svelte,
    Angular,
    Vite,
    Express,
}

impl NodeFramework {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeFramework::Next => "next",
            NodeFramework::Nuxt => "nuxt",
            NodeFramework::React => "react",
            NodeFramework::Vue => "vue",
            NodeFramework::SvelteKit => "sveltekit",
            NodeFramework::Svelte => "svelte",
            NodeFramework::Angular => "angular",
            NodeFramework::Vite => "vite",
            NodeFramework::Express => "express",
        }
    }

    /// Port the framework's dev/prod server listens on out of the box
    pub fn default_port(&self) -> u16 {
        match self {
            NodeFramework::Next | NodeFramework::Nuxt | NodeFramework::React => 3000,
            NodeFramework::Express => 3000,
            NodeFramework::Vue | NodeFramework::Svelte | NodeFramework::SvelteKit => 5173,
            NodeFramework::Vite => 5173,
            NodeFramework::Angular => 4200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PythonFramework {
    Django,
    Flask,
    FastApi,
}

impl PythonFramework {
    pub fn as_str(&self) -> &'static str {
        match self {
            PythonFramework::Django => "django",
            PythonFramework::Flask => "flask",
            PythonFramework::FastApi => "fastapi",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            PythonFramework::Django | PythonFramework::FastApi => 8000,
            PythonFramework::Flask => 5000,
        }
    }
}

/// What kind of project the repository holds, with the facts each kind
/// needs to produce install options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProjectType {
    Node {
        framework: Option<NodeFramework>,
        package_manager: PackageManager,
        typescript: bool,
    },
    Rust {
        binary: Option<String>,
    },
    Go {
        module: String,
    },
    Python {
        framework: Option<PythonFramework>,
        entrypoint: Option<String>,
    },
    Docker {
        compose: bool,
    },
    Scripts {
        install_script: Option<String>,
        deploy_script: Option<String>,
    },
    Unknown,
}

impl ProjectType {
    pub fn language(&self) -> &'static str {
        match self {
            ProjectType::Node { typescript: true, .. } => "typescript",
            ProjectType::Node { .. } => "javascript",
            ProjectType::Rust { .. } => "rust",
            ProjectType::Go { .. } => "go",
            ProjectType::Python { .. } => "python",
            ProjectType::Docker { .. } => "docker",
            ProjectType::Scripts { .. } => "shell",
            ProjectType::Unknown => "unknown",
        }
    }

    pub fn framework(&self) -> Option<&'static str> {
        match self {
            ProjectType::Node { framework, .. } => framework.map(|f| f.as_str()),
            ProjectType::Python { framework, .. } => framework.map(|f| f.as_str()),
            ProjectType::Docker { compose: true } => Some("docker-compose"),
            _ => None,
        }
    }
}

/// Result of inspecting a repository's manifest files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryAnalysis {
    pub project_type: ProjectType,
    pub language: String,
    pub framework: Option<String>,
    pub install_options: Vec<InstallOption>,
    /// Manifest files that were found
    #[serde(default)]
    pub detected_files: Vec<String>,
    pub analyzed_branch: String,
    pub analyzed_at: DateTime<Utc>,
}

impl RepositoryAnalysis {
    pub fn recommended_option(&self) -> Option<&InstallOption> {
        self.install_options
            .iter()
            .find(|option| option.is_recommended)
            .or_else(|| self.install_options.first())
    }

    pub fn option_named(&self, name: &str) -> Option<&InstallOption> {
        self.install_options.iter().find(|option| option.name == name)
    }
}
