//! Repository analysis: infer project type and install options from
//! manifest files fetched through the GitHub contents API

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::DeploydError;
use crate::github::client::RepositoryHost;
use crate::models::analysis::{
    InstallOption, NodeFramework, PackageManager, ProjectType, PythonFramework, RepositoryAnalysis,
};

/// Port used when nothing else says otherwise
pub const FALLBACK_PORT: u16 = 3000;

pub const MANIFEST_FILES: &[&str] = &[
    "package.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.toml",
    "go.mod",
    "requirements.txt",
    "pyproject.toml",
    "Dockerfile",
    "docker-compose.yml",
    ".env.example",
    "README.md",
    "install.sh",
    "deploy.sh",
];

/// Manifest files found in a repository, by path
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    files: BTreeMap<String, String>,
}

impl ManifestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<String>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn with(mut self, path: &str, contents: &str) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

/// Fetch every known manifest at `git_ref`. Missing files are skipped.
pub async fn fetch_manifests(
    host: &dyn RepositoryHost,
    full_name: &str,
    git_ref: &str,
    token: Option<&SecretString>,
) -> Result<ManifestSet, DeploydError> {
    let fetches = MANIFEST_FILES
        .iter()
        .map(|path| async move { (*path, host.file(full_name, git_ref, path, token).await) });

    let mut manifests = ManifestSet::new();
    for (path, result) in join_all(fetches).await {
        if let Some(contents) = result? {
            manifests.insert(path, contents);
        }
    }
    debug!(full_name, git_ref, found = ?manifests.paths(), "manifests fetched");
    Ok(manifests)
}

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    main: Option<String>,
    #[serde(default, rename = "packageManager")]
    package_manager: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: BTreeMap<String, serde_json::Value>,
}

impl PackageJson {
    fn depends_on(&self, name: &str) -> bool {
        self.dependencies.contains_key(name) || self.dev_dependencies.contains_key(name)
    }
}

fn parse_package_json(contents: &str) -> anyhow::Result<PackageJson> {
    serde_json::from_str(contents).context("package.json is not valid JSON")
}

fn cargo_binary(contents: &str) -> anyhow::Result<Option<String>> {
    let manifest: toml::Value = toml::from_str(contents).context("Cargo.toml is not valid TOML")?;
    let bin = manifest
        .get("bin")
        .and_then(|b| b.as_array())
        .and_then(|bins| bins.first())
        .and_then(|b| b.get("name"))
        .and_then(|n| n.as_str());
    let package = manifest
        .get("package")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str());
    Ok(bin.or(package).map(str::to_string))
}

fn go_module(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("module "))
        .map(|m| m.trim().to_string())
}

fn node_framework(package: &PackageJson) -> Option<NodeFramework> {
    [
        ("next", NodeFramework::Next),
        ("nuxt", NodeFramework::Nuxt),
        ("@sveltejs/kit", NodeFramework::SvelteKit),
        ("@angular/core", NodeFramework::Angular),
        ("vite", NodeFramework::Vite),
        ("svelte", NodeFramework::Svelte),
        ("vue", NodeFramework::Vue),
        ("react", NodeFramework::React),
        ("express", NodeFramework::Express),
    ]
    .into_iter()
    .find(|(dep, _)| package.depends_on(dep))
    .map(|(_, framework)| framework)
}

fn package_manager(manifests: &ManifestSet, package: &PackageJson) -> PackageManager {
    if manifests.contains("pnpm-lock.yaml") {
        return PackageManager::Pnpm;
    }
    if manifests.contains("yarn.lock") {
        return PackageManager::Yarn;
    }
    match package.package_manager.as_deref() {
        Some(pm) if pm.starts_with("pnpm") => PackageManager::Pnpm,
        Some(pm) if pm.starts_with("yarn") => PackageManager::Yarn,
        _ => PackageManager::Npm,
    }
}

fn python_framework(manifests: &ManifestSet) -> Option<PythonFramework> {
    let requirements = [manifests.get("requirements.txt"), manifests.get("pyproject.toml")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();
    [
        ("django", PythonFramework::Django),
        ("fastapi", PythonFramework::FastApi),
        ("flask", PythonFramework::Flask),
    ]
    .into_iter()
    .find(|(name, _)| requirements.contains(name))
    .map(|(_, framework)| framework)
}

/// `.env.example` `PORT=`, then a `port: N` mention in the README
fn declared_port(manifests: &ManifestSet) -> Option<u16> {
    let env_port = Regex::new(r#"(?m)^\s*(?:export\s+)?PORT\s*=\s*["']?(\d{2,5})"#).ok()?;
    let readme_port = Regex::new(r"(?i)\bport\s*:?\s*(\d{2,5})\b").ok()?;

    let from = |re: &Regex, file: &str| {
        manifests
            .get(file)
            .and_then(|contents| re.captures(contents))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|p| *p > 0)
    };
    from(&env_port, ".env.example").or_else(|| from(&readme_port, "README.md"))
}

fn detect_project_type(manifests: &ManifestSet) -> ProjectType {
    if let Some(contents) = manifests.get("package.json") {
        let package = parse_package_json(contents).unwrap_or_else(|e| {
            warn!("{:#}", e);
            PackageJson::default()
        });
        return ProjectType::Node {
            framework: node_framework(&package),
            package_manager: package_manager(manifests, &package),
            typescript: package.depends_on("typescript"),
        };
    }
    if let Some(contents) = manifests.get("Cargo.toml") {
        let binary = cargo_binary(contents).unwrap_or_else(|e| {
            warn!("{:#}", e);
            None
        });
        return ProjectType::Rust { binary };
    }
    if let Some(contents) = manifests.get("go.mod") {
        return ProjectType::Go {
            module: go_module(contents).unwrap_or_default(),
        };
    }
    if manifests.contains("requirements.txt") || manifests.contains("pyproject.toml") {
        let framework = python_framework(manifests);
        let entrypoint = match framework {
            Some(PythonFramework::Django) => Some("manage.py".to_string()),
            Some(PythonFramework::FastApi) => Some("main:app".to_string()),
            Some(PythonFramework::Flask) => Some("app.py".to_string()),
            None => None,
        };
        return ProjectType::Python { framework, entrypoint };
    }
    if manifests.contains("docker-compose.yml") || manifests.contains("Dockerfile") {
        return ProjectType::Docker {
            compose: manifests.contains("docker-compose.yml"),
        };
    }
    if manifests.contains("install.sh") || manifests.contains("deploy.sh") {
        return ProjectType::Scripts {
            install_script: manifests.contains("install.sh").then(|| "install.sh".to_string()),
            deploy_script: manifests.contains("deploy.sh").then(|| "deploy.sh".to_string()),
        };
    }
    ProjectType::Unknown
}

fn option(name: &str, description: &str, build: String, start: String, port: u16) -> InstallOption {
    InstallOption {
        name: name.to_string(),
        description: description.to_string(),
        build_command: build,
        start_command: start,
        port: Some(port),
        is_recommended: false,
        environment: BTreeMap::new(),
    }
}

fn node_options(manifests: &ManifestSet, primary: PackageManager, port: u16) -> Vec<InstallOption> {
    let package = manifests
        .get("package.json")
        .and_then(|c| parse_package_json(c).ok())
        .unwrap_or_default();

    let mut managers = vec![primary];
    managers.extend(PackageManager::all().into_iter().filter(|pm| *pm != primary));

    managers
        .into_iter()
        .map(|pm| {
            let build = if package.scripts.contains_key("build") {
                format!("{} && {}", pm.install_command(), pm.run_command("build"))
            } else {
                pm.install_command().to_string()
            };
            let start = if package.scripts.contains_key("start") {
                pm.run_command("start")
            } else if package.scripts.contains_key("preview") {
                format!("{} -- --host 0.0.0.0 --port {}", pm.run_command("preview"), port)
            } else {
                format!("node {}", package.main.as_deref().unwrap_or("index.js"))
            };
            let mut node = option(pm.as_str(), &format!("Install and run with {}", pm.as_str()), build, start, port);
            node.environment.insert("NODE_ENV".to_string(), "production".to_string());
            node
        })
        .collect()
}

fn language_options(project_type: &ProjectType, manifests: &ManifestSet, port: u16) -> Vec<InstallOption> {
    match project_type {
        ProjectType::Node { package_manager, .. } => node_options(manifests, *package_manager, port),
        ProjectType::Rust { binary } => {
            let binary = binary.clone().unwrap_or_else(|| "app".to_string());
            vec![option(
                "cargo",
                "Release build with cargo",
                "cargo build --release".to_string(),
                format!("./target/release/{}", binary),
                port,
            )]
        }
        ProjectType::Go { .. } => vec![option(
            "go",
            "Build a static binary with go build",
            "go build -o app .".to_string(),
            "./app".to_string(),
            port,
        )],
        ProjectType::Python { framework, .. } => {
            let install = if manifests.contains("requirements.txt") {
                "pip install -r requirements.txt"
            } else {
                "pip install ."
            };
            let start = match framework {
                Some(PythonFramework::Django) => format!("python manage.py runserver 0.0.0.0:{}", port),
                Some(PythonFramework::FastApi) => format!("uvicorn main:app --host 0.0.0.0 --port {}", port),
                Some(PythonFramework::Flask) => format!("flask run --host 0.0.0.0 --port {}", port),
                None => "python main.py".to_string(),
            };
            vec![option("pip", "Install with pip", install.to_string(), start, port)]
        }
        _ => Vec::new(),
    }
}

/// Options in priority order: custom scripts, compose, Dockerfile, language
/// package managers, then a custom fallback. The first is recommended.
fn install_options(project_type: &ProjectType, manifests: &ManifestSet, app_name: &str, port: u16) -> Vec<InstallOption> {
    let mut options = Vec::new();
    let language = language_options(project_type, manifests, port);

    if manifests.contains("deploy.sh") {
        let build = if manifests.contains("install.sh") {
            "bash install.sh".to_string()
        } else {
            String::new()
        };
        options.push(option("scripts", "Repository install/deploy scripts", build, "bash deploy.sh".to_string(), port));
    } else if manifests.contains("install.sh") {
        if let Some(first) = language.first() {
            options.push(option(
                "scripts",
                "Repository install script",
                "bash install.sh".to_string(),
                first.start_command.clone(),
                port,
            ));
        }
    }
    if manifests.contains("docker-compose.yml") {
        options.push(option(
            "docker-compose",
            "Build and run with docker compose",
            "docker compose build".to_string(),
            "docker compose up".to_string(),
            port,
        ));
    }
    if manifests.contains("Dockerfile") {
        options.push(option(
            "docker",
            "Build and run the Dockerfile",
            format!("docker build -t {} .", app_name),
            format!("docker run --rm --name {name} -p {port}:{port} {name}", name = app_name, port = port),
            port,
        ));
    }
    options.extend(language);
    options.push(option(
        "custom",
        "Provide your own commands",
        String::new(),
        "bash start.sh".to_string(),
        port,
    ));

    if let Some(first) = options.first_mut() {
        first.is_recommended = true;
    }
    options
}

/// Apply the heuristics to fetched manifests
pub fn analyze(manifests: &ManifestSet, app_name: &str, branch: &str) -> RepositoryAnalysis {
    let project_type = detect_project_type(manifests);
    let framework_port = match &project_type {
        ProjectType::Node { framework: Some(f), .. } => Some(f.default_port()),
        ProjectType::Python { framework: Some(f), .. } => Some(f.default_port()),
        _ => None,
    };
    let port = declared_port(manifests).or(framework_port).unwrap_or(FALLBACK_PORT);
    let docker_name = app_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>();

    RepositoryAnalysis {
        language: project_type.language().to_string(),
        framework: project_type.framework().map(str::to_string),
        install_options: install_options(&project_type, manifests, &docker_name, port),
        detected_files: manifests.paths(),
        project_type,
        analyzed_branch: branch.to_string(),
        analyzed_at: Utc::now(),
    }
}
