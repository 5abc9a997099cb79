//! Starter configuration generation for `devrack init`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CONFIG_FILE_NAME;

/// Monorepo directories scanned when the root itself is not a project.
const PROJECT_DIRS: &[&str] = &["apps", "packages", "services", "src"];
const COLORS: &[&str] = &["blue", "green", "magenta", "cyan", "yellow", "red"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedService {
    pub name: String,
    /// Relative to the configuration root, `/`-separated.
    pub dir: String,
    pub cmd: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
struct StarterConfig {
    defaults: Vec<String>,
    services: BTreeMap<String, StarterService>,
}

#[derive(Debug, Serialize)]
struct StarterService {
    dir: String,
    cmd: String,
    port: u16,
    color: String,
    icon: String,
}

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// Writes a starter `devrack.toml` into `root`. Never overwrites.
pub fn write_starter_config(root: &Path) -> Result<(PathBuf, Vec<DetectedService>)> {
    let path = root.join(CONFIG_FILE_NAME);
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let services = detect_services(root);
    let contents = render(&services)?;
    fs::write(&path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    Ok((path, services))
}

/// Finds runnable projects in `root` or its usual monorepo folders.
///
/// Falls back to a single sample service when nothing is recognised.
pub fn detect_services(root: &Path) -> Vec<DetectedService> {
    if let Some((cmd, port)) = detect_project(root) {
        return vec![DetectedService {
            name: "app".to_string(),
            dir: ".".to_string(),
            cmd: cmd.to_string(),
            port,
        }];
    }

    let mut services: Vec<DetectedService> = Vec::new();
    for parent in PROJECT_DIRS {
        for dir in subdirectories(&root.join(parent)) {
            let Some((cmd, port)) = detect_project(&dir) else {
                continue;
            };
            let Some(name) = dir.file_name().map(|name| name.to_string_lossy().to_string()) else {
                continue;
            };
            if services.iter().any(|svc| svc.name == name) {
                warn!(service = %name, dir = %dir.display(), "skipping duplicate project name");
                continue;
            }
            services.push(DetectedService {
                dir: format!("{parent}/{name}"),
                name,
                cmd: cmd.to_string(),
                port,
            });
        }
    }

    if services.is_empty() {
        debug!("no projects detected, writing a sample service");
        services.push(DetectedService {
            name: "app".to_string(),
            dir: ".".to_string(),
            cmd: "npm run dev".to_string(),
            port: 3000,
        });
    }
    services
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Command and usual port for a recognised project directory.
fn detect_project(dir: &Path) -> Option<(&'static str, u16)> {
    if let Ok(raw) = fs::read_to_string(dir.join("package.json")) {
        let has_dev = serde_json::from_str::<PackageJson>(&raw)
            .map(|pkg| pkg.scripts.contains_key("dev"))
            .unwrap_or(false);
        if has_dev {
            return Some(("npm run dev", 3000));
        }
    }
    if dir.join("go.mod").is_file() {
        return Some(("go run .", 8080));
    }
    if dir.join("Cargo.toml").is_file() {
        return Some(("cargo run", 8080));
    }
    if dir.join("requirements.txt").is_file() {
        return Some(("python main.py", 8000));
    }
    if dir.join("pyproject.toml").is_file() {
        return Some(("python -m uvicorn main:app --reload", 8000));
    }
    None
}

fn icon_for(name: &str) -> &'static str {
    match name {
        "web" => "🌐",
        "server" => "🚀",
        "api" => "📡",
        "admin" => "👤",
        "worker" => "⚙️",
        "frontend" => "🎨",
        "backend" => "🔧",
        "db" => "💾",
        "queue" => "📬",
        _ => "📦",
    }
}

fn render(services: &[DetectedService]) -> Result<String> {
    let starter = StarterConfig {
        defaults: services.iter().map(|svc| svc.name.clone()).collect(),
        services: services
            .iter()
            .enumerate()
            .map(|(idx, svc)| {
                (
                    svc.name.clone(),
                    StarterService {
                        dir: svc.dir.clone(),
                        cmd: svc.cmd.clone(),
                        port: svc.port,
                        color: COLORS[idx % COLORS.len()].to_string(),
                        icon: icon_for(&svc.name).to_string(),
                    },
                )
            })
            .collect(),
    };
    toml::to_string(&starter).context("failed to render starter config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use crate::service::ServiceKind;

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn root_project_becomes_single_app() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("go.mod"), "module example\n");
        touch(&dir.path().join("apps/web/package.json"), r#"{"scripts":{"dev":"vite"}}"#);

        let services = detect_services(dir.path());
        assert_eq!(
            services,
            vec![DetectedService {
                name: "app".into(),
                dir: ".".into(),
                cmd: "go run .".into(),
                port: 8080,
            }]
        );
    }

    #[test]
    fn monorepo_folders_are_scanned_in_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("apps/web/package.json"), r#"{"scripts":{"dev":"vite"}}"#);
        touch(&dir.path().join("apps/docs/package.json"), r#"{"scripts":{"build":"x"}}"#);
        touch(&dir.path().join("services/api/Cargo.toml"), "[package]\n");
        touch(&dir.path().join("services/ml/pyproject.toml"), "");
        touch(&dir.path().join("packages/web/go.mod"), "");

        let services = detect_services(dir.path());
        let summary: Vec<(&str, &str, &str)> = services
            .iter()
            .map(|svc| (svc.name.as_str(), svc.dir.as_str(), svc.cmd.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("web", "apps/web", "npm run dev"),
                ("api", "services/api", "cargo run"),
                ("ml", "services/ml", "python -m uvicorn main:app --reload"),
            ]
        );
    }

    #[test]
    fn empty_directory_gets_sample() {
        let dir = tempfile::tempdir().unwrap();
        let services = detect_services(dir.path());
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].cmd, "npm run dev");
        assert_eq!(services[0].port, 3000);
    }

    #[test]
    fn starter_config_loads_and_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("apps/api/requirements.txt"), "flask\n");
        touch(&dir.path().join("apps/web/package.json"), r#"{"scripts":{"dev":"next dev"}}"#);

        let (path, detected) = write_starter_config(dir.path()).unwrap();
        assert_eq!(detected.len(), 2);

        let config = load_config(&path).unwrap();
        assert_eq!(config.defaults, vec!["api", "web"]);
        let api = config.service("api").unwrap();
        assert_eq!(api.cmd, "python main.py");
        assert_eq!(api.port, Some(8000));
        assert_eq!(api.color, "blue");
        assert_eq!(api.icon.as_deref(), Some("📡"));
        assert_eq!(api.work_dir, config.root_dir.join("apps/api"));
        assert!(matches!(api.kind, ServiceKind::LongRunning));
        assert_eq!(config.service("web").unwrap().color, "green");

        let err = write_starter_config(dir.path()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
