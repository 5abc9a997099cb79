//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file,
//! loads and validates it, and turns each `[services.<name>]` table into a
//! `ServiceDefinition`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::service::{HttpProbe, ServiceDefinition, ServiceKind};

pub const CONFIG_FILE_NAME: &str = "devrack.toml";

const DEFAULT_COLOR: &str = "white";
const DEFAULT_METHOD: &str = "GET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("service {service}: {field} is required for {kind} services")]
    MissingField {
        service: String,
        field: &'static str,
        kind: &'static str,
    },

    #[error("service {service}: unknown type {kind:?}")]
    UnknownKind { service: String, kind: String },

    #[error("service {service}: invalid interval {value:?}")]
    InvalidInterval { service: String, value: String },

    #[error("service {service}: invalid header {header:?}, expected \"Name: value\"")]
    InvalidHeader { service: String, header: String },

    #[error("service {0}: cmd is empty or cannot be split into words")]
    EmptyCommand(String),

    #[error("defaults: unknown service {0}")]
    UnknownDefault(String),
}

/// Top-level structure of `devrack.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Services started when none are named explicitly.
    #[serde(default)]
    pub defaults: Vec<String>,
    /// Only keep captured lines matching this pattern.
    pub filter: Option<String>,
    /// Drop captured lines matching this pattern.
    pub exclude: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    /// Working directory, relative to the config file.
    pub dir: Option<String>,
    /// Command to execute.
    pub cmd: Option<String>,
    /// Port used for conflict checks.
    pub port: Option<u16>,
    /// Display color (default: white).
    pub color: Option<String>,
    /// Display icon.
    pub icon: Option<String>,
    /// "service" / "long-running" (default), "oneshot", "interval" or "http".
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Period for interval services: milliseconds, or a string like "500ms", "5s", "2m".
    pub interval: Option<IntervalValue>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub body: Option<String>,
    /// Extra request headers as "Name: value".
    #[serde(default)]
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IntervalValue {
    Millis(u64),
    Text(String),
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute directory containing the config file.
    pub root_dir: PathBuf,
    /// Service definitions, ordered by name.
    pub services: Vec<ServiceDefinition>,
    pub defaults: Vec<String>,
    pub filter: Option<String>,
    pub exclude: Option<String>,
}

impl Config {
    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|svc| svc.name == name)
    }
}

/// Loads and validates the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ConfigFile = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let absolute = std::path::absolute(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let root = absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    build_config(file, root)
}

/// Looks for `devrack.toml` in `start` and its parents.
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// Validates a parsed file against a root directory.
pub fn build_config(file: ConfigFile, root_dir: PathBuf) -> Result<Config, ConfigError> {
    let mut services = Vec::with_capacity(file.services.len());
    for (name, service) in file.services {
        services.push(service_definition(&root_dir, name, service)?);
    }

    let defaults = if file.defaults.is_empty() {
        services.iter().map(|svc| svc.name.clone()).collect()
    } else {
        for name in &file.defaults {
            if !services.iter().any(|svc| &svc.name == name) {
                return Err(ConfigError::UnknownDefault(name.clone()));
            }
        }
        file.defaults
    };

    Ok(Config {
        root_dir,
        services,
        defaults,
        filter: file.filter,
        exclude: file.exclude,
    })
}

fn service_definition(
    root: &Path,
    name: String,
    config: ServiceConfig,
) -> Result<ServiceDefinition, ConfigError> {
    let missing = |field: &'static str, kind: &'static str| ConfigError::MissingField {
        service: name.clone(),
        field,
        kind,
    };
    let cmd = match config.cmd.clone() {
        Some(cmd) if shell_words::split(&cmd).map_or(true, |words| words.is_empty()) => {
            return Err(ConfigError::EmptyCommand(name));
        }
        cmd => cmd,
    };

    let (kind, dir, cmd) = match config.kind.as_deref().unwrap_or("service") {
        "" | "service" | "long-running" => {
            let dir = config.dir.clone().ok_or_else(|| missing("dir", "long-running"))?;
            let cmd = cmd.ok_or_else(|| missing("cmd", "long-running"))?;
            (ServiceKind::LongRunning, dir, cmd)
        }
        "oneshot" => {
            let cmd = cmd.ok_or_else(|| missing("cmd", "oneshot"))?;
            (ServiceKind::Oneshot, config.dir.clone().unwrap_or_else(|| ".".into()), cmd)
        }
        "interval" => {
            let cmd = cmd.ok_or_else(|| missing("cmd", "interval"))?;
            let every = match &config.interval {
                Some(value) => interval_duration(&name, value)?,
                None => return Err(missing("interval", "interval")),
            };
            let dir = config.dir.clone().unwrap_or_else(|| ".".into());
            (ServiceKind::Interval { every }, dir, cmd)
        }
        "http" => {
            let url = config
                .url
                .clone()
                .filter(|url| !url.is_empty())
                .ok_or_else(|| missing("url", "http"))?;
            let headers = config
                .headers
                .iter()
                .map(|header| parse_header(&name, header))
                .collect::<Result<Vec<_>, _>>()?;
            let probe = HttpProbe {
                url,
                method: config
                    .method
                    .clone()
                    .filter(|m| !m.is_empty())
                    .map(|m| m.to_uppercase())
                    .unwrap_or_else(|| DEFAULT_METHOD.to_string()),
                body: config.body.clone().filter(|body| !body.is_empty()),
                headers,
            };
            let dir = config.dir.clone().unwrap_or_else(|| ".".into());
            (ServiceKind::Http(probe), dir, String::new())
        }
        other => {
            return Err(ConfigError::UnknownKind {
                service: name,
                kind: other.to_string(),
            })
        }
    };

    Ok(ServiceDefinition {
        work_dir: root.join(dir),
        cmd,
        kind,
        color: config
            .color
            .filter(|color| !color.is_empty())
            .unwrap_or_else(|| DEFAULT_COLOR.to_string()),
        icon: config.icon.filter(|icon| !icon.is_empty()),
        port: config.port.filter(|port| *port > 0),
        name,
    })
}

fn interval_duration(service: &str, value: &IntervalValue) -> Result<Duration, ConfigError> {
    let invalid = |raw: String| ConfigError::InvalidInterval {
        service: service.to_string(),
        value: raw,
    };
    let duration = match value {
        IntervalValue::Millis(ms) => Duration::from_millis(*ms),
        IntervalValue::Text(raw) => parse_duration(raw).ok_or_else(|| invalid(raw.clone()))?,
    };
    if duration.is_zero() {
        let raw = match value {
            IntervalValue::Millis(ms) => ms.to_string(),
            IntervalValue::Text(raw) => raw.clone(),
        };
        return Err(invalid(raw));
    }
    Ok(duration)
}

/// Parses "250ms", "5s", "1.5s", "2m" or "1h".
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let seconds = match unit.trim() {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

fn parse_header(service: &str, header: &str) -> Result<(String, String), ConfigError> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidHeader {
            service: service.to_string(),
            header: header.to_string(),
        })?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Config, ConfigError> {
        let file: ConfigFile = toml::from_str(raw).unwrap();
        build_config(file, PathBuf::from("/work/project"))
    }

    #[test]
    fn parses_every_service_kind() {
        let config = parse(
            r#"
defaults = ["api"]
exclude = "hmr"

[services.api]
dir = "api"
cmd = "cargo run --release"
port = 8080
color = "blue"
icon = "🚀"

[services.migrate]
type = "oneshot"
cmd = "./migrate.sh"

[services.lint]
type = "interval"
cmd = "cargo check"
interval = "30s"

[services.health]
type = "http"
url = "http://localhost:8080/health"
method = "post"
body = '{"ping":true}'
headers = ["Authorization: Bearer abc"]
"#,
        )
        .unwrap();

        assert_eq!(config.defaults, vec!["api"]);
        assert_eq!(config.exclude.as_deref(), Some("hmr"));
        let names: Vec<&str> = config.services.iter().map(|svc| svc.name.as_str()).collect();
        assert_eq!(names, vec!["api", "health", "lint", "migrate"]);

        let api = config.service("api").unwrap();
        assert_eq!(api.kind, ServiceKind::LongRunning);
        assert_eq!(api.work_dir, PathBuf::from("/work/project/api"));
        assert_eq!(api.port, Some(8080));
        assert_eq!(api.icon.as_deref(), Some("🚀"));

        let migrate = config.service("migrate").unwrap();
        assert_eq!(migrate.kind, ServiceKind::Oneshot);
        assert_eq!(migrate.work_dir, PathBuf::from("/work/project/."));
        assert_eq!(migrate.color, "white");

        let lint = config.service("lint").unwrap();
        assert_eq!(
            lint.kind,
            ServiceKind::Interval {
                every: Duration::from_secs(30)
            }
        );

        match &config.service("health").unwrap().kind {
            ServiceKind::Http(probe) => {
                assert_eq!(probe.method, "POST");
                assert_eq!(probe.body.as_deref(), Some(r#"{"ping":true}"#));
                assert_eq!(
                    probe.headers,
                    vec![("Authorization".to_string(), "Bearer abc".to_string())]
                );
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn defaults_to_every_service() {
        let config = parse(
            r#"
[services.b]
type = "oneshot"
cmd = "true"

[services.a]
type = "oneshot"
cmd = "true"
"#,
        )
        .unwrap();
        assert_eq!(config.defaults, vec!["a", "b"]);
    }

    #[test]
    fn rejects_missing_fields_per_kind() {
        let err = parse("[services.api]\ncmd = \"run\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "dir", .. }));

        let err = parse("[services.h]\ntype = \"http\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "url", .. }));

        let err = parse("[services.t]\ntype = \"interval\"\ncmd = \"echo\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "interval", .. }));

        let err = parse("[services.o]\ntype = \"oneshot\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "cmd", .. }));

        let err = parse("[services.o]\ntype = \"oneshot\"\ncmd = \"  \"\n").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand(name) if name == "o"));
    }

    #[test]
    fn rejects_unknown_type_and_default() {
        let err = parse("[services.x]\ntype = \"cron\"\ncmd = \"true\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKind { .. }));

        let err = parse("defaults = [\"nope\"]\n[services.x]\ntype = \"oneshot\"\ncmd = \"true\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDefault(name) if name == "nope"));
    }

    #[test]
    fn interval_accepts_millis_and_rejects_zero() {
        let config =
            parse("[services.t]\ntype = \"interval\"\ncmd = \"echo\"\ninterval = 100\n").unwrap();
        assert_eq!(
            config.services[0].kind,
            ServiceKind::Interval {
                every: Duration::from_millis(100)
            }
        );
        let err = parse("[services.t]\ntype = \"interval\"\ncmd = \"echo\"\ninterval = \"0s\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInterval { .. }));
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("5 days"), None);
    }

    #[test]
    fn finds_config_in_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("apps").join("web");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[services.web]\ndir = \"apps/web\"\ncmd = \"npm run dev\"\n",
        )
        .unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE_NAME));
        let config = load_config(&found).unwrap();
        assert_eq!(config.root_dir, dir.path());
        assert_eq!(config.service("web").unwrap().work_dir, nested);
    }
}
