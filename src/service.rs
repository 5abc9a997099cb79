//! Data structures for supervised services.
//!
//! This module defines the immutable definition of a service (`ServiceDefinition`),
//! the closed set of execution kinds (`ServiceKind`), the lifecycle status
//! (`ServiceStatus`), the mutable per-service record (`ServiceState`) and the
//! snapshot handed to clients (`ServiceSnapshot`). It also reads the dynamic
//! overlay a service may publish in its working directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::output::{LogBuffer, DEFAULT_MAX_LINES};

/// File a service may write into its working directory to override how it is displayed.
pub const STATUS_FILE: &str = ".devrack-status";

/// How often the overlay file is re-read per service.
pub const OVERLAY_REFRESH: Duration = Duration::from_secs(1);

/// Plain-text overlays longer than this are truncated.
const OVERLAY_ICON_MAX_CHARS: usize = 20;

/// Specification for a service to be supervised.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    /// Unique name of the service.
    pub name: String,
    /// Absolute working directory (configured dir resolved against the config root).
    pub work_dir: PathBuf,
    /// Command line, split shell-style at spawn time. Empty for `http` services.
    pub cmd: String,
    /// Execution strategy.
    pub kind: ServiceKind,
    /// Display color.
    pub color: String,
    /// Optional display icon.
    pub icon: Option<String>,
    /// TCP port used for conflict detection and display.
    pub port: Option<u16>,
}

/// The execution strategy of a service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceKind {
    /// A process expected to keep running until stopped.
    LongRunning,
    /// A command run once to completion.
    Oneshot,
    /// A command re-run on a fixed period.
    Interval { every: Duration },
    /// A single HTTP request.
    Http(HttpProbe),
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::LongRunning => "long-running",
            ServiceKind::Oneshot => "oneshot",
            ServiceKind::Interval { .. } => "interval",
            ServiceKind::Http(_) => "http",
        }
    }
}

/// Parameters of an `http` service.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpProbe {
    pub url: String,
    pub method: String,
    pub body: Option<String>,
    /// Header name/value pairs, applied after the defaults.
    pub headers: Vec<(String, String)>,
}

/// The lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Running,
    Waiting,
    Completed,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Running => "running",
            ServiceStatus::Waiting => "waiting",
            ServiceStatus::Completed => "completed",
            ServiceStatus::Failed => "failed",
        }
    }
}

/// Mutable runtime record of a single service. Always accessed under its lock.
#[derive(Debug)]
pub struct ServiceState {
    pub status: ServiceStatus,
    /// Process id of the live child (long-running and oneshot only).
    pub pid: Option<u32>,
    pub logs: LogBuffer,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub run_count: u32,
    /// Stop signal for an active interval loop.
    pub stop_tx: Option<mpsc::Sender<()>>,
    /// Set by an explicit stop so that the exit is reported as `stopped`.
    pub stop_requested: bool,
    pub overlay: OverlayCache,
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            pid: None,
            logs: LogBuffer::new(DEFAULT_MAX_LINES),
            last_run: None,
            next_run: None,
            exit_code: None,
            run_count: 0,
            stop_tx: None,
            stop_requested: false,
            overlay: OverlayCache::default(),
        }
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a service, as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub running: bool,
    /// Lifecycle status, or the overlay's status string when one is published.
    pub status: String,
    pub port: Option<u16>,
    pub color: String,
    pub icon: Option<String>,
    pub message: Option<String>,
    pub exit_code: Option<i32>,
    pub run_count: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl ServiceSnapshot {
    /// Replaces display fields with any non-empty overlay values.
    pub fn apply_overlay(&mut self, overlay: &DynamicOverlay) {
        if let Some(icon) = non_empty(&overlay.icon) {
            self.icon = Some(icon.to_string());
        }
        if let Some(color) = non_empty(&overlay.color) {
            self.color = color.to_string();
        }
        if let Some(status) = non_empty(&overlay.status) {
            self.status = status.to_string();
        }
        if let Some(message) = non_empty(&overlay.message) {
            self.message = Some(message.to_string());
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Display fields published by the service itself.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DynamicOverlay {
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Last overlay read for a service and when it was read.
#[derive(Debug, Clone, Default)]
pub struct OverlayCache {
    checked_at: Option<Instant>,
    value: Option<DynamicOverlay>,
}

impl OverlayCache {
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.checked_at {
            Some(at) => now.duration_since(at) >= OVERLAY_REFRESH,
            None => true,
        }
    }

    pub fn value(&self) -> Option<&DynamicOverlay> {
        self.value.as_ref()
    }

    pub fn store(&mut self, value: Option<DynamicOverlay>, now: Instant) {
        self.value = value;
        self.checked_at = Some(now);
    }
}

/// Reads the overlay file from a service directory. Any failure yields `None`.
pub fn read_overlay(work_dir: &Path) -> Option<DynamicOverlay> {
    let raw = std::fs::read_to_string(work_dir.join(STATUS_FILE)).ok()?;
    parse_overlay(&raw)
}

/// Parses overlay content: a JSON object, or a short plain string used as the icon.
pub fn parse_overlay(raw: &str) -> Option<DynamicOverlay> {
    let content = raw.trim();
    if content.is_empty() {
        return None;
    }
    if content.starts_with('{') {
        if let Ok(overlay) = serde_json::from_str::<DynamicOverlay>(content) {
            return Some(overlay);
        }
    }
    let icon: String = content.chars().take(OVERLAY_ICON_MAX_CHARS).collect();
    Some(DynamicOverlay {
        icon: Some(icon),
        ..DynamicOverlay::default()
    })
}
