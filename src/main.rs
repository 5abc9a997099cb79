//! devrack: run a project's development services under one shared daemon.
//!
//! The `daemon` subcommand hosts the supervision engine for a project. Every
//! other subcommand is a thin client that finds (or spawns) that daemon and
//! talks to it over the local socket.

mod client;
mod config;
mod daemon;
mod events;
mod init;
mod output;
mod ports;
mod protocol;
mod runner;
mod service;
mod transport;

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::client::Client;
use crate::config::{find_config_file, load_config, Config, CONFIG_FILE_NAME};
use crate::daemon::Registry;
use crate::output::{Level, LineFilter};
use crate::protocol::{LogEntry, PortStatus};
use crate::service::ServiceSnapshot;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Stopping waits for every process to exit; port checks shell out.
const SLOW_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const LOG_ENV: &str = "DEVRACK_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Run your development services from one shared daemon",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devrack.toml (default: search upwards from the current directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the project daemon in the foreground.
    Daemon,
    /// Start services and follow their output until Ctrl-C.
    Run {
        /// Services to run (default: the configured defaults).
        services: Vec<String>,
        /// Kill foreign processes holding service ports without asking.
        #[arg(long)]
        kill_ports: bool,
        /// Only print lines matching this regex.
        #[arg(long)]
        filter: Option<String>,
        /// Hide lines matching this regex.
        #[arg(long)]
        exclude: Option<String>,
    },
    /// Start services in the background.
    Start {
        services: Vec<String>,
        #[arg(long)]
        kill_ports: bool,
    },
    /// Stop one service, or all of them.
    Stop { service: Option<String> },
    /// Restart a service.
    Restart { service: String },
    /// Show the state of every service.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print recent log lines.
    Logs {
        service: Option<String>,
        /// Number of lines.
        #[arg(short = 'n', long, default_value_t = runner::DEFAULT_LOG_LINES)]
        lines: usize,
        /// Keep printing new lines.
        #[arg(short, long)]
        follow: bool,
        #[arg(long)]
        json: bool,
    },
    /// Clear buffered log lines.
    Clear { service: Option<String> },
    /// Report which service ports are held by other processes.
    CheckPorts,
    /// Kill the processes listening on the given ports.
    KillPorts {
        #[arg(required = true)]
        ports: Vec<u16>,
    },
    /// Stop every service and the daemon.
    Shutdown,
    /// Write a starter devrack.toml for the current directory.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(match cli.command {
        Commands::Daemon => "info",
        _ => "warn",
    });

    if let Commands::Init = cli.command {
        return run_init();
    }

    let (config, config_path) = resolve_config(&cli)?;
    let registry = Registry::from_env();

    match cli.command {
        Commands::Daemon => {
            let socket = registry.socket_path(&config.root_dir);
            daemon::run_foreground(config, socket).await
        }
        Commands::Run {
            services,
            kill_ports,
            filter,
            exclude,
        } => {
            let filter = LineFilter::new(filter.as_deref(), exclude.as_deref())
                .context("invalid --filter/--exclude pattern")?;
            run_services(&registry, &config, &config_path, services, kill_ports, filter).await
        }
        Commands::Start {
            services,
            kill_ports,
        } => {
            let client = registry.connect_or_spawn(&config, &config_path).await?;
            let started = client
                .start_and_wait(&services, kill_ports, SLOW_REQUEST_TIMEOUT)
                .await
                .context("failed to start services")?;
            println!("Started {}", started.join(", "));
            Ok(())
        }
        Commands::Stop { service } => {
            let client = connect_existing(&registry, &config).await?;
            client
                .stop_and_wait(service.as_deref(), SLOW_REQUEST_TIMEOUT)
                .await
                .context("failed to stop")?;
            println!("Stopped {}", service.as_deref().unwrap_or("all services"));
            Ok(())
        }
        Commands::Restart { service } => {
            let client = connect_existing(&registry, &config).await?;
            client
                .restart_and_wait(&service, REQUEST_TIMEOUT)
                .await
                .with_context(|| format!("failed to restart {service}"))?;
            println!("Restarting {service}");
            Ok(())
        }
        Commands::Status { json } => {
            let client = connect_existing(&registry, &config).await?;
            let services = client.status(REQUEST_TIMEOUT).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&services)?);
            } else {
                print_status(&services);
            }
            Ok(())
        }
        Commands::Logs {
            service,
            lines,
            follow,
            json,
        } => {
            let client = connect_existing(&registry, &config).await?;
            print_logs(&client, &config, service.as_deref(), lines, follow, json).await
        }
        Commands::Clear { service } => {
            let client = connect_existing(&registry, &config).await?;
            client.clear_logs(service.as_deref(), REQUEST_TIMEOUT).await?;
            println!("Cleared logs for {}", service.as_deref().unwrap_or("all services"));
            Ok(())
        }
        Commands::CheckPorts => {
            let client = connect_existing(&registry, &config).await?;
            let report = client.check_ports(SLOW_REQUEST_TIMEOUT).await?;
            for port in &report.ports {
                println!("{}", describe_port(port));
            }
            if report.has_conflict {
                println!("Run `devrack kill-ports <port>` or start with --kill-ports.");
            }
            Ok(())
        }
        Commands::KillPorts { ports } => {
            let client = connect_existing(&registry, &config).await?;
            let report = client.kill_ports(&ports, SLOW_REQUEST_TIMEOUT).await?;
            for port in &report.killed {
                println!("Killed process on port {port}");
            }
            for port in &report.failed {
                println!("Nothing killed on port {port}");
            }
            Ok(())
        }
        Commands::Shutdown => {
            let Ok(client) = registry.connect(&config.root_dir).await else {
                println!("No daemon running for {}", config.root_dir.display());
                return Ok(());
            };
            client.shutdown(SLOW_REQUEST_TIMEOUT).await?;
            println!("Daemon shut down");
            Ok(())
        }
        Commands::Init => run_init(),
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(cli: &Cli) -> Result<(Config, PathBuf)> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_config_file(&cwd).with_context(|| {
                format!("no {CONFIG_FILE_NAME} found (run `devrack init` to create one)")
            })?
        }
    };
    let path = std::path::absolute(&path)
        .with_context(|| format!("invalid config path {}", path.display()))?;
    let config = load_config(&path)?;
    Ok((config, path))
}

async fn connect_existing(registry: &Registry, config: &Config) -> Result<Client> {
    registry.connect(&config.root_dir).await.with_context(|| {
        format!(
            "no daemon running for {} (start one with `devrack run` or `devrack start`)",
            config.root_dir.display()
        )
    })
}

fn run_init() -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let (path, services) = init::write_starter_config(&cwd)?;
    println!("Created {} with {} service(s)", path.display(), services.len());
    for svc in &services {
        println!("  {} ({}): {}", svc.name, svc.dir, svc.cmd);
    }
    println!("\nRun `devrack run` to start them.");
    Ok(())
}

async fn run_services(
    registry: &Registry,
    config: &Config,
    config_path: &std::path::Path,
    services: Vec<String>,
    mut kill_ports: bool,
    filter: LineFilter,
) -> Result<()> {
    if let Some(unknown) = services.iter().find(|name| config.service(name).is_none()) {
        bail!("unknown service: {unknown}");
    }
    let client = registry.connect_or_spawn(config, config_path).await?;
    let wanted: HashSet<String> = if services.is_empty() {
        config.defaults.iter().cloned().collect()
    } else {
        services.iter().cloned().collect()
    };

    if !kill_ports {
        let report = client.check_ports(SLOW_REQUEST_TIMEOUT).await?;
        let conflicts: Vec<&PortStatus> = report
            .ports
            .iter()
            .filter(|port| port.in_use && wanted.contains(&port.service))
            .collect();
        if !conflicts.is_empty() {
            for port in &conflicts {
                println!("{}", describe_port(port));
            }
            if !confirm("Kill the processes holding these ports?").await? {
                bail!("port conflict, not starting");
            }
            kill_ports = true;
        }
    }

    let printer = Printer::new(config);
    client.on_message(protocol::LOG_ENTRY, move |message| {
        let Ok(entry) = message.parse::<LogEntry>() else {
            return;
        };
        if wanted.contains(&entry.service) && filter.allows(&entry.message) {
            printer.print(&entry, false);
        }
    });

    let started = client
        .start_and_wait(&services, kill_ports, SLOW_REQUEST_TIMEOUT)
        .await
        .context("failed to start services")?;
    eprintln!("Running {} (Ctrl-C to stop)", started.join(", "));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            eprintln!("\nStopping {}", started.join(", "));
            for name in &started {
                client.stop_and_wait(Some(name.as_str()), SLOW_REQUEST_TIMEOUT).await?;
            }
        }
        _ = client.closed() => bail!("lost connection to the daemon"),
    }
    Ok(())
}

async fn print_logs(
    client: &Client,
    config: &Config,
    service: Option<&str>,
    lines: usize,
    follow: bool,
    json: bool,
) -> Result<()> {
    if follow {
        let printer = Printer::new(config);
        let wanted = service.map(str::to_string);
        client.on_message(protocol::LOG_ENTRY, move |message| {
            let Ok(entry) = message.parse::<LogEntry>() else {
                return;
            };
            if wanted.as_ref().map_or(true, |name| *name == entry.service) {
                printer.print(&entry, json);
            }
        });
    }

    let printer = Printer::new(config);
    for entry in client.logs(service, lines, REQUEST_TIMEOUT).await? {
        printer.print(&entry, json);
    }

    if follow {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal.context("failed to listen for Ctrl-C")?,
            _ = client.closed() => bail!("lost connection to the daemon"),
        }
    }
    Ok(())
}

/// Writes log entries as `HH:MM:SS [service] message` with service colors.
struct Printer {
    colors: HashMap<String, String>,
    width: usize,
}

impl Printer {
    fn new(config: &Config) -> Self {
        Self {
            colors: config
                .services
                .iter()
                .map(|svc| (svc.name.clone(), svc.color.clone()))
                .collect(),
            width: config
                .services
                .iter()
                .map(|svc| svc.name.len())
                .max()
                .unwrap_or(0),
        }
    }

    fn print(&self, entry: &LogEntry, json: bool) {
        let line = if json {
            match serde_json::to_string(entry) {
                Ok(line) => line,
                Err(_) => return,
            }
        } else {
            self.format(entry)
        };
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }

    fn format(&self, entry: &LogEntry) -> String {
        let prefix = format!("[{}]", entry.service);
        let prefix = format!("{prefix:<width$}", width = self.width + 2);
        let prefix = apply_color(&prefix, self.colors.get(&entry.service).map(String::as_str));
        let message = match entry.level {
            Level::Error => apply_color(&entry.message, Some("red")),
            Level::Warn => apply_color(&entry.message, Some("yellow")),
            _ => entry.message.clone(),
        };
        let time = entry.time.with_timezone(&Local).format("%H:%M:%S");
        format!("{} {prefix} {message}", apply_color(&time.to_string(), Some("gray")))
    }
}

fn print_status(services: &[ServiceSnapshot]) {
    let width = services.iter().map(|svc| svc.name.len()).max().unwrap_or(0);
    for svc in services {
        let icon = svc.icon.as_deref().unwrap_or(" ");
        let name = apply_color(&format!("{:<width$}", svc.name), Some(svc.color.as_str()));
        let status = apply_color(&format!("{:<10}", svc.status), Some(status_color(&svc.status)));
        let mut line = format!("{icon} {name} {status} {:<12}", svc.kind);
        if let Some(port) = svc.port {
            line.push_str(&format!(" :{port}"));
        }
        if svc.run_count > 0 && svc.kind != "long-running" {
            line.push_str(&format!(" runs={}", svc.run_count));
        }
        if let Some(code) = svc.exit_code {
            line.push_str(&format!(" exit={code}"));
        }
        if let Some(next) = svc.next_run {
            line.push_str(&format!(" next={}", next.with_timezone(&Local).format("%H:%M:%S")));
        }
        if let Some(message) = svc.message.as_deref() {
            line.push_str(&format!("  {message}"));
        }
        println!("{}", line.trim_end());
    }
}

fn status_color(status: &str) -> &'static str {
    match status {
        "running" | "completed" => "green",
        "failed" => "red",
        "waiting" => "yellow",
        _ => "gray",
    }
}

fn describe_port(port: &PortStatus) -> String {
    match (port.in_use, port.pid) {
        (false, _) => format!("{} :{} free", port.service, port.port),
        (true, Some(pid)) => format!("{} :{} in use by pid {pid}", port.service, port.port),
        (true, None) => format!("{} :{} in use", port.service, port.port),
    }
}

async fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .context("prompt task failed")?
    .context("failed to read answer")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

fn apply_color(text: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "white" => "37",
        "gray" | "grey" => "90",
        _ => return text.to_string(),
    };
    format!("\u{1b}[{code}m{text}\u{1b}[0m")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn colors_known_names_only() {
        assert_eq!(apply_color("[api]", Some("blue")), "\u{1b}[34m[api]\u{1b}[0m");
        assert_eq!(apply_color("[api]", Some("Grey")), "\u{1b}[90m[api]\u{1b}[0m");
        assert_eq!(apply_color("[api]", Some("chartreuse")), "[api]");
        assert_eq!(apply_color("[api]", None), "[api]");
    }

    #[test]
    fn port_descriptions() {
        let mut port = PortStatus {
            service: "api".into(),
            port: 8080,
            in_use: false,
            pid: None,
        };
        assert_eq!(describe_port(&port), "api :8080 free");
        port.in_use = true;
        assert_eq!(describe_port(&port), "api :8080 in use");
        port.pid = Some(77);
        assert_eq!(describe_port(&port), "api :8080 in use by pid 77");
    }

    #[test]
    fn printer_pads_prefix_to_longest_name() {
        let printer = Printer {
            colors: HashMap::new(),
            width: 6,
        };
        let entry = LogEntry {
            time: Utc::now(),
            service: "api".into(),
            level: Level::Info,
            message: "listening".into(),
        };
        let line = strip_ansi_escapes::strip_str(printer.format(&entry));
        assert!(line.ends_with(" [api]    listening"), "{line}");
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "devrack", "--config", "x.toml", "logs", "api", "-n", "5", "-f",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(
            cli.command,
            Commands::Logs {
                service: Some(ref name),
                lines: 5,
                follow: true,
                json: false,
            } if name == "api"
        ));

        let cli = Cli::try_parse_from(["devrack", "run", "api", "web", "--kill-ports"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run { ref services, kill_ports: true, .. } if services.len() == 2
        ));

        assert!(Cli::try_parse_from(["devrack", "kill-ports"]).is_err());
    }
}
