//! Port probing and process-tree termination.
//!
//! Answers "who is listening on this TCP port" and sends termination signals
//! to a process or its whole process group. Children spawned by the engine are
//! placed in their own group so that signalling the group reaches everything
//! they started.

use std::net::TcpListener;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// Puts the spawned child into a new process group.
pub fn detach_process_group(command: &mut Command) {
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }
}

/// Politely asks a process tree to exit (SIGTERM on unix, CTRL_BREAK on windows).
pub fn terminate_tree(pid: u32) {
    #[cfg(unix)]
    signal_group(pid, libc::SIGTERM);

    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

/// Forcefully kills a process tree.
pub fn kill_tree(pid: u32) {
    #[cfg(unix)]
    signal_group(pid, libc::SIGKILL);

    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

/// Forcefully kills a single process.
///
/// Returns `false` if the signal could not be delivered.
pub fn kill_process(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
    }

    #[cfg(windows)]
    {
        std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        false
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: i32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

/// Process group of a process, if it can be determined.
pub fn process_group(pid: u32) -> Option<u32> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).ok()?;
        let pgid = unsafe { libc::getpgid(pid) };
        u32::try_from(pgid).ok().filter(|pgid| *pgid > 0)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        None
    }
}

/// Finds the pid listening on a local TCP port.
pub async fn port_owner(port: u16) -> Option<u32> {
    #[cfg(windows)]
    let output = Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;

    #[cfg(not(windows))]
    let output = Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(err) => {
            debug!(port, error = %err, "port lookup tool unavailable");
            return None;
        }
    };
    let text = String::from_utf8_lossy(&output.stdout);

    #[cfg(windows)]
    return parse_netstat_owner(&text, port);

    #[cfg(not(windows))]
    parse_lsof_pid(&text)
}

/// Whether something already listens on the port, by attempting to bind it.
pub fn is_port_bound(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// First pid printed by `lsof -t`.
pub fn parse_lsof_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .find(|pid| *pid > 0)
}

/// Owner pid from `netstat -ano` output for a listening port.
pub fn parse_netstat_owner(output: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{port}");
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || !fields[3].eq_ignore_ascii_case("LISTENING") {
            return None;
        }
        if !fields[1].ends_with(&suffix) {
            return None;
        }
        fields[4].parse::<u32>().ok().filter(|pid| *pid > 0)
    })
}
