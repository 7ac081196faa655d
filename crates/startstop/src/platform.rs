//! OS capability interface.
//!
//! Everything that differs per host (process tree discovery, termination
//! signals, resource inspection utilities, page cache control) lives behind
//! [`Platform`]. One implementation is selected at startup by [`detect`]
//! and injected into the supervisor, sampler and orchestrator.

use startstop_core::OsFamily;
use std::collections::{BTreeMap, VecDeque};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to execute {program}: {source}")]
    Execution {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Host-specific process control and introspection.
pub trait Platform: Send + Sync + std::fmt::Debug {
    fn os(&self) -> OsFamily;

    /// Every live descendant of `pid`, children before grandchildren.
    fn descendants(&self, pid: u32) -> Vec<u32>;

    /// Ask the process to exit. A process that is already gone is not an error.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Unconditional kill. A process that is already gone is not an error.
    fn kill(&self, pid: u32) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Utility printing the resident set size of `pid` in kB.
    fn rss_command(&self, pid: u32) -> Vec<String>;

    /// Utility listing or counting the open descriptors of `pid`.
    fn fd_command(&self, pid: u32) -> Vec<String>;

    /// Interpret the output of [`Platform::fd_command`]; `-1` when unusable.
    fn count_fds(&self, output: &str) -> i64;

    /// RSS in kB without external utilities, when the host allows it.
    fn rss_fallback(&self, _pid: u32) -> Option<i64> {
        None
    }

    /// Descriptor count without external utilities, when the host allows it.
    fn fd_fallback(&self, _pid: u32) -> Option<i64> {
        None
    }

    /// Commands that flush and drop the page cache, run in order.
    fn drop_caches_commands(&self) -> Vec<Vec<String>>;
}

/// Platform implementation for the host.
pub fn detect() -> Arc<dyn Platform> {
    #[cfg(unix)]
    {
        Arc::new(UnixPlatform::new(OsFamily::current()))
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsPlatform)
    }
}

fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| (*t).to_string()).collect()
}

/// Run a short-lived utility and capture stdout. Failures yield `None`.
fn capture(program: &str, args: &[String]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            debug!(program, status = %output.status, "utility exited unsuccessfully");
            None
        }
        Err(err) => {
            debug!(program, error = %err, "failed to run utility");
            None
        }
    }
}

/// Parse `pid ppid` lines into a parent -> children map.
fn parse_process_table(table: &str) -> BTreeMap<u32, Vec<u32>> {
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(ppid)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let (Ok(pid), Ok(ppid)) = (pid.parse::<u32>(), ppid.parse::<u32>()) {
            children.entry(ppid).or_default().push(pid);
        }
    }
    children
}

/// Breadth-first walk of the process tree below `root`.
pub fn descendants_from_table(table: &str, root: u32) -> Vec<u32> {
    let children = parse_process_table(table);
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if child != root && !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found
}

#[cfg(unix)]
pub use unix::UnixPlatform;

#[cfg(unix)]
mod unix {
    use super::{argv, capture, descendants_from_table, Platform, PlatformError, Result};
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use startstop_core::OsFamily;

    /// Linux, macOS and other Unix hosts: POSIX signals, `ps` and `lsof`.
    #[derive(Debug, Clone, Copy)]
    pub struct UnixPlatform {
        os: OsFamily,
    }

    impl UnixPlatform {
        pub fn new(os: OsFamily) -> Self {
            Self { os }
        }

        fn send(pid: u32, signal: Option<Signal>) -> Result<()> {
            let Ok(raw) = i32::try_from(pid) else {
                return Err(PlatformError::Signal {
                    pid,
                    message: "pid out of range".to_string(),
                });
            };
            match kill(Pid::from_raw(raw), signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(errno) => Err(PlatformError::Signal {
                    pid,
                    message: errno.desc().to_string(),
                }),
            }
        }

        /// `pid ppid` table from procfs, for hosts without `ps`.
        fn proc_table() -> Option<String> {
            let mut table = String::new();
            for entry in std::fs::read_dir("/proc").ok()?.flatten() {
                let name = entry.file_name();
                let Some(pid) = name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit()))
                else {
                    continue;
                };
                let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                    continue;
                };
                // Fields after the parenthesised command name: state ppid ...
                let Some(rest) = stat.rsplit_once(')').map(|(_, r)| r) else {
                    continue;
                };
                if let Some(ppid) = rest.split_whitespace().nth(1) {
                    table.push_str(pid);
                    table.push(' ');
                    table.push_str(ppid);
                    table.push('\n');
                }
            }
            Some(table)
        }
    }

    impl Platform for UnixPlatform {
        fn os(&self) -> OsFamily {
            self.os
        }

        fn descendants(&self, pid: u32) -> Vec<u32> {
            let table = capture("ps", &argv(&["-A", "-o", "pid=", "-o", "ppid="]))
                .or_else(Self::proc_table)
                .unwrap_or_default();
            descendants_from_table(&table, pid)
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            Self::send(pid, Some(Signal::SIGTERM))
        }

        fn kill(&self, pid: u32) -> Result<()> {
            Self::send(pid, Some(Signal::SIGKILL))
        }

        fn is_alive(&self, pid: u32) -> bool {
            let Ok(raw) = i32::try_from(pid) else {
                return false;
            };
            matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
        }

        fn rss_command(&self, pid: u32) -> Vec<String> {
            argv(&["ps", "-p", &pid.to_string(), "-o", "rss="])
        }

        fn fd_command(&self, pid: u32) -> Vec<String> {
            argv(&["lsof", "-F0n", "-p", &pid.to_string()])
        }

        /// One `f` record per descriptor; no `p` record means the process is gone.
        fn count_fds(&self, output: &str) -> i64 {
            if !output.lines().any(|l| l.starts_with('p')) {
                return -1;
            }
            output.lines().filter(|l| l.starts_with('f')).count() as i64
        }

        fn rss_fallback(&self, pid: u32) -> Option<i64> {
            let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
            status
                .lines()
                .find_map(|l| l.strip_prefix("VmRSS:"))
                .and_then(|v| v.split_whitespace().next())
                .and_then(|v| v.parse().ok())
        }

        fn fd_fallback(&self, pid: u32) -> Option<i64> {
            let entries = std::fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
            Some(entries.count() as i64)
        }

        fn drop_caches_commands(&self) -> Vec<Vec<String>> {
            match self.os {
                OsFamily::MacOs => vec![argv(&["sync"]), argv(&["sudo", "-n", "purge"])],
                _ => vec![
                    argv(&["sync"]),
                    argv(&["sudo", "-n", "sh", "-c", "echo 3 > /proc/sys/vm/drop_caches"]),
                ],
            }
        }
    }
}

#[cfg(windows)]
pub use windows::WindowsPlatform;

#[cfg(windows)]
mod windows {
    use super::{argv, capture, descendants_from_table, Platform, PlatformError, Result};
    use startstop_core::OsFamily;
    use std::process::Command;

    /// Windows hosts: `taskkill`, `tasklist` and PowerShell CIM queries.
    #[derive(Debug, Clone, Copy)]
    pub struct WindowsPlatform;

    fn powershell(script: &str) -> Vec<String> {
        argv(&["powershell", "-NoProfile", "-NonInteractive", "-Command", script])
    }

    fn taskkill(pid: u32, force: bool) -> Result<()> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
        if force {
            args.push("/F");
        }
        let output = Command::new("taskkill")
            .args(&args)
            .output()
            .map_err(|source| PlatformError::Execution {
                program: "taskkill".to_string(),
                source,
            })?;
        // 128: no such process
        if output.status.success() || output.status.code() == Some(128) {
            Ok(())
        } else {
            Err(PlatformError::Signal {
                pid,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    impl Platform for WindowsPlatform {
        fn os(&self) -> OsFamily {
            OsFamily::Windows
        }

        fn descendants(&self, pid: u32) -> Vec<u32> {
            let args = powershell(
                "Get-CimInstance Win32_Process | ForEach-Object { \"$($_.ProcessId) $($_.ParentProcessId)\" }",
            );
            let table = capture(&args[0], &args[1..]).unwrap_or_default();
            descendants_from_table(&table, pid)
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            taskkill(pid, false)
        }

        fn kill(&self, pid: u32) -> Result<()> {
            taskkill(pid, true)
        }

        fn is_alive(&self, pid: u32) -> bool {
            let filter = format!("PID eq {pid}");
            capture("tasklist", &argv(&["/FI", &filter, "/NH"]))
                .is_some_and(|out| out.split_whitespace().any(|f| f == pid.to_string()))
        }

        fn rss_command(&self, pid: u32) -> Vec<String> {
            powershell(&format!("[int64]((Get-Process -Id {pid}).WorkingSet64/1024)"))
        }

        fn fd_command(&self, pid: u32) -> Vec<String> {
            powershell(&format!("(Get-Process -Id {pid}).HandleCount"))
        }

        fn count_fds(&self, output: &str) -> i64 {
            crate::sampler::first_number(output)
        }

        fn drop_caches_commands(&self) -> Vec<Vec<String>> {
            Vec::new()
        }
    }
}
