//! Point-in-time resource sampling.
//!
//! Best-effort telemetry: a process that exited between PID capture and
//! sampling yields `-1`, never an error.

use crate::platform::Platform;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Bound on a single inspection utility run.
const UTILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Resident memory and open descriptors; `-1` means unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceSample {
    pub rss_kb: i64,
    pub open_fds: i64,
}

/// First line consisting only of digits (surrounding whitespace allowed).
pub fn first_number(output: &str) -> i64 {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && l.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|l| l.parse().ok())
        .unwrap_or(-1)
}

#[derive(Debug, Clone)]
pub struct ResourceSampler {
    platform: Arc<dyn Platform>,
}

impl ResourceSampler {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Resident set size of `pid` in kB.
    pub async fn sample_rss(&self, pid: u32) -> i64 {
        let argv = self.platform.rss_command(pid);
        let mut rss = match run_utility(&argv).await {
            Some(output) => first_number(&output),
            None => -1,
        };
        if rss < 0 {
            rss = self.platform.rss_fallback(pid).unwrap_or(-1);
        }
        debug!(pid, rss_kb = rss, "sampled rss");
        rss
    }

    /// Open file descriptors (handles on Windows) of `pid`.
    pub async fn sample_open_fds(&self, pid: u32) -> i64 {
        let argv = self.platform.fd_command(pid);
        let mut fds = match run_utility(&argv).await {
            Some(output) => self.platform.count_fds(&output),
            None => -1,
        };
        if fds < 0 {
            fds = self.platform.fd_fallback(pid).unwrap_or(-1);
        }
        debug!(pid, open_fds = fds, "sampled open fds");
        fds
    }

    pub async fn sample(&self, pid: u32) -> ResourceSample {
        ResourceSample {
            rss_kb: self.sample_rss(pid).await,
            open_fds: self.sample_open_fds(pid).await,
        }
    }
}

/// Stdout of the utility. `lsof` exits 1 when some files cannot be listed,
/// so output is kept regardless of the exit status.
async fn run_utility(argv: &[String]) -> Option<String> {
    let (program, args) = argv.split_first()?;
    let output = Command::new(program).args(args).kill_on_drop(true).output();
    match tokio::time::timeout(UTILITY_TIMEOUT, output).await {
        Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Err(err)) => {
            debug!(program, error = %err, "sampling utility unavailable");
            None
        }
        Err(_) => {
            warn!(program, "sampling utility timed out");
            None
        }
    }
}
