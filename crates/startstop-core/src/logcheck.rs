//! Log file analysis.
//!
//! Classifies completed log files line by line, aggregates offending
//! lines, and extracts `started in Xs` / `stopped in Xs` durations.

use crate::whitelist::WhitelistSet;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log file does not exist: {}", .0.display())]
    Missing(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} contains offending lines:\n{}", path.display(), lines.iter().cloned().collect::<Vec<_>>().join("\n"))]
    Offending {
        path: PathBuf,
        lines: BTreeSet<String>,
    },
    #[error("{} has no 'Listening on:' line", .0.display())]
    ListeningLineMissing(PathBuf),
    #[error("{} does not listen on {expected}: {line}", path.display())]
    UnexpectedHost {
        path: PathBuf,
        expected: String,
        line: String,
    },
    #[error("invalid log pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Outcome of classifying one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No error or warning signal.
    Clean,
    /// Error or warning signal covered by a whitelist.
    Whitelisted,
    /// Error or warning signal not covered by any whitelist.
    Offending,
}

/// Durations reported by the application, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StartStop {
    pub started_s: Option<f64>,
    pub stopped_s: Option<f64>,
}

impl StartStop {
    /// Started duration in milliseconds, `-1` when absent.
    pub fn started_ms(&self) -> i64 {
        to_ms(self.started_s)
    }

    /// Stopped duration in milliseconds, `-1` when absent.
    pub fn stopped_ms(&self) -> i64 {
        to_ms(self.stopped_s)
    }
}

fn to_ms(seconds: Option<f64>) -> i64 {
    seconds.map_or(-1, |s| (s * 1000.0).round() as i64)
}

const LISTENING_MARKER: &str = "Listening on:";

/// Compiled signal and duration patterns.
#[derive(Debug, Clone)]
pub struct LogAnalyzer {
    offending: Regex,
    started: [Regex; 2],
    stopped: [Regex; 2],
}

impl LogAnalyzer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            offending: Regex::new(r"(?i)(ERROR|WARN|SLF4J:)")?,
            started: [
                Regex::new(r"started in ([0-9]+(?:\.[0-9]+)?)s")?,
                Regex::new(r"started in .*?188m([0-9]+(?:\.[0-9]+)?)")?,
            ],
            stopped: [
                Regex::new(r"stopped in ([0-9]+(?:\.[0-9]+)?)s")?,
                Regex::new(r"stopped in .*?188m([0-9]+(?:\.[0-9]+)?)")?,
            ],
        })
    }

    /// Whether the line carries an error or warning signal.
    pub fn has_signal(&self, line: &str) -> bool {
        self.offending.is_match(line)
    }

    pub fn classify(&self, line: &str, whitelist: &WhitelistSet) -> Classification {
        if !self.has_signal(line) {
            Classification::Clean
        } else if whitelist.is_whitelisted(line) {
            Classification::Whitelisted
        } else {
            Classification::Offending
        }
    }

    /// Deduplicated offending lines of `content`.
    pub fn offending_lines(&self, content: &str, whitelist: &WhitelistSet) -> BTreeSet<String> {
        let mut offending: BTreeSet<String> = content
            .lines()
            .filter(|line| self.classify(line, whitelist) == Classification::Offending)
            .map(str::to_string)
            .collect();

        if whitelist.handles_shutdown_race()
            && offending
                .iter()
                .any(|line| line.contains(crate::whitelist::SHUTDOWN_RACE_MARKER))
        {
            offending.retain(|line| !whitelist.is_shutdown_race_noise(line));
        }

        offending
    }

    /// Offending lines of the log at `path`.
    pub fn check_log(&self, path: &Path, whitelist: &WhitelistSet) -> Result<BTreeSet<String>> {
        let content = read_log(path)?;
        Ok(self.offending_lines(&content, whitelist))
    }

    /// Fail with every offending line when the log is not clean.
    pub fn ensure_clean(&self, path: &Path, whitelist: &WhitelistSet) -> Result<()> {
        let lines = self.check_log(path, whitelist)?;
        if lines.is_empty() {
            Ok(())
        } else {
            Err(LogError::Offending {
                path: path.to_path_buf(),
                lines,
            })
        }
    }

    /// First `started in` and `stopped in` durations in `content`.
    pub fn parse_start_stop_content(&self, content: &str) -> StartStop {
        let mut result = StartStop::default();
        for line in content.lines() {
            if result.started_s.is_none() {
                result.started_s = first_capture(&self.started, line);
            }
            if result.stopped_s.is_none() {
                result.stopped_s = first_capture(&self.stopped, line);
            }
            if result.started_s.is_some() && result.stopped_s.is_some() {
                break;
            }
        }
        result
    }

    /// Durations from the log at `path`. Absent markers are `None`.
    pub fn parse_start_stop(&self, path: &Path) -> Result<StartStop> {
        let content = read_log(path)?;
        Ok(self.parse_start_stop_content(&content))
    }

    /// The log must contain a `Listening on:` line naming `host`.
    pub fn check_listening_host(&self, path: &Path, host: &str) -> Result<()> {
        let content = read_log(path)?;
        let Some(line) = content.lines().find(|l| l.contains(LISTENING_MARKER)) else {
            return Err(LogError::ListeningLineMissing(path.to_path_buf()));
        };
        if line.contains(host) {
            Ok(())
        } else {
            Err(LogError::UnexpectedHost {
                path: path.to_path_buf(),
                expected: host.to_string(),
                line: line.to_string(),
            })
        }
    }
}

/// Plain pattern first, then the colourised one.
fn first_capture(patterns: &[Regex; 2], line: &str) -> Option<f64> {
    patterns.iter().find_map(|re| {
        re.captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

fn read_log(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(LogError::Missing(path.to_path_buf()));
    }
    let bytes = std::fs::read(path).map_err(|source| LogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
