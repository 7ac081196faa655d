//! Core types shared by the harness.
//!
//! Host OS family and scenario modes. Both appear in threshold keys,
//! log file names and measurement rows, so their string forms are stable.

use serde::{Deserialize, Serialize};

/// Host operating system family.
///
/// Detected once at startup and passed down; process introspection,
/// signal semantics and OS-specific whitelists all key off this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
}

impl OsFamily {
    /// Family of the host the harness was compiled for.
    pub fn current() -> Self {
        Self::from_os_name(std::env::consts::OS)
    }

    /// Map a `std::env::consts::OS` value to a family.
    ///
    /// BSDs and other Unix flavours behave like Linux for everything the
    /// harness does (`ps`, `lsof`, POSIX signals).
    pub fn from_os_name(name: &str) -> Self {
        match name {
            "windows" => Self::Windows,
            "macos" => Self::MacOs,
            _ => Self::Linux,
        }
    }

    /// Prefix used in threshold keys (`linux.jvm.RSS.threshold.kB`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "mac",
            Self::Windows => "windows",
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, Self::Windows)
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scenario mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Build a jar, then start/stop it repeatedly.
    Jvm,
    /// Build a native executable, then start/stop it repeatedly.
    Native,
    /// Dev loop: start in dev mode, edit a source file, measure reload.
    Dev,
    /// Generate a skeleton project, then run it in dev mode.
    Generator,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jvm => "jvm",
            Self::Native => "native",
            Self::Dev => "dev",
            Self::Generator => "generator",
        }
    }

    /// Parse a mode name (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "jvm" => Some(Self::Jvm),
            "native" => Some(Self::Native),
            "dev" => Some(Self::Dev),
            "generator" => Some(Self::Generator),
            _ => None,
        }
    }

    /// Whether this mode runs the dev loop rather than build-then-run cycles.
    pub fn is_dev_loop(&self) -> bool {
        matches!(self, Self::Dev | Self::Generator)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
