//! Known-benign log line patterns.
//!
//! A [`WhitelistSet`] holds two compiled pattern collections: the
//! application family set (baseline plus per-application patterns from
//! the registry) and the OS set for the detected host. Patterns must
//! match the whole line.

use crate::types::OsFamily;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WhitelistError {
    #[error("invalid whitelist pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, WhitelistError>;

/// Lines every application build and run may emit.
pub const BASELINE_PATTERNS: &[&str] = &[
    // Artifact names that merely contain "error"
    r".*maven-error-diagnostics.*",
    r".*errorprone.*",
    r".*error_prone_annotations.*",
    r".*ErrorProne.*",
    // No SLF4J provider on the build classpath
    r".*SLF4J: Failed to load class .org\.slf4j\.impl\.StaticLoggerBinder.*",
    r".*SLF4J: Defaulting to no-operation \(NOP\) logger implementation.*",
    r".*SLF4J: See http://www\.slf4j\.org/codes\.html.*",
    r".*SLF4J: No SLF4J providers were found.*",
    r".*SLF4J: See https://www\.slf4j\.org/codes\.html.*",
    // JDK chatter
    r".*WARNING: An illegal reflective access operation has occurred.*",
    r".*\[WARNING\] .*sun\.misc\.Unsafe.*",
    r".*WARNING: .*sun\.misc\.Unsafe.*",
];

const LINUX_PATTERNS: &[&str] = &[r".*io\.netty\.channel\.epoll.*Native.*"];

const MAC_PATTERNS: &[&str] = &[
    r".*objc\[\d+\]: Class .* is implemented in both.*",
    r".*Unable to load io\.netty\.resolver\.dns\.macos\.MacOSDnsServerAddressStreamProvider.*",
];

const WINDOWS_PATTERNS: &[&str] = &[
    r".*Unable to make the Vert\.x cache directory .* world readable and writable.*",
    r".*Unable to make the Vert\.x cache directory .* world readable.*",
    r".*Unable to make the Vert\.x cache directory .* world writable.*",
];

/// Offending-line marker of the Windows dev-mode shutdown race.
pub const SHUTDOWN_RACE_MARKER: &str = "Shutdown in progress";

/// Lines dropped once the shutdown race has been detected.
pub const SHUTDOWN_RACE_PATTERNS: &[&str] = &[
    r".*Shutdown in progress.*",
    r".*ERROR.*Failed to stop.*",
    r".*WARN.*Interrupted while.*",
    r".*ERROR.*Failed to run.*",
];

/// Built-in patterns for an OS family.
pub fn os_patterns(os: OsFamily) -> &'static [&'static str] {
    match os {
        OsFamily::Linux => LINUX_PATTERNS,
        OsFamily::MacOs => MAC_PATTERNS,
        OsFamily::Windows => WINDOWS_PATTERNS,
    }
}

/// Compile a pattern anchored at both ends.
fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            let pattern = p.as_ref();
            Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                WhitelistError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                }
            })
        })
        .collect()
}

/// Compiled application and OS whitelists, immutable after construction.
#[derive(Debug, Clone)]
pub struct WhitelistSet {
    os: OsFamily,
    app: Vec<Regex>,
    os_specific: Vec<Regex>,
    shutdown_race: Vec<Regex>,
}

impl WhitelistSet {
    /// Baseline plus `app_patterns`, and the built-in set for `os`.
    pub fn new<S: AsRef<str>>(app_patterns: &[S], os: OsFamily) -> Result<Self> {
        let mut app = compile(BASELINE_PATTERNS)?;
        app.extend(compile(app_patterns)?);
        Ok(Self {
            os,
            app,
            os_specific: compile(os_patterns(os))?,
            shutdown_race: compile(SHUTDOWN_RACE_PATTERNS)?,
        })
    }

    pub fn os(&self) -> OsFamily {
        self.os
    }

    /// Application set first, then the OS set.
    pub fn is_whitelisted(&self, line: &str) -> bool {
        self.app.iter().any(|re| re.is_match(line))
            || self.os_specific.iter().any(|re| re.is_match(line))
    }

    /// Whether the dev-mode shutdown race exemption applies on this host.
    pub fn handles_shutdown_race(&self) -> bool {
        self.os.is_windows()
    }

    /// Line is one of the known benign shutdown race messages.
    pub fn is_shutdown_race_noise(&self, line: &str) -> bool {
        self.shutdown_race.iter().any(|re| re.is_match(line))
    }
}
