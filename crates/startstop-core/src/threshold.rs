//! Per-application performance budgets.
//!
//! `threshold.conf` is a flat `key=value` file keyed as
//! `{os}.{mode}.{metric}.threshold.{unit}`. Any key can be overridden from
//! the environment with its uppercase-underscore form
//! (`linux.jvm.RSS.threshold.kB` -> `LINUX_JVM_RSS_THRESHOLD_KB`).

use crate::types::{Mode, OsFamily};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("failed to read thresholds: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid threshold line: {0}")]
    InvalidLine(String),
    #[error("invalid threshold value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("no threshold configured for {0}")]
    Missing(String),
    #[error("threshold exceeded:{}", render_violations(.0))]
    Exceeded(Vec<Violation>),
}

pub type Result<T> = std::result::Result<T, ThresholdError>;

/// Observed value above its budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub key: String,
    pub observed: u64,
    pub threshold: u64,
}

fn render_violations(violations: &[Violation]) -> String {
    let mut out = String::new();
    for v in violations {
        let _ = write!(
            out,
            "\n  {}: observed {} exceeds threshold {}",
            v.key, v.observed, v.threshold
        );
    }
    out
}

/// Values under test. `None` skips the metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observed {
    pub rss_kb: Option<u64>,
    pub time_to_first_ok_request_ms: Option<u64>,
    pub time_to_reload_ms: Option<u64>,
}

pub fn rss_key(os: OsFamily, mode: Mode) -> String {
    format!("{os}.{mode}.RSS.threshold.kB")
}

pub fn time_to_first_ok_request_key(os: OsFamily, mode: Mode) -> String {
    format!("{os}.{mode}.time.to.first.ok.request.threshold.ms")
}

pub fn time_to_reload_key(os: OsFamily, mode: Mode) -> String {
    format!("{os}.{mode}.time.to.reload.threshold.ms")
}

/// Environment variable overriding `key`.
pub fn env_name(key: &str) -> String {
    key.to_uppercase().replace(['.', '-'], "_")
}

/// Read-only threshold table for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThresholdSet(BTreeMap<String, u64>);

impl ThresholdSet {
    /// Load from a file; an absent file yields an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ThresholdError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            values.insert(key.to_string(), parse_value(key, value)?);
        }
        Ok(Self(values))
    }

    /// Apply overrides from `lookup`, called with [`env_name`] of each key.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (key, value) in &mut self.0 {
            if let Some(raw) = lookup(&env_name(key)) {
                *value = parse_value(key, &raw)?;
            }
        }
        Ok(self)
    }

    /// Overrides from the process environment.
    pub fn with_process_env(self) -> Result<Self> {
        self.with_env_overrides(|name| std::env::var(name).ok())
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.0.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: u64) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare every observed metric against its budget (inclusive).
    ///
    /// All violations are collected before failing.
    pub fn check(&self, os: OsFamily, mode: Mode, observed: &Observed) -> Result<()> {
        let metrics = [
            (rss_key(os, mode), observed.rss_kb),
            (
                time_to_first_ok_request_key(os, mode),
                observed.time_to_first_ok_request_ms,
            ),
            (time_to_reload_key(os, mode), observed.time_to_reload_ms),
        ];

        let mut violations = Vec::new();
        for (key, value) in metrics {
            let Some(observed) = value else {
                continue;
            };
            let threshold = self
                .get(&key)
                .ok_or_else(|| ThresholdError::Missing(key.clone()))?;
            if observed > threshold {
                violations.push(Violation {
                    key,
                    observed,
                    threshold,
                });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ThresholdError::Exceeded(violations))
        }
    }
}

fn parse_value(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| ThresholdError::InvalidValue {
            key: key.to_string(),
            value: value.trim().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONF: &str = "\
# budgets
linux.jvm.RSS.threshold.kB=380000
linux.jvm.time.to.first.ok.request.threshold.ms=1500
linux.dev.time.to.reload.threshold.ms=3000
";

    #[test]
    fn keys_follow_os_mode_metric_layout() {
        assert_eq!(rss_key(OsFamily::Linux, Mode::Jvm), "linux.jvm.RSS.threshold.kB");
        assert_eq!(
            time_to_first_ok_request_key(OsFamily::MacOs, Mode::Native),
            "mac.native.time.to.first.ok.request.threshold.ms"
        );
        assert_eq!(
            time_to_reload_key(OsFamily::Windows, Mode::Dev),
            "windows.dev.time.to.reload.threshold.ms"
        );
    }

    #[test]
    fn env_name_transform() {
        assert_eq!(env_name("linux.jvm.RSS.threshold.kB"), "LINUX_JVM_RSS_THRESHOLD_KB");
        assert_eq!(env_name("mac.dev-mode.x"), "MAC_DEV_MODE_X");
    }

    #[test]
    fn boundary_is_inclusive() {
        let set = ThresholdSet::parse(CONF).unwrap();
        let at = Observed {
            rss_kb: Some(380_000),
            ..Default::default()
        };
        assert!(set.check(OsFamily::Linux, Mode::Jvm, &at).is_ok());

        let over = Observed {
            rss_kb: Some(380_001),
            ..Default::default()
        };
        let err = set.check(OsFamily::Linux, Mode::Jvm, &over).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("380001"));
        assert!(message.contains("380000"));
    }

    #[test]
    fn all_violations_are_reported() {
        let set = ThresholdSet::parse(CONF).unwrap();
        let observed = Observed {
            rss_kb: Some(500_000),
            time_to_first_ok_request_ms: Some(2000),
            time_to_reload_ms: None,
        };
        match set.check(OsFamily::Linux, Mode::Jvm, &observed) {
            Err(ThresholdError::Exceeded(v)) => assert_eq!(v.len(), 2),
            other => panic!("expected two violations, got {other:?}"),
        }
    }

    #[test]
    fn skipped_metrics_need_no_key() {
        let set = ThresholdSet::parse(CONF).unwrap();
        let observed = Observed {
            time_to_reload_ms: Some(2999),
            ..Default::default()
        };
        assert!(set.check(OsFamily::Linux, Mode::Dev, &observed).is_ok());
    }

    #[test]
    fn missing_key_is_an_error() {
        let set = ThresholdSet::parse(CONF).unwrap();
        let observed = Observed {
            rss_kb: Some(1),
            ..Default::default()
        };
        let err = set.check(OsFamily::Windows, Mode::Jvm, &observed).unwrap_err();
        assert!(matches!(err, ThresholdError::Missing(k) if k == "windows.jvm.RSS.threshold.kB"));
    }

    #[test]
    fn unparseable_value_is_fatal() {
        let err = ThresholdSet::parse("linux.jvm.RSS.threshold.kB=lots").unwrap_err();
        assert!(matches!(err, ThresholdError::InvalidValue { .. }));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [("LINUX_JVM_RSS_THRESHOLD_KB", "1000")].into_iter().collect();
        let set = ThresholdSet::parse(CONF)
            .unwrap()
            .with_env_overrides(|name| env.get(name).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(set.get("linux.jvm.RSS.threshold.kB"), Some(1000));
        assert_eq!(
            set.get("linux.jvm.time.to.first.ok.request.threshold.ms"),
            Some(1500)
        );
    }

    #[test]
    fn absent_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let set = ThresholdSet::load(&dir.path().join("threshold.conf")).unwrap();
        assert!(set.is_empty());
    }
}
