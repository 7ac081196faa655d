//! Log archival.
//!
//! Copies a scenario's logs to `<archive_dir>/<app>-<mode>-<timestamp>/`,
//! records a SHA-256 manifest, and writes `report.txt` and `summary.json`
//! next to them.

use chrono::Utc;
use sha2::{Digest, Sha256};
use startstop_core::{Mode, ScenarioReport};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const MANIFEST_FILE: &str = "MANIFEST.sha256";
pub const REPORT_FILE: &str = "report.txt";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Compute SHA256 checksum of file contents.
pub fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Create a fresh bundle directory; a numeric suffix avoids collisions
/// between scenarios finishing within the same second.
pub fn create_bundle_dir(archive_root: &Path, app: &str, mode: Mode) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let base = format!("{app}-{mode}-{stamp}");
    fs::create_dir_all(archive_root)?;

    let mut candidate = archive_root.join(&base);
    let mut suffix = 1;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                candidate = archive_root.join(format!("{base}-{suffix}"));
                suffix += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// What [`archive_logs`] managed to copy, relative to the bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchivedLogs {
    pub archived: Vec<PathBuf>,
    /// Logs left behind because reading or copying them failed.
    pub failed: Vec<PathBuf>,
}

impl ArchivedLogs {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Copy every file below `logs_dir` into `bundle` and write the manifest.
///
/// A file that cannot be copied is logged and skipped; the manifest lists
/// the files that made it. A missing `logs_dir` archives nothing but still
/// writes an empty manifest.
pub fn archive_logs(logs_dir: &Path, bundle: &Path) -> Result<ArchivedLogs> {
    let mut logs = ArchivedLogs::default();
    if logs_dir.is_dir() {
        copy_tree(logs_dir, logs_dir, bundle, &mut logs);
    }
    logs.archived.sort();
    logs.failed.sort();

    let mut manifest = fs::File::create(bundle.join(MANIFEST_FILE))?;
    let mut hashed = Vec::with_capacity(logs.archived.len());
    for relative in logs.archived.drain(..) {
        match compute_checksum(&bundle.join(&relative)) {
            Ok(checksum) => {
                writeln!(manifest, "{checksum}  {}", relative.display())?;
                hashed.push(relative);
            }
            Err(err) => {
                warn!(file = %relative.display(), error = %err, "failed to hash archived log");
                logs.failed.push(relative);
            }
        }
    }
    manifest.flush()?;
    logs.archived = hashed;

    debug!(
        bundle = %bundle.display(),
        files = logs.archived.len(),
        failed = logs.failed.len(),
        "logs archived"
    );
    Ok(logs)
}

fn copy_tree(root: &Path, dir: &Path, bundle: &Path, logs: &mut ArchivedLogs) {
    let relative = |path: &Path| path.strip_prefix(root).unwrap_or(path).to_path_buf();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "failed to list logs");
            logs.failed.push(relative(dir));
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "failed to read log entry");
                logs.failed.push(relative(dir));
                continue;
            }
        };
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => copy_tree(root, &path, bundle, logs),
            Ok(t) if t.is_file() => {
                let rel = relative(&path);
                match copy_file(&path, &bundle.join(&rel)) {
                    Ok(()) => logs.archived.push(rel),
                    Err(err) => {
                        warn!(file = %path.display(), error = %err, "failed to archive log");
                        logs.failed.push(rel);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to stat log");
                logs.failed.push(relative(&path));
            }
        }
    }
}

fn copy_file(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)?;
    Ok(())
}

/// Write `report.txt` and `summary.json` into `bundle`.
pub fn write_report(bundle: &Path, report: &ScenarioReport) -> Result<()> {
    report.write(&bundle.join(REPORT_FILE))?;
    let json = serde_json::to_string_pretty(report)?;
    fs::write(bundle.join(SUMMARY_FILE), json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use startstop_core::OsFamily;
    use tempfile::TempDir;

    #[test]
    fn checksum_matches_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, "hello").unwrap();
        assert_eq!(
            compute_checksum(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn bundle_dirs_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let a = create_bundle_dir(dir.path(), "hello", Mode::Jvm).unwrap();
        let b = create_bundle_dir(dir.path(), "hello", Mode::Jvm).unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("hello-jvm-"));
    }

    #[test]
    fn archive_copies_logs_and_writes_manifest() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(logs.join("iterations")).unwrap();
        fs::write(logs.join("build.log"), "BUILD SUCCESS\n").unwrap();
        fs::write(logs.join("iterations").join("run-1.log"), "started in 1.0s\n").unwrap();

        let bundle = create_bundle_dir(&dir.path().join("archive"), "hello", Mode::Native).unwrap();
        let archived = archive_logs(&logs, &bundle).unwrap();
        assert!(archived.is_complete());

        assert_eq!(
            archived.archived,
            vec![
                PathBuf::from("build.log"),
                PathBuf::from("iterations").join("run-1.log")
            ]
        );
        assert!(bundle.join("iterations").join("run-1.log").exists());

        let manifest = fs::read_to_string(bundle.join(MANIFEST_FILE)).unwrap();
        assert_eq!(manifest.lines().count(), 2);
        let build_sum = compute_checksum(&logs.join("build.log")).unwrap();
        assert!(manifest.contains(&format!("{build_sum}  build.log")));
    }

    #[test]
    fn failed_copy_skips_file_and_keeps_going() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        for name in ["a.log", "b.log", "c.log"] {
            fs::write(logs.join(name), name).unwrap();
        }

        // A directory in the way makes the copy of b.log fail, even as root.
        let bundle = create_bundle_dir(dir.path(), "hello", Mode::Jvm).unwrap();
        fs::create_dir_all(bundle.join("b.log")).unwrap();

        let result = archive_logs(&logs, &bundle).unwrap();
        assert!(!result.is_complete());
        assert_eq!(result.failed, vec![PathBuf::from("b.log")]);
        assert_eq!(
            result.archived,
            vec![PathBuf::from("a.log"), PathBuf::from("c.log")]
        );

        let manifest = fs::read_to_string(bundle.join(MANIFEST_FILE)).unwrap();
        assert_eq!(manifest.lines().count(), 2);
        assert!(manifest.contains("  a.log"));
        assert!(manifest.contains("  c.log"));
        assert!(!manifest.contains("b.log"));
    }

    #[test]
    fn missing_logs_dir_still_writes_manifest() {
        let dir = TempDir::new().unwrap();
        let bundle = create_bundle_dir(dir.path(), "hello", Mode::Dev).unwrap();
        let archived = archive_logs(&dir.path().join("absent"), &bundle).unwrap();
        assert!(archived.archived.is_empty());
        assert!(archived.is_complete());
        assert!(bundle.join(MANIFEST_FILE).exists());
    }

    #[test]
    fn report_and_summary_are_written() {
        let dir = TempDir::new().unwrap();
        let mut report = ScenarioReport::new("hello", Mode::Jvm, OsFamily::Linux);
        report.finish(Some("boom".to_string()));
        write_report(dir.path(), &report).unwrap();

        let text = fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap();
        assert!(text.contains("FAILED"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap())
                .unwrap();
        assert_eq!(json["app"], "hello");
        assert_eq!(json["mode"], "jvm");
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["error"], "boom");
    }
}
