//! Application registry.
//!
//! Descriptors are loaded once from `apps.toml` and passed by reference:
//!
//! ```toml
//! [[app]]
//! name = "hello"
//! dir = "apps/hello"
//! whitelist = [".*Unrecognized configuration key.*"]
//!
//! [[app.url]]
//! path = "/hello"
//! expected = "Hello from Quarkus"
//!
//! [app.reload]
//! file = "src/main/java/org/acme/GreetingResource.java"
//! from = "Hello from Quarkus"
//! to = "Bye from Quarkus"
//! path = "/hello"
//! expected = "Bye from Quarkus"
//! ```

use crate::threshold::{ThresholdError, ThresholdSet};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Per-application thresholds file, relative to the application directory.
pub const THRESHOLD_FILE: &str = "threshold.conf";

#[derive(Debug, Error)]
pub enum AppsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("duplicate application name: {0}")]
    Duplicate(String),
    #[error("application {0} declares no probe URL")]
    NoUrls(String),
    #[error("unknown application: {0}")]
    Unknown(String),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
}

pub type Result<T> = std::result::Result<T, AppsError>;

/// Known-good URL and the body substring it must serve.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeUrl {
    pub path: String,
    pub expected: String,
}

/// Source edit applied during the dev loop and the response proving reload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReloadEdit {
    /// File relative to the application directory.
    pub file: PathBuf,
    pub from: String,
    pub to: String,
    pub path: String,
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppDescriptor {
    pub name: String,
    /// Source directory, relative to the repository root.
    pub dir: PathBuf,
    /// The first entry is the readiness probe.
    #[serde(default, rename = "url")]
    pub urls: Vec<ProbeUrl>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub reload: Option<ReloadEdit>,
    /// Extensions for the generator mode.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Sources are produced by the generator rather than copied.
    #[serde(default)]
    pub generated: bool,
}

impl AppDescriptor {
    /// Readiness probe (first URL).
    pub fn readiness(&self) -> Option<&ProbeUrl> {
        self.urls.first()
    }

    /// URLs checked after readiness without timing.
    pub fn additional_urls(&self) -> &[ProbeUrl] {
        self.urls.get(1..).unwrap_or(&[])
    }

    pub fn source_dir(&self, repo_dir: &Path) -> PathBuf {
        repo_dir.join(&self.dir)
    }

    /// Thresholds from `<repo>/<dir>/threshold.conf` with env overrides.
    pub fn load_thresholds(&self, repo_dir: &Path) -> Result<ThresholdSet> {
        let set = ThresholdSet::load(&self.source_dir(repo_dir).join(THRESHOLD_FILE))?;
        Ok(set.with_process_env()?)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    app: Vec<AppDescriptor>,
}

/// Immutable set of application descriptors.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: Vec<AppDescriptor>,
}

impl AppRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| AppsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse registry content; `origin` is used in error messages.
    pub fn parse(content: &str, origin: &Path) -> Result<Self> {
        let file: RegistryFile = toml::from_str(content).map_err(|source| AppsError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;

        let mut seen = std::collections::BTreeSet::new();
        for app in &file.app {
            if !seen.insert(app.name.as_str()) {
                return Err(AppsError::Duplicate(app.name.clone()));
            }
            if app.urls.is_empty() {
                return Err(AppsError::NoUrls(app.name.clone()));
            }
        }

        Ok(Self { apps: file.app })
    }

    pub fn get(&self, name: &str) -> Result<&AppDescriptor> {
        self.apps
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| AppsError::Unknown(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppDescriptor> {
        self.apps.iter()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const REGISTRY: &str = r#"
[[app]]
name = "hello"
dir = "apps/hello"
whitelist = [".*Unrecognized configuration key.*"]

[[app.url]]
path = "/"
expected = "Welcome"

[[app.url]]
path = "/hello"
expected = "Hello"

[app.reload]
file = "src/main/java/Hello.java"
from = "Hello"
to = "Bye"
path = "/hello"
expected = "Bye"

[[app]]
name = "rest"
dir = "apps/rest"
extensions = ["rest", "rest-jackson"]
generated = true

[[app.url]]
path = "/q/health"
expected = "UP"
"#;

    #[test]
    fn parse_registry() {
        let registry = AppRegistry::parse(REGISTRY, Path::new("apps.toml")).unwrap();
        assert_eq!(registry.len(), 2);

        let hello = registry.get("hello").unwrap();
        assert_eq!(hello.readiness().unwrap().expected, "Welcome");
        assert_eq!(hello.additional_urls().len(), 1);
        assert_eq!(hello.reload.as_ref().unwrap().to, "Bye");
        assert_eq!(hello.whitelist.len(), 1);

        let rest = registry.get("rest").unwrap();
        assert!(rest.generated);
        assert_eq!(rest.extensions, vec!["rest", "rest-jackson"]);
        assert!(rest.additional_urls().is_empty());
        assert!(rest.reload.is_none());
    }

    #[test]
    fn unknown_app_is_an_error() {
        let registry = AppRegistry::parse(REGISTRY, Path::new("apps.toml")).unwrap();
        assert!(matches!(registry.get("nope"), Err(AppsError::Unknown(_))));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let content = r#"
[[app]]
name = "a"
dir = "a"
[[app.url]]
path = "/"
expected = "x"

[[app]]
name = "a"
dir = "b"
[[app.url]]
path = "/"
expected = "x"
"#;
        let err = AppRegistry::parse(content, Path::new("apps.toml")).unwrap_err();
        assert!(matches!(err, AppsError::Duplicate(name) if name == "a"));
    }

    #[test]
    fn app_without_urls_is_rejected() {
        let content = "[[app]]\nname = \"a\"\ndir = \"a\"\n";
        let err = AppRegistry::parse(content, Path::new("apps.toml")).unwrap_err();
        assert!(matches!(err, AppsError::NoUrls(_)));
    }

    #[test]
    fn thresholds_load_from_app_dir() {
        let repo = TempDir::new().unwrap();
        let app_dir = repo.path().join("apps/hello");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join(THRESHOLD_FILE),
            "linux.jvm.RSS.threshold.kB=1234\n",
        )
        .unwrap();

        let registry = AppRegistry::parse(REGISTRY, Path::new("apps.toml")).unwrap();
        let set = registry
            .get("hello")
            .unwrap()
            .load_thresholds(repo.path())
            .unwrap();
        assert_eq!(set.get("linux.jvm.RSS.threshold.kB"), Some(1234));
    }
}
