//! Command assembly for build, run, dev-loop and generator invocations.
//!
//! Commands are built from named token templates. Tokens may contain
//! `{placeholder}` references resolved from an injected parameter map
//! (`version`, `local_repo`, `app`, ...). No I/O happens here; the
//! supervisor treats the result as an opaque argument list.

use crate::config::{HarnessConfig, TemplateOverrides};
use crate::types::{Mode, OsFamily};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command template {0} is empty")]
    Empty(&'static str),
    #[error("unresolved placeholder {{{placeholder}}} in {template} template")]
    UnresolvedPlaceholder {
        template: &'static str,
        placeholder: String,
    },
    #[error("unterminated placeholder in token: {0}")]
    Unterminated(String),
    #[error("mode {0} has no {1} step")]
    NoTemplateForMode(Mode, &'static str),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Named command templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    Build,
    Run,
    NativeBuild,
    NativeRun,
    Dev,
    Generate,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Run => "run",
            Self::NativeBuild => "native-build",
            Self::NativeRun => "native-run",
            Self::Dev => "dev",
            Self::Generate => "generate",
        }
    }

    /// Template that builds the artifact for `mode`.
    pub fn build_for(mode: Mode) -> Result<Self> {
        match mode {
            Mode::Jvm => Ok(Self::Build),
            Mode::Native => Ok(Self::NativeBuild),
            Mode::Generator => Ok(Self::Generate),
            Mode::Dev => Err(CommandError::NoTemplateForMode(mode, "build")),
        }
    }

    /// Template that starts the application for `mode`.
    pub fn run_for(mode: Mode) -> Self {
        match mode {
            Mode::Jvm => Self::Run,
            Mode::Native => Self::NativeRun,
            Mode::Dev | Mode::Generator => Self::Dev,
        }
    }

    /// Built-in tokens for this template.
    fn default_tokens(&self, os: OsFamily) -> Vec<String> {
        let tokens: &[&str] = match self {
            Self::Build => &[
                "mvn",
                "clean",
                "package",
                "-DskipTests",
                "-Dquarkus.package.output-name=quarkus",
                "-Dmaven.repo.local={local_repo}",
                "-Dquarkus.version={version}",
            ],
            Self::Run => &["java", "-jar", "target/quarkus-app/quarkus-run.jar"],
            Self::NativeBuild => &[
                "mvn",
                "clean",
                "package",
                "-Pnative",
                "-DskipTests",
                "-Dquarkus.package.output-name=quarkus",
                "-Dmaven.repo.local={local_repo}",
                "-Dquarkus.version={version}",
            ],
            Self::NativeRun if os.is_windows() => &["target\\quarkus-runner.exe"],
            Self::NativeRun => &["./target/quarkus-runner"],
            Self::Dev => &[
                "mvn",
                "quarkus:dev",
                "-Dmaven.repo.local={local_repo}",
                "-Dquarkus.version={version}",
            ],
            Self::Generate => &[
                "mvn",
                "io.quarkus:quarkus-maven-plugin:{version}:create",
                "-DprojectGroupId=io.quarkus.startstop",
                "-DprojectArtifactId={app}",
                "-DprojectVersion=1.0.0-SNAPSHOT",
                "-DplatformArtifactId=quarkus-bom",
                "-Dextensions={extensions}",
                "-Dmaven.repo.local={local_repo}",
            ],
        };
        tokens.iter().map(|t| (*t).to_string()).collect()
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    /// Combined stdout/stderr destination (overwritten on start).
    pub log_file: PathBuf,
    /// Extra environment, merged over the inherited one.
    pub env: BTreeMap<String, String>,
}

impl Command {
    /// First token; `None` for an empty argv.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Space-joined form for logs and reports.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Assembles [`Command`]s from templates and injected parameters.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    os: OsFamily,
    overrides: TemplateOverrides,
    params: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

impl CommandBuilder {
    pub fn new(os: OsFamily) -> Self {
        let mut params = BTreeMap::new();
        params.insert("os".to_string(), os.as_str().to_string());
        params.insert("arch".to_string(), std::env::consts::ARCH.to_string());
        Self {
            os,
            overrides: TemplateOverrides::default(),
            params,
            env: BTreeMap::new(),
        }
    }

    /// Builder seeded with repository location, version and template overrides.
    pub fn from_config(config: &HarnessConfig, os: OsFamily) -> Self {
        Self::new(os)
            .with_overrides(config.templates.clone())
            .with_param("repo", config.repo_dir.display().to_string())
            .with_param("local_repo", config.local_repo.display().to_string())
            .with_param("version", config.version.clone())
            .with_param("port", config.port.to_string())
    }

    pub fn with_overrides(mut self, overrides: TemplateOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Set or replace a placeholder value.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add an environment variable to every built command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn tokens(&self, template: Template) -> Vec<String> {
        let overridden = match template {
            Template::Build => &self.overrides.build,
            Template::Run => &self.overrides.run,
            Template::NativeBuild => &self.overrides.native_build,
            Template::NativeRun => &self.overrides.native_run,
            Template::Dev => &self.overrides.dev,
            Template::Generate => &self.overrides.generate,
        };
        overridden
            .clone()
            .unwrap_or_else(|| template.default_tokens(self.os))
    }

    /// Resolve `template` into a command running in `workdir` and logging to `log_file`.
    pub fn build(&self, template: Template, workdir: &Path, log_file: &Path) -> Result<Command> {
        let tokens = self.tokens(template);
        if tokens.is_empty() {
            return Err(CommandError::Empty(template.as_str()));
        }

        let mut argv = tokens
            .iter()
            .map(|token| self.substitute(template, token))
            .collect::<Result<Vec<_>>>()?;

        if self.os.is_windows() && argv[0] == "mvn" {
            argv[0] = "mvn.cmd".to_string();
        }

        Ok(Command {
            argv,
            workdir: workdir.to_path_buf(),
            log_file: log_file.to_path_buf(),
            env: self.env.clone(),
        })
    }

    fn substitute(&self, template: Template, token: &str) -> Result<String> {
        let mut out = String::with_capacity(token.len());
        let mut rest = token;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                return Err(CommandError::Unterminated(token.to_string()));
            };
            let name = &after[..close];
            let value =
                self.params
                    .get(name)
                    .ok_or_else(|| CommandError::UnresolvedPlaceholder {
                        template: template.as_str(),
                        placeholder: name.to_string(),
                    })?;
            out.push_str(value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CommandBuilder {
        CommandBuilder::new(OsFamily::Linux)
            .with_param("local_repo", "/tmp/m2")
            .with_param("version", "3.15.1")
            .with_param("app", "hello")
            .with_param("extensions", "rest,health")
    }

    #[test]
    fn build_template_injects_parameters() {
        let cmd = builder()
            .build(Template::Build, Path::new("/work"), Path::new("/logs/build.log"))
            .unwrap();
        assert_eq!(cmd.program(), Some("mvn"));
        assert!(cmd.argv.contains(&"-Dmaven.repo.local=/tmp/m2".to_string()));
        assert!(cmd.argv.contains(&"-Dquarkus.version=3.15.1".to_string()));
        assert_eq!(cmd.workdir, PathBuf::from("/work"));
        assert_eq!(cmd.log_file, PathBuf::from("/logs/build.log"));
    }

    #[test]
    fn generate_template_substitutes_inside_tokens() {
        let cmd = builder()
            .build(Template::Generate, Path::new("/work"), Path::new("/logs/gen.log"))
            .unwrap();
        assert_eq!(cmd.argv[1], "io.quarkus:quarkus-maven-plugin:3.15.1:create");
        assert!(cmd.argv.contains(&"-DprojectArtifactId=hello".to_string()));
        assert!(cmd.argv.contains(&"-Dextensions=rest,health".to_string()));
    }

    #[test]
    fn missing_parameter_is_fatal() {
        let builder = CommandBuilder::new(OsFamily::Linux);
        let err = builder
            .build(Template::Dev, Path::new("."), Path::new("dev.log"))
            .unwrap_err();
        match err {
            CommandError::UnresolvedPlaceholder {
                template,
                placeholder,
            } => {
                assert_eq!(template, "dev");
                assert_eq!(placeholder, "local_repo");
            }
            e => panic!("expected UnresolvedPlaceholder, got {e:?}"),
        }
    }

    #[test]
    fn override_replaces_default_tokens() {
        let overrides = TemplateOverrides {
            run: Some(vec!["sh".to_string(), "run.sh".to_string(), "{app}".to_string()]),
            ..Default::default()
        };
        let cmd = builder()
            .with_overrides(overrides)
            .build(Template::Run, Path::new("."), Path::new("run.log"))
            .unwrap();
        assert_eq!(cmd.argv, vec!["sh", "run.sh", "hello"]);
    }

    #[test]
    fn empty_override_is_rejected() {
        let overrides = TemplateOverrides {
            run: Some(Vec::new()),
            ..Default::default()
        };
        let err = builder()
            .with_overrides(overrides)
            .build(Template::Run, Path::new("."), Path::new("run.log"))
            .unwrap_err();
        assert!(matches!(err, CommandError::Empty("run")));
    }

    #[test]
    fn unterminated_placeholder_is_rejected() {
        let overrides = TemplateOverrides {
            run: Some(vec!["echo".to_string(), "{app".to_string()]),
            ..Default::default()
        };
        let err = builder()
            .with_overrides(overrides)
            .build(Template::Run, Path::new("."), Path::new("run.log"))
            .unwrap_err();
        assert!(matches!(err, CommandError::Unterminated(_)));
    }

    #[test]
    fn windows_uses_mvn_cmd_and_exe_runner() {
        let builder = CommandBuilder::new(OsFamily::Windows)
            .with_param("local_repo", "C:\\m2")
            .with_param("version", "3.15.1");
        let build = builder
            .build(Template::Build, Path::new("."), Path::new("b.log"))
            .unwrap();
        assert_eq!(build.program(), Some("mvn.cmd"));
        let run = builder
            .build(Template::NativeRun, Path::new("."), Path::new("r.log"))
            .unwrap();
        assert_eq!(run.program(), Some("target\\quarkus-runner.exe"));
    }

    #[test]
    fn builder_env_is_attached() {
        let cmd = builder()
            .with_env("QUARKUS_HTTP_PORT", "8081")
            .build(Template::Run, Path::new("."), Path::new("run.log"))
            .unwrap();
        assert_eq!(cmd.env.get("QUARKUS_HTTP_PORT").map(String::as_str), Some("8081"));
    }

    #[test]
    fn empty_argv_has_no_program() {
        let cmd = Command {
            argv: Vec::new(),
            workdir: PathBuf::from("."),
            log_file: PathBuf::from("run.log"),
            env: BTreeMap::new(),
        };
        assert_eq!(cmd.program(), None);
        assert_eq!(cmd.display(), "");
    }

    #[test]
    fn mode_template_mapping() {
        assert_eq!(Template::build_for(Mode::Jvm).unwrap(), Template::Build);
        assert_eq!(Template::build_for(Mode::Native).unwrap(), Template::NativeBuild);
        assert!(Template::build_for(Mode::Dev).is_err());
        assert_eq!(Template::run_for(Mode::Native), Template::NativeRun);
        assert_eq!(Template::run_for(Mode::Generator), Template::Dev);
    }
}
