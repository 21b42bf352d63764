//! Task configuration loaded from an INI file.
//!
//! ```ini
//! [args]
//! project = Demo
//! task = process_data
//! tags = sandbox v1
//!
//! [runtrace]
//! asset_dir = ./
//! runs_dir = .
//! log_format = pretty
//! ```
//!
//! Every key can be overridden from the environment, e.g.
//! `RUNTRACE_ARGS__PROJECT=Other`. A relative `asset_dir` is taken relative to
//! the file's directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use runtrace_core::instrument::RunSpec;

use crate::logging::LogFormat;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "conf.ini";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RUNTRACE";

// `RUNTRACE_ARGS__PROJECT` -> `args.project`.
fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("configuration key args.project must not be empty")]
    EmptyProject,
}

/// The `[args]` section: run registration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskConfig {
    pub project: String,
    /// Run name; the wrapped function's identifier when absent.
    #[serde(default)]
    pub task: Option<String>,
    /// Whitespace-separated tag list.
    #[serde(default)]
    pub tags: String,
}

impl TaskConfig {
    pub fn tag_list(&self) -> Vec<String> {
        self.tags.split_whitespace().map(str::to_string).collect()
    }

    pub fn run_spec(&self) -> RunSpec {
        let spec = RunSpec::new(self.project.clone()).with_tags(self.tag_list());
        match self.task.as_deref().filter(|t| !t.is_empty()) {
            Some(task) => spec.with_name(task),
            None => spec,
        }
    }
}

/// The optional `[runtrace]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntraceSettings {
    /// Directory the artifact and report assets are resolved against.
    pub asset_dir: PathBuf,
    /// Base directory for local run bundles.
    pub runs_dir: PathBuf,
    pub log_format: LogFormat,
}

impl Default for RuntraceSettings {
    fn default() -> Self {
        Self {
            asset_dir: PathBuf::from("./"),
            runs_dir: PathBuf::from("."),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Full configuration file contents.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuntraceConfig {
    pub args: TaskConfig,
    #[serde(default)]
    pub runtrace: RuntraceSettings,
}

impl RuntraceConfig {
    /// Load `path` (INI) and apply `RUNTRACE_*` environment overrides.
    ///
    /// A relative `asset_dir` is resolved against the directory holding `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path.as_ref(), environment())
    }

    fn load_with_env(path: &Path, env: config::Environment) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let builder = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Ini)
                    .required(true),
            )
            .add_source(env);
        let mut loaded = Self::finish(builder)?;
        if let Some(dir) = path.parent() {
            loaded.runtrace.asset_dir = dir.join(&loaded.runtrace.asset_dir);
        }
        Ok(loaded)
    }

    /// Parse INI text without consulting the environment.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Ini));
        Self::finish(builder)
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let loaded: Self = builder.build()?.try_deserialize()?;
        if loaded.args.project.trim().is_empty() {
            return Err(ConfigError::EmptyProject);
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "[args]\nproject = Demo\ntask = Task\ntags = sandbox  v1\n";

    #[test]
    fn parses_args_section() {
        let cfg = RuntraceConfig::from_ini_str(SAMPLE).unwrap();
        assert_eq!(cfg.args.project, "Demo");
        assert_eq!(cfg.args.task.as_deref(), Some("Task"));
        assert_eq!(cfg.args.tag_list(), vec!["sandbox", "v1"]);
        assert_eq!(cfg.runtrace, RuntraceSettings::default());
    }

    #[test]
    fn run_spec_uses_task_as_name() {
        let spec = RuntraceConfig::from_ini_str(SAMPLE)
            .unwrap()
            .args
            .run_spec();
        assert_eq!(spec.project, "Demo");
        assert_eq!(spec.effective_name("process_data"), "Task");
        assert_eq!(spec.tags, vec!["sandbox", "v1"]);
    }

    #[test]
    fn missing_task_falls_back_to_identifier() {
        let cfg = RuntraceConfig::from_ini_str("[args]\nproject = Demo\n").unwrap();
        assert!(cfg.args.tag_list().is_empty());
        assert_eq!(cfg.args.run_spec().effective_name("process_data"), "process_data");
    }

    #[test]
    fn reads_runtrace_section() {
        let text = format!("{SAMPLE}\n[runtrace]\nasset_dir = assets\nlog_format = json\n");
        let cfg = RuntraceConfig::from_ini_str(&text).unwrap();
        assert_eq!(cfg.runtrace.asset_dir, PathBuf::from("assets"));
        assert_eq!(cfg.runtrace.runs_dir, PathBuf::from("."));
        assert_eq!(cfg.runtrace.log_format, LogFormat::Json);
    }

    #[test]
    fn rejects_missing_or_empty_project() {
        assert!(matches!(
            RuntraceConfig::from_ini_str("[args]\ntask = x\n"),
            Err(ConfigError::Load(_))
        ));
        assert!(matches!(
            RuntraceConfig::from_ini_str("[args]\nproject =\n"),
            Err(ConfigError::EmptyProject)
        ));
    }

    #[test]
    fn load_reads_file_and_requires_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.ini");
        std::fs::write(&path, SAMPLE).unwrap();
        let env = environment().source(Some(config::Map::new()));
        assert_eq!(
            RuntraceConfig::load_with_env(&path, env).unwrap().args.project,
            "Demo"
        );
        assert!(RuntraceConfig::load(dir.path().join("absent.ini")).is_err());
    }

    #[test]
    fn environment_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.ini");
        std::fs::write(&path, SAMPLE).unwrap();

        let vars: config::Map<String, String> = [
            ("RUNTRACE_ARGS__PROJECT", "Other"),
            ("RUNTRACE_RUNTRACE__LOG_FORMAT", "json"),
            ("UNRELATED_ARGS__TASK", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let cfg = RuntraceConfig::load_with_env(&path, environment().source(Some(vars))).unwrap();

        assert_eq!(cfg.args.project, "Other");
        assert_eq!(cfg.args.task.as_deref(), Some("Task"));
        assert_eq!(cfg.runtrace.log_format, LogFormat::Json);
    }

    #[test]
    fn asset_dir_is_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.ini");
        let env = || environment().source(Some(config::Map::new()));

        std::fs::write(&path, format!("{SAMPLE}[runtrace]\nasset_dir = assets\n")).unwrap();
        let cfg = RuntraceConfig::load_with_env(&path, env()).unwrap();
        assert_eq!(cfg.runtrace.asset_dir, dir.path().join("assets"));

        let absolute = dir.path().join("elsewhere");
        std::fs::write(
            &path,
            format!("{SAMPLE}[runtrace]\nasset_dir = {}\n", absolute.display()),
        )
        .unwrap();
        let cfg = RuntraceConfig::load_with_env(&path, env()).unwrap();
        assert_eq!(cfg.runtrace.asset_dir, absolute);
    }
}
