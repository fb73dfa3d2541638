//! Pipeline definitions: stages, commands, post-actions and global config.
//!
//! Definitions are static. They are loaded from TOML or JSON, validated once,
//! and never mutated while a build runs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::artifact::ArtifactSpec;
use crate::domain::error::{ConfigError, EngineError, Result};
use crate::domain::record::BuildId;

/// Default global pipeline timeout in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 30;
/// Default number of builds whose artifacts are retained.
pub const DEFAULT_BUILDS_TO_KEEP: usize = 5;
/// Upper bound for `timeoutMinutes` (one week).
pub const MAX_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

fn default_timeout_minutes() -> u64 {
    DEFAULT_TIMEOUT_MINUTES
}

fn default_builds_to_keep() -> usize {
    DEFAULT_BUILDS_TO_KEEP
}

fn default_enabled() -> bool {
    true
}

/// Recognised configuration keys of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineConfig {
    /// Container image name exported as `IMAGE_NAME`.
    #[serde(default)]
    pub image_name: Option<String>,

    /// Image tag; derived from the build number when absent.
    #[serde(default)]
    pub image_tag: Option<String>,

    /// Global timeout for the whole build.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,

    /// Retention count for artifacts and images.
    #[serde(default = "default_builds_to_keep")]
    pub builds_to_keep: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image_name: None,
            image_tag: None,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            builds_to_keep: DEFAULT_BUILDS_TO_KEEP,
        }
    }
}

/// A single external command: argv plus environment, never a shell string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable followed by its arguments.
    pub argv: Vec<String>,

    /// Extra environment for this command only.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory relative to the workspace root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Per-command timeout; falls back to the stage timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Failure is logged as a warning and does not halt the stage.
    #[serde(default)]
    pub best_effort: bool,

    /// Exit codes that signal a degraded (unstable) result rather than failure.
    #[serde(default)]
    pub unstable_exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout_secs: None,
            best_effort: false,
            unstable_exit_codes: Vec::new(),
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn unstable_on(mut self, codes: &[i32]) -> Self {
        self.unstable_exit_codes = codes.to_vec();
        self
    }

    /// Human-readable rendering for logs and reports. Never executed.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Post-actions attached to a stage, keyed by outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagePost {
    #[serde(default)]
    pub always: Vec<CommandSpec>,
    #[serde(default)]
    pub success: Vec<CommandSpec>,
    #[serde(default)]
    pub failure: Vec<CommandSpec>,
    #[serde(default)]
    pub unstable: Vec<CommandSpec>,
}

/// Pipeline-level post hooks. `cleanup` runs last, whatever happened.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelinePost {
    #[serde(default)]
    pub always: Vec<CommandSpec>,
    #[serde(default)]
    pub success: Vec<CommandSpec>,
    #[serde(default)]
    pub failure: Vec<CommandSpec>,
    #[serde(default)]
    pub unstable: Vec<CommandSpec>,
    #[serde(default)]
    pub aborted: Vec<CommandSpec>,
    #[serde(default)]
    pub cleanup: Vec<CommandSpec>,
}

/// Commands run once per pruned build (e.g. removing its image tag).
///
/// Each command receives `PRUNED_BUILD_NUMBER` in its environment, plus
/// `PRUNED_IMAGE_TAG` unless a fixed `imageTag` is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionSpec {
    #[serde(default)]
    pub prune_commands: Vec<CommandSpec>,
}

/// A named unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDefinition {
    pub name: String,

    pub commands: Vec<CommandSpec>,

    #[serde(default)]
    pub post: StagePost,

    /// Timeout override applied to each command of this stage.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// A failure here is recorded but does not abort the pipeline.
    #[serde(default)]
    pub non_fatal: bool,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Stages that must run before this one.
    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, commands: Vec<CommandSpec>) -> Self {
        Self {
            name: name.into(),
            commands,
            post: StagePost::default(),
            timeout_secs: None,
            non_fatal: false,
            enabled: true,
            needs: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_post(mut self, post: StagePost) -> Self {
        self.post = post;
        self
    }

    pub fn with_artifact(mut self, spec: ArtifactSpec) -> Self {
        self.artifacts.push(spec);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn needs(mut self, stage: impl Into<String>) -> Self {
        self.needs.push(stage.into());
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.non_fatal = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Complete declaration of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineDefinition {
    pub name: String,

    #[serde(default)]
    pub config: PipelineConfig,

    /// Environment shared by every command of the pipeline.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Executables that must be on PATH before any stage runs.
    #[serde(default)]
    pub required_tools: Vec<String>,

    pub stages: Vec<StageDefinition>,

    #[serde(default)]
    pub post: PipelinePost,

    #[serde(default)]
    pub retention: RetentionSpec,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            config: PipelineConfig::default(),
            env: BTreeMap::new(),
            required_tools: Vec::new(),
            stages,
            post: PipelinePost::default(),
            retention: RetentionSpec::default(),
        }
    }

    /// Load and validate a definition, picking the parser by file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("").to_string()).into()),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let def: Self = toml::from_str(raw).map_err(ConfigError::from)?;
        def.validate()?;
        Ok(def)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let def: Self = serde_json::from_str(raw).map_err(ConfigError::from)?;
        def.validate()?;
        Ok(def)
    }

    /// Check structural invariants: names, commands, dependencies, cycles.
    pub fn validate(&self) -> Result<()> {
        if !is_path_safe(&self.name) {
            return Err(invalid(format!(
                "pipeline name {:?} must be non-empty and use only [A-Za-z0-9._-]",
                self.name
            )));
        }
        if self.stages.is_empty() {
            return Err(invalid("stages cannot be empty"));
        }
        if self.config.timeout_minutes == 0 || self.config.timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(invalid(format!(
                "timeoutMinutes must be between 1 and {}",
                MAX_TIMEOUT_MINUTES
            )));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(invalid("stage name cannot be empty"));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage name: {}", stage.name)));
            }
            if stage.commands.is_empty() {
                return Err(invalid(format!("stage {} has no commands", stage.name)));
            }
            let post = &stage.post;
            let all = stage
                .commands
                .iter()
                .chain(&post.always)
                .chain(&post.success)
                .chain(&post.failure)
                .chain(&post.unstable);
            for cmd in all {
                check_command(cmd, &format!("stage {}", stage.name))?;
            }
            let mut artifact_names = HashSet::new();
            for spec in &stage.artifacts {
                if !is_path_safe(&spec.name) {
                    return Err(invalid(format!(
                        "artifact name {:?} in stage {} must use only [A-Za-z0-9._-]",
                        spec.name, stage.name
                    )));
                }
                if !artifact_names.insert(spec.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate artifact {} in stage {}",
                        spec.name, stage.name
                    )));
                }
                if !is_relative_pattern(&spec.pattern) {
                    return Err(invalid(format!(
                        "artifact pattern {:?} in stage {} must be relative to the workspace",
                        spec.pattern, stage.name
                    )));
                }
            }
        }

        let hooks = &self.post;
        let pipeline_commands = hooks
            .always
            .iter()
            .chain(&hooks.success)
            .chain(&hooks.failure)
            .chain(&hooks.unstable)
            .chain(&hooks.aborted)
            .chain(&hooks.cleanup)
            .chain(&self.retention.prune_commands);
        for cmd in pipeline_commands {
            check_command(cmd, "pipeline hooks")?;
        }

        for stage in &self.stages {
            for dep in &stage.needs {
                if !seen.contains(dep.as_str()) {
                    return Err(invalid(format!(
                        "stage {} needs unknown stage {}",
                        stage.name, dep
                    )));
                }
                if dep == &stage.name {
                    return Err(invalid(format!("stage {} needs itself", stage.name)));
                }
            }
        }

        self.execution_order().map(|_| ())
    }

    /// Stages in execution order.
    ///
    /// Stable topological sort: among ready stages the earliest declared runs
    /// first, so a definition without `needs` runs in declaration order.
    pub fn execution_order(&self) -> Result<Vec<&StageDefinition>> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut order: Vec<&StageDefinition> = Vec::with_capacity(self.stages.len());

        while order.len() < self.stages.len() {
            let next = self.stages.iter().find(|s| {
                !placed.contains(s.name.as_str())
                    && s.needs.iter().all(|d| placed.contains(d.as_str()))
            });
            match next {
                Some(stage) => {
                    placed.insert(stage.name.as_str());
                    order.push(stage);
                }
                None => {
                    let stuck: Vec<&str> = self
                        .stages
                        .iter()
                        .filter(|s| !placed.contains(s.name.as_str()))
                        .map(|s| s.name.as_str())
                        .collect();
                    return Err(invalid(format!(
                        "dependency cycle among stages: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }

        Ok(order)
    }

    /// Deterministic digest of the ordered stage names.
    pub fn stages_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for stage in &self.stages {
            hasher.update(stage.name.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_minutes.saturating_mul(60))
    }

    /// Image tag for a build: the configured tag, or the build number.
    pub fn image_tag(&self, build_id: BuildId) -> String {
        self.config
            .image_tag
            .clone()
            .unwrap_or_else(|| build_id.to_string())
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidDefinition(msg.into())
}

/// Names used as path components must stay inside their parent directory.
pub fn is_path_safe(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn check_command(cmd: &CommandSpec, owner: &str) -> Result<()> {
    if cmd.argv.is_empty() || cmd.argv[0].is_empty() {
        return Err(invalid(format!("{} has an empty command", owner)));
    }
    if let Some(dir) = &cmd.working_dir {
        let inside = dir.to_str().is_some_and(is_relative_pattern);
        if !inside {
            return Err(invalid(format!(
                "working_dir {:?} of `{}` in {} must stay inside the workspace",
                dir,
                cmd.display(),
                owner
            )));
        }
    }
    Ok(())
}

fn is_relative_pattern(pattern: &str) -> bool {
    !pattern.trim().is_empty()
        && !Path::new(pattern).is_absolute()
        && !pattern.split(['/', '\\']).any(|part| part == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str) -> StageDefinition {
        StageDefinition::new(name, vec![CommandSpec::new(["true"])])
    }

    #[test]
    fn test_linear_order_is_declaration_order() {
        let def = PipelineDefinition::new(
            "etl",
            vec![stage("checkout"), stage("test"), stage("publish")],
        );
        let names: Vec<_> = def
            .execution_order()
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["checkout", "test", "publish"]);
    }

    #[test]
    fn test_needs_reorders_stably() {
        let def = PipelineDefinition::new(
            "etl",
            vec![
                stage("publish").needs("build"),
                stage("build"),
                stage("lint"),
            ],
        );
        let names: Vec<_> = def
            .execution_order()
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["build", "publish", "lint"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let def = PipelineDefinition::new(
            "etl",
            vec![stage("a").needs("b"), stage("b").needs("a")],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = PipelineDefinition::new("etl", vec![stage("a").needs("ghost")]);
        assert!(def.validate().unwrap_err().to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let def = PipelineDefinition::new("etl", vec![stage("a"), stage("a")]);
        assert!(def.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let def = PipelineDefinition::new(
            "etl",
            vec![StageDefinition::new("a", vec![CommandSpec::new(Vec::<String>::new())])],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_unsafe_pipeline_name_rejected() {
        let def = PipelineDefinition::new("../escape", vec![stage("a")]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_escaping_artifact_pattern_rejected() {
        for pattern in ["/etc/*", "../outside/*.tar", "build/../../x", ""] {
            let def = PipelineDefinition::new(
                "p",
                vec![stage("a").with_artifact(ArtifactSpec::new("out", pattern))],
            );
            assert!(def.validate().is_err(), "pattern {pattern:?} accepted");
        }
        let ok = PipelineDefinition::new(
            "p",
            vec![stage("a").with_artifact(ArtifactSpec::new("out", "dist/**/*.whl"))],
        );
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_escaping_working_dir_rejected() {
        for dir in ["/tmp", "../sibling", "src/../../up"] {
            let mut cmd = CommandSpec::new(["make"]);
            cmd.working_dir = Some(PathBuf::from(dir));
            let def = PipelineDefinition::new("p", vec![StageDefinition::new("a", vec![cmd])]);
            assert!(def.validate().is_err(), "working_dir {dir:?} accepted");
        }

        let mut cleanup = CommandSpec::new(["docker", "rm", "etl"]);
        cleanup.working_dir = Some(PathBuf::from("/"));
        let mut def = PipelineDefinition::new("p", vec![stage("a")]);
        def.post.cleanup.push(cleanup);
        assert!(def.validate().is_err());

        let mut nested = CommandSpec::new(["pytest"]);
        nested.working_dir = Some(PathBuf::from("src/app"));
        let ok = PipelineDefinition::new("p", vec![StageDefinition::new("a", vec![nested])]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_timeout_minutes_bounded() {
        let raw = r#"
            name = "p"
            [config]
            timeoutMinutes = 200000000000000000
            [[stages]]
            name = "a"
            commands = [{ argv = ["true"] }]
        "#;
        let err = PipelineDefinition::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("timeoutMinutes"));

        let mut def = PipelineDefinition::new("p", vec![stage("a")]);
        def.config.timeout_minutes = MAX_TIMEOUT_MINUTES;
        assert!(def.validate().is_ok());
        assert_eq!(def.global_timeout(), Duration::from_secs(MAX_TIMEOUT_MINUTES * 60));
    }

    #[test]
    fn test_stages_digest_order_sensitive() {
        let a = PipelineDefinition::new("p", vec![stage("fmt"), stage("check")]);
        let b = PipelineDefinition::new("p", vec![stage("check"), stage("fmt")]);
        assert_ne!(a.stages_digest(), b.stages_digest());
        assert_eq!(a.stages_digest(), a.clone().stages_digest());
    }

    #[test]
    fn test_image_tag_defaults_to_build_number() {
        let mut def = PipelineDefinition::new("p", vec![stage("a")]);
        assert_eq!(def.image_tag(BuildId(42)), "42");
        def.config.image_tag = Some("latest".to_string());
        assert_eq!(def.image_tag(BuildId(42)), "latest");
    }

    #[test]
    fn test_from_toml_with_config_keys() {
        let raw = r#"
            name = "etl-pipeline"
            required_tools = ["git"]

            [config]
            imageName = "etl-app"
            timeoutMinutes = 10
            buildsToKeep = 3

            [[stages]]
            name = "checkout"
            commands = [{ argv = ["git", "status"] }]

            [[stages]]
            name = "tests"
            timeout_secs = 120
            commands = [{ argv = ["pytest", "-q"], unstable_exit_codes = [1] }]

            [[stages.artifacts]]
            name = "junit"
            pattern = "reports/*.xml"
            allow_empty = true
        "#;
        let def = PipelineDefinition::from_toml_str(raw).unwrap();
        assert_eq!(def.config.image_name.as_deref(), Some("etl-app"));
        assert_eq!(def.config.timeout_minutes, 10);
        assert_eq!(def.config.builds_to_keep, 3);
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.stages[1].commands[0].unstable_exit_codes, vec![1]);
        assert!(def.stages[1].artifacts[0].allow_empty);
        assert!(def.stages[0].enabled);
        assert_eq!(def.global_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_unknown_config_key_rejected() {
        let raw = r#"
            name = "p"
            [config]
            imageNmae = "typo"
            [[stages]]
            name = "a"
            commands = [{ argv = ["true"] }]
        "#;
        assert!(PipelineDefinition::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_from_json() {
        let raw = r#"{
            "name": "p",
            "stages": [{ "name": "a", "commands": [{ "argv": ["true"] }] }]
        }"#;
        let def = PipelineDefinition::from_json_str(raw).unwrap();
        assert_eq!(def.config.timeout_minutes, DEFAULT_TIMEOUT_MINUTES);
        assert_eq!(def.config.builds_to_keep, DEFAULT_BUILDS_TO_KEEP);
    }

    #[test]
    fn test_from_path_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "name: p").unwrap();
        let err = PipelineDefinition::from_path(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }
}
