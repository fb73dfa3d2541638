//! Declared and collected artifacts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An artifact a stage declares it produces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactSpec {
    /// Logical name (e.g. "test-results").
    pub name: String,

    /// Glob pattern relative to the workspace root.
    pub pattern: String,

    /// Whether matching zero files is acceptable.
    #[serde(default)]
    pub allow_empty: bool,

    /// Record a SHA-256 fingerprint for each collected file.
    #[serde(default)]
    pub fingerprint: bool,

    /// Exempt from retention pruning.
    #[serde(default)]
    pub keep_forever: bool,
}

impl ArtifactSpec {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            allow_empty: false,
            fingerprint: false,
            keep_forever: false,
        }
    }

    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    pub fn fingerprinted(mut self) -> Self {
        self.fingerprint = true;
        self
    }

    pub fn keep_forever(mut self) -> Self {
        self.keep_forever = true;
        self
    }
}

/// A file collected into the artifact store. Never mutated after collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    /// Logical name from the declaring [`ArtifactSpec`].
    pub name: String,

    /// Path relative to the workspace root the file was copied from.
    pub source_path: PathBuf,

    /// Absolute path inside the artifact store.
    pub stored_path: PathBuf,

    /// Size in bytes.
    pub size_bytes: u64,

    /// SHA-256 hex digest, when fingerprinting was requested.
    pub fingerprint: Option<String>,

    /// Survives retention pruning.
    pub keep_forever: bool,
}
