//! Artifact collection into a per-pipeline store, plus retention.
//!
//! Layout under the store root:
//!
//! ```text
//! index.json
//! builds/<build_id>/artifacts/<name>/<path relative to workspace>
//! builds/<build_id>/build-record.json, summary.txt, junit.xml
//! ```

use chrono::{DateTime, Utc};
use pipewright_core::obs;
use pipewright_core::{Artifact, ArtifactSpec, BuildId, EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const INDEX_FILE: &str = "index.json";

/// Artifacts recorded for one build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildArtifacts {
    pub build_id: BuildId,
    pub started_at: DateTime<Utc>,
    pub artifacts: Vec<Artifact>,
    /// Retention already removed this build; only keep-forever files remain.
    #[serde(default)]
    pub pruned: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArtifactIndex {
    /// Highest build number ever registered, including pruned ones.
    #[serde(default)]
    pub last_build: Option<BuildId>,
    #[serde(default)]
    pub builds: BTreeMap<u64, BuildArtifacts>,
}

/// Result of collecting a stage's declared artifacts.
#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub artifacts: Vec<Artifact>,
    /// One entry per spec that could not be satisfied.
    pub errors: Vec<EngineError>,
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub pruned: Vec<BuildId>,
    /// Deletion failures. Never fatal.
    pub warnings: Vec<EngineError>,
}

pub struct ArtifactCollector {
    root: PathBuf,
    index: ArtifactIndex,
}

impl ArtifactCollector {
    /// Open (or create) a store rooted at `root` and load its index.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("builds"))?;
        let index_path = root.join(INDEX_FILE);
        let index = match fs::read_to_string(&index_path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ArtifactIndex::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { root, index })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a build's artifacts and reports.
    pub fn build_dir(&self, build_id: BuildId) -> PathBuf {
        self.root.join("builds").join(build_id.to_string())
    }

    pub fn register_build(&mut self, build_id: BuildId, started_at: DateTime<Utc>) -> Result<()> {
        self.index.builds.insert(
            build_id.0,
            BuildArtifacts {
                build_id,
                started_at,
                artifacts: Vec::new(),
                pruned: false,
            },
        );
        if self.index.last_build.map_or(true, |last| build_id > last) {
            self.index.last_build = Some(build_id);
        }
        fs::create_dir_all(self.build_dir(build_id))?;
        self.persist()
    }

    /// Collect every spec, recording the artifacts in the index.
    ///
    /// A spec that matches nothing (and does not allow that) is reported in
    /// [`CollectOutcome::errors`]; the other specs are still collected.
    pub fn collect(
        &mut self,
        build_id: BuildId,
        specs: &[ArtifactSpec],
        workspace: &Path,
    ) -> Result<CollectOutcome> {
        let mut outcome = CollectOutcome::default();
        if specs.is_empty() {
            return Ok(outcome);
        }
        for spec in specs {
            match self.collect_one(build_id, spec, workspace) {
                Ok(mut found) => outcome.artifacts.append(&mut found),
                Err(e) => {
                    warn!(artifact = %spec.name, error = %e, "artifact collection failed");
                    outcome.errors.push(e);
                }
            }
        }

        if let Some(entry) = self.index.builds.get_mut(&build_id.0) {
            entry.artifacts.extend(outcome.artifacts.iter().cloned());
        }
        self.persist()?;
        Ok(outcome)
    }

    /// Copy the files matching one spec into the store.
    pub fn collect_one(
        &self,
        build_id: BuildId,
        spec: &ArtifactSpec,
        workspace: &Path,
    ) -> Result<Vec<Artifact>> {
        let full_pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&workspace.to_string_lossy()),
            spec.pattern
        );
        let paths = glob::glob(&full_pattern).map_err(|e| {
            EngineError::InvalidDefinition(format!("artifact pattern {}: {}", spec.pattern, e))
        })?;

        let dest_root = self.build_dir(build_id).join("artifacts").join(&spec.name);
        let mut collected = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(artifact = %spec.name, error = %e, "unreadable path while matching");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            let relative = path.strip_prefix(workspace).unwrap_or(&path).to_path_buf();
            let stored_path = dest_root.join(&relative);
            if let Some(parent) = stored_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let size_bytes = fs::copy(&path, &stored_path)?;
            let fingerprint = if spec.fingerprint {
                Some(sha256_file(&stored_path)?)
            } else {
                None
            };
            debug!(artifact = %spec.name, path = %relative.display(), size_bytes, "collected");
            collected.push(Artifact {
                name: spec.name.clone(),
                source_path: relative,
                stored_path,
                size_bytes,
                fingerprint,
                keep_forever: spec.keep_forever,
            });
        }

        if collected.is_empty() && !spec.allow_empty {
            return Err(EngineError::ArtifactMissing {
                name: spec.name.clone(),
                pattern: spec.pattern.clone(),
            });
        }
        Ok(collected)
    }

    pub fn artifacts(&self, build_id: BuildId) -> Option<&[Artifact]> {
        self.index
            .builds
            .get(&build_id.0)
            .map(|b| b.artifacts.as_slice())
    }

    /// Known builds in build-number order.
    pub fn builds(&self) -> impl Iterator<Item = &BuildArtifacts> {
        self.index.builds.values()
    }

    pub fn last_build_id(&self) -> Option<BuildId> {
        self.index.last_build
    }

    /// Keep the `keep_last` most recent builds and delete the rest.
    ///
    /// Recency is `started_at` descending, ties broken by build number
    /// descending. Keep-forever artifacts survive; their build stays in the
    /// index marked as pruned.
    pub fn prune(&mut self, keep_last: usize) -> Result<PruneReport> {
        let mut live: Vec<(DateTime<Utc>, u64)> = self
            .index
            .builds
            .values()
            .filter(|b| !b.pruned)
            .map(|b| (b.started_at, b.build_id.0))
            .collect();
        live.sort_by(|a, b| b.cmp(a));

        let mut report = PruneReport::default();
        for (_, id) in live.into_iter().skip(keep_last) {
            let build_id = BuildId(id);
            let Some(entry) = self.index.builds.get_mut(&id) else {
                continue;
            };
            let (kept, doomed): (Vec<Artifact>, Vec<Artifact>) =
                entry.artifacts.drain(..).partition(|a| a.keep_forever);

            let removed = doomed.len();
            if kept.is_empty() {
                self.index.builds.remove(&id);
                let dir = self.build_dir(build_id);
                if let Err(e) = remove_dir_all_tolerant(&dir) {
                    obs::emit_cleanup_error(&dir.display().to_string(), &e);
                    report.warnings.push(e.into());
                }
            } else {
                entry.artifacts = kept;
                entry.pruned = true;
                for artifact in &doomed {
                    if let Err(e) = remove_file_tolerant(&artifact.stored_path) {
                        obs::emit_cleanup_error(&artifact.stored_path.display().to_string(), &e);
                        report.warnings.push(e.into());
                    }
                }
            }

            obs::emit_retention_pruned(build_id, removed);
            report.pruned.push(build_id);
        }

        report.pruned.sort();
        self.persist()?;
        Ok(report)
    }

    /// Write the index atomically.
    pub fn persist(&self) -> Result<()> {
        let raw = serde_json::to_vec_pretty(&self.index)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&raw)?;
        tmp.persist(self.root.join(INDEX_FILE))
            .map_err(|e| e.error)?;
        Ok(())
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn remove_dir_all_tolerant(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_file_tolerant(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
