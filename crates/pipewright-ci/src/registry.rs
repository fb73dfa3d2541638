//! Process-wide guard against concurrent builds of the same pipeline.

use pipewright_core::{EngineError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Default)]
pub struct RunRegistry {
    active: Mutex<HashSet<String>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every controller in this process.
    pub fn global() -> Arc<RunRegistry> {
        static GLOBAL: OnceLock<Arc<RunRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(RunRegistry::new())).clone()
    }

    /// Claim `pipeline`; fails with [`EngineError::ConcurrentRun`] while
    /// another lease for it is alive.
    pub fn acquire(self: &Arc<Self>, pipeline: &str) -> Result<RunLease> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(pipeline.to_string()) {
            return Err(EngineError::ConcurrentRun {
                pipeline: pipeline.to_string(),
            });
        }
        Ok(RunLease {
            registry: Arc::clone(self),
            pipeline: pipeline.to_string(),
        })
    }

    pub fn is_running(&self, pipeline: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(pipeline)
    }
}

/// Releases the pipeline claim when dropped.
#[derive(Debug)]
pub struct RunLease {
    registry: Arc<RunRegistry>,
    pipeline: String,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.pipeline);
    }
}
