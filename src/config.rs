use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// One task at a time in topological order; the first failure stops
    /// dispatch.
    #[default]
    Sequential,
    /// Every task whose dependencies have completed is dispatched at once.
    /// Branches independent of a failure keep running to completion.
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mode: SchedulingMode,
    /// Upper bound on simultaneously running tasks in concurrent mode.
    /// Values outside `1..=Semaphore::MAX_PERMITS` are clamped at run time.
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::Sequential,
            max_concurrency: 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn concurrent() -> Self {
        Self {
            mode: SchedulingMode::Concurrent,
            ..Self::default()
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.clamp(1, Semaphore::MAX_PERMITS);
        self
    }
}
