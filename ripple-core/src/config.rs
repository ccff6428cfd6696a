//! Engine Configuration

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads in the engine's pool. `0` lets rayon pick (one per
    /// logical CPU, or `RAYON_NUM_THREADS`).
    pub worker_threads: usize,

    /// Prefix for worker thread names; threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,

    /// Pulse independent branches of a wave on the pool. When `false` the
    /// wave is drained on the calling thread in FIFO order, which makes
    /// pulse order reproducible.
    pub parallel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name_prefix: "ripple-worker".to_string(),
            parallel: true,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Drain waves on the calling thread.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub(crate) fn build_pool(&self) -> Result<rayon::ThreadPool> {
        let prefix = self.thread_name_prefix.clone();
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_threads)
            .thread_name(move |index| format!("{prefix}-{index}"))
            .build()
            .map_err(|e| EngineError::ThreadPool(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{ "worker_threads": 3 }"#).unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.thread_name_prefix, "ripple-worker");
        assert!(config.parallel);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = EngineConfig::from_json("{ worker_threads: }").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn builders() {
        let config = EngineConfig::default()
            .with_worker_threads(2)
            .with_thread_name_prefix("test")
            .sequential();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.thread_name_prefix, "test");
        assert!(!config.parallel);

        let pool = config.build_pool().unwrap();
        assert_eq!(pool.current_num_threads(), 2);
    }
}
