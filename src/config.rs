//! Settings of a task pool.
use crate::error::PoolError;
use serde::{Deserialize, Serialize};

/// How a [`TaskPool`](crate::pool::TaskPool) divides the ranks of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// The number of ranks in each worker group
    pub cpus_per_worker: usize,
    /// Hand ranks that do not fill a whole worker group to the first groups
    /// instead of leaving them idle
    pub use_all_cpus: bool,
    /// Log every task sent and every result received at `info` level
    pub debug: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            cpus_per_worker: 1,
            use_all_cpus: false,
            debug: false,
        }
    }
}

impl PoolConfig {
    /// Reads the settings from a JSON object. Missing fields keep their
    /// default.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, PoolError> {
        Ok(PoolConfig::deserialize(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_keep_defaults() {
        let config = PoolConfig::from_json(&json!({ "cpus_per_worker": 3 })).unwrap();
        assert_eq!(config.cpus_per_worker, 3);
        assert!(!config.use_all_cpus);
        assert!(!config.debug);
        assert_eq!(PoolConfig::from_json(&json!({})).unwrap(), PoolConfig::default());
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(matches!(
            PoolConfig::from_json(&json!({ "use_all_cpus": "yes" })),
            Err(PoolError::Json(_))
        ));
    }
}
