//! Scheduler configuration.

use serde::{Deserialize, Serialize};

use crate::domain::SchedulerError;

/// Scheduler configuration.
///
/// Missing JSON fields fall back to the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker slots (maximum simultaneously Running tasks).
    pub pool_size: usize,

    /// How many finished handles keep their report (and, once observed,
    /// their result). Older ones are forgotten.
    pub history_limit: usize,
}

impl SchedulerConfig {
    /// Two lanes per logical CPU, like the usual thread-pool heuristic.
    pub fn default_pool_size() -> usize {
        num_cpus::get().max(1) * 2
    }

    pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, SchedulerError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.pool_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.history_limit == 0 {
            return Err(SchedulerError::InvalidConfig(
                "history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: Self::default_pool_size(),
            history_limit: Self::DEFAULT_HISTORY_LIMIT,
        }
    }
}
