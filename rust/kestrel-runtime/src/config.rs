//! Scheduler configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads; `0` means one per available CPU.
    pub workers: usize,
}

impl SchedulerConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_workers_means_cpu_count() {
        let config: SchedulerConfig = toml::from_str("").unwrap();
        assert_eq!(config.workers, 0);
        assert!(config.worker_count() >= 1);
        let config: SchedulerConfig = toml::from_str("workers = 3").unwrap();
        assert_eq!(config.worker_count(), 3);
    }
}
