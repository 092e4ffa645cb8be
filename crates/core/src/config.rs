//! Runtime tunables for the queue and worker pools.

use std::collections::HashMap;
use std::time::Duration;

use crate::pipeline::stage::Stage;

/// Knobs governing retry, pausing, leasing and retention. Defaults match
/// production settings; tests shrink the durations.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Total attempt budget per job, including the first run.
    pub max_attempts: u32,
    /// Base delay for exponential backoff: `base * 2^(attempts - 1)`.
    pub backoff_base: Duration,
    /// How long a stage waits for an answer before the attempt fails.
    pub question_timeout: Duration,
    /// Active jobs whose lease passes this age are assumed orphaned and
    /// returned to the queue. Must comfortably exceed `question_timeout`.
    pub lease_duration: Duration,
    /// Fallback poll cadence for workers when no wakeup arrives.
    pub poll_interval: Duration,
    /// Cadence of the lease reaper and retention purge.
    pub maintenance_interval: Duration,
    /// Skip the plan approval gate and push straight to the Generator.
    pub auto_approve_plans: bool,
    /// Completed jobs older than this are purged.
    pub completed_retention: Duration,
    /// Failed jobs older than this are purged.
    pub failed_retention: Duration,
    /// Per-stage worker slot overrides. Stages not listed use defaults.
    pub concurrency: HashMap<Stage, usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(5000),
            question_timeout: Duration::from_secs(300),
            lease_duration: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_millis(250),
            maintenance_interval: Duration::from_secs(30),
            auto_approve_plans: false,
            completed_retention: Duration::from_secs(24 * 60 * 60),
            failed_retention: Duration::from_secs(7 * 24 * 60 * 60),
            concurrency: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Worker slots for a stage. Intake is cheap validation so it runs
    /// wide; the Generator is the expensive stage and runs alone.
    pub fn concurrency_for(&self, stage: Stage) -> usize {
        if let Some(&n) = self.concurrency.get(&stage) {
            return n.max(1);
        }
        match stage {
            Stage::Intake => 5,
            Stage::Researcher => 3,
            Stage::Planner => 2,
            Stage::Generator => 1,
            Stage::Deployer => 2,
            Stage::Documents => 2,
        }
    }

    /// Delay before attempt `attempts_made + 1` of a retried job.
    pub fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(16);
        self.backoff_base * 2u32.pow(exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(5000));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(10000));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(20000));
    }

    #[test]
    fn concurrency_defaults_and_overrides() {
        let mut cfg = PipelineConfig::default();
        assert_eq!(cfg.concurrency_for(Stage::Intake), 5);
        assert_eq!(cfg.concurrency_for(Stage::Generator), 1);
        cfg.concurrency.insert(Stage::Generator, 0);
        assert_eq!(cfg.concurrency_for(Stage::Generator), 1);
        cfg.concurrency.insert(Stage::Researcher, 8);
        assert_eq!(cfg.concurrency_for(Stage::Researcher), 8);
    }
}
