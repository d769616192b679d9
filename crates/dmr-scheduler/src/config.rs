use std::time::Duration;

/// Tuning knobs for [`crate::SchedulingService`], each with a named
/// default.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Handler worker count.
    pub concurrency: usize,
    /// Max wait for a worker to pick up a newly ready task before retrying
    /// the scan.
    pub standard_timeout: Duration,
    /// Retry interval for tasks held back by resource contention.
    pub postponed_timeout: Duration,
    /// Debounce interval between follow-up polls when none were found.
    pub follow_up_delay: Duration,
    /// Lease duration granted when leasing follow-up rows.
    pub follow_up_timeout: Duration,
    /// Max rows leased per follow-up poll.
    pub follow_up_fetch: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            standard_timeout: Duration::from_millis(3000),
            postponed_timeout: Duration::from_millis(1000),
            follow_up_delay: Duration::from_millis(200),
            follow_up_timeout: Duration::from_millis(30_000),
            follow_up_fetch: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        if self.follow_up_fetch < 1 {
            return Err("followUpFetch must be at least 1".to_string());
        }
        Ok(())
    }
}
