//! Engine configuration: a typed struct read at construction, no
//! file-based loader and no CLI (the engine exposes no command surface
//! of its own).

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lease TTL for task-runner sessions.
    pub task_ttl_seconds: u64,
    /// Interval between `tasks.cleanup` ticks.
    pub cleanup_interval_seconds: u64,
    /// How long a finished (or abandoned) task record survives.
    pub retention_seconds: u64,
    /// Max age of the writing File before the scheduler closes it.
    pub default_file_max_age_seconds: u64,
    /// Max aggregated slice bytes before the scheduler closes a File.
    pub default_file_max_bytes: u64,
    /// Max uncompressed bytes per Slice before a local rotate is triggered.
    pub per_slice_max_bytes: u64,
    /// Max age per Slice before a local rotate is triggered.
    pub per_slice_max_age_seconds: u64,
    /// Number of volumes assigned to a new File.
    pub volume_assignment_count: usize,
    /// Preferred volume types, in priority order (e.g. `["hdd"]`).
    pub preferred_volume_types: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_ttl_seconds: 15,
            cleanup_interval_seconds: 15,
            retention_seconds: 3600,
            default_file_max_age_seconds: 3600,
            default_file_max_bytes: 512 * 1024 * 1024,
            per_slice_max_bytes: 128 * 1024 * 1024,
            per_slice_max_age_seconds: 300,
            volume_assignment_count: 1,
            preferred_volume_types: Vec::new(),
        }
    }
}

/// Exponential backoff with jitter. `IncrementRetry` uses base 2min,
/// factor 2, cap 30min; the store's `Unavailable` retry uses base 25ms,
/// factor 2, cap 2s with a 30s elapsed cap. Both call sites share this
/// helper instead of re-deriving the curve.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: std::time::Duration,
    pub factor: f64,
    pub cap: std::time::Duration,
}

impl BackoffPolicy {
    /// `File.IncrementRetry` / `Slice.IncrementRetry` policy.
    pub const RETRY_AFTER: Self = Self {
        base: std::time::Duration::from_secs(120),
        factor: 2.0,
        cap: std::time::Duration::from_secs(1800),
    };

    /// Store-client `Unavailable` retry policy.
    pub const STORE_UNAVAILABLE: Self = Self {
        base: std::time::Duration::from_millis(25),
        factor: 2.0,
        cap: std::time::Duration::from_secs(2),
    };

    /// Duration for the given (1-based) attempt number, with up to ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let unjittered = self.base.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = unjittered.min(self.cap.as_secs_f64());
        let jitter = 1.0 + (rand::random::<f64>() - 0.5) * 0.5;
        std::time::Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::RETRY_AFTER;
        for attempt in 1..20 {
            assert!(policy.delay_for_attempt(attempt) <= policy.cap.mul_f64(1.26));
        }
    }

    #[test]
    fn backoff_grows_then_plateaus() {
        let policy = BackoffPolicy::STORE_UNAVAILABLE;
        let first = policy.delay_for_attempt(1).as_secs_f64();
        assert!(first > 0.0 && first < 0.05);
    }
}
