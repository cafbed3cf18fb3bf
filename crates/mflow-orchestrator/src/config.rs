//! Orchestrator configuration.

use std::time::Duration;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Event handlers in flight per channel
    pub prefetch: usize,
    /// Re-read-and-reapply attempts when a job save loses a race
    pub save_conflict_retries: u32,
    /// Report tasks whose state has not moved for this long
    pub stale_threshold: Duration,
    /// Interval between stale-task scans
    pub stale_check_interval: Duration,
    /// Upper bound on active jobs examined per scan
    pub stale_scan_limit: usize,
    pub stale_detection_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            prefetch: 8,
            save_conflict_retries: 5,
            stale_threshold: Duration::from_secs(3600),
            stale_check_interval: Duration::from_secs(300),
            stale_scan_limit: 500,
            stale_detection_enabled: true,
        }
    }
}

impl OrchestratorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            prefetch: std::env::var("ORCHESTRATOR_PREFETCH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.prefetch),
            save_conflict_retries: std::env::var("SAVE_CONFLICT_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.save_conflict_retries),
            stale_threshold: std::env::var("STALE_TASK_THRESHOLD_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_threshold),
            stale_check_interval: std::env::var("STALE_CHECK_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_check_interval),
            stale_scan_limit: std::env::var("STALE_SCAN_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.stale_scan_limit),
            stale_detection_enabled: std::env::var("ENABLE_STALE_DETECTION")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.stale_detection_enabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("SAVE_CONFLICT_RETRIES", "2");
        std::env::set_var("STALE_TASK_THRESHOLD_SECS", "60");
        std::env::set_var("ENABLE_STALE_DETECTION", "false");

        let config = OrchestratorConfig::from_env();

        std::env::remove_var("SAVE_CONFLICT_RETRIES");
        std::env::remove_var("STALE_TASK_THRESHOLD_SECS");
        std::env::remove_var("ENABLE_STALE_DETECTION");

        assert_eq!(config.save_conflict_retries, 2);
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
        assert!(!config.stale_detection_enabled);
        assert_eq!(config.prefetch, 8);
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        std::env::set_var("ORCHESTRATOR_PREFETCH", "many");
        let config = OrchestratorConfig::from_env();
        std::env::remove_var("ORCHESTRATOR_PREFETCH");

        assert_eq!(config.prefetch, 8);
        assert_eq!(config.save_conflict_retries, 5);
    }
}
