//! Configuration types.

use std::time::Duration;

/// Policy for stage-entry events that match both a global automation and a
/// stage-specific one.
///
/// The CRM's historical behavior is to fire both; whether that is intended
/// business behavior is an open product question, so it is a configuration
/// knob rather than a hard-coded answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateStagePolicy {
    /// Fire both the global and the stage-specific automation.
    FireBoth,
    /// Suppress global automations when a stage-specific automation of the
    /// same channel matched the same event.
    PreferStageSpecific,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between scheduler passes.
    pub tick_interval: Duration,
    /// Clock hour (UTC) used for countdown sends when a tenant has not
    /// configured one.
    pub default_send_hour: u32,
    /// Countdown fire times older than this are skipped, not backfilled.
    pub countdown_grace_days: i64,
    /// How global-vs-stage-specific double matches are handled.
    pub duplicate_stage_policy: DuplicateStagePolicy,
    /// Days of upcoming anchor dates scanned per countdown automation per
    /// pass (bounds the calendar collaborator query).
    pub countdown_horizon_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            default_send_hour: 10,
            countdown_grace_days: 1,
            duplicate_stage_policy: DuplicateStagePolicy::FireBoth,
            countdown_horizon_days: 1,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let tick_secs: u64 = std::env::var("STUDIOFLOW_TICK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.tick_interval.as_secs());

        let default_send_hour: u32 = std::env::var("STUDIOFLOW_SEND_HOUR")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|h| *h < 24)
            .unwrap_or(defaults.default_send_hour);

        let countdown_grace_days: i64 = std::env::var("STUDIOFLOW_GRACE_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.countdown_grace_days);

        let duplicate_stage_policy = match std::env::var("STUDIOFLOW_DUPLICATE_STAGE_POLICY")
            .ok()
            .as_deref()
        {
            Some("prefer_stage_specific") => DuplicateStagePolicy::PreferStageSpecific,
            _ => DuplicateStagePolicy::FireBoth,
        };

        Self {
            tick_interval: Duration::from_secs(tick_secs),
            default_send_hour,
            countdown_grace_days,
            duplicate_stage_policy,
            countdown_horizon_days: defaults.countdown_horizon_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.tick_interval.as_secs(), 60);
        assert_eq!(config.default_send_hour, 10);
        assert_eq!(config.countdown_grace_days, 1);
        assert_eq!(
            config.duplicate_stage_policy,
            DuplicateStagePolicy::FireBoth
        );
    }
}
