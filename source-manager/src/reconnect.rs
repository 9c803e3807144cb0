//! Reconnect policy shared by every transport.
//!
//! The delay is fixed: each retry waits exactly `delay`, no matter how many
//! attempts came before it. Attempts are counted across the lifetime of the
//! source and only reset when a transport explicitly asks for it (the gateway
//! transport does so on `READY`).

use sourcebus::SourceConfig;
use std::time::Duration;

/// Decides whether a dropped connection should be retried.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    enabled: bool,
    delay: Duration,
    /// `None` means unbounded
    max_attempts: Option<u32>,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(enabled: bool, delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            enabled,
            delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(
            config.reconnect,
            config.reconnect_delay(),
            config.max_reconnect_attempts,
        )
    }

    /// Returns true when another retry may be scheduled.
    pub fn should_retry(&self) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| self.attempts < max)
    }

    /// Counts one attempt and returns the new total.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sourcebus::SourceKind;

    #[test]
    fn test_disabled_never_retries() {
        let policy = ReconnectPolicy::new(false, Duration::from_millis(10), None);
        assert!(!policy.should_retry());
    }

    #[test]
    fn test_unbounded_always_retries() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_millis(10), None);
        for _ in 0..1000 {
            assert!(policy.should_retry());
            policy.record_attempt();
        }
        assert_eq!(policy.attempts(), 1000);
    }

    #[test]
    fn test_max_attempts_stops_after_n() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_millis(10), Some(2));

        assert!(policy.should_retry());
        assert_eq!(policy.record_attempt(), 1);
        assert!(policy.should_retry());
        assert_eq!(policy.record_attempt(), 2);
        // The third disconnect gets no retry
        assert!(!policy.should_retry());
    }

    #[test]
    fn test_delay_is_fixed() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_millis(250), None);
        policy.record_attempt();
        policy.record_attempt();
        assert_eq!(policy.delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_millis(10), Some(1));
        policy.record_attempt();
        assert!(!policy.should_retry());
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert!(policy.should_retry());
    }

    #[test]
    fn test_from_config_reads_fields() {
        let mut config = SourceConfig::new(SourceKind::WebSocket, "ws");
        config.reconnect_delay = 1500;
        config.max_reconnect_attempts = Some(4);

        let policy = ReconnectPolicy::from_config(&config);
        assert!(policy.enabled());
        assert_eq!(policy.delay(), Duration::from_millis(1500));
        assert_eq!(policy, ReconnectPolicy::new(true, Duration::from_millis(1500), Some(4)));
    }
}
