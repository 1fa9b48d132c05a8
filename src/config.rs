//! Client and driver configuration
//!
//! All values here are resolved integers and durations; parsing of size and
//! duration suffix strings belongs to the embedding application. Out-of-range
//! values are clamped into their documented bounds with a logged warning
//! rather than failing.

use std::time::Duration;

const MIN_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_TIMEOUT: Duration = Duration::from_secs(60);

const MIN_TERM_LENGTH: usize = 64 * 1024;
const MAX_TERM_LENGTH: usize = 1024 * 1024 * 1024;

const MIN_MTU_LENGTH: usize = 128;

fn clamp_duration(name: &str, value: Duration, min: Duration, max: Duration) -> Duration {
    if value < min || value > max {
        let clamped = value.clamp(min, max);
        tracing::warn!(
            setting = name,
            requested_ms = value.as_millis() as u64,
            clamped_ms = clamped.as_millis() as u64,
            "Configuration value out of range, clamping"
        );
        clamped
    } else {
        value
    }
}

/// Client session configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Driver heartbeat silence beyond this marks the whole session dead
    pub driver_timeout: Duration,

    /// Issued commands unresolved beyond this expire as timed out
    pub command_timeout: Duration,

    /// Interval between client keepalives sent to the driver
    pub keepalive_interval: Duration,

    /// Duty cycle interval for the background conductor task
    pub idle_interval: Duration,

    /// Drive the conductor by explicit `invoke()` calls instead of a
    /// background task (single-threaded embedding)
    pub use_conductor_invoker: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            driver_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(500),
            idle_interval: Duration::from_millis(1),
            use_conductor_invoker: false,
        }
    }
}

impl ClientConfig {
    /// Set the driver liveness timeout (clamped to [100ms, 60s])
    pub fn driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = clamp_duration("driver_timeout", timeout, MIN_TIMEOUT, MAX_TIMEOUT);
        self
    }

    /// Set the command resolution timeout (clamped to [100ms, 60s])
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = clamp_duration("command_timeout", timeout, MIN_TIMEOUT, MAX_TIMEOUT);
        self
    }

    /// Set the keepalive interval (clamped to [10ms, 60s])
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = clamp_duration(
            "keepalive_interval",
            interval,
            Duration::from_millis(10),
            MAX_TIMEOUT,
        );
        self
    }

    /// Set the background duty cycle interval (clamped to [1ms, 1s])
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = clamp_duration(
            "idle_interval",
            interval,
            Duration::from_millis(1),
            Duration::from_secs(1),
        );
        self
    }

    /// Drive the conductor duty cycle by explicit `invoke()` calls
    pub fn use_conductor_invoker(mut self, enabled: bool) -> Self {
        self.use_conductor_invoker = enabled;
        self
    }
}

/// Embedded driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Term buffer length per partition; rounded up to a power of two and
    /// clamped to [64 KiB, 1 GiB]
    pub term_buffer_length: usize,

    /// Maximum bytes per fragment including the frame header
    pub mtu_length: usize,

    /// Receiver window granted ahead of the slowest/fastest destination;
    /// capped at half the term length
    pub initial_window_length: usize,

    /// An image silent beyond this is removed as unavailable
    pub image_liveness_timeout: Duration,

    /// A client silent beyond this has its resources purged
    pub client_liveness_timeout: Duration,

    /// Duty cycle interval for the background driver task
    pub duty_cycle_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            term_buffer_length: 64 * 1024,
            mtu_length: 1408,
            initial_window_length: 32 * 1024,
            image_liveness_timeout: Duration::from_secs(5),
            client_liveness_timeout: Duration::from_secs(10),
            duty_cycle_interval: Duration::from_millis(1),
        }
    }
}

impl DriverConfig {
    /// Set the term buffer length; non power-of-two values round up
    pub fn term_buffer_length(mut self, length: usize) -> Self {
        let mut resolved = length.clamp(MIN_TERM_LENGTH, MAX_TERM_LENGTH);
        if !resolved.is_power_of_two() {
            resolved = resolved.next_power_of_two().min(MAX_TERM_LENGTH);
        }
        if resolved != length {
            tracing::warn!(
                requested = length,
                resolved = resolved,
                "Term buffer length adjusted"
            );
        }
        self.term_buffer_length = resolved;
        self
    }

    /// Set the MTU; clamped to [128, term length / 8]
    pub fn mtu_length(mut self, length: usize) -> Self {
        let max = self.term_buffer_length / 8;
        let resolved = length.clamp(MIN_MTU_LENGTH, max);
        if resolved != length {
            tracing::warn!(requested = length, resolved = resolved, "MTU length adjusted");
        }
        self.mtu_length = resolved;
        self
    }

    /// Set the initial receiver window; capped at half the term length
    pub fn initial_window_length(mut self, length: usize) -> Self {
        let max = self.term_buffer_length / 2;
        let resolved = length.clamp(MIN_MTU_LENGTH, max);
        if resolved != length {
            tracing::warn!(
                requested = length,
                resolved = resolved,
                "Initial window length adjusted"
            );
        }
        self.initial_window_length = resolved;
        self
    }

    /// Set the image liveness timeout (clamped to [100ms, 60s])
    pub fn image_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.image_liveness_timeout =
            clamp_duration("image_liveness_timeout", timeout, MIN_TIMEOUT, MAX_TIMEOUT);
        self
    }

    /// Set the client liveness timeout (clamped to [100ms, 60s])
    pub fn client_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.client_liveness_timeout =
            clamp_duration("client_liveness_timeout", timeout, MIN_TIMEOUT, MAX_TIMEOUT);
        self
    }

    /// Set the driver duty cycle interval (clamped to [1ms, 1s])
    pub fn duty_cycle_interval(mut self, interval: Duration) -> Self {
        self.duty_cycle_interval = clamp_duration(
            "duty_cycle_interval",
            interval,
            Duration::from_millis(1),
            Duration::from_secs(1),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.driver_timeout, Duration::from_secs(10));
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_millis(500));
        assert!(!config.use_conductor_invoker);
    }

    #[test]
    fn test_client_builder_chaining() {
        let config = ClientConfig::default()
            .driver_timeout(Duration::from_secs(2))
            .command_timeout(Duration::from_secs(1))
            .use_conductor_invoker(true);

        assert_eq!(config.driver_timeout, Duration::from_secs(2));
        assert_eq!(config.command_timeout, Duration::from_secs(1));
        assert!(config.use_conductor_invoker);
    }

    #[test]
    fn test_timeout_clamped_not_rejected() {
        let config = ClientConfig::default().driver_timeout(Duration::from_millis(1));
        assert_eq!(config.driver_timeout, MIN_TIMEOUT);

        let config = ClientConfig::default().driver_timeout(Duration::from_secs(3600));
        assert_eq!(config.driver_timeout, MAX_TIMEOUT);
    }

    #[test]
    fn test_default_driver_config() {
        let config = DriverConfig::default();
        assert_eq!(config.term_buffer_length, 64 * 1024);
        assert_eq!(config.mtu_length, 1408);
        assert_eq!(config.initial_window_length, 32 * 1024);
    }

    #[test]
    fn test_term_length_rounds_to_power_of_two() {
        let config = DriverConfig::default().term_buffer_length(100_000);
        assert_eq!(config.term_buffer_length, 128 * 1024);

        let config = DriverConfig::default().term_buffer_length(1);
        assert_eq!(config.term_buffer_length, MIN_TERM_LENGTH);
    }

    #[test]
    fn test_mtu_capped_by_term_length() {
        let config = DriverConfig::default().mtu_length(1024 * 1024);
        assert_eq!(config.mtu_length, 64 * 1024 / 8);
    }

    #[test]
    fn test_window_capped_at_half_term() {
        let config = DriverConfig::default().initial_window_length(usize::MAX);
        assert_eq!(config.initial_window_length, 32 * 1024);
    }
}
