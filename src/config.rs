//! Manager construction options.
//!
//! Options recognized at construction, with the defaults the kernel ships.
//! Out-of-range values never surface an error: the field reverts to its
//! default (with a warning log), because nothing inside the kernel is
//! allowed to be fatal.

use tracing::warn;
use web_time::Duration;

/// Inclusive frame-rate bounds.
pub const FRAME_RATE_RANGE: (u32, u32) = (1, 300);

/// Configuration for a [`NetworkManager`](crate::NetworkManager).
///
/// # Forward Compatibility
///
/// New fields may be added in future versions; construct instances with the
/// `..NetworkConfig::default()` pattern.
///
/// # Example
///
/// ```
/// use bastion_lockstep::NetworkConfig;
/// use web_time::Duration;
///
/// let config = NetworkConfig {
///     local_player_id: 2,
///     local_player_name: "commander".to_string(),
///     frame_rate: 60,
///     disconnect_timeout: Duration::from_secs(8),
///     ..NetworkConfig::default()
/// };
/// assert_eq!(config.sanitized().frame_rate, 60);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Skip networking entirely and run a single-player session.
    pub force_single_player: bool,
    /// The local player's slot number.
    pub local_player_id: u32,
    /// The local player's name, matched against user lists.
    pub local_player_name: String,
    /// Simulation frame rate, clamped to `[1, 300]`. Default 30.
    pub frame_rate: u32,
    /// Frames ahead of the executed frame into which local commands are
    /// scheduled. Default 30.
    pub run_ahead: u32,
    /// Stall time before the disconnect screen comes up. Default 10s.
    pub disconnect_timeout: Duration,
    /// Peer silence before the packet router evicts it. Default 60s.
    pub disconnect_player_timeout: Duration,
    /// Peer silence before it is listed on the disconnect screen.
    /// Default 15s.
    pub disconnect_screen_notify_timeout: Duration,
    /// Keep-alive pacing while the disconnect screen is up. Default 500ms.
    pub disconnect_keep_alive_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            force_single_player: false,
            local_player_id: 0,
            local_player_name: String::new(),
            frame_rate: 30,
            run_ahead: 30,
            disconnect_timeout: Duration::from_millis(10_000),
            disconnect_player_timeout: Duration::from_millis(60_000),
            disconnect_screen_notify_timeout: Duration::from_millis(15_000),
            disconnect_keep_alive_interval: Duration::from_millis(500),
        }
    }
}

impl NetworkConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the configuration with out-of-range fields reverted to
    /// their defaults.
    ///
    /// The frame rate is clamped into [`FRAME_RATE_RANGE`]; zero durations
    /// revert to their defaults. Invalid values warn, they never error.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        let (min_rate, max_rate) = FRAME_RATE_RANGE;
        if self.frame_rate < min_rate || self.frame_rate > max_rate {
            warn!(
                frame_rate = self.frame_rate,
                "frame rate out of range, reverting to {}", defaults.frame_rate
            );
            self.frame_rate = defaults.frame_rate;
        }
        if self.disconnect_timeout.is_zero() {
            warn!("zero disconnect timeout, reverting to default");
            self.disconnect_timeout = defaults.disconnect_timeout;
        }
        if self.disconnect_player_timeout.is_zero() {
            warn!("zero disconnect player timeout, reverting to default");
            self.disconnect_player_timeout = defaults.disconnect_player_timeout;
        }
        if self.disconnect_screen_notify_timeout.is_zero() {
            warn!("zero disconnect screen notify timeout, reverting to default");
            self.disconnect_screen_notify_timeout = defaults.disconnect_screen_notify_timeout;
        }
        if self.disconnect_keep_alive_interval.is_zero() {
            warn!("zero keep-alive interval, reverting to default");
            self.disconnect_keep_alive_interval = defaults.disconnect_keep_alive_interval;
        }
        self
    }

    /// Milliseconds per simulation frame at the configured rate.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(u64::from(1000 / self.frame_rate.max(1)))
    }
}

/// Clamps a frame rate received over the wire into [`FRAME_RATE_RANGE`].
#[must_use]
pub fn clamp_frame_rate(rate: u32) -> u32 {
    rate.clamp(FRAME_RATE_RANGE.0, FRAME_RATE_RANGE.1)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = NetworkConfig::default();
        assert!(!config.force_single_player);
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.run_ahead, 30);
        assert_eq!(config.disconnect_timeout, Duration::from_secs(10));
        assert_eq!(config.disconnect_player_timeout, Duration::from_secs(60));
        assert_eq!(
            config.disconnect_screen_notify_timeout,
            Duration::from_secs(15)
        );
        assert_eq!(
            config.disconnect_keep_alive_interval,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn sanitize_reverts_out_of_range_frame_rate() {
        let config = NetworkConfig {
            frame_rate: 0,
            ..NetworkConfig::default()
        };
        assert_eq!(config.sanitized().frame_rate, 30);

        let config = NetworkConfig {
            frame_rate: 301,
            ..NetworkConfig::default()
        };
        assert_eq!(config.sanitized().frame_rate, 30);

        let config = NetworkConfig {
            frame_rate: 300,
            ..NetworkConfig::default()
        };
        assert_eq!(config.sanitized().frame_rate, 300);
    }

    #[test]
    fn sanitize_reverts_zero_durations() {
        let config = NetworkConfig {
            disconnect_timeout: Duration::ZERO,
            disconnect_keep_alive_interval: Duration::ZERO,
            ..NetworkConfig::default()
        };
        let sane = config.sanitized();
        assert_eq!(sane.disconnect_timeout, Duration::from_secs(10));
        assert_eq!(sane.disconnect_keep_alive_interval, Duration::from_millis(500));
    }

    #[test]
    fn frame_interval_follows_rate() {
        let config = NetworkConfig {
            frame_rate: 30,
            ..NetworkConfig::default()
        };
        assert_eq!(config.frame_interval(), Duration::from_millis(33));

        let config = NetworkConfig {
            frame_rate: 100,
            ..NetworkConfig::default()
        };
        assert_eq!(config.frame_interval(), Duration::from_millis(10));
    }

    #[test]
    fn wire_frame_rate_clamps() {
        assert_eq!(clamp_frame_rate(0), 1);
        assert_eq!(clamp_frame_rate(60), 60);
        assert_eq!(clamp_frame_rate(10_000), 300);
    }
}
