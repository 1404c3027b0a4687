//! Service configuration.

use std::time::Duration;

use framekit_core::{Error, Result};
use framekit_net::{CodecStrategy, ServiceType};
use tracing::warn;

/// Environment variable overriding the frame rate in [`ServiceConfig::from_env`].
pub const FPS_ENV: &str = "FRAMEKIT_FPS";

/// Lowest accepted frame rate.
pub const MIN_FPS: u32 = 1;

/// Highest accepted frame rate.
pub const MAX_FPS: u32 = 1000;

/// Frame rate used when none is configured.
pub const DEFAULT_FPS: u32 = 200;

/// Configuration for one service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Human-readable service name, used in logs.
    pub name: String,
    /// Framed packets or raw byte streams.
    pub service_type: ServiceType,
    /// Target frames per second when internally driven.
    pub fps: u32,
    /// Payload codec. Raw services always use [`CodecStrategy::Raw`].
    pub codec: CodecStrategy,
    /// Poller threads requested from the transport.
    pub pollers: usize,
    /// Silence the warning for Binary payloads without a registered coder.
    pub suppress_coder_not_found_warning: bool,
    /// Drive the service timer scheduler once per frame.
    pub timers_enabled: bool,
    /// Delay between re-polls of a hook that reported `Pending` during start.
    pub hook_poll_interval: Duration,
}

impl ServiceConfig {
    /// Create a config with defaults for a normal service named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: ServiceType::Normal,
            fps: DEFAULT_FPS,
            codec: CodecStrategy::Binary,
            pollers: 1,
            suppress_coder_not_found_warning: false,
            timers_enabled: true,
            hook_poll_interval: Duration::from_millis(1),
        }
    }

    /// Like [`ServiceConfig::new`], then apply `FRAMEKIT_FPS` if it is set to
    /// a valid frame rate.
    #[must_use]
    pub fn from_env(name: impl Into<String>) -> Self {
        let config = Self::new(name);
        match std::env::var(FPS_ENV) {
            Ok(raw) => match raw.trim().parse::<u32>() {
                Ok(fps) if validate_fps(fps).is_ok() => config.with_fps(fps),
                _ => {
                    warn!(value = %raw, "ignoring invalid {FPS_ENV}");
                    config
                }
            },
            Err(_) => config,
        }
    }

    /// Set the service type. A raw service switches the codec to Raw.
    #[must_use]
    pub fn with_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        if service_type == ServiceType::Raw {
            self.codec = CodecStrategy::Raw;
        }
        self
    }

    /// Set the frame rate. Values outside 1..=1000 are clamped.
    #[must_use]
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps.clamp(MIN_FPS, MAX_FPS);
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: CodecStrategy) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_pollers(mut self, pollers: usize) -> Self {
        self.pollers = pollers.max(1);
        self
    }

    #[must_use]
    pub fn with_suppressed_coder_warning(mut self) -> Self {
        self.suppress_coder_not_found_warning = true;
        self
    }

    #[must_use]
    pub fn with_timers(mut self, enabled: bool) -> Self {
        self.timers_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_hook_poll_interval(mut self, interval: Duration) -> Self {
        self.hook_poll_interval = interval;
        self
    }

    /// Returns the duration of one frame at the configured rate.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(MIN_FPS)
    }
}

/// Check that `fps` lies in 1..=1000.
pub fn validate_fps(fps: u32) -> Result<()> {
    if (MIN_FPS..=MAX_FPS).contains(&fps) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "fps must be within {MIN_FPS}..={MAX_FPS}, got {fps}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::new("echo");
        assert_eq!(config.name, "echo");
        assert_eq!(config.fps, DEFAULT_FPS);
        assert_eq!(config.codec, CodecStrategy::Binary);
        assert_eq!(config.pollers, 1);
        assert_eq!(config.frame_interval(), Duration::from_millis(5));
    }

    #[test]
    fn test_raw_type_forces_raw_codec() {
        let config = ServiceConfig::new("raw").with_type(ServiceType::Raw);
        assert_eq!(config.codec, CodecStrategy::Raw);
    }

    #[test]
    fn test_fps_is_clamped_and_validated() {
        assert_eq!(ServiceConfig::new("a").with_fps(0).fps, MIN_FPS);
        assert_eq!(ServiceConfig::new("a").with_fps(5000).fps, MAX_FPS);
        assert!(validate_fps(60).is_ok());
        assert!(matches!(validate_fps(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(validate_fps(1001), Err(Error::InvalidArgument(_))));
    }
}
