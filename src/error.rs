// Error types for the beat keeper
//
// Clock, sensor input and configuration failures, each with a stable numeric
// code for CLI and diagnostics output.
//
// Only boot-time failures travel through these types. Per-pass numeric
// anomalies (clamped corrections, aborted scans, sampling overruns) are handled
// where they happen and reported through telemetry instead.

use log::error;
use std::fmt;

/// Stable code plus message for every error surfaced by the tracker
pub trait ErrorCode {
    fn code(&self) -> i32;

    fn message(&self) -> String;
}

/// Log a clock error with its code and the failing call site
pub fn log_clock_error(err: &ClockError, context: &str) {
    error!(
        "Clock error in {}: code={}, component=BeatClock, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Log an input error with structured context
pub fn log_input_error(err: &InputError, context: &str) {
    error!(
        "Input error in {}: code={}, component=OnsetDetector, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Clock and tracker lifecycle errors
///
/// Error code range: 1001-1008
#[derive(Debug, Clone, PartialEq)]
pub enum ClockError {
    /// Tau (8th-note duration) must be strictly positive
    TauInvalid { tau_us: i64 },

    /// A performance is already running
    AlreadyRunning,

    /// No performance is running
    NotRunning,

    /// A task's command channel closed unexpectedly
    ChannelClosed { channel: String },

    /// Mutex/RwLock was poisoned
    LockPoisoned { component: String },

    /// The requested MIDI output port could not be opened
    MidiPortUnavailable { reason: String },

    /// The evaluator runtime could not be built
    RuntimeUnavailable { reason: String },

    /// The configuration failed validation
    ConfigRejected { reason: String },
}

impl ErrorCode for ClockError {
    fn code(&self) -> i32 {
        match self {
            ClockError::TauInvalid { .. } => 1001,
            ClockError::AlreadyRunning => 1002,
            ClockError::NotRunning => 1003,
            ClockError::ChannelClosed { .. } => 1004,
            ClockError::LockPoisoned { .. } => 1005,
            ClockError::MidiPortUnavailable { .. } => 1006,
            ClockError::RuntimeUnavailable { .. } => 1007,
            ClockError::ConfigRejected { .. } => 1008,
        }
    }

    fn message(&self) -> String {
        match self {
            ClockError::TauInvalid { tau_us } => {
                format!("Tau must be greater than 0 us (got {})", tau_us)
            }
            ClockError::AlreadyRunning => {
                "Performance already running. Call stop_performance() first.".to_string()
            }
            ClockError::NotRunning => {
                "No performance running. Call begin_performance() first.".to_string()
            }
            ClockError::ChannelClosed { channel } => {
                format!("Channel closed: {}", channel)
            }
            ClockError::LockPoisoned { component } => {
                format!("Lock poisoned for component: {}", component)
            }
            ClockError::MidiPortUnavailable { reason } => {
                format!("MIDI output unavailable: {}", reason)
            }
            ClockError::RuntimeUnavailable { reason } => {
                format!("Evaluator runtime unavailable: {}", reason)
            }
            ClockError::ConfigRejected { reason } => {
                format!("Configuration rejected: {}", reason)
            }
        }
    }
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClockError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for ClockError {}

/// Sensor input errors
///
/// Error code range: 2001-2004
#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    /// No usable input device
    DeviceUnavailable { details: String },

    /// Failed to open the input stream
    StreamOpenFailed { reason: String },

    /// The device only offers a sample format we do not read
    UnsupportedFormat { format: String },

    /// Kick and snare need two input channels
    ChannelCountTooLow { channels: u16 },
}

impl ErrorCode for InputError {
    fn code(&self) -> i32 {
        match self {
            InputError::DeviceUnavailable { .. } => 2001,
            InputError::StreamOpenFailed { .. } => 2002,
            InputError::UnsupportedFormat { .. } => 2003,
            InputError::ChannelCountTooLow { .. } => 2004,
        }
    }

    fn message(&self) -> String {
        match self {
            InputError::DeviceUnavailable { details } => {
                format!("Input device unavailable: {}", details)
            }
            InputError::StreamOpenFailed { reason } => {
                format!("Failed to open input stream: {}", reason)
            }
            InputError::UnsupportedFormat { format } => {
                format!("Unsupported sample format: {}", format)
            }
            InputError::ChannelCountTooLow { channels } => {
                format!("Need 2 input channels (kick, snare), device has {}", channels)
            }
        }
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InputError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for InputError {}

/// Configuration errors
///
/// Error code range: 3001-3003
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The config file could not be read
    Io { details: String },

    /// The config file is not valid JSON for [`crate::config::AppConfig`]
    Parse { details: String },

    /// A field holds a value the tracker cannot run with
    Invalid { field: String, reason: String },
}

impl ErrorCode for ConfigError {
    fn code(&self) -> i32 {
        match self {
            ConfigError::Io { .. } => 3001,
            ConfigError::Parse { .. } => 3002,
            ConfigError::Invalid { .. } => 3003,
        }
    }

    fn message(&self) -> String {
        match self {
            ConfigError::Io { details } => format!("Failed to read config: {}", details),
            ConfigError::Parse { details } => format!("Failed to parse config: {}", details),
            ConfigError::Invalid { field, reason } => {
                format!("Invalid config value for {}: {}", field, reason)
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConfigError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for ClockError {
    fn from(err: ConfigError) -> Self {
        ClockError::ConfigRejected {
            reason: err.message(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io {
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_error_codes() {
        assert_eq!(ClockError::TauInvalid { tau_us: 0 }.code(), 1001);
        assert_eq!(ClockError::AlreadyRunning.code(), 1002);
        assert_eq!(ClockError::NotRunning.code(), 1003);
        assert_eq!(
            ClockError::ChannelClosed {
                channel: "clock".to_string()
            }
            .code(),
            1004
        );
        assert_eq!(
            ClockError::LockPoisoned {
                component: "test".to_string()
            }
            .code(),
            1005
        );
        assert_eq!(
            ClockError::MidiPortUnavailable {
                reason: "test".to_string()
            }
            .code(),
            1006
        );
        assert_eq!(
            ClockError::RuntimeUnavailable {
                reason: "test".to_string()
            }
            .code(),
            1007
        );
        assert_eq!(
            ClockError::ConfigRejected {
                reason: "test".to_string()
            }
            .code(),
            1008
        );
    }

    #[test]
    fn test_input_error_codes() {
        assert_eq!(
            InputError::DeviceUnavailable {
                details: "none".to_string()
            }
            .code(),
            2001
        );
        assert_eq!(InputError::ChannelCountTooLow { channels: 1 }.code(), 2004);
    }

    #[test]
    fn test_clock_error_display() {
        let err = ClockError::TauInvalid { tau_us: -5 };
        assert!(err.message().contains("greater than 0"));
        assert!(err.to_string().contains("code 1001"));

        let err = ClockError::LockPoisoned {
            component: "BeatClockState".to_string(),
        };
        assert!(err.message().contains("BeatClockState"));
    }

    #[test]
    fn test_config_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err: ConfigError = io_err.into();
        match err {
            ConfigError::Io { details } => assert!(details.contains("missing file")),
            other => panic!("Expected Io variant, got {:?}", other),
        }

        let parse_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: ConfigError = parse_err.into();
        assert_eq!(err.code(), 3002);
    }

    #[test]
    fn test_error_code_trait() {
        let clock_err: &dyn ErrorCode = &ClockError::NotRunning;
        assert_eq!(clock_err.code(), 1003);

        let input_err: &dyn ErrorCode = &InputError::ChannelCountTooLow { channels: 1 };
        assert!(input_err.message().contains("has 1"));
    }
}
