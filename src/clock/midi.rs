//! MIDI realtime output.
//!
//! The clock only ever emits three single-byte system realtime messages.
//! Downstream gear depends on these exact values.

use std::sync::{Arc, Mutex};

use midir::{MidiOutput, MidiOutputConnection};

use crate::error::ClockError;

/// Sent 24 times per quarter note (12 per 8th)
pub const TIMING_CLOCK: u8 = 0xF8;
/// Sent on the Stopped -> Running transition
pub const START: u8 = 0xFA;
/// Sent on the Running -> Stopped transition
pub const STOP: u8 = 0xFC;

/// Wire speed of a DIN MIDI link in baud
pub const MIDI_BAUD_RATE: u32 = 31_250;

const CLIENT_NAME: &str = "beat_keeper";

/// Destination for realtime bytes.
pub trait MidiSink: Send {
    fn send(&mut self, message: u8);
}

/// Port names of every MIDI output currently available
pub fn list_output_ports() -> Result<Vec<String>, ClockError> {
    let output = MidiOutput::new(CLIENT_NAME).map_err(|err| ClockError::MidiPortUnavailable {
        reason: err.to_string(),
    })?;
    Ok(output
        .ports()
        .iter()
        .filter_map(|port| output.port_name(port).ok())
        .collect())
}

/// Hardware or virtual MIDI output port opened through midir
pub struct MidiPortSink {
    connection: MidiOutputConnection,
    port_name: String,
    failed_sends: u64,
}

impl MidiPortSink {
    /// Open the first output port whose name contains `filter`
    /// (or the first port at all when no filter is given).
    pub fn open(filter: Option<&str>) -> Result<Self, ClockError> {
        let output = MidiOutput::new(CLIENT_NAME).map_err(|err| ClockError::MidiPortUnavailable {
            reason: err.to_string(),
        })?;

        let ports = output.ports();
        let port = ports
            .iter()
            .find(|port| match filter {
                None => true,
                Some(filter) => output
                    .port_name(port)
                    .map(|name| name.contains(filter))
                    .unwrap_or(false),
            })
            .ok_or_else(|| ClockError::MidiPortUnavailable {
                reason: match filter {
                    Some(filter) => format!("no output port matching '{}'", filter),
                    None => "no MIDI output ports".to_string(),
                },
            })?;

        let port_name = output.port_name(port).unwrap_or_else(|_| "unknown".to_string());
        let connection = output
            .connect(port, "beat_keeper-clock")
            .map_err(|err| ClockError::MidiPortUnavailable {
                reason: err.to_string(),
            })?;

        log::info!("[MidiPortSink] Opened MIDI output '{}'", port_name);
        Ok(Self {
            connection,
            port_name,
            failed_sends: 0,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl MidiSink for MidiPortSink {
    fn send(&mut self, message: u8) {
        if let Err(err) = self.connection.send(&[message]) {
            self.failed_sends += 1;
            // First failure, then every hundredth
            if self.failed_sends % 100 == 1 {
                tracing::warn!(
                    "[MidiPortSink] send to '{}' failed ({} so far): {}",
                    self.port_name,
                    self.failed_sends,
                    err
                );
            }
        }
    }
}

/// Keeps every byte sent, shareable with the test that inspects it.
#[derive(Debug, Clone, Default)]
pub struct RecordingMidi {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl RecordingMidi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .map(|bytes| bytes.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, message: u8) -> usize {
        self.bytes().iter().filter(|&&byte| byte == message).count()
    }
}

impl MidiSink for RecordingMidi {
    fn send(&mut self, message: u8) {
        if let Ok(mut bytes) = self.bytes.lock() {
            bytes.push(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_byte_values() {
        assert_eq!(TIMING_CLOCK, 0xF8);
        assert_eq!(START, 0xFA);
        assert_eq!(STOP, 0xFC);
    }

    #[test]
    fn test_recording_sink_shares_bytes() {
        let recorder = RecordingMidi::new();
        let mut sink: Box<dyn MidiSink> = Box::new(recorder.clone());
        sink.send(START);
        sink.send(TIMING_CLOCK);
        sink.send(TIMING_CLOCK);
        assert_eq!(recorder.bytes(), vec![START, TIMING_CLOCK, TIMING_CLOCK]);
        assert_eq!(recorder.count(TIMING_CLOCK), 2);
    }
}
