use crate::codec::CodecError;
use crate::config::{ConfigError, DeviceConfig};
use crate::device::{handshake, DeviceIoError, Transport};
use crate::encoder;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// Extra read budget on top of the nominal poll period, so a single slow
/// packet does not abort a pulse while a dead device still fails quickly.
const READ_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of one logical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No valid configuration committed yet.
    Unarmed,
    /// Configured and ready to trigger.
    Armed,
    /// Poll loop in flight.
    Running,
    /// Pulse captured, result being decoded and published.
    Processing,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unarmed => "UNARMED",
            Self::Armed => "ARMED",
            Self::Running => "RUNNING",
            Self::Processing => "PROCESSING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("acquisition rejected: port is {0}, not ARMED")]
    Busy(AcquisitionState),

    #[error("device error: {0}")]
    Device(#[from] DeviceIoError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("decode error: {0}")]
    Codec(#[from] CodecError),
}

/// Raw outcome of one triggered pulse.
#[derive(Debug, Clone)]
pub struct RawPulse {
    /// Concatenated packet buffers, first (stale) read excluded.
    pub raw: Vec<u8>,
    /// Wall time from the first paced poll to the stop command.
    pub elapsed: Duration,
    /// Polls performed.
    pub polls: u32,
    /// Polls whose nominal deadline had already passed when the read
    /// finished. Observable drift indicator, not an error.
    pub overruns: u32,
}

/// The one owner of a physical DI-4108. All device I/O goes through this
/// struct; callers serialise access to it (see the registry).
pub struct Digitizer {
    transport: Box<dyn Transport>,
}

impl Digitizer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Re-verify the instrument identity.
    pub fn handshake(&mut self) -> Result<(), DeviceIoError> {
        handshake(self.transport.as_mut())
    }

    /// Program a validated configuration into the device: the ordered slist,
    /// rate, filter, decimation and packet-size commands, then the ready LED.
    pub fn commit(&mut self, config: &DeviceConfig) -> Result<(), DeviceIoError> {
        for command in encoder::command_sequence(config) {
            self.transport.send_command(&command)?;
        }
        // Green: configured and idle.
        self.transport.send_command("led 2")?;
        Ok(())
    }

    /// Set the front LED color, 0..=7 per the device protocol.
    pub fn set_led(&mut self, value: u8) -> Result<(), AcquisitionError> {
        if value > 7 {
            return Err(ConfigError::LedValue(value).into());
        }
        self.transport.send_command(&format!("led {value}"))?;
        Ok(())
    }

    /// Run one triggered pulse of roughly `duration`, polling the device on
    /// the configured schedule.
    ///
    /// The first read after `start 0` returns a stale buffered sample and is
    /// discarded. Each subsequent poll reads one packet-buffer worth of
    /// bytes, then sleeps out the positive remainder to its nominal deadline
    /// `t0 + i * poll_period` on the monotonic clock; a non-positive
    /// remainder is counted as an overrun and the loop proceeds immediately.
    /// Any device failure aborts the pulse with a best-effort stop, and no
    /// partial result escapes.
    pub fn trig_pulse(
        &mut self,
        config: &DeviceConfig,
        duration: Duration,
    ) -> Result<RawPulse, AcquisitionError> {
        let poll_period = config.poll_period();
        let poll_bytes = config.poll_bytes();
        let read_budget = poll_period + READ_GRACE;
        let poll_count =
            (duration.as_secs_f64() / poll_period.as_secs_f64()).ceil() as u32;

        log::debug!(
            "pulse: {} polls of {} bytes every {:?}",
            poll_count,
            poll_bytes,
            poll_period
        );

        self.transport.send_command("start 0")?;

        let mut buffer = vec![0u8; poll_bytes];
        if let Err(e) = self.transport.read_exact(&mut buffer, read_budget) {
            let _ = self.transport.send_command("stop");
            return Err(e.into());
        }

        let t0 = Instant::now();
        let mut raw = Vec::with_capacity(poll_bytes * poll_count as usize);
        let mut overruns = 0;

        for i in 1..=poll_count {
            if let Err(e) = self.transport.read_exact(&mut buffer, read_budget) {
                let _ = self.transport.send_command("stop");
                return Err(e.into());
            }
            raw.extend_from_slice(&buffer);

            let deadline = t0 + poll_period * i;
            match deadline.checked_duration_since(Instant::now()) {
                Some(remainder) => thread::sleep(remainder),
                None => overruns += 1,
            }
        }

        self.transport.send_command("stop")?;
        let elapsed = t0.elapsed();

        if overruns > 0 {
            log::warn!("pulse finished with {} poll overruns", overruns);
        }

        Ok(RawPulse {
            raw,
            elapsed,
            polls: poll_count,
            overruns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_pulse, RecordLayout};
    use crate::config::SettingsPatch;
    use crate::device::MockTransport;

    fn config_with(patch: &str) -> DeviceConfig {
        let patch: SettingsPatch = serde_json::from_str(patch).unwrap();
        DeviceConfig::default().apply(&patch).unwrap()
    }

    fn mock_digitizer() -> (Digitizer, crate::device::CommandLog) {
        let (mock, log) = MockTransport::new();
        (Digitizer::new(Box::new(mock)), log)
    }

    #[test]
    fn commit_sends_sequence_and_led() {
        let config = config_with(r#"{"chans": [0], "dec": 2}"#);
        let (mut digitizer, log) = mock_digitizer();
        digitizer.commit(&config).unwrap();

        let commands = log.lock().unwrap().clone();
        assert_eq!(commands.first().unwrap(), "slist 0 0");
        assert_eq!(commands.last().unwrap(), "led 2");
        assert!(commands.iter().any(|c| c == "dec 2"));
    }

    #[test]
    fn set_led_validates_range() {
        let (mut digitizer, log) = mock_digitizer();
        digitizer.set_led(5).unwrap();
        assert!(matches!(
            digitizer.set_led(8),
            Err(AcquisitionError::Config(ConfigError::LedValue(8)))
        ));
        assert_eq!(log.lock().unwrap().as_slice(), &["led 5".to_string()]);
    }

    #[test]
    fn pulse_reads_expected_bytes_and_brackets_with_start_stop() {
        let config = config_with(r#"{"fs": 1000, "chans": [0]}"#);
        let (mut digitizer, log) = mock_digitizer();

        let pulse = digitizer
            .trig_pulse(&config, Duration::from_millis(200))
            .unwrap();

        let poll_period = config.poll_period().as_secs_f64();
        let expected_polls = (0.2 / poll_period).ceil() as u32;
        assert_eq!(pulse.polls, expected_polls);
        assert_eq!(pulse.raw.len(), config.poll_bytes() * expected_polls as usize);
        assert_eq!(pulse.overruns, 0);

        let commands = log.lock().unwrap().clone();
        assert_eq!(commands.first().unwrap(), "start 0");
        assert_eq!(commands.last().unwrap(), "stop");
    }

    #[test]
    fn pulse_discards_the_stale_first_buffer() {
        let config = config_with(r#"{"fs": 1000, "chans": [0]}"#);
        let (mut digitizer, _log) = mock_digitizer();

        let pulse = digitizer
            .trig_pulse(&config, Duration::from_millis(50))
            .unwrap();

        // The mock streams a counting ramp from zero; the first
        // poll_bytes/2 words went to the discarded read.
        let first_word = u16::from_le_bytes([pulse.raw[0], pulse.raw[1]]);
        assert_eq!(first_word as usize, config.poll_bytes() / 2);
    }

    #[test]
    fn one_second_pulse_lands_within_one_poll_period() {
        let config = config_with(r#"{"fs": 1000, "chans": [0], "dec": 1}"#);
        let (mut digitizer, _log) = mock_digitizer();

        let pulse = digitizer.trig_pulse(&config, Duration::from_secs(1)).unwrap();

        let poll_period = config.poll_period().as_secs_f64();
        let drift = (pulse.elapsed.as_secs_f64() - 1.0).abs();
        assert!(
            drift <= poll_period,
            "elapsed {:?} drifted more than one poll period ({} s)",
            pulse.elapsed,
            poll_period
        );

        let layout = RecordLayout::from_config(&config);
        let data = decode_pulse(&pulse.raw, &layout, pulse.elapsed).unwrap();
        let samples_per_poll = config.poll_bytes() / 2 / layout.record_count();
        assert!(
            (data.records() as i64 - 1000).unsigned_abs() as usize <= samples_per_poll,
            "{} records, expected within {} of 1000",
            data.records(),
            samples_per_poll
        );
    }

    struct DeadAfterStart {
        inner: MockTransport,
        reads: u32,
    }

    impl Transport for DeadAfterStart {
        fn send_command(&mut self, command: &str) -> Result<(), DeviceIoError> {
            self.inner.send_command(command)
        }

        fn read_exact(&mut self, buf: &mut [u8], budget: Duration) -> Result<(), DeviceIoError> {
            self.reads += 1;
            if self.reads > 2 {
                return Err(DeviceIoError::Timeout {
                    wanted: buf.len(),
                    got: 0,
                    elapsed: budget,
                });
            }
            self.inner.read_exact(buf, budget)
        }

        fn read_reply(&mut self, budget: Duration) -> Result<String, DeviceIoError> {
            self.inner.read_reply(budget)
        }
    }

    #[test]
    fn mid_pulse_timeout_aborts_and_stops_the_device() {
        let config = config_with(r#"{"fs": 1000, "chans": [0]}"#);
        let (mock, log) = MockTransport::new();
        let mut digitizer = Digitizer::new(Box::new(DeadAfterStart { inner: mock, reads: 0 }));

        let err = digitizer.trig_pulse(&config, Duration::from_secs(1));
        assert!(matches!(
            err,
            Err(AcquisitionError::Device(DeviceIoError::Timeout { .. }))
        ));

        let commands = log.lock().unwrap().clone();
        assert_eq!(commands.last().unwrap(), "stop");
    }
}
