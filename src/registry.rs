use crate::acquisition::{AcquisitionError, AcquisitionState, Digitizer};
use crate::codec::{decode_pulse, PulseData, RecordLayout};
use crate::config::{ConfigError, DeviceConfig, FilterSetting, SettingsPatch};
use crate::connector::ConnectorError;
use crate::device::DeviceIoError;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Keys consumed by the dispatcher itself. They tune the pulse-duration
/// derivation and are echoed by `get_settings`, but are never forwarded to
/// the device.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandlerPatch {
    pub store_mode: Option<String>,
    pub n_samps_pre: Option<u64>,
    pub n_samps_post: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub store_mode: Option<String>,
    pub n_samps_pre: u64,
    pub n_samps_post: u64,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            store_mode: None,
            n_samps_pre: 0,
            n_samps_post: 10_000,
        }
    }
}

impl HandlerSettings {
    fn apply(&mut self, patch: &HandlerPatch) {
        if let Some(mode) = &patch.store_mode {
            self.store_mode = Some(mode.clone());
        }
        if let Some(pre) = patch.n_samps_pre {
            self.n_samps_pre = pre;
        }
        if let Some(post) = patch.n_samps_post {
            self.n_samps_post = post;
        }
    }
}

/// The most recent captured pulse for a port. Replaced wholesale under the
/// port lock, so readers never observe a half-written result.
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub raw: Vec<u8>,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("device error: {0}")]
    Device(#[from] DeviceIoError),

    #[error("connection error: {0}")]
    Connect(#[from] ConnectorError),

    #[error("init rejected: port is {0}")]
    Busy(AcquisitionState),
}

struct PortShared {
    state: AcquisitionState,
    config: DeviceConfig,
    handler: HandlerSettings,
    last: Option<StoredResult>,
}

/// Everything the process knows about one logical port: the digitizer handle
/// (the single device owner; its mutex serialises all device I/O) and the
/// shared state/config/result block.
pub struct PortEntry {
    digitizer: Mutex<Option<Digitizer>>,
    shared: Mutex<PortShared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PortEntry {
    fn new() -> Self {
        Self {
            digitizer: Mutex::new(None),
            shared: Mutex::new(PortShared {
                state: AcquisitionState::Unarmed,
                config: DeviceConfig::default(),
                handler: HandlerSettings::default(),
                last: None,
            }),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        lock(&self.shared).state
    }

    /// Validate and merge a settings patch, then commit the result to the
    /// device, connecting it on first use. Validation happens before any I/O:
    /// a rejected patch leaves the device and the stored configuration
    /// untouched. The port arms on the first successful commit.
    pub fn init(
        &self,
        patch: &SettingsPatch,
        handler_patch: &HandlerPatch,
        open: impl FnOnce() -> Result<Digitizer, ConnectorError>,
    ) -> Result<(), InitError> {
        let (candidate, mut handler) = {
            let shared = lock(&self.shared);
            if matches!(
                shared.state,
                AcquisitionState::Running | AcquisitionState::Processing
            ) {
                return Err(InitError::Busy(shared.state));
            }
            (shared.config.apply(patch)?, shared.handler.clone())
        };
        handler.apply(handler_patch);

        let mut slot = lock(&self.digitizer);
        if slot.is_none() {
            *slot = Some(open()?);
        }
        if let Some(digitizer) = slot.as_mut() {
            digitizer.commit(&candidate)?;
        }
        drop(slot);

        let mut shared = lock(&self.shared);
        shared.config = candidate;
        shared.handler = handler;
        shared.state = AcquisitionState::Armed;
        Ok(())
    }

    /// Pulse duration derived from the handler settings and the hardware
    /// sampling frequency.
    pub fn pulse_duration(&self) -> Duration {
        let shared = lock(&self.shared);
        let samples = shared.handler.n_samps_pre + shared.handler.n_samps_post;
        Duration::from_secs_f64(samples as f64 / shared.config.actual_fs())
    }

    /// Execute one triggered pulse. Fails immediately with
    /// [`AcquisitionError::Busy`] unless the port is ARMED; on success the
    /// raw result is published atomically and the port re-arms. Any failure
    /// also re-arms the port, so it is never left stuck mid-state.
    pub fn trig_pulse(&self) -> Result<PulseData, AcquisitionError> {
        let (config, duration) = {
            let mut shared = lock(&self.shared);
            if shared.state != AcquisitionState::Armed {
                return Err(AcquisitionError::Busy(shared.state));
            }
            shared.state = AcquisitionState::Running;
            let samples = shared.handler.n_samps_pre + shared.handler.n_samps_post;
            let duration =
                Duration::from_secs_f64(samples as f64 / shared.config.actual_fs());
            (shared.config.clone(), duration)
        };

        let outcome = {
            let mut slot = lock(&self.digitizer);
            match slot.as_mut() {
                Some(digitizer) => digitizer.trig_pulse(&config, duration),
                // Armed implies a committed device; treat a missing handle
                // as a stale port rather than panicking.
                None => Err(AcquisitionError::Busy(AcquisitionState::Unarmed)),
            }
        };

        match outcome {
            Ok(pulse) => {
                lock(&self.shared).state = AcquisitionState::Processing;
                let layout = RecordLayout::from_config(&config);
                let decoded = decode_pulse(&pulse.raw, &layout, pulse.elapsed);
                let mut shared = lock(&self.shared);
                match decoded {
                    Ok(data) => {
                        shared.last = Some(StoredResult {
                            raw: pulse.raw,
                            elapsed: pulse.elapsed,
                        });
                        shared.state = AcquisitionState::Armed;
                        Ok(data)
                    }
                    Err(e) => {
                        shared.state = AcquisitionState::Armed;
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                lock(&self.shared).state = AcquisitionState::Armed;
                Err(e)
            }
        }
    }

    /// Merged device-facing and handler-only settings. `serde_json` maps are
    /// ordered, so the encoding comes out key-sorted and deterministic.
    pub fn settings_json(&self) -> serde_json::Value {
        let shared = lock(&self.shared);
        let config = &shared.config;
        let filt = match &config.filter {
            None => serde_json::Value::Null,
            Some(FilterSetting::All(mode)) => json!(mode.as_raw()),
            Some(FilterSetting::PerChannel(modes)) => {
                json!(modes.iter().map(|m| m.as_raw()).collect::<Vec<_>>())
            }
        };
        // Keys listed sorted so the encoding is order-stable regardless of
        // the underlying map flavour.
        json!({
            "actual_fs": config.actual_fs(),
            "chans": config.channels.channels(),
            "counter_in": config.channels.counter_in,
            "dec": config.dec,
            "dig_in": config.channels.dig_in,
            "ffl": config.ffl,
            "filt_settings": filt,
            "fs": config.fs,
            "n_samps_post": shared.handler.n_samps_post,
            "n_samps_pre": shared.handler.n_samps_pre,
            "packet_size": config.packet_size(),
            "poll_period": config.poll_period().as_secs_f64(),
            "rate_in": config.channels.rate_in,
            "rate_range": config.rate_range.hertz(),
            "srate": config.srate(),
            "store_mode": shared.handler.store_mode,
            "v_range": config.v_range.volts(),
        })
    }

    pub fn last_result(&self) -> Option<StoredResult> {
        lock(&self.shared).last.clone()
    }

    /// Byte length of the last stored result, zero when none exists.
    pub fn last_result_len(&self) -> usize {
        lock(&self.shared).last.as_ref().map_or(0, |r| r.raw.len())
    }
}

/// Process-wide registry of per-port state. One entry per logical port,
/// created UNARMED on first contact; the raw map never escapes.
#[derive(Default)]
pub struct Registry {
    ports: Mutex<HashMap<String, Arc<PortEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for a port, created on first contact.
    pub fn entry(&self, port: &str) -> Arc<PortEntry> {
        let mut ports = lock(&self.ports);
        ports
            .entry(port.to_string())
            .or_insert_with(|| Arc::new(PortEntry::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockTransport;
    use std::sync::Barrier;
    use std::thread;

    fn mock_opener() -> Result<Digitizer, ConnectorError> {
        let (mock, _log) = MockTransport::new();
        Ok(Digitizer::new(Box::new(mock)))
    }

    fn patches(json: &str) -> (SettingsPatch, HandlerPatch) {
        (
            serde_json::from_str(json).unwrap(),
            serde_json::from_str(json).unwrap(),
        )
    }

    #[test]
    fn first_contact_is_unarmed_with_defaults() {
        let registry = Registry::new();
        let entry = registry.entry("dev0");
        assert_eq!(entry.state(), AcquisitionState::Unarmed);
        assert_eq!(entry.last_result_len(), 0);
        let settings = entry.settings_json();
        assert_eq!(settings["fs"], 10_000.0);
        assert_eq!(settings["n_samps_post"], 10_000);
    }

    #[test]
    fn entry_is_shared_across_lookups() {
        let registry = Registry::new();
        let a = registry.entry("dev0");
        let b = registry.entry("dev0");
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.entry("dev1");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn init_arms_and_applies_settings() {
        let registry = Registry::new();
        let entry = registry.entry("dev0");
        let (patch, handler) =
            patches(r#"{"fs": 1000, "chans": [0], "n_samps_post": 500, "store_mode": "raw"}"#);
        entry.init(&patch, &handler, mock_opener).unwrap();

        assert_eq!(entry.state(), AcquisitionState::Armed);
        let settings = entry.settings_json();
        assert_eq!(settings["fs"], 1000.0);
        assert_eq!(settings["chans"], json!([0]));
        assert_eq!(settings["n_samps_post"], 500);
        assert_eq!(settings["store_mode"], "raw");
    }

    #[test]
    fn failed_init_changes_nothing() {
        let registry = Registry::new();
        let entry = registry.entry("dev0");
        let (patch, handler) = patches(r#"{"fs": 999999}"#);
        assert!(matches!(
            entry.init(&patch, &handler, mock_opener),
            Err(InitError::Config(ConfigError::SampleRate(_)))
        ));
        assert_eq!(entry.state(), AcquisitionState::Unarmed);
        assert_eq!(entry.settings_json()["fs"], 10_000.0);
    }

    #[test]
    fn trig_pulse_requires_armed() {
        let registry = Registry::new();
        let entry = registry.entry("dev0");
        assert!(matches!(
            entry.trig_pulse(),
            Err(AcquisitionError::Busy(AcquisitionState::Unarmed))
        ));
    }

    #[test]
    fn pulse_publishes_result_and_rearms() {
        let registry = Registry::new();
        let entry = registry.entry("dev0");
        let (patch, handler) = patches(r#"{"fs": 1000, "chans": [0], "n_samps_post": 100}"#);
        entry.init(&patch, &handler, mock_opener).unwrap();

        let data = entry.trig_pulse().unwrap();
        assert!(data.records() > 0);
        assert_eq!(entry.state(), AcquisitionState::Armed);

        let stored = entry.last_result().unwrap();
        assert_eq!(entry.last_result_len(), stored.raw.len());
        assert!(stored.elapsed > Duration::ZERO);
        // One record is one 2-byte word with a single channel.
        assert_eq!(data.records(), stored.raw.len() / 2);
    }

    #[test]
    fn concurrent_pulses_are_mutually_exclusive() {
        let registry = Registry::new();
        let entry = registry.entry("dev0");
        let (patch, handler) = patches(r#"{"fs": 1000, "chans": [0], "n_samps_post": 1000}"#);
        entry.init(&patch, &handler, mock_opener).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let entry = entry.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                entry.trig_pulse().map(|_| ())
            }));
        }

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(AcquisitionError::Busy(_))))
            .count();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!((ok, busy), (1, 1));
        assert_eq!(entry.state(), AcquisitionState::Armed);
    }
}
