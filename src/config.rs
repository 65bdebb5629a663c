use serde::Deserialize;
use std::time::Duration;

/// Selectable bipolar voltage ranges, in volts. The device range code is the
/// index into this ladder.
pub const VOLTAGE_LADDER: [f64; 6] = [10.0, 5.0, 2.0, 1.0, 0.5, 0.2];

/// Selectable rate-measurement ranges, in Hz. The device range code is the
/// index into this ladder plus one.
pub const RATE_LADDER: [f64; 12] = [
    50_000.0, 20_000.0, 10_000.0, 5_000.0, 2_000.0, 1_000.0, 500.0, 200.0, 100.0, 50.0, 20.0,
    10.0,
];

/// Base clock of the DI-4108 sampling engine.
pub const BASE_CLOCK_HZ: f64 = 60e6;

/// srate register limits per the device protocol.
pub const SRATE_MIN: u16 = 375;
pub const SRATE_MAX: u16 = 65535;

/// Highest supported sampling frequency.
pub const FS_MAX: f64 = 160e3;

/// Below this frequency the srate register saturates at dec=1.
pub const FS_MIN: f64 = BASE_CLOCK_HZ / SRATE_MAX as f64;

/// Selectable packet sizes are powers of two within these bounds.
pub const PACKET_SIZE_MIN: u16 = 16;
pub const PACKET_SIZE_MAX: u16 = 2048;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("sampling frequency {0} Hz out of range ({FS_MIN:.1}..={FS_MAX} Hz)")]
    SampleRate(f64),

    #[error("channel index {0} out of range (0..=7)")]
    ChannelOutOfRange(i64),

    #[error("duplicate channel index {0}")]
    DuplicateChannel(u8),

    #[error("too many channels ({0}, at most 8)")]
    TooManyChannels(usize),

    #[error("channel count {0} out of range (0..=8)")]
    ChannelCount(i64),

    #[error("no active inputs selected")]
    NoActiveInputs,

    #[error("dec must be an integer, 1<=dec<=512 (got {0})")]
    Decimation(i64),

    #[error("ffl must be an integer, 1<=ffl<=64 (got {0})")]
    MovingAverage(i64),

    #[error("filter settings must have value(s) of 0, 1, 2, or 3 (got {0})")]
    FilterMode(i64),

    #[error("per-channel filter settings must match the channel list length ({expected}, got {got})")]
    FilterListLength { expected: usize, got: usize },

    #[error("led value {0} out of range (0..=7)")]
    LedValue(u8),
}

/// A voltage range resolved against [`VOLTAGE_LADDER`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageRange {
    volts: f64,
    code: u16,
}

impl VoltageRange {
    /// Collapse a requested range onto the nearest ladder entry. Ties break to
    /// the earlier (higher-voltage) entry.
    pub fn nearest(requested: f64) -> Self {
        let code = nearest_index(requested, &VOLTAGE_LADDER);
        Self {
            volts: VOLTAGE_LADDER[code],
            code: code as u16,
        }
    }

    pub fn volts(&self) -> f64 {
        self.volts
    }

    /// 3-bit range code used in slist entries.
    pub fn code(&self) -> u16 {
        self.code
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self::nearest(10.0)
    }
}

/// A rate-measurement range resolved against [`RATE_LADDER`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateRange {
    hertz: f64,
    code: u16,
}

impl RateRange {
    /// Collapse a requested range onto the nearest ladder entry. The device
    /// code is the ladder index plus one.
    pub fn nearest(requested: f64) -> Self {
        let index = nearest_index(requested, &RATE_LADDER);
        Self {
            hertz: RATE_LADDER[index],
            code: index as u16 + 1,
        }
    }

    pub fn hertz(&self) -> f64 {
        self.hertz
    }

    pub fn code(&self) -> u16 {
        self.code
    }
}

impl Default for RateRange {
    fn default() -> Self {
        Self::nearest(50e3)
    }
}

fn nearest_index(requested: f64, ladder: &[f64]) -> usize {
    let mut best = 0;
    let mut best_diff = f64::INFINITY;
    for (i, value) in ladder.iter().enumerate() {
        let diff = (requested - value).abs();
        if diff < best_diff {
            best = i;
            best_diff = diff;
        }
    }
    best
}

/// Channel selection as it appears in an `init` payload: either a channel
/// count or an explicit ordered list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChannelSpec {
    Count(i64),
    List(Vec<i64>),
}

/// Ordered set of active inputs: analog channels plus the optional digital,
/// rate and counter inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSet {
    channels: Vec<u8>,
    pub dig_in: bool,
    pub rate_in: bool,
    pub counter_in: bool,
}

impl ChannelSet {
    /// Validate a channel selection. `None` selects all eight analog channels;
    /// an integer `n` selects channels `0..n`; a list is taken verbatim after
    /// checking range, uniqueness and length. Invalid input is rejected, never
    /// truncated.
    pub fn resolve(
        spec: Option<&ChannelSpec>,
        dig_in: bool,
        rate_in: bool,
        counter_in: bool,
    ) -> Result<Self, ConfigError> {
        let channels = match spec {
            None => (0..8).collect(),
            Some(ChannelSpec::Count(n)) => {
                if !(0..=8).contains(n) {
                    return Err(ConfigError::ChannelCount(*n));
                }
                (0..*n as u8).collect()
            }
            Some(ChannelSpec::List(list)) => {
                if list.len() > 8 {
                    return Err(ConfigError::TooManyChannels(list.len()));
                }
                let mut channels = Vec::with_capacity(list.len());
                for &raw in list {
                    if !(0..=7).contains(&raw) {
                        return Err(ConfigError::ChannelOutOfRange(raw));
                    }
                    let chan = raw as u8;
                    if channels.contains(&chan) {
                        return Err(ConfigError::DuplicateChannel(chan));
                    }
                    channels.push(chan);
                }
                channels
            }
        };
        Ok(Self {
            channels,
            dig_in,
            rate_in,
            counter_in,
        })
    }

    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    /// Values per record: one per analog channel plus one per active flag.
    pub fn record_count(&self) -> usize {
        self.channels.len()
            + usize::from(self.dig_in)
            + usize::from(self.rate_in)
            + usize::from(self.counter_in)
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self {
            channels: (0..8).collect(),
            dig_in: false,
            rate_in: false,
            counter_in: false,
        }
    }
}

/// Analog-input filter applied inside the decimation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Select the last point of the window.
    LastPoint,
    /// Cascaded integrator-comb filter.
    Cic,
    /// Maximum point in the window.
    Max,
    /// Minimum point in the window.
    Min,
}

impl FilterMode {
    pub fn from_raw(value: i64) -> Result<Self, ConfigError> {
        match value {
            0 => Ok(Self::LastPoint),
            1 => Ok(Self::Cic),
            2 => Ok(Self::Max),
            3 => Ok(Self::Min),
            other => Err(ConfigError::FilterMode(other)),
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            Self::LastPoint => 0,
            Self::Cic => 1,
            Self::Max => 2,
            Self::Min => 3,
        }
    }
}

/// Filter selection as it appears in an `init` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FilterSpec {
    Scalar(i64),
    List(Vec<i64>),
}

/// Validated filter selection: one mode for every analog channel, or one mode
/// per channel in channel-list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSetting {
    All(FilterMode),
    PerChannel(Vec<FilterMode>),
}

impl FilterSetting {
    fn resolve(spec: &FilterSpec, channel_count: usize) -> Result<Self, ConfigError> {
        match spec {
            FilterSpec::Scalar(raw) => Ok(Self::All(FilterMode::from_raw(*raw)?)),
            FilterSpec::List(list) => {
                if list.len() != channel_count {
                    return Err(ConfigError::FilterListLength {
                        expected: channel_count,
                        got: list.len(),
                    });
                }
                let modes = list
                    .iter()
                    .map(|&raw| FilterMode::from_raw(raw))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::PerChannel(modes))
            }
        }
    }
}

/// Flat key/value settings object accepted by `init`. Unknown keys are
/// dropped by serde; absent keys leave the current configuration untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub fs: Option<f64>,
    pub v_range: Option<f64>,
    pub chans: Option<ChannelSpec>,
    pub dig_in: Option<bool>,
    pub rate_in: Option<bool>,
    pub rate_range: Option<f64>,
    pub ffl: Option<i64>,
    pub counter_in: Option<bool>,
    pub dec: Option<i64>,
    pub filt_settings: Option<FilterSpec>,
}

/// Validated device configuration.
///
/// `packet_size` and `poll_period` are mutually dependent and are only ever
/// updated together through [`DeviceConfig::retune_packetization`], which
/// every merge path calls. The requested `fs` is kept as given; the frequency
/// the hardware will actually produce is [`DeviceConfig::actual_fs`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub fs: f64,
    pub channels: ChannelSet,
    pub v_range: VoltageRange,
    pub rate_range: RateRange,
    pub dec: u16,
    pub ffl: Option<u8>,
    pub filter: Option<FilterSetting>,
    /// Packets read per poll.
    pub buffer_depth: usize,
    packet_size: u16,
    poll_period: Duration,
}

/// Poll period targeted before the packet-size quantisation is applied.
const POLL_PERIOD_TARGET: Duration = Duration::from_millis(100);

impl Default for DeviceConfig {
    fn default() -> Self {
        let mut config = Self {
            fs: 10_000.0,
            channels: ChannelSet::default(),
            v_range: VoltageRange::default(),
            rate_range: RateRange::default(),
            dec: 1,
            ffl: None,
            filter: None,
            buffer_depth: 4,
            packet_size: PACKET_SIZE_MIN,
            poll_period: POLL_PERIOD_TARGET,
        };
        config.retune_packetization();
        config
    }
}

impl DeviceConfig {
    /// Value for the `srate` register: `60e6 / (fs * dec)`, clamped to the
    /// register's legal span.
    pub fn srate(&self) -> u16 {
        let raw = (BASE_CLOCK_HZ / (self.fs * self.dec as f64)).round();
        (raw as u32).clamp(SRATE_MIN as u32, SRATE_MAX as u32) as u16
    }

    /// Sampling frequency the hardware will actually produce. Differs from the
    /// requested `fs` whenever srate quantisation or clamping kicks in.
    pub fn actual_fs(&self) -> f64 {
        BASE_CLOCK_HZ / (self.srate() as f64 * self.dec as f64)
    }

    pub fn packet_size(&self) -> u16 {
        self.packet_size
    }

    pub fn poll_period(&self) -> Duration {
        self.poll_period
    }

    /// Bytes transferred per poll: `buffer_depth` packets.
    pub fn poll_bytes(&self) -> usize {
        self.packet_size as usize * self.buffer_depth
    }

    /// Recompute the packet-size/poll-period pair from `fs`, the record count
    /// and `buffer_depth`. The packet size is the smallest selectable power of
    /// two that covers the bytes produced per packet slot at the current poll
    /// period; the poll period is then re-derived from the chosen packet size
    /// so the pair stays consistent with what the hardware can be told.
    pub fn retune_packetization(&mut self) {
        let record_count = self.channels.record_count().max(1);
        let bytes_per_second = self.fs * record_count as f64 * 2.0;
        let target =
            (bytes_per_second * self.poll_period.as_secs_f64() / self.buffer_depth as f64).ceil();
        self.packet_size = packet_size_for(target as usize);
        self.poll_period = Duration::from_secs_f64(
            self.packet_size as f64 * self.buffer_depth as f64 / bytes_per_second,
        );
    }

    /// Validate a settings patch against this configuration and produce the
    /// merged result. Pure: no device I/O happens here, so a failed merge
    /// leaves both the current configuration and the device untouched.
    pub fn apply(&self, patch: &SettingsPatch) -> Result<Self, ConfigError> {
        let mut next = self.clone();

        if let Some(fs) = patch.fs {
            if !(fs >= FS_MIN && fs <= FS_MAX) {
                return Err(ConfigError::SampleRate(fs));
            }
            next.fs = fs;
        }
        if let Some(v_range) = patch.v_range {
            next.v_range = VoltageRange::nearest(v_range);
        }
        if let Some(rate_range) = patch.rate_range {
            next.rate_range = RateRange::nearest(rate_range);
        }
        if let Some(dec) = patch.dec {
            if !(1..=512).contains(&dec) {
                return Err(ConfigError::Decimation(dec));
            }
            next.dec = dec as u16;
        }
        if let Some(ffl) = patch.ffl {
            if !(1..=64).contains(&ffl) {
                return Err(ConfigError::MovingAverage(ffl));
            }
            next.ffl = Some(ffl as u8);
        }

        let dig_in = patch.dig_in.unwrap_or(self.channels.dig_in);
        let rate_in = patch.rate_in.unwrap_or(self.channels.rate_in);
        let counter_in = patch.counter_in.unwrap_or(self.channels.counter_in);
        next.channels = match &patch.chans {
            Some(spec) => ChannelSet::resolve(Some(spec), dig_in, rate_in, counter_in)?,
            None => {
                let mut channels = self.channels.clone();
                channels.dig_in = dig_in;
                channels.rate_in = rate_in;
                channels.counter_in = counter_in;
                channels
            }
        };
        if next.channels.record_count() == 0 {
            return Err(ConfigError::NoActiveInputs);
        }

        if let Some(spec) = &patch.filt_settings {
            next.filter = Some(FilterSetting::resolve(spec, next.channels.channels().len())?);
        }

        next.retune_packetization();
        Ok(next)
    }
}

/// Smallest power of two >= `target` within the selectable packet-size span,
/// clipped at both ends.
pub fn packet_size_for(target: usize) -> u16 {
    target
        .next_power_of_two()
        .clamp(PACKET_SIZE_MIN as usize, PACKET_SIZE_MAX as usize) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voltage_range_snaps_to_nearest() {
        assert_eq!(VoltageRange::nearest(10.0).code(), 0);
        assert_eq!(VoltageRange::nearest(0.2).code(), 5);
        assert_eq!(VoltageRange::nearest(4.0).volts(), 5.0);
        assert_eq!(VoltageRange::nearest(0.05).volts(), 0.2);
        assert_eq!(VoltageRange::nearest(1000.0).volts(), 10.0);
    }

    #[test]
    fn voltage_range_tie_breaks_to_higher_entry() {
        // 0.35 is equidistant from 0.5 and 0.2.
        let range = VoltageRange::nearest(0.35);
        assert_eq!(range.volts(), 0.5);
        assert_eq!(range.code(), 4);
    }

    #[test]
    fn rate_range_code_is_index_plus_one() {
        assert_eq!(RateRange::nearest(50e3).code(), 1);
        assert_eq!(RateRange::nearest(10.0).code(), 12);
        assert_eq!(RateRange::nearest(900.0).hertz(), 1000.0);
    }

    #[test]
    fn channel_set_default_is_all_eight() {
        let set = ChannelSet::resolve(None, false, false, false).unwrap();
        assert_eq!(set.channels(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(set.record_count(), 8);
    }

    #[test]
    fn channel_count_selects_prefix() {
        let set = ChannelSet::resolve(Some(&ChannelSpec::Count(3)), true, false, false).unwrap();
        assert_eq!(set.channels(), &[0, 1, 2]);
        assert_eq!(set.record_count(), 4);
    }

    #[test]
    fn channel_count_out_of_range_is_rejected() {
        let err = ChannelSet::resolve(Some(&ChannelSpec::Count(9)), false, false, false);
        assert!(matches!(err, Err(ConfigError::ChannelCount(9))));
    }

    #[test]
    fn duplicate_channels_are_rejected() {
        let spec = ChannelSpec::List(vec![0, 2, 2]);
        let err = ChannelSet::resolve(Some(&spec), false, false, false);
        assert!(matches!(err, Err(ConfigError::DuplicateChannel(2))));
    }

    #[test]
    fn channel_list_preserves_order() {
        let spec = ChannelSpec::List(vec![5, 0, 3]);
        let set = ChannelSet::resolve(Some(&spec), false, true, true).unwrap();
        assert_eq!(set.channels(), &[5, 0, 3]);
        assert_eq!(set.record_count(), 5);
    }

    #[test]
    fn packet_size_selection() {
        assert_eq!(packet_size_for(100), 128);
        assert_eq!(packet_size_for(1), 16);
        assert_eq!(packet_size_for(16), 16);
        assert_eq!(packet_size_for(2049), 2048);
        assert_eq!(packet_size_for(1_000_000), 2048);
    }

    #[test]
    fn srate_is_clamped() {
        let mut config = DeviceConfig::default();
        config.fs = 10_000.0;
        config.dec = 1;
        assert_eq!(config.srate(), 6000);

        config.fs = 160_000.0;
        assert_eq!(config.srate(), 375);

        // Saturates at the top of the register with heavy decimation.
        config.fs = 1_000.0;
        config.dec = 512;
        assert_eq!(config.srate(), SRATE_MIN);
    }

    #[test]
    fn actual_fs_reflects_quantisation() {
        let patch = SettingsPatch {
            fs: Some(7_000.0),
            ..SettingsPatch::default()
        };
        let config = DeviceConfig::default().apply(&patch).unwrap();
        // 60e6 / 7000 = 8571.43 -> srate 8571 -> actual 7000.35 Hz
        assert_eq!(config.srate(), 8571);
        assert!((config.actual_fs() - 7000.35).abs() < 0.01);
        assert_eq!(config.fs, 7_000.0);
    }

    #[test]
    fn retune_keeps_pair_consistent() {
        let config = DeviceConfig::default();
        let record_count = config.channels.record_count() as f64;
        let derived = config.packet_size() as f64 * config.buffer_depth as f64
            / (config.fs * record_count * 2.0);
        assert!((config.poll_period().as_secs_f64() - derived).abs() < 1e-9);
        assert!(config.packet_size().is_power_of_two());

        // A second retune is a fixed point.
        let mut again = config.clone();
        again.retune_packetization();
        assert_eq!(again.packet_size(), config.packet_size());
        assert_eq!(again.poll_period(), config.poll_period());
    }

    #[test]
    fn apply_rejects_out_of_range_values() {
        let base = DeviceConfig::default();
        let patch = SettingsPatch {
            fs: Some(200_000.0),
            ..SettingsPatch::default()
        };
        assert!(matches!(base.apply(&patch), Err(ConfigError::SampleRate(_))));

        let patch = SettingsPatch {
            dec: Some(513),
            ..SettingsPatch::default()
        };
        assert!(matches!(base.apply(&patch), Err(ConfigError::Decimation(513))));

        let patch = SettingsPatch {
            ffl: Some(0),
            ..SettingsPatch::default()
        };
        assert!(matches!(base.apply(&patch), Err(ConfigError::MovingAverage(0))));

        let patch = SettingsPatch {
            filt_settings: Some(FilterSpec::Scalar(4)),
            ..SettingsPatch::default()
        };
        assert!(matches!(base.apply(&patch), Err(ConfigError::FilterMode(4))));
    }

    #[test]
    fn apply_rejects_mismatched_filter_list() {
        let base = DeviceConfig::default();
        let patch = SettingsPatch {
            chans: Some(ChannelSpec::List(vec![0, 1])),
            filt_settings: Some(FilterSpec::List(vec![0, 1, 2])),
            ..SettingsPatch::default()
        };
        assert!(matches!(
            base.apply(&patch),
            Err(ConfigError::FilterListLength {
                expected: 2,
                got: 3
            })
        ));
    }

    #[test]
    fn apply_rejects_empty_input_set() {
        let base = DeviceConfig::default();
        let patch = SettingsPatch {
            chans: Some(ChannelSpec::Count(0)),
            ..SettingsPatch::default()
        };
        assert!(matches!(base.apply(&patch), Err(ConfigError::NoActiveInputs)));
    }

    #[test]
    fn apply_merges_over_current_values() {
        let base = DeviceConfig::default();
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"fs": 1000, "chans": [0], "dig_in": true, "unknown": 1}"#)
                .unwrap();
        let merged = base.apply(&patch).unwrap();
        assert_eq!(merged.fs, 1000.0);
        assert_eq!(merged.channels.channels(), &[0]);
        assert!(merged.channels.dig_in);
        // Untouched keys carry over.
        assert_eq!(merged.dec, base.dec);
        assert_eq!(merged.v_range, base.v_range);
    }

    #[test]
    fn patch_parses_scalar_and_list_shapes() {
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"chans": 4, "filt_settings": 1}"#).unwrap();
        assert!(matches!(patch.chans, Some(ChannelSpec::Count(4))));
        assert!(matches!(patch.filt_settings, Some(FilterSpec::Scalar(1))));

        let patch: SettingsPatch =
            serde_json::from_str(r#"{"chans": [1, 2], "filt_settings": [0, 3]}"#).unwrap();
        assert!(matches!(patch.chans, Some(ChannelSpec::List(_))));
        assert!(matches!(patch.filt_settings, Some(FilterSpec::List(_))));
    }
}
