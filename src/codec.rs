use crate::config::DeviceConfig;
use polars::prelude::*;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("sample buffer length {0} is odd; samples are 2-byte words")]
    OddLength(usize),

    #[error("record layout has no slots")]
    EmptyLayout,
}

/// One value slot inside a record, in device scan order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Analog { channel: u8, volts: f64 },
    Digital,
    Rate { hertz: f64 },
    Counter,
}

impl Slot {
    fn column_name(&self) -> String {
        match self {
            Self::Analog { channel, .. } => format!("ch{channel}"),
            Self::Digital => "dig_in".to_string(),
            Self::Rate { .. } => "rate".to_string(),
            Self::Counter => "count".to_string(),
        }
    }
}

/// Decode-order description of one record. Mirrors the slist order the
/// encoder programs: analog channels first, then digital input, then rate,
/// then counter.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLayout {
    slots: Vec<Slot>,
}

impl RecordLayout {
    pub fn from_config(config: &DeviceConfig) -> Self {
        let set = &config.channels;
        let mut slots = Vec::with_capacity(set.record_count());
        for &channel in set.channels() {
            slots.push(Slot::Analog {
                channel,
                volts: config.v_range.volts(),
            });
        }
        if set.dig_in {
            slots.push(Slot::Digital);
        }
        if set.rate_in {
            slots.push(Slot::Rate {
                hertz: config.rate_range.hertz(),
            });
        }
        if set.counter_in {
            slots.push(Slot::Counter);
        }
        Self { slots }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn record_count(&self) -> usize {
        self.slots.len()
    }
}

/// Group consecutive byte pairs as little-endian unsigned 16-bit words.
pub fn bytes_to_ints(buffer: &[u8]) -> Result<Vec<u16>, CodecError> {
    if buffer.len() % 2 != 0 {
        return Err(CodecError::OddLength(buffer.len()));
    }
    Ok(buffer
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Inverse of [`bytes_to_ints`].
pub fn ints_to_bytes(ints: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ints.len() * 2);
    for value in ints {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Recover the signed magnitude of a two's-complement value of the given
/// width: values with the sign bit set are shifted down by `1 << bits`.
pub fn twos_complement(value: u32, bits: u32) -> i32 {
    if value & (1 << (bits - 1)) != 0 {
        (value as i64 - (1i64 << bits)) as i32
    } else {
        value as i32
    }
}

/// Inverse of [`twos_complement`].
pub fn from_twos_complement(value: i32, bits: u32) -> u32 {
    if value < 0 {
        (value as i64 + (1i64 << bits)) as u32
    } else {
        value as u32
    }
}

/// Physical values decoded from one pulse, one column per record slot.
#[derive(Debug, Clone)]
pub struct PulseData {
    layout: RecordLayout,
    columns: Vec<Vec<f64>>,
    elapsed: Duration,
}

impl PulseData {
    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// Number of complete records decoded.
    pub fn records(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn column(&self, slot: usize) -> Option<&[f64]> {
        self.columns.get(slot).map(Vec::as_slice)
    }

    /// DataFrame view with a time column derived from the hardware sampling
    /// frequency and one named column per record slot.
    pub fn to_frame(&self, actual_fs: f64) -> PolarsResult<DataFrame> {
        let records = self.records();
        let times: Vec<f64> = (0..records).map(|i| i as f64 / actual_fs).collect();
        let mut columns: Vec<Column> = Vec::with_capacity(self.columns.len() + 1);
        columns.push(Series::new("time".into(), times).into());
        for (slot, values) in self.layout.slots().iter().zip(&self.columns) {
            columns.push(Series::new(slot.column_name().into(), values.clone()).into());
        }
        DataFrame::new(columns)
    }
}

/// Decode a raw pulse buffer into physical values.
///
/// Slots decode in layout order: analog as `twos(v)/32768 * v_range` volts,
/// digital as the upper byte (`raw >> 8`, not re-masked), rate as
/// `(twos(v) + 32768)/65536 * rate_range` Hz, counter as `twos(v) + 32768`.
/// A trailing partial record, possible because packet boundaries are
/// independent of the record stride, is dropped.
pub fn decode_pulse(
    raw: &[u8],
    layout: &RecordLayout,
    elapsed: Duration,
) -> Result<PulseData, CodecError> {
    let record_count = layout.record_count();
    if record_count == 0 {
        return Err(CodecError::EmptyLayout);
    }
    let ints = bytes_to_ints(raw)?;
    let records = ints.len() / record_count;
    let mut columns = vec![Vec::with_capacity(records); record_count];
    for record in ints.chunks_exact(record_count) {
        for (slot, (&value, column)) in layout
            .slots()
            .iter()
            .zip(record.iter().zip(columns.iter_mut()))
        {
            column.push(decode_slot(*slot, value));
        }
    }
    Ok(PulseData {
        layout: layout.clone(),
        columns,
        elapsed,
    })
}

fn decode_slot(slot: Slot, value: u16) -> f64 {
    match slot {
        Slot::Analog { volts, .. } => {
            twos_complement(value as u32, 16) as f64 / 32768.0 * volts
        }
        Slot::Digital => (value >> 8) as f64,
        Slot::Rate { hertz } => {
            (twos_complement(value as u32, 16) as f64 + 32768.0) / 65536.0 * hertz
        }
        Slot::Counter => twos_complement(value as u32, 16) as f64 + 32768.0,
    }
}
