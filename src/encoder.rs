//! Translation of a validated [`DeviceConfig`] into the DI-4108's register
//! and command encoding. Pure string/number construction; the acquisition
//! controller owns the transport that the commands are written to.

use crate::config::{DeviceConfig, FilterSetting};

/// slist marker for the digital-input record slot.
const SLIST_DIGITAL: u16 = 8;
/// slist marker combined with the rate code for the rate slot.
const SLIST_RATE: u16 = 9;
/// slist marker for the counter slot.
const SLIST_COUNTER: u16 = 10;

/// Build the select-list entries in scan order: analog channels carry the
/// channel index in the low bits and the voltage-range code in bits 8-11;
/// the digital, rate and counter inputs use their fixed markers.
pub fn slist_entries(config: &DeviceConfig) -> Vec<u16> {
    let set = &config.channels;
    let mut entries = Vec::with_capacity(set.record_count());
    for &channel in set.channels() {
        entries.push(channel as u16 | (config.v_range.code() << 8));
    }
    if set.dig_in {
        entries.push(SLIST_DIGITAL);
    }
    if set.rate_in {
        entries.push((config.rate_range.code() << 8) | SLIST_RATE);
    }
    if set.counter_in {
        entries.push(SLIST_COUNTER);
    }
    entries
}

/// Ladder index carried by the `ps` command: packet sizes are powers of two
/// starting at 16 bytes.
pub fn packet_size_index(packet_size: u16) -> u16 {
    packet_size.trailing_zeros() as u16 - 4
}

/// The full, ordered command sequence that commits a configuration: one
/// `slist` per entry, `srate`, filter command(s), `dec`, `ffl` when set, and
/// the packet size.
pub fn command_sequence(config: &DeviceConfig) -> Vec<String> {
    let mut commands = Vec::new();

    for (index, entry) in slist_entries(config).iter().enumerate() {
        commands.push(format!("slist {index} {entry}"));
    }

    commands.push(format!("srate {}", config.srate()));

    match &config.filter {
        Some(FilterSetting::All(mode)) => {
            commands.push(format!("filter * {}", mode.as_raw()));
        }
        Some(FilterSetting::PerChannel(modes)) => {
            for (&channel, mode) in config.channels.channels().iter().zip(modes) {
                commands.push(format!("filter {channel} {}", mode.as_raw()));
            }
        }
        // Leave the device default in place when unspecified.
        None => {}
    }

    commands.push(format!("dec {}", config.dec));

    if let Some(ffl) = config.ffl {
        commands.push(format!("ffl {ffl}"));
    }

    commands.push(format!("ps {}", packet_size_index(config.packet_size())));

    commands
}
