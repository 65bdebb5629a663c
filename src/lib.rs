//! # di4108-rs
//!
//! A Rust driver and triggered-pulse acquisition server for the DATAQ
//! DI-4108 USB data-acquisition instrument.
//!
//! The crate covers the full path from a requested channel/range/timing
//! configuration down to the instrument's register encoding and back up from
//! raw two's-complement byte streams to physical values, and exposes
//! triggered pulses to network clients over a small tagged-command protocol.
//!
//! ## Features
//!
//! - **Device discovery**: finds attached DI-4108s by USB vendor/product id
//!   through `serialport` enumeration
//! - **Configuration encoding**: validated channel sets, voltage/rate range
//!   ladders, srate/decimation/filter/packet-size programming
//! - **Sample codec**: little-endian two's-complement decoding into volts,
//!   digital states, rate and counter values, with a `polars` DataFrame view
//! - **Triggered pulses**: deadline-paced poll loop with overrun accounting
//!   and strict abort semantics
//! - **Pulse server**: thread-per-connection TCP dispatcher speaking the
//!   `<init>`/`<trig_pulse>`/`<store>` tagged grammar, with one serialized
//!   device owner per port
//!
//! ## Examples
//!
//! ### Capture one pulse from an attached instrument
//!
//! ```rust,no_run
//! use di4108_rs::codec::{decode_pulse, RecordLayout};
//! use di4108_rs::{DeviceConfig, Di4108Connector, SettingsPatch};
//! use std::time::Duration;
//!
//! let mut digitizer = Di4108Connector::connect(None)?;
//!
//! let patch: SettingsPatch = serde_json::from_str(r#"{"fs": 1000, "chans": [0]}"#)?;
//! let config = DeviceConfig::default().apply(&patch)?;
//! digitizer.commit(&config)?;
//!
//! let pulse = digitizer.trig_pulse(&config, Duration::from_secs(1))?;
//! let layout = RecordLayout::from_config(&config);
//! let data = decode_pulse(&pulse.raw, &layout, pulse.elapsed)?;
//! println!("{} records in {:?}", data.records(), data.elapsed());
//! println!("{}", data.to_frame(config.actual_fs())?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Serve pulses over TCP
//!
//! ```rust,no_run
//! use di4108_rs::{Di4108Connector, PulseServer, ServerConfig};
//! use std::net::TcpListener;
//! use std::sync::Arc;
//!
//! let server = Arc::new(PulseServer::new(
//!     "di4108",
//!     Arc::new(|| Di4108Connector::connect(None)),
//!     ServerConfig::default(),
//! ));
//! let listener = TcpListener::bind("0.0.0.0:4220")?;
//! server.serve(listener)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Exercise the stack without hardware
//!
//! ```rust
//! use di4108_rs::{DeviceConfig, Digitizer, MockTransport};
//! use std::time::Duration;
//!
//! let (mock, commands) = MockTransport::new();
//! let mut digitizer = Digitizer::new(Box::new(mock));
//!
//! let config = DeviceConfig::default();
//! digitizer.commit(&config)?;
//! let pulse = digitizer.trig_pulse(&config, Duration::from_millis(50))?;
//! assert!(!pulse.raw.is_empty());
//! assert_eq!(commands.lock().unwrap().first().map(String::as_str), Some("slist 0 0"));
//! # Ok::<(), di4108_rs::AcquisitionError>(())
//! ```

pub mod acquisition;
pub mod codec;
pub mod config;
pub mod connector;
pub mod device;
pub mod encoder;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-export the main types for convenience
pub use acquisition::{AcquisitionError, AcquisitionState, Digitizer, RawPulse};

pub use codec::{decode_pulse, CodecError, PulseData, RecordLayout};

pub use config::{
    ChannelSet, ChannelSpec, ConfigError, DeviceConfig, FilterMode, FilterSetting, RateRange,
    SettingsPatch, VoltageRange,
};

pub use connector::{ConnectorError, Di4108Connector, Di4108Device};

pub use device::{DeviceIoError, MockTransport, SerialTransport, Transport};

pub use protocol::{parse_request, Command, CommandName, ProtocolError, RequestItem};

pub use registry::{
    HandlerPatch, HandlerSettings, InitError, PortEntry, Registry, StoredResult,
};

pub use server::{Opener, PulseServer, ServerConfig};
