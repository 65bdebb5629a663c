use crate::acquisition::{AcquisitionError, Digitizer};
use crate::config::SettingsPatch;
use crate::connector::ConnectorError;
use crate::protocol::{parse_request, CommandName, RequestItem};
use crate::registry::{HandlerPatch, InitError, PortEntry, Registry};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Connects the physical device when a port is first committed.
pub type Opener = dyn Fn() -> Result<Digitizer, ConnectorError> + Send + Sync;

/// Knobs for the network side of the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket read/write timeout; no network operation blocks longer.
    pub io_timeout: Duration,
    /// Upper bound on one request's size.
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            max_request_bytes: 64 * 1024,
        }
    }
}

/// TCP front end: accepts connections, parses tagged requests and routes the
/// commands to the per-port registry. One worker thread per connection; the
/// registry serialises everything that touches the device.
pub struct PulseServer {
    registry: Arc<Registry>,
    opener: Arc<Opener>,
    port_key: String,
    config: ServerConfig,
}

impl PulseServer {
    pub fn new(port_key: impl Into<String>, opener: Arc<Opener>, config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            opener,
            port_key: port_key.into(),
            config,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Accept loop. Each connection gets its own worker; a worker failing or
    /// disconnecting mid-pulse does not cancel the acquisition, which the
    /// device owner completes independently.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "listening");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_client(stream) {
                            tracing::warn!("client worker ended with error: {e}");
                        }
                    });
                }
                Err(e) => tracing::error!("accept failed: {e}"),
            }
        }
        Ok(())
    }

    fn handle_client(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let peer = stream.peer_addr()?;
        let span = tracing::info_span!("client", peer = %peer);
        let _guard = span.enter();
        tracing::info!("connected");

        stream.set_read_timeout(Some(self.config.io_timeout))?;
        stream.set_write_timeout(Some(self.config.io_timeout))?;

        while let Some(request) = self.read_request(&mut stream)? {
            for item in parse_request(&request) {
                self.dispatch(item, &mut stream)?;
            }
        }

        tracing::info!("disconnected");
        Ok(())
    }

    /// Accumulate one request: bytes up to a newline or end of stream.
    /// Returns `None` once the peer is done. Anything past the newline is
    /// kept in the request; commands are positional, so back-to-back
    /// requests concatenate without changing meaning.
    fn read_request(&self, stream: &mut TcpStream) -> std::io::Result<Option<String>> {
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if request.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
                Ok(n) => {
                    request.extend_from_slice(&chunk[..n]);
                    if request.len() > self.config.max_request_bytes {
                        tracing::warn!("request exceeded {} bytes", self.config.max_request_bytes);
                        stream.write_all(b"error protocol\n")?;
                        return Ok(None);
                    }
                    if chunk[..n].contains(&b'\n') {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    // Idle connection past the IO timeout: let it go.
                    if request.is_empty() {
                        return Ok(None);
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(String::from_utf8_lossy(&request).into_owned()))
    }

    fn dispatch(&self, item: RequestItem, stream: &mut TcpStream) -> std::io::Result<()> {
        let item = match item {
            RequestItem::Malformed(e) => {
                tracing::warn!("protocol error: {e}");
                return stream.write_all(b"error protocol\n");
            }
            RequestItem::Command(command) => command,
        };

        let entry = self.registry.entry(&self.port_key);
        tracing::debug!(command = %item.name, "dispatch");

        match item.name {
            CommandName::Init => match self.handle_init(&entry, item.payload.as_deref()) {
                Ok(()) => stream.write_all(b"ok\n"),
                Err(kind) => stream.write_all(format!("error {kind}\n").as_bytes()),
            },
            CommandName::TrigPulse => {
                tracing::debug!(duration = ?entry.pulse_duration(), "pulse requested");
                match entry.trig_pulse() {
                    Ok(data) => {
                        tracing::debug!(records = data.records(), "pulse complete");
                        stream.write_all(b"ok\n")
                    }
                    Err(e) => {
                        tracing::warn!("trig_pulse failed: {e}");
                        stream
                            .write_all(format!("error {}\n", acquisition_error_kind(&e)).as_bytes())
                    }
                }
            }
            CommandName::GetSettings => {
                let mut encoded = entry.settings_json().to_string();
                encoded.push('\n');
                stream.write_all(encoded.as_bytes())
            }
            CommandName::QueryDataLength => {
                stream.write_all(format!("{}\n", entry.last_result_len()).as_bytes())
            }
            // The raw buffer, verbatim and unframed; the peer sizes the read
            // via a prior query_data_length. Either the whole buffer goes out
            // or the connection fails.
            CommandName::Store => match entry.last_result() {
                Some(result) => stream.write_all(&result.raw),
                None => Ok(()),
            },
        }
    }

    fn handle_init(
        &self,
        entry: &PortEntry,
        payload: Option<&str>,
    ) -> Result<(), &'static str> {
        let payload = payload.ok_or_else(|| {
            tracing::warn!("init without a payload");
            "config"
        })?;
        let patch: SettingsPatch = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!("init payload rejected: {e}");
            "config"
        })?;
        let handler: HandlerPatch = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!("init payload rejected: {e}");
            "config"
        })?;

        let opener = self.opener.clone();
        entry.init(&patch, &handler, || opener()).map_err(|e| {
            tracing::warn!("init failed: {e}");
            init_error_kind(&e)
        })
    }
}

fn init_error_kind(error: &InitError) -> &'static str {
    match error {
        InitError::Config(_) => "config",
        InitError::Device(_) | InitError::Connect(_) => "device",
        InitError::Busy(_) => "busy",
    }
}

fn acquisition_error_kind(error: &AcquisitionError) -> &'static str {
    match error {
        AcquisitionError::Busy(_) => "busy",
        AcquisitionError::Device(_) => "device",
        AcquisitionError::Config(_) => "config",
        AcquisitionError::Codec(_) => "codec",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionState;
    use crate::config::ConfigError;
    use crate::device::DeviceIoError;

    #[test]
    fn error_kinds_map_to_protocol_words() {
        assert_eq!(
            init_error_kind(&InitError::Config(ConfigError::Decimation(0))),
            "config"
        );
        assert_eq!(
            init_error_kind(&InitError::Busy(AcquisitionState::Running)),
            "busy"
        );
        assert_eq!(
            acquisition_error_kind(&AcquisitionError::Busy(AcquisitionState::Running)),
            "busy"
        );
        assert_eq!(
            acquisition_error_kind(&AcquisitionError::Device(DeviceIoError::Timeout {
                wanted: 1,
                got: 0,
                elapsed: Duration::ZERO,
            })),
            "device"
        );
    }
}
