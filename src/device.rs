use serialport::SerialPort;
use std::io::Read;
use std::io::Write;
use std::time::{Duration, Instant};

/// Reply the instrument must echo to the `info 0` handshake.
pub const HANDSHAKE_REPLY: &str = "info 0 DATAQ";

/// Attempts before a failed handshake is reported.
pub const HANDSHAKE_ATTEMPTS: u32 = 3;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum DeviceIoError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read timed out after {elapsed:?} with {got} of {wanted} bytes")]
    Timeout {
        wanted: usize,
        got: usize,
        elapsed: Duration,
    },

    #[error("device did not answer 'info 0' with '{HANDSHAKE_REPLY}' (last reply: {reply:?})")]
    Handshake { reply: String },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Byte-level access to one DI-4108. Commands are CR-terminated ASCII; data
/// reads are fixed-size binary packets. Every read carries an explicit,
/// finite budget.
pub trait Transport: Send {
    /// Write one command, appending the CR terminator.
    fn send_command(&mut self, command: &str) -> Result<(), DeviceIoError>;

    /// Fill `buf` completely or fail with [`DeviceIoError::Timeout`] once the
    /// budget is spent.
    fn read_exact(&mut self, buf: &mut [u8], budget: Duration) -> Result<(), DeviceIoError>;

    /// Read one CR-terminated ASCII reply, without the terminator.
    fn read_reply(&mut self, budget: Duration) -> Result<String, DeviceIoError>;
}

/// [`Transport`] over a serial port. The DI-4108 enumerates as a USB CDC
/// device, so the configured baud rate is nominal.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str) -> Result<Self, DeviceIoError> {
        let port = serialport::new(path, 115_200)
            .timeout(Duration::from_millis(10))
            .open()?;
        let mut transport = Self { port };
        transport.drain()?;
        Ok(transport)
    }

    /// Discard anything buffered from a previous session.
    fn drain(&mut self) -> Result<(), DeviceIoError> {
        self.port.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn read_byte(&mut self, deadline: Instant) -> Result<Option<u8>, DeviceIoError> {
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => {}
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

impl Transport for SerialTransport {
    fn send_command(&mut self, command: &str) -> Result<(), DeviceIoError> {
        log::debug!("-> {}", command);
        self.port.write_all(format!("{command}\r").as_bytes())?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], budget: Duration) -> Result<(), DeviceIoError> {
        let deadline = Instant::now() + budget;
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if filled < buf.len() && Instant::now() >= deadline {
                return Err(DeviceIoError::Timeout {
                    wanted: buf.len(),
                    got: filled,
                    elapsed: budget,
                });
            }
        }
        Ok(())
    }

    fn read_reply(&mut self, budget: Duration) -> Result<String, DeviceIoError> {
        let deadline = Instant::now() + budget;
        let mut reply = Vec::new();
        loop {
            match self.read_byte(deadline)? {
                Some(b'\r') => break,
                Some(byte) => reply.push(byte),
                None => {
                    return Err(DeviceIoError::Timeout {
                        wanted: reply.len() + 1,
                        got: reply.len(),
                        elapsed: budget,
                    })
                }
            }
        }
        Ok(String::from_utf8(reply)?.trim().to_string())
    }
}

/// Verify the instrument identity: `info 0` must come back as
/// `info 0 DATAQ\r`, retried a bounded number of times.
pub fn handshake<T: Transport + ?Sized>(transport: &mut T) -> Result<(), DeviceIoError> {
    let mut last_reply = String::new();
    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        transport.send_command("info 0")?;
        match transport.read_reply(HANDSHAKE_TIMEOUT) {
            Ok(reply) if reply == HANDSHAKE_REPLY => {
                log::debug!("handshake ok on attempt {}", attempt);
                return Ok(());
            }
            Ok(reply) => {
                log::debug!("handshake attempt {} answered {:?}", attempt, reply);
                last_reply = reply;
            }
            Err(DeviceIoError::Timeout { .. }) => {
                log::debug!("handshake attempt {} timed out", attempt);
            }
            Err(e) => return Err(e),
        }
    }
    Err(DeviceIoError::Handshake { reply: last_reply })
}

/// In-memory stand-in for the instrument: answers the handshake and, once
/// started, produces an endless little-endian counting ramp. Useful for
/// development and tests without hardware.
pub struct MockTransport {
    started: bool,
    next_word: u16,
    pending_reply: Option<String>,
    commands: CommandLog,
}

/// Shared view of the commands a [`MockTransport`] has received.
pub type CommandLog = std::sync::Arc<std::sync::Mutex<Vec<String>>>;

impl MockTransport {
    pub fn new() -> (Self, CommandLog) {
        let log = CommandLog::default();
        let transport = Self {
            started: false,
            next_word: 0,
            pending_reply: None,
            commands: log.clone(),
        };
        (transport, log)
    }
}

impl Transport for MockTransport {
    fn send_command(&mut self, command: &str) -> Result<(), DeviceIoError> {
        if let Ok(mut log) = self.commands.lock() {
            log.push(command.to_string());
        }
        match command {
            "info 0" => self.pending_reply = Some(HANDSHAKE_REPLY.to_string()),
            "start 0" => self.started = true,
            "stop" => self.started = false,
            _ => {}
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], budget: Duration) -> Result<(), DeviceIoError> {
        if !self.started {
            return Err(DeviceIoError::Timeout {
                wanted: buf.len(),
                got: 0,
                elapsed: budget,
            });
        }
        for pair in buf.chunks_mut(2) {
            let bytes = self.next_word.to_le_bytes();
            pair.copy_from_slice(&bytes[..pair.len()]);
            self.next_word = self.next_word.wrapping_add(1);
        }
        Ok(())
    }

    fn read_reply(&mut self, budget: Duration) -> Result<String, DeviceIoError> {
        self.pending_reply
            .take()
            .ok_or(DeviceIoError::Timeout {
                wanted: 1,
                got: 0,
                elapsed: budget,
            })
    }
}
