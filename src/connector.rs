use crate::acquisition::Digitizer;
use crate::device::{handshake, DeviceIoError, SerialTransport};
use serialport::SerialPortType;

/// USB vendor id of DATAQ Instruments.
pub const DI4108_VID: u16 = 0x0683;
/// USB product id of the DI-4108.
pub const DI4108_PID: u16 = 0x4108;

/// A DI-4108 found on the host.
#[derive(Debug, Clone)]
pub struct Di4108Device {
    pub port: String,
    pub serial_number: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("device error: {0}")]
    Device(#[from] DeviceIoError),

    #[error("port {port} is not a DI-4108")]
    InvalidPort { port: String },

    #[error("no DI-4108 found; plug one in or specify the port manually")]
    DeviceNotFound,
}

/// Discovery and connection entry point for locally attached DI-4108s.
pub struct Di4108Connector;

impl Di4108Connector {
    /// Connect to a DI-4108, either on an explicit serial port or on the
    /// first discovered device, and verify its identity via the `info 0`
    /// handshake.
    pub fn connect(port: Option<&str>) -> Result<Digitizer, ConnectorError> {
        let port = match port {
            Some(port) => {
                Self::validate_port(port)?;
                port.to_string()
            }
            None => Self::get_available_devices()?
                .into_iter()
                .next()
                .map(|device| device.port)
                .ok_or(ConnectorError::DeviceNotFound)?,
        };

        log::debug!("Connecting to DI-4108 on port {}", port);
        let mut transport = SerialTransport::open(&port)?;
        handshake(&mut transport)?;
        Ok(Digitizer::new(Box::new(transport)))
    }

    /// Validate that a given port enumerates with the DI-4108 vendor/product
    /// identity.
    fn validate_port(port: &str) -> Result<(), ConnectorError> {
        let devices = Self::get_available_devices()?;
        if !devices.iter().any(|d| d.port == port) {
            return Err(ConnectorError::InvalidPort {
                port: port.to_string(),
            });
        }
        Ok(())
    }

    /// All attached DI-4108s, identified by USB vendor/product id.
    pub fn get_available_devices() -> Result<Vec<Di4108Device>, ConnectorError> {
        let mut devices = Vec::new();
        for info in serialport::available_ports()? {
            if let SerialPortType::UsbPort(usb) = &info.port_type {
                if usb.vid == DI4108_VID && usb.pid == DI4108_PID {
                    devices.push(Di4108Device {
                        port: info.port_name.clone(),
                        serial_number: usb.serial_number.clone(),
                    });
                }
            }
        }
        Ok(devices)
    }
}
