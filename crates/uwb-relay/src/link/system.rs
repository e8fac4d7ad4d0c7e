//! Hardware serial ports via the `serialport` crate (8N1, no flow control).

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use super::{PortOpener, SerialStream};

pub struct SystemPortOpener {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SystemPortOpener {
    /// `timeout` is the port's default I/O timeout; it bounds writes and any
    /// read issued without an explicit timeout.
    pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout,
        }
    }
}

impl PortOpener for SystemPortOpener {
    type Stream = SystemPort;

    fn name(&self) -> &str {
        &self.path
    }

    fn open(&mut self) -> io::Result<SystemPort> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        Ok(SystemPort {
            port,
            io_timeout: self.timeout,
            current_timeout: self.timeout,
        })
    }
}

pub struct SystemPort {
    port: Box<dyn SerialPort>,
    io_timeout: Duration,
    current_timeout: Duration,
}

impl SystemPort {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if timeout != self.current_timeout {
            self.port.set_timeout(timeout)?;
            self.current_timeout = timeout;
        }
        Ok(())
    }
}

impl SerialStream for SystemPort {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_timeout(timeout)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.set_timeout(self.io_timeout)?;
        self.port.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(self.port.clear(ClearBuffer::Input)?)
    }

    fn clear_output(&mut self) -> io::Result<()> {
        Ok(self.port.clear(ClearBuffer::Output)?)
    }
}

/// A serial port visible to the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// Lists serial ports known to the operating system.
pub fn list_ports() -> io::Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| PortInfo {
            description: describe(&p.port_type),
            name: p.port_name,
        })
        .collect())
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("USB serial");
            format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid)
        }
        SerialPortType::PciPort => "PCI serial".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
        SerialPortType::Unknown => "serial".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_missing_port_fails() {
        let mut opener = SystemPortOpener::new(
            "/dev/uwb-relay-does-not-exist",
            115_200,
            Duration::from_millis(10),
        );
        assert_eq!(opener.name(), "/dev/uwb-relay-does-not-exist");
        assert!(opener.open().is_err());
    }

    #[test]
    fn port_descriptions_are_readable() {
        assert_eq!(describe(&SerialPortType::PciPort), "PCI serial");
        assert_eq!(describe(&SerialPortType::Unknown), "serial");
    }
}
