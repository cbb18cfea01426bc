//! Serial endpoint abstraction.
//!
//! One factory, several concrete endpoints, all reduced to [`BoxLink`]:
//!
//! ```text
//! open_endpoint(&SerialConfig)
//!     ├── physical port      (tokio-serial)            any platform
//!     ├── named pipe         (\\.\pipe\<name>)         windows, --namedpipe
//!     └── pseudo-terminal    (PTY master + ./COMn)     unix, COM* names
//! ```
//!
//! The client role uses [`console`] instead (keyboard in, stdout out), which
//! plugs into the same pump because it is just another [`BoxLink`].

pub mod console;
#[cfg(windows)]
pub mod pipe;
pub mod port;
#[cfg(unix)]
pub mod pty;

use std::fmt;
use std::str::FromStr;

use crate::error::EndpointError;
use crate::link::BoxLink;

/// Baud rates accepted for physical ports.
pub const STANDARD_BAUDS: &[u32] = &[
    300, 600, 1200, 2400, 4800, 9600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800, 921_600,
];

/// Parity setting, wire characters `N`/`O`/`E`/`M`/`S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParityCfg {
    /// No parity bit.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Mark parity (exchanged on the wire; not every backend can drive it).
    Mark,
    /// Space parity (exchanged on the wire; not every backend can drive it).
    Space,
}

/// Stop bits, wire characters `1`/`2` (`1.5` accepted locally, encoded as `1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBitsCfg {
    /// One stop bit.
    One,
    /// One and a half stop bits.
    OnePointFive,
    /// Two stop bits.
    Two,
}

/// Flow control, wire characters `N`/`X`/`H`/`R`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCfg {
    /// No flow control.
    None,
    /// Software flow control (XON/XOFF).
    Software,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Hardware flow control, DSR/DTR variant (driven as RTS/CTS by the
    /// serialport backend).
    HardwareDsr,
}

/// Compact four-character line format, e.g. `8N1N`:
/// data bits, parity, stop bits, flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineFormat {
    /// Data bits, 5–8.
    pub data_bits: u8,
    /// Parity.
    pub parity: ParityCfg,
    /// Stop bits.
    pub stop_bits: StopBitsCfg,
    /// Flow control.
    pub flow: FlowCfg,
}

impl Default for LineFormat {
    fn default() -> Self {
        Self {
            data_bits: 8,
            parity: ParityCfg::None,
            stop_bits: StopBitsCfg::One,
            flow: FlowCfg::None,
        }
    }
}

impl FromStr for LineFormat {
    type Err = String;

    /// Accepts `8N1N` and the long stop-bits form `8N1.5N`, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let bytes = upper.as_bytes();
        if bytes.len() != 4 && bytes.len() != 6 {
            return Err(format!("line format must look like 8N1N, got {s:?}"));
        }
        let data_bits = match bytes[0] {
            b @ b'5'..=b'8' => b - b'0',
            other => return Err(format!("data bits must be 5-8, got {:?}", other as char)),
        };
        let parity = match bytes[1] {
            b'N' => ParityCfg::None,
            b'O' => ParityCfg::Odd,
            b'E' => ParityCfg::Even,
            b'M' => ParityCfg::Mark,
            b'S' => ParityCfg::Space,
            other => return Err(format!("parity must be N/O/E/M/S, got {:?}", other as char)),
        };
        let (stop_bits, flow_at) = if bytes.len() == 6 {
            if &upper[2..5] != "1.5" {
                return Err(format!("stop bits must be 1, 1.5 or 2, got {:?}", &s[2..5]));
            }
            (StopBitsCfg::OnePointFive, 5)
        } else {
            let stop = match bytes[2] {
                b'1' => StopBitsCfg::One,
                b'2' => StopBitsCfg::Two,
                other => return Err(format!("stop bits must be 1, 1.5 or 2, got {:?}", other as char)),
            };
            (stop, 3)
        };
        let flow = match bytes[flow_at] {
            b'N' => FlowCfg::None,
            b'X' => FlowCfg::Software,
            b'H' => FlowCfg::Hardware,
            b'R' => FlowCfg::HardwareDsr,
            other => return Err(format!("flow must be N/X/H/R, got {:?}", other as char)),
        };
        Ok(Self { data_bits, parity, stop_bits, flow })
    }
}

impl fmt::Display for LineFormat {
    /// Always renders the compact four-character wire form; `1.5` stop bits
    /// encode as `1`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            ParityCfg::None => 'N',
            ParityCfg::Odd => 'O',
            ParityCfg::Even => 'E',
            ParityCfg::Mark => 'M',
            ParityCfg::Space => 'S',
        };
        let stop = match self.stop_bits {
            StopBitsCfg::One | StopBitsCfg::OnePointFive => '1',
            StopBitsCfg::Two => '2',
        };
        let flow = match self.flow {
            FlowCfg::None => 'N',
            FlowCfg::Software => 'X',
            FlowCfg::Hardware => 'H',
            FlowCfg::HardwareDsr => 'R',
        };
        write!(f, "{}{}{}{}", self.data_bits, parity, stop, flow)
    }
}

/// Full local serial endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name: device path, `COMn`, or a bare pipe name with
    /// [`SerialConfig::named_pipe`] set.
    pub port_name: String,
    /// Baud rate.
    pub baud: u32,
    /// Line format.
    pub line: LineFormat,
    /// Treat `port_name` as a named pipe instead of a device.
    pub named_pipe: bool,
}

impl SerialConfig {
    /// Build a config, validating the baud rate against [`STANDARD_BAUDS`].
    pub fn new(port_name: impl Into<String>, baud: u32, line: LineFormat) -> Result<Self, String> {
        if !STANDARD_BAUDS.contains(&baud) {
            return Err(format!("non-standard baud rate {baud}"));
        }
        Ok(Self { port_name: port_name.into(), baud, line, named_pipe: false })
    }

    /// Build a named-pipe config (line parameters kept for the wire exchange).
    pub fn pipe(name: impl Into<String>, line: LineFormat) -> Self {
        Self { port_name: name.into(), baud: 9600, line, named_pipe: true }
    }
}

impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.port_name, self.baud, self.line)
    }
}

/// Enumerate serial ports visible to the OS, as `(name, description)`.
pub fn list_ports() -> Result<Vec<(String, String)>, EndpointError> {
    use tokio_serial::SerialPortType;

    let ports = tokio_serial::available_ports()
        .map_err(|e| EndpointError::Io(std::io::Error::other(e.description)))?;
    Ok(ports
        .into_iter()
        .map(|info| {
            let kind = match info.port_type {
                SerialPortType::UsbPort(usb) => {
                    let product = usb.product.unwrap_or_else(|| "USB serial".to_string());
                    format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid)
                }
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::Unknown => "unknown".to_string(),
            };
            (info.port_name, kind)
        })
        .collect())
}

/// Open the local serial endpoint described by `cfg`.
///
/// Dispatch order: named pipe if requested, PTY for `COM*` names on unix,
/// physical port otherwise. The returned link is ready for the pump.
pub async fn open_endpoint(cfg: &SerialConfig) -> Result<BoxLink, EndpointError> {
    if cfg.named_pipe {
        #[cfg(windows)]
        {
            return pipe::open_owned(&cfg.port_name).await;
        }
        #[cfg(not(windows))]
        {
            return Err(EndpointError::Io(std::io::Error::other(
                "named pipes are only available on Windows; use a COM* name for a PTY",
            )));
        }
    }

    #[cfg(unix)]
    if cfg.port_name.to_ascii_uppercase().starts_with("COM") {
        let endpoint = pty::PtyEndpoint::create(&cfg.port_name)?;
        return Ok(Box::new(endpoint));
    }

    port::open(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format_round_trip() {
        for text in ["8N1N", "7E2X", "5O1H", "6M2R", "8S1N"] {
            let parsed: LineFormat = text.parse().unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn test_line_format_case_insensitive() {
        let parsed: LineFormat = "8n1x".parse().unwrap();
        assert_eq!(parsed.to_string(), "8N1X");
    }

    #[test]
    fn test_one_point_five_stop_bits_encode_as_one() {
        let parsed: LineFormat = "8N1.5N".parse().unwrap();
        assert_eq!(parsed.stop_bits, StopBitsCfg::OnePointFive);
        assert_eq!(parsed.to_string(), "8N1N");
    }

    #[test]
    fn test_line_format_rejects_garbage() {
        assert!("9N1N".parse::<LineFormat>().is_err());
        assert!("8Q1N".parse::<LineFormat>().is_err());
        assert!("8N3N".parse::<LineFormat>().is_err());
        assert!("8N1Z".parse::<LineFormat>().is_err());
        assert!("8N1".parse::<LineFormat>().is_err());
        assert!("".parse::<LineFormat>().is_err());
    }

    #[test]
    fn test_serial_config_rejects_odd_baud() {
        assert!(SerialConfig::new("/dev/ttyUSB0", 9601, LineFormat::default()).is_err());
        assert!(SerialConfig::new("/dev/ttyUSB0", 9600, LineFormat::default()).is_ok());
    }
}
