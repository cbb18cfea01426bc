//! Physical serial port endpoint via tokio-serial.

use std::time::Duration;

use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use super::{FlowCfg, ParityCfg, SerialConfig, StopBitsCfg};
use crate::error::EndpointError;
use crate::link::BoxLink;

/// Open `cfg.port_name` as a physical serial port.
///
/// Mark/space parity is accepted in configs for the wire exchange but the
/// serialport backend cannot drive it, so opening such a port is refused
/// here rather than silently downgraded.
pub fn open(cfg: &SerialConfig) -> Result<BoxLink, EndpointError> {
    let parity = match cfg.line.parity {
        ParityCfg::None => Parity::None,
        ParityCfg::Odd => Parity::Odd,
        ParityCfg::Even => Parity::Even,
        ParityCfg::Mark | ParityCfg::Space => {
            return Err(EndpointError::Io(std::io::Error::other(
                "mark/space parity is not supported by the serial backend",
            )));
        }
    };
    let data_bits = match cfg.line.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };
    let stop_bits = match cfg.line.stop_bits {
        // 1.5 stop bits collapse to 1, same as the wire encoding.
        StopBitsCfg::One | StopBitsCfg::OnePointFive => StopBits::One,
        StopBitsCfg::Two => StopBits::Two,
    };
    let flow_control = match cfg.line.flow {
        FlowCfg::None => FlowControl::None,
        FlowCfg::Software => FlowControl::Software,
        FlowCfg::Hardware | FlowCfg::HardwareDsr => FlowControl::Hardware,
    };

    let builder = tokio_serial::new(&cfg.port_name, cfg.baud)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .timeout(Duration::from_millis(100));

    #[allow(unused_mut)]
    let mut stream = builder
        .open_native_async()
        .map_err(|e| map_serial_error(e, &cfg.port_name))?;

    #[cfg(unix)]
    stream
        .set_exclusive(false)
        .map_err(|e| map_serial_error(e, &cfg.port_name))?;

    Ok(Box::new(stream))
}

fn map_serial_error(err: tokio_serial::Error, name: &str) -> EndpointError {
    use tokio_serial::ErrorKind;
    match err.kind {
        ErrorKind::NoDevice => EndpointError::NotFound(name.to_string()),
        ErrorKind::InvalidInput => EndpointError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            err.description,
        )),
        ErrorKind::Io(kind) => {
            EndpointError::classify(std::io::Error::new(kind, err.description), name)
        }
        ErrorKind::Unknown => EndpointError::Io(std::io::Error::other(err.description)),
    }
}
