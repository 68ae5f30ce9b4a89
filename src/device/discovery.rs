use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

use super::geometry::DeviceVariant;
use crate::error::Result;

/// A supported controller found on a serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub port: String,
    pub variant: DeviceVariant,
    pub serial_number: Option<String>,
    pub product: Option<String>,
}

/// List serial ports whose USB id belongs to a supported controller
pub fn discover() -> Result<Vec<DiscoveredDevice>> {
    let ports = serialport::available_ports()?;
    debug!("Found {} serial ports", ports.len());
    Ok(ports.into_iter().filter_map(identify).collect())
}

fn identify(info: SerialPortInfo) -> Option<DiscoveredDevice> {
    let SerialPortType::UsbPort(usb) = info.port_type else {
        return None;
    };
    let variant = DeviceVariant::from_usb_id(usb.vid, usb.pid)?;
    debug!("{} is a {}", info.port_name, variant);

    Some(DiscoveredDevice {
        port: info.port_name,
        variant,
        serial_number: usb.serial_number,
        product: usb.product,
    })
}
