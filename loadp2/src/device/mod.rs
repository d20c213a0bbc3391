//! Serial port discovery and USB bridge classification.
//!
//! Propeller 2 boards talk through a USB-to-UART bridge (FTDI on the Parallax
//! Prop Plug and the P2 Eval/Edge boards). Discovery lists what the host
//! knows about and, for the automatic sweep, produces the ordered list of
//! candidate port names to probe.

#[cfg(feature = "native")]
use log::{debug, trace};

/// Number of numbered device names tried under a prefix when the host cannot
/// enumerate ports.
pub const NUMBERED_CANDIDATES: u32 = 20;

/// Port name prefix used by the automatic sweep on this host.
#[cfg(windows)]
pub const DEFAULT_PORT_PREFIX: &str = "COM";
/// Port name prefix used by the automatic sweep on this host.
#[cfg(target_os = "macos")]
pub const DEFAULT_PORT_PREFIX: &str = "/dev/cu.usbserial";
/// Port name prefix used by the automatic sweep on this host.
#[cfg(not(any(windows, target_os = "macos")))]
pub const DEFAULT_PORT_PREFIX: &str = "/dev/ttyUSB";

/// Known USB bridge kinds found on Propeller boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// FTDI FT232/FT231X (Prop Plug, P2 Eval, P2 Edge).
    Ftdi,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs for common USB-to-UART bridges.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ftdi => "FTDI",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH341",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Discovered serial endpoint information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }
}

/// Detect all available endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort::bare(port_info.port_name.clone());

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Detect all available endpoints (no native serial support compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Ordered port names for the automatic sweep.
///
/// Enumerated ports under `prefix` come first, known bridges ahead of the
/// rest. When enumeration finds nothing under the prefix, the numbered names
/// `prefix0 .. prefix19` are returned instead.
pub fn candidate_ports(prefix: &str) -> Vec<String> {
    candidates_from(detect_ports(), prefix)
}

fn candidates_from(ports: Vec<DetectedPort>, prefix: &str) -> Vec<String> {
    let lowered = prefix.to_ascii_lowercase();
    let mut matching: Vec<DetectedPort> = ports
        .into_iter()
        .filter(|p| {
            p.name
                .to_ascii_lowercase()
                .starts_with(&lowered)
        })
        .collect();

    if matching.is_empty() {
        return (0..NUMBERED_CANDIDATES)
            .map(|i| format!("{prefix}{i}"))
            .collect();
    }

    // Stable: keeps the host's ordering within each group.
    matching.sort_by_key(|p| !p.device.is_known());
    matching
        .into_iter()
        .map(|p| p.name)
        .collect()
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.device.is_known() {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}
