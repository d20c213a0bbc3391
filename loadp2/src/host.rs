//! Host-side utilities for serial port discovery.

use crate::device::{DEFAULT_PORT_PREFIX, DetectedPort};

/// Discover all available serial ports.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    crate::device::detect_ports()
}

/// Discover serial ports behind a recognised USB bridge.
#[must_use]
pub fn discover_bridge_ports() -> Vec<DetectedPort> {
    discover_ports()
        .into_iter()
        .filter(|p| p.device.is_known())
        .collect()
}

/// Port names the automatic sweep will try, using `prefix` or the host
/// default.
#[must_use]
pub fn sweep_candidates(prefix: Option<&str>) -> Vec<String> {
    crate::device::candidate_ports(prefix.unwrap_or(DEFAULT_PORT_PREFIX))
}
