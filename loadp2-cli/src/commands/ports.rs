//! `list-ports` command.

use console::style;
use loadp2::{DetectedPort, discover_ports};

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) {
    let detected = discover_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        let output = serde_json::json!({
            "ok": true,
            "data": { "ports": ports }
        });
        println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
        return;
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }
    for (port, line) in detected
        .iter()
        .zip(loadp2::device::format_port_list(&detected))
    {
        if port.device.is_known() {
            eprintln!("  {} {}", style("•").green(), line);
        } else {
            eprintln!("  {} {}", style("•").dim(), line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadp2::DeviceKind;

    #[test]
    fn test_port_json_fields() {
        let port = DetectedPort {
            name: "/dev/ttyUSB0".into(),
            device: DeviceKind::Ftdi,
            vid: Some(0x0403),
            pid: Some(0x6015),
            manufacturer: Some("FTDI".into()),
            product: Some("Prop Plug".into()),
            serial: None,
        };
        let value = port_json(&port);
        assert_eq!(value["name"], "/dev/ttyUSB0");
        assert_eq!(value["known"], true);
        assert_eq!(value["vid"], 0x0403);
        assert!(value["serial"].is_null());
    }
}
