//! Target discovery and version handshake.
//!
//! Per candidate port:
//!
//! ```text
//! Closed --open--> Reset-Issued --settle--> Probing --banner--> Ready
//!   ^                                          |
//!   |                                    no banner, retries left: probe again
//!   +----------- retries exhausted: close, next candidate --------+
//! ```
//!
//! The sweep walks every candidate at the shortest settle delay before
//! trying the longer one, since most boards come up quickly.

use std::thread;
use std::time::Duration;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::{CHECK_COMMAND, VERSION_BANNER};
use crate::target::SessionConfig;

/// Most bytes read back from a probe.
const RESPONSE_LIMIT: usize = 100;

/// Per-read timeout while collecting the probe response.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(10);

/// How hard to try each candidate.
#[derive(Debug, Clone)]
pub struct ProbePlan {
    /// Post-reset settle delays, tried in order.
    pub settle_delays: Vec<Duration>,
    /// Probe attempts per candidate and delay.
    pub attempts: usize,
}

impl ProbePlan {
    /// Automatic sweep across many ports.
    pub fn sweep() -> Self {
        Self {
            settle_delays: vec![Duration::from_millis(50), Duration::from_millis(900)],
            attempts: 2,
        }
    }

    /// A single port named by the user; no fallback, so try harder.
    pub fn explicit() -> Self {
        Self {
            settle_delays: vec![Duration::from_millis(50), Duration::from_millis(500)],
            attempts: 5,
        }
    }
}

/// A port that answered with a version banner.
#[derive(Debug)]
pub struct Discovered<P> {
    /// The open port.
    pub port: P,
    /// Port name.
    pub name: String,
    /// Version character from the banner.
    pub version: char,
}

/// Extract the version character from a probe response.
pub fn parse_banner(response: &[u8]) -> Option<char> {
    let start = response
        .windows(VERSION_BANNER.len())
        .position(|w| w == VERSION_BANNER)?;
    response
        .get(start + VERSION_BANNER.len())
        .map(|&b| char::from(b))
}

/// Reset (if enabled), wait `settle`, then probe up to `attempts` times.
///
/// Returns the version character, or `None` when the port stayed silent.
pub fn probe<P: Port>(
    port: &mut P,
    config: &SessionConfig,
    settle: Duration,
    attempts: usize,
) -> Result<Option<char>> {
    if config.reset {
        port.pulse_reset(config.reset_line)?;
        thread::sleep(settle);
    }

    for attempt in 1..=attempts {
        if crate::is_interrupted_requested() {
            return Err(Error::Cancelled);
        }
        port.clear_input()?;
        port.send(CHECK_COMMAND)?;
        thread::sleep(config.probe_wait());

        let response = read_response(port)?;
        if let Some(version) = parse_banner(&response) {
            return Ok(Some(version));
        }
        trace!(
            "Probe {attempt}/{attempts} on {}: {:?}",
            port.name(),
            String::from_utf8_lossy(&response)
        );
    }
    Ok(None)
}

fn read_response<P: Port>(port: &mut P) -> Result<Vec<u8>> {
    let mut response = Vec::with_capacity(RESPONSE_LIMIT);
    let mut chunk = [0u8; RESPONSE_LIMIT];
    while response.len() < RESPONSE_LIMIT {
        let room = RESPONSE_LIMIT - response.len();
        let n = port.receive_timeout(&mut chunk[..room], RESPONSE_TIMEOUT)?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
        if parse_banner(&response).is_some() {
            break;
        }
    }
    Ok(response)
}

/// Handshake with one named port.
pub fn connect_port<P, F>(
    name: &str,
    config: &SessionConfig,
    plan: &ProbePlan,
    mut open: F,
) -> Result<Discovered<P>>
where
    P: Port,
    F: FnMut(&str, u32) -> Result<P>,
{
    for &settle in &plan.settle_delays {
        debug!(
            "Trying {name} with a settle delay of {} ms",
            settle.as_millis()
        );
        let mut port = open(name, config.loader_baud)?;
        if let Some(version) = probe(&mut port, config, settle, plan.attempts)? {
            info!("P2 version {version} found on {name}");
            return Ok(Discovered {
                port,
                name: name.to_string(),
                version,
            });
        }
        port.close()?;
    }
    Err(Error::HandshakeFailed(format!("no P2 answered on {name}")))
}

/// Sweep `candidates`, returning the first port that answers.
///
/// Ports that fail to open or error while probing are skipped.
pub fn discover<P, F>(
    candidates: &[String],
    config: &SessionConfig,
    plan: &ProbePlan,
    mut open: F,
) -> Result<Discovered<P>>
where
    P: Port,
    F: FnMut(&str, u32) -> Result<P>,
{
    info!("Searching serial ports for a P2");
    for &settle in &plan.settle_delays {
        for name in candidates {
            let mut port = match open(name, config.loader_baud) {
                Ok(port) => port,
                Err(e) => {
                    trace!("Skipping {name}: {e}");
                    continue;
                },
            };
            debug!(
                "Trying {name} with a settle delay of {} ms",
                settle.as_millis()
            );
            match probe(&mut port, config, settle, plan.attempts) {
                Ok(Some(version)) => {
                    info!("P2 version {version} found on {name}");
                    return Ok(Discovered {
                        port,
                        name: name.clone(),
                        version,
                    });
                },
                Ok(None) => {},
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => debug!("Probe on {name} failed: {e}"),
            }
            let _ = port.close();
        }
    }
    Err(Error::DeviceNotFound)
}

/// Find or connect to a target on the host's serial ports.
#[cfg(feature = "native")]
pub fn open_native(
    port: Option<&str>,
    prefix: Option<&str>,
    config: &SessionConfig,
) -> Result<Discovered<crate::port::NativePort>> {
    use crate::port::{NativePort, SerialConfig};

    let opener = |name: &str, baud: u32| NativePort::open(&SerialConfig::new(name, baud));
    match port {
        Some(name) => connect_port(name, config, &ProbePlan::explicit(), opener),
        None => {
            let candidates = crate::host::sweep_candidates(prefix);
            discover(&candidates, config, &ProbePlan::sweep(), opener)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::ResetLine;
    use crate::port::mock::MockPort;

    fn quick_plan(attempts: usize) -> ProbePlan {
        ProbePlan {
            settle_delays: vec![Duration::from_millis(1), Duration::from_millis(2)],
            attempts,
        }
    }

    #[test]
    fn test_parse_banner() {
        assert_eq!(parse_banner(b"\r\nProp_Ver G\r\n"), Some('G'));
        assert_eq!(parse_banner(b"junk\r\nProp_Ver A"), Some('A'));
        assert_eq!(parse_banner(b"\r\nProp_Ver "), None);
        assert_eq!(parse_banner(b"Prop_Ver G"), None);
    }

    #[test]
    fn test_probe_resets_then_sends_check() {
        let mut port = MockPort::new();
        port.queue(b"\r\nProp_Ver G\r\n");
        let version = probe(&mut port, &SessionConfig::default(), Duration::ZERO, 1).unwrap();
        assert_eq!(version, Some('G'));
        assert_eq!(port.dtr_history, vec![true, false, true]);
        assert_eq!(port.written, CHECK_COMMAND);
    }

    #[test]
    fn test_probe_uses_configured_reset_line() {
        let mut port = MockPort::new();
        port.queue(b"\r\nProp_Ver A");
        let config = SessionConfig {
            reset_line: ResetLine::Rts,
            ..SessionConfig::default()
        };
        probe(&mut port, &config, Duration::ZERO, 1).unwrap();
        assert_eq!(port.rts_history, vec![true, false, true]);
        assert!(port.dtr_history.is_empty());
    }

    #[test]
    fn test_probe_retries_until_banner() {
        let mut port = MockPort::new();
        port.queue(b"garbage");
        port.queue_silence();
        port.queue(b"\r\nProp_Ver B\r\n");
        let config = SessionConfig {
            reset: false,
            ..SessionConfig::default()
        };
        let version = probe(&mut port, &config, Duration::ZERO, 3).unwrap();
        assert_eq!(version, Some('B'));
        assert_eq!(port.written.len(), CHECK_COMMAND.len() * 2);
    }

    #[test]
    fn test_probe_gives_up_after_attempts() {
        let mut port = MockPort::new();
        let config = SessionConfig {
            reset: false,
            ..SessionConfig::default()
        };
        assert_eq!(probe(&mut port, &config, Duration::ZERO, 2).unwrap(), None);
        assert_eq!(port.written.len(), CHECK_COMMAND.len() * 2);
        // Input is flushed before every check command.
        assert_eq!(port.clears, 2);
    }

    #[test]
    fn test_discover_skips_unopenable_and_silent_ports() {
        let candidates: Vec<String> = ["/dev/a", "/dev/b", "/dev/c"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let mut opened = Vec::new();
        let found = discover(
            &candidates,
            &SessionConfig::default(),
            &quick_plan(1),
            |name: &str, _baud| {
                opened.push(name.to_string());
                match name {
                    "/dev/a" => Err(Error::DeviceNotFound),
                    "/dev/b" => Ok(MockPort::new()),
                    _ => {
                        let mut port = MockPort::new();
                        port.queue(b"\r\nProp_Ver G\r\n");
                        Ok(port)
                    },
                }
            },
        )
        .unwrap();
        assert_eq!(found.name, "/dev/c");
        assert_eq!(found.version, 'G');
        assert!(!found.port.is_closed());
        assert_eq!(found.port.clears, 1);
        assert_eq!(opened, vec!["/dev/a", "/dev/b", "/dev/c"]);
    }

    #[test]
    fn test_discover_reports_not_found() {
        let candidates = vec!["/dev/x".to_string()];
        let result = discover(
            &candidates,
            &SessionConfig::default(),
            &quick_plan(1),
            |_: &str, _| Ok(MockPort::new()),
        );
        assert!(matches!(result, Err(Error::DeviceNotFound)));
    }

    #[test]
    fn test_connect_port_tries_each_settle_delay() {
        let mut opens = 0;
        let found = connect_port(
            "/dev/p2",
            &SessionConfig::default(),
            &quick_plan(1),
            |_: &str, baud| {
                opens += 1;
                assert_eq!(baud, crate::target::DEFAULT_LOADER_BAUD);
                let mut port = MockPort::new();
                if opens == 2 {
                    port.queue(b"\r\nProp_Ver A\r\n");
                }
                Ok(port)
            },
        )
        .unwrap();
        assert_eq!(found.version, 'A');
        assert_eq!(opens, 2);
    }

    #[test]
    fn test_connect_port_fails_with_handshake_error() {
        let result = connect_port(
            "/dev/p2",
            &SessionConfig::default(),
            &quick_plan(1),
            |_: &str, _| Ok(MockPort::new()),
        );
        assert!(matches!(result, Err(Error::HandshakeFailed(_))));
    }

    #[test]
    fn test_explicit_port_is_tried_harder_than_sweep() {
        let explicit = ProbePlan::explicit();
        let sweep = ProbePlan::sweep();
        assert!(explicit.attempts > sweep.attempts);
        assert!(!explicit.settle_delays.is_empty());
        assert!(!sweep.settle_delays.is_empty());
    }
}
