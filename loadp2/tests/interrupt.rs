//! Interrupt handling through the global checker.
//!
//! The checker installed here reads a per-thread flag, so each test controls
//! its own interruption without touching tests running beside it.

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use loadp2::target::handshake;
use loadp2::{Block, Error, Interpreter, LoadPlan, LoadStrategy, Port, Session, SessionConfig};

thread_local! {
    static INTERRUPTED: Cell<bool> = const { Cell::new(false) };
}

fn install_checker(interrupted: bool) {
    loadp2::set_interrupt_checker(|| INTERRUPTED.with(Cell::get));
    INTERRUPTED.with(|flag| flag.set(interrupted));
}

/// A line that records writes and never answers. With `interrupt_on_read`
/// set, the first read raises the interrupt flag, as Ctrl-C during a wait.
#[derive(Default)]
struct SilentLine {
    written: Vec<u8>,
    reads: usize,
    interrupt_on_read: bool,
    timeout: Duration,
}

impl Read for SilentLine {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        self.reads += 1;
        if self.interrupt_on_read {
            INTERRUPTED.with(|flag| flag.set(true));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "silent"))
    }
}

impl Write for SilentLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SilentLine {
    fn set_timeout(&mut self, timeout: Duration) -> loadp2::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, _baud_rate: u32) -> loadp2::Result<()> {
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        115_200
    }

    fn clear_input(&mut self) -> loadp2::Result<()> {
        Ok(())
    }

    fn drain(&mut self) -> loadp2::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "silent"
    }

    fn set_dtr(&mut self, _level: bool) -> loadp2::Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> loadp2::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> loadp2::Result<()> {
        Ok(())
    }
}

#[test]
fn load_is_cancelled_before_any_byte() {
    install_checker(true);
    let config = SessionConfig::default().with_strategy(LoadStrategy::Chip);
    let mut session = Session::new(SilentLine::default(), config, Some('G'));
    let plan = LoadPlan {
        stage: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        blocks: vec![Block {
            name: "app".into(),
            address: 0,
            data: vec![1; 16],
        }],
        ..LoadPlan::default()
    };

    let result = session.load(&plan, &mut |_: &str, _: usize, _: usize| {});
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(session.port().written.is_empty());
}

#[test]
fn recv_wait_is_cancelled_instead_of_timing_out() {
    install_checker(false);
    let mut line = SilentLine {
        interrupt_on_read: true,
        ..SilentLine::default()
    };

    let started = Instant::now();
    let result = Interpreter::new().run(&mut line, "recvtimeout(5000) recv(ready)");
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(line.reads, 1);
}

#[test]
fn script_stops_before_next_command() {
    install_checker(true);
    let mut line = SilentLine::default();
    let result = Interpreter::new().run(&mut line, "send[hello]");
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(line.written.is_empty());
}

#[test]
fn handshake_is_cancelled_before_check_command() {
    install_checker(true);
    let mut line = SilentLine::default();
    let config = SessionConfig {
        reset: false,
        ..SessionConfig::default()
    };
    let result = handshake::probe(&mut line, &config, Duration::ZERO, 5);
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(line.written.is_empty());
}
