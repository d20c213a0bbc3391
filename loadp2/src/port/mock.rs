//! Scripted in-memory port for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

/// A fake device: replies are queued up front and handed out in order,
/// everything written is recorded.
///
/// Queued replies model future device output, so `clear_input` does not
/// discard them. An empty chunk makes exactly one read time out.
pub(crate) struct MockPort {
    replies: VecDeque<Vec<u8>>,
    pub written: Vec<u8>,
    pub write_sizes: Vec<usize>,
    pub dtr_history: Vec<bool>,
    pub rts_history: Vec<bool>,
    pub baud_history: Vec<u32>,
    pub clears: usize,
    pub loopback: bool,
    timeout: Duration,
    baud_rate: u32,
    closed: bool,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            written: Vec::new(),
            write_sizes: Vec::new(),
            dtr_history: Vec::new(),
            rts_history: Vec::new(),
            baud_history: Vec::new(),
            clears: 0,
            loopback: false,
            timeout: Duration::from_millis(100),
            baud_rate: 115200,
            closed: false,
        }
    }

    /// Echo every written byte back as input.
    pub fn loopback() -> Self {
        Self {
            loopback: true,
            ..Self::new()
        }
    }

    /// Queue a reply chunk; one read never crosses a chunk boundary.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.replies.push_back(bytes.to_vec());
    }

    /// Make the next read time out.
    pub fn queue_silence(&mut self) {
        self.replies.push_back(Vec::new());
    }

    pub fn pending(&self) -> usize {
        self.replies.iter().map(Vec::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(front) = self.replies.front_mut() else {
            thread::sleep(self.timeout.min(Duration::from_millis(2)));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        };
        if front.is_empty() {
            self.replies.pop_front();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "silence"));
        }
        let n = buf.len().min(front.len());
        buf[..n].copy_from_slice(&front[..n]);
        front.drain(..n);
        if front.is_empty() {
            self.replies.pop_front();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        self.write_sizes.push(buf.len());
        if self.loopback {
            self.replies.push_back(buf.to_vec());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_history.push(baud_rate);
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_input(&mut self) -> Result<()> {
        self.clears += 1;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.dtr_history.push(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.rts_history.push(level);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
