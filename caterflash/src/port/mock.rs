//! Scripted in-memory port for driving sessions in tests.

use crate::error::Result;
use crate::port::Port;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

/// One scripted read result.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Bytes handed out over one or more reads.
    Data(Vec<u8>),
    /// End of stream; every later read also returns `Ok(0)`.
    Eof,
}

/// Port that replays scripted replies and records everything written.
///
/// Once the script runs dry, reads time out after the port timeout.
pub(crate) struct MockPort {
    replies: VecDeque<Reply>,
    pub written: Vec<u8>,
    pub close_count: usize,
    pub clear_count: usize,
    timeout: Duration,
    write_budget: Option<usize>,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            written: Vec::new(),
            close_count: 0,
            clear_count: 0,
            timeout: Duration::from_millis(1),
            write_budget: None,
        }
    }

    /// Queue bytes to be read.
    #[must_use]
    pub fn reply(mut self, data: &[u8]) -> Self {
        self.replies.push_back(Reply::Data(data.to_vec()));
        self
    }

    /// Queue `count` acknowledges.
    #[must_use]
    pub fn acks(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.replies.push_back(Reply::Data(vec![0x0D]));
        }
        self
    }

    /// Queue an end of stream.
    #[must_use]
    pub fn eof(mut self) -> Self {
        self.replies.push_back(Reply::Eof);
        self
    }

    /// Accept `count` writes, then fail every later one with `BrokenPipe`.
    #[must_use]
    pub fn fail_writes_after(mut self, count: usize) -> Self {
        self.write_budget = Some(count);
        self
    }

    /// A device that answers every command of a clean session of `pages` pages.
    pub fn caterina(pages: usize) -> Self {
        // P, A, every page, L
        Self::new().reply(b"CATERIN").acks(pages + 3)
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.replies.pop_front() {
            Some(Reply::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.replies.push_front(Reply::Data(data.split_off(n)));
                }
                Ok(n)
            },
            Some(Reply::Eof) => {
                self.replies.push_front(Reply::Eof);
                Ok(0)
            },
            None => {
                thread::sleep(self.timeout);
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            },
        }
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.write_budget {
            Some(0) => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
            Some(ref mut left) => *left -= 1,
            None => {},
        }
        self.written.extend_from_slice(buf);
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

    fn clear_buffers(&mut self) -> Result<()> {
        self.clear_count += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        self.close_count += 1;
        Ok(())
    }
}
