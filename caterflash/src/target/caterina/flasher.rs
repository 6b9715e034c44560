//! Caterina flasher.
//!
//! Drives one AVR109 programming session over a [`Port`]: identify the
//! bootloader, enter programming mode, set the start address, write every
//! page, leave programming mode and exit to the application.
//!
//! The session is a state machine with exactly one awaited response per
//! transition. Each await polls the port with a short timeout so that a
//! silent device turns into [`Error::ProtocolTimeout`] and a Ctrl-C turns
//! into [`Error::Cancelled`] without blocking forever. A response is complete
//! once it has the expected length, or once the line goes quiet after bytes
//! that cannot start the expected response (such as the `?` AVR109 sends for
//! a rejected command).
//!
//! ## Example
//!
//! ```rust,no_run
//! use caterflash::{CaterinaFlasher, DeviceProfile, MemoryImage, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = DeviceProfile::atmega32u4();
//!     let image = MemoryImage::from_file("blink.hex", profile.flash_size)?;
//!
//!     let mut flasher =
//!         CaterinaFlasher::open("/dev/ttyACM0", profile.baud_rate, SessionConfig::for_profile(&profile))?;
//!     flasher.flash(&image, |percent| println!("{percent}%"))?;
//!
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::MemoryImage;
use crate::image::ihex::ERASED_BYTE;
use crate::port::Port;
use crate::protocol::avr109::{CommandFrame, FlashState, Outcome, SessionPosition};
use crate::target::profile::{DEFAULT_PAGE_SIZE, DeviceProfile, validate_page_size};
use log::{debug, info, trace, warn};
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Session timing and retry parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Flash page size in bytes.
    pub page_size: usize,
    /// Wait after the identity string before entering programming mode.
    pub identity_settle: Duration,
    /// Wait after every command write.
    pub command_settle: Duration,
    /// Wait after an identity request.
    pub request_settle: Duration,
    /// Longest wait for a single response.
    pub read_timeout: Duration,
    /// Port read timeout used while polling for a response.
    pub poll_interval: Duration,
    /// Unexpected responses tolerated per step before giving up.
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            identity_settle: Duration::from_millis(100),
            command_settle: Duration::from_millis(5),
            request_settle: Duration::from_millis(10),
            read_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            max_retries: 3,
        }
    }
}

impl SessionConfig {
    /// Default timings with the page size of `profile`.
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        Self::default().with_page_size(profile.page_size)
    }

    /// Set the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the retry limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set all settle delays at once.
    #[must_use]
    pub fn with_settle(mut self, identity: Duration, command: Duration, request: Duration) -> Self {
        self.identity_settle = identity;
        self.command_settle = command;
        self.request_settle = request;
        self
    }

    /// Set the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Caterina flasher.
///
/// Owns the port for the lifetime of the session. A flasher runs at most one
/// session; the port is closed when it ends, whatever the outcome.
pub struct CaterinaFlasher<P: Port> {
    port: P,
    config: SessionConfig,
    state: FlashState,
    position: SessionPosition,
    retries: u32,
    last_rejected: Option<Vec<u8>>,
    cancel: Option<Arc<AtomicBool>>,
    started: bool,
    closed: bool,
}

impl<P: Port> CaterinaFlasher<P> {
    /// Create a flasher over an open port.
    pub fn new(port: P, config: SessionConfig) -> Self {
        Self {
            port,
            config,
            state: FlashState::AwaitingIdentity,
            position: SessionPosition::default(),
            retries: 0,
            last_rejected: None,
            cancel: None,
            started: false,
            closed: false,
        }
    }

    /// Abort the session once `flag` becomes true.
    ///
    /// The global interrupt checker is always honoured in addition.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the flasher and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Current page cursor.
    pub fn position(&self) -> SessionPosition {
        self.position
    }

    /// Write `image` to the device.
    ///
    /// `progress` receives the completed percentage before each page and a
    /// final 100 once the bootloader has been told to exit.
    pub fn flash<F>(&mut self, image: &MemoryImage, mut progress: F) -> Result<()>
    where
        F: FnMut(u8),
    {
        if self.started {
            return Err(Error::Config(
                "flasher has already run a session".to_string(),
            ));
        }
        self.started = true;

        let result = self.run(image, &mut progress).map_err(|e| self.in_session(e));
        if result.is_err() {
            self.state = FlashState::Terminated(Outcome::Failure);
        }

        let closed = self.close_port();
        match result {
            Ok(()) => closed,
            Err(e) => {
                if let Err(close_err) = closed {
                    warn!("Failed to close {}: {close_err}", self.port.name());
                }
                Err(e)
            },
        }
    }

    fn run(&mut self, image: &MemoryImage, progress: &mut dyn FnMut(u8)) -> Result<()> {
        self.validate(image)?;

        let page_size = self.config.page_size;
        self.position = SessionPosition {
            page_total: image.page_count(page_size),
            ..SessionPosition::default()
        };

        info!(
            "Flashing {} bytes in {} pages of {page_size} bytes on {}",
            image.len(),
            self.position.page_total,
            self.port.name()
        );

        self.port.set_timeout(self.config.poll_interval)?;
        self.port.clear_buffers()?;

        self.transition(FlashState::AwaitingIdentity);
        self.send(&CommandFrame::identify(), self.config.request_settle)?;

        while !self.state.is_terminal() {
            let state = self.state;
            let response = self.await_response()?;

            if !state.accepts(&response) {
                self.reject(state, response)?;
                continue;
            }

            match state {
                FlashState::AwaitingIdentity => {
                    debug!("Bootloader identified as {}", String::from_utf8_lossy(&response));
                    self.settle(self.config.identity_settle)?;
                    self.send(&CommandFrame::enter_programming(), self.config.command_settle)?;
                    self.transition(FlashState::AwaitingModeAck);
                },
                FlashState::AwaitingModeAck => {
                    self.send(
                        &CommandFrame::set_address(self.position.word_address),
                        self.config.command_settle,
                    )?;
                    self.transition(FlashState::AwaitingPageAck);
                },
                FlashState::AwaitingPageAck => {
                    let next = self.write_page(image, progress)?;
                    self.transition(next);
                },
                FlashState::AwaitingFinalPageAck => {
                    self.send(&CommandFrame::leave_programming(), self.config.command_settle)?;
                    self.transition(FlashState::AwaitingLeaveAck);
                },
                FlashState::AwaitingLeaveAck => {
                    self.send(&CommandFrame::exit(), self.config.command_settle)?;
                    progress(100);
                    self.transition(FlashState::Terminated(Outcome::Success));
                },
                FlashState::Terminated(_) => {},
            }
        }

        info!("Flashed {} pages", self.position.pages_sent);
        Ok(())
    }

    fn validate(&self, image: &MemoryImage) -> Result<()> {
        validate_page_size(self.config.page_size)?;
        if image.is_empty() {
            return Err(Error::EmptyImage);
        }
        let last_page = image.page_count(self.config.page_size) - 1;
        word_address(last_page * self.config.page_size, image.len())?;
        Ok(())
    }

    /// Send the next page and return the state that waits for its ack.
    fn write_page(
        &mut self,
        image: &MemoryImage,
        progress: &mut dyn FnMut(u8),
    ) -> Result<FlashState> {
        let page_size = self.config.page_size;
        let offset = self.position.byte_offset;
        let is_final = offset + page_size >= image.len();

        // offset < len: the session leaves this state after the final page
        let end = (offset + page_size).min(image.len());
        let mut page = image.as_bytes()[offset..end].to_vec();
        page.resize(page_size, ERASED_BYTE);

        progress(percent(offset, image.len()));
        self.position.pages_sent += 1;
        debug!(
            "Writing page {}/{} at word address {:#06x}",
            self.position.pages_sent, self.position.page_total, self.position.word_address
        );
        self.send(&CommandFrame::block_write(&page)?, self.config.command_settle)?;

        self.position.byte_offset += page_size;

        if is_final {
            Ok(FlashState::AwaitingFinalPageAck)
        } else {
            self.position.word_address = word_address(self.position.byte_offset, image.len())?;
            Ok(FlashState::AwaitingPageAck)
        }
    }

    /// Count an unexpected response, re-requesting the identity if needed.
    fn reject(&mut self, state: FlashState, response: Vec<u8>) -> Result<()> {
        self.retries += 1;
        if self.retries > self.config.max_retries {
            return Err(Error::ProtocolDesync {
                state,
                expected: state.expected_description(),
                actual: response,
                position: self.position,
            });
        }

        warn!(
            "Unexpected response {response:02X?} in {state}, retry {}/{}",
            self.retries, self.config.max_retries
        );
        self.last_rejected = Some(response);
        if state == FlashState::AwaitingIdentity {
            self.port.clear_buffers()?;
            self.send(&CommandFrame::identify(), self.config.request_settle)?;
        }
        Ok(())
    }

    fn transition(&mut self, next: FlashState) {
        if next != self.state {
            debug!("{} -> {next}", self.state);
        }
        self.state = next;
        self.retries = 0;
        self.last_rejected = None;
    }

    fn send(&mut self, frame: &CommandFrame, settle: Duration) -> Result<()> {
        let data = frame.build();
        trace!("Sending {:02X?}", &data[..data.len().min(8)]);
        self.port.write_all_bytes(&data)?;
        self.settle(settle)
    }

    /// Read the response to the last command.
    ///
    /// Stops at the expected length, or when a poll comes back empty after
    /// bytes that are not a prefix of the expected response.
    fn await_response(&mut self) -> Result<Vec<u8>> {
        let expected = self.state.expected_response();
        let expected_len = expected.len();
        let deadline = Instant::now() + self.config.read_timeout;
        let mut response = Vec::with_capacity(expected_len);
        let mut buf = [0u8; 16];

        while response.len() < expected_len {
            self.check_cancelled()?;
            if Instant::now() >= deadline {
                return Err(self.deadline_error(response));
            }

            let want = (expected_len - response.len()).min(buf.len());
            match self.port.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(Error::TransportClosedEarly {
                        state: self.state,
                        position: self.position,
                    });
                },
                Ok(n) => {
                    trace!("Received {:02X?}", &buf[..n]);
                    response.extend_from_slice(&buf[..n]);
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if !response.is_empty() && !expected.starts_with(&response) {
                        return Ok(response);
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        Ok(response)
    }

    /// Error for a response deadline that passed.
    ///
    /// Silence right after a rejected response, or a truncated response, is
    /// a desync rather than a plain timeout.
    fn deadline_error(&mut self, partial: Vec<u8>) -> Error {
        let actual = if partial.is_empty() {
            self.last_rejected.take()
        } else {
            Some(partial)
        };

        match actual {
            Some(actual) => Error::ProtocolDesync {
                state: self.state,
                expected: self.state.expected_description(),
                actual,
                position: self.position,
            },
            None => Error::ProtocolTimeout {
                state: self.state,
                position: self.position,
            },
        }
    }

    /// Attach the session position to a transport failure.
    fn in_session(&self, err: Error) -> Error {
        let source = match err {
            Error::Io(source) => source,
            #[cfg(feature = "native")]
            Error::Serial(e) => std::io::Error::from(e),
            other => return other,
        };
        Error::Transport {
            state: self.state,
            position: self.position,
            source,
        }
    }

    /// Sleep in poll-sized slices, checking for cancellation in between.
    fn settle(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(self.config.poll_interval));
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        let flagged = self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst));
        if flagged || crate::is_interrupted_requested() {
            return Err(Error::Cancelled {
                state: self.state,
                position: self.position,
            });
        }
        Ok(())
    }

    fn close_port(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing {}", self.port.name());
        self.port.close()
    }
}

/// Word address of image byte `offset`.
fn word_address(offset: usize, len: usize) -> Result<u16> {
    u16::try_from(offset / 2).map_err(|_| Error::ImageTooLarge { len })
}

/// `offset / len` as a rounded percentage.
#[allow(clippy::cast_possible_truncation)]
fn percent(offset: usize, len: usize) -> u8 {
    // offset < len, so the result is at most 100
    ((offset * 100 + len / 2) / len) as u8
}

#[cfg(feature = "native")]
mod native_impl {
    use super::{CaterinaFlasher, Duration, Error, Result, SessionConfig, debug, thread, warn};
    use crate::port::{NativePort, SerialConfig};

    impl CaterinaFlasher<NativePort> {
        /// Open `port_name` and create a flasher over it.
        ///
        /// The bootloader re-enumerates right after a reset, so opening is
        /// retried a few times.
        pub fn open(port_name: &str, baud_rate: u32, config: SessionConfig) -> Result<Self> {
            const MAX_OPEN_PORT_ATTEMPTS: usize = 3;
            const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

            let mut last_error = None;

            for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
                let serial =
                    SerialConfig::new(port_name, baud_rate).with_timeout(config.poll_interval);
                match NativePort::open(&serial) {
                    Ok(port) => {
                        if attempt > 1 {
                            debug!("Port opened on attempt {attempt}");
                        }
                        return Ok(Self::new(port, config));
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                        );
                        last_error = Some(e);

                        if attempt < MAX_OPEN_PORT_ATTEMPTS {
                            thread::sleep(OPEN_RETRY_DELAY);
                        }
                    },
                }
            }

            Err(last_error.unwrap_or(Error::DeviceNotFound))
        }
    }
}
