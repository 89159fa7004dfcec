//! Serial transport for the microscope peripherals.
//!
//! Wraps the `serialport` crate behind the small [`SerialLink`] trait so the
//! protocol drivers (IOTool, Spectra X) can be exercised against scripted
//! mock links. [`SmartSerial`] adds the request/response conveniences the
//! devices need: buffered `read_until`, a non-blocking drain of stray bytes,
//! an overall timeout that is independent of the poll interval, and
//! cooperative interruption of otherwise-unbounded reads.
//!
//! Each port is owned by exactly one device struct; callers serialize whole
//! request/response exchanges by holding that device's lock.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ScopeError, ScopeResult};

/// Poll interval for blocking reads. Short enough that cancellation and
/// overall-timeout checks stay responsive.
const POLL: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared between a blocking reader and the
/// code that wants to interrupt it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// New, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of whatever is polling this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once `cancel()` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Clear the flag so the token can be reused for the next operation.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

/// Minimal byte-stream interface over a serial device.
pub trait SerialLink: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever is available, blocking up to the link's poll timeout.
    /// A poll timeout surfaces as `ErrorKind::TimedOut`.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Number of bytes already buffered by the OS for this port.
    fn bytes_to_read(&self) -> io::Result<usize>;
}

/// Opens serial links. The IOTool reset protocol closes and reopens its port
/// around a device re-enumeration, so link creation is itself abstracted.
pub trait LinkFactory: Send + Sync {
    /// Open the port at the given baud rate.
    fn open(&self, port: &str, baud_rate: u32) -> ScopeResult<Box<dyn SerialLink>>;

    /// Whether the device node currently exists.
    fn exists(&self, port: &str) -> bool;
}

/// Production link over the `serialport` crate.
struct SystemLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink for SystemLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn bytes_to_read(&self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::other)
    }
}

/// Factory for real system serial ports.
pub struct SystemLinkFactory;

impl LinkFactory for SystemLinkFactory {
    fn open(&self, port: &str, baud_rate: u32) -> ScopeResult<Box<dyn SerialLink>> {
        let port = serialport::new(port, baud_rate)
            .timeout(POLL)
            .open()
            .map_err(|e| ScopeError::Serial(format!("failed to open '{port}': {e}")))?;
        Ok(Box::new(SystemLink { port }))
    }

    fn exists(&self, port: &str) -> bool {
        std::path::Path::new(port).exists()
    }
}

/// Buffered request/response wrapper over a [`SerialLink`].
pub struct SmartSerial {
    link: Box<dyn SerialLink>,
    read_buffer: Vec<u8>,
    /// Overall deadline for blocking reads. `None` blocks forever (used by
    /// the IOTool wait-for-program-completion path, which is bounded by
    /// higher-level timeouts instead).
    timeout: Option<Duration>,
}

impl SmartSerial {
    /// Wrap a link with the given overall read timeout.
    pub fn new(link: Box<dyn SerialLink>, timeout: Option<Duration>) -> Self {
        Self {
            link,
            read_buffer: Vec::new(),
            timeout,
        }
    }

    /// Change the overall read timeout. `None` means wait indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Write the whole buffer.
    pub fn write(&mut self, data: &[u8]) -> ScopeResult<()> {
        self.link
            .write_all(data)
            .map_err(|e| ScopeError::Serial(format!("write failed: {e}")))
    }

    /// Read until `delim` appears; returns everything up to and including it.
    /// Bytes read past the delimiter stay buffered for the next call. On
    /// cancellation the pending bytes also stay buffered and
    /// [`ScopeError::HardwareAborted`] is returned.
    pub fn read_until(&mut self, delim: u8, cancel: Option<&CancelToken>) -> ScopeResult<Vec<u8>> {
        let start = Instant::now();
        loop {
            if let Some(pos) = self.read_buffer.iter().position(|&b| b == delim) {
                let mut head: Vec<u8> = self.read_buffer.drain(..=pos).collect();
                head.shrink_to_fit();
                return Ok(head);
            }
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return Err(ScopeError::HardwareAborted);
                }
            }
            let mut chunk = [0u8; 256];
            match self.link.read_some(&mut chunk) {
                Ok(0) => {
                    return Err(ScopeError::Serial(
                        "device reports readiness but returned no data (disconnected?)".into(),
                    ));
                }
                Ok(n) => self.read_buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if let Some(timeout) = self.timeout {
                        if start.elapsed() > timeout {
                            return Err(ScopeError::SerialTimeout);
                        }
                    }
                }
                Err(e) => return Err(ScopeError::Serial(format!("read failed: {e}"))),
            }
        }
    }

    /// Read exactly `n` bytes, honoring the overall timeout.
    pub fn read_exact(&mut self, n: usize) -> ScopeResult<Vec<u8>> {
        let start = Instant::now();
        while self.read_buffer.len() < n {
            let mut chunk = [0u8; 256];
            match self.link.read_some(&mut chunk) {
                Ok(0) => {
                    return Err(ScopeError::Serial(
                        "device reports readiness but returned no data (disconnected?)".into(),
                    ));
                }
                Ok(read) => self.read_buffer.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if let Some(timeout) = self.timeout {
                        if start.elapsed() > timeout {
                            return Err(ScopeError::SerialTimeout);
                        }
                    }
                }
                Err(e) => return Err(ScopeError::Serial(format!("read failed: {e}"))),
            }
        }
        Ok(self.read_buffer.drain(..n).collect())
    }

    /// Drain and return every byte currently available, without blocking.
    pub fn read_all_buffered(&mut self) -> ScopeResult<Vec<u8>> {
        let pending = self
            .link
            .bytes_to_read()
            .map_err(|e| ScopeError::Serial(format!("queue query failed: {e}")))?;
        let mut drained = std::mem::take(&mut self.read_buffer);
        if pending > 0 {
            let mut chunk = vec![0u8; pending];
            match self.link.read_some(&mut chunk) {
                Ok(n) => drained.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(ScopeError::Serial(format!("read failed: {e}"))),
            }
        }
        if !drained.is_empty() {
            debug!(bytes = drained.len(), "drained stray serial bytes");
        }
        Ok(drained)
    }
}

/// Scripted in-memory serial links for tests.
pub mod mock {
    use super::*;

    /// Shared state behind a [`MockLink`] and the test that scripts it.
    #[derive(Default)]
    pub struct MockLinkState {
        /// Bytes the link will yield to reads.
        pub rx: VecDeque<u8>,
        /// Every `write_all` payload, in order.
        pub writes: Vec<Vec<u8>>,
        /// Per-write scripted responses; popped front on each write.
        pub responses: VecDeque<Vec<u8>>,
        /// When no scripted response is queued, answer each newline-terminated
        /// write with a bare ready prompt.
        pub auto_prompt: bool,
    }

    impl MockLinkState {
        /// Queue bytes for the device to "send".
        pub fn push_rx(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }

        /// Concatenated writes decoded as UTF-8, for assertions.
        pub fn written_text(&self) -> String {
            let all: Vec<u8> = self.writes.iter().flatten().copied().collect();
            String::from_utf8_lossy(&all).into_owned()
        }
    }

    /// Test double implementing [`SerialLink`] against scripted state.
    #[derive(Clone)]
    pub struct MockLink {
        state: Arc<Mutex<MockLinkState>>,
    }

    impl MockLink {
        /// New link with auto-prompt behavior (every command gets `>`).
        pub fn new() -> Self {
            let state = MockLinkState {
                auto_prompt: true,
                ..MockLinkState::default()
            };
            Self {
                state: Arc::new(Mutex::new(state)),
            }
        }

        /// Handle for scripting and inspection.
        pub fn state(&self) -> Arc<Mutex<MockLinkState>> {
            self.state.clone()
        }
    }

    impl Default for MockLink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SerialLink for MockLink {
        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            let mut state = self.state.lock();
            state.writes.push(data.to_vec());
            if let Some(response) = state.responses.pop_front() {
                state.rx.extend(response);
            } else if state.auto_prompt && data.ends_with(b"\n") {
                state.rx.push_back(b'>');
            }
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.lock();
            if state.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock rx empty"));
            }
            let mut n = 0;
            while n < buf.len() {
                match state.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn bytes_to_read(&self) -> io::Result<usize> {
            Ok(self.state.lock().rx.len())
        }
    }

    /// Outcome of one scripted `open()` call.
    pub enum OpenOutcome {
        /// Hand out this link.
        Link(MockLink),
        /// Fail as if the OS reported the port busy.
        Busy,
    }

    /// Scripted [`LinkFactory`]: pops one outcome per `open()`, then falls
    /// back to fresh auto-prompt links.
    pub struct MockLinkFactory {
        outcomes: Mutex<VecDeque<OpenOutcome>>,
        opened: Mutex<Vec<MockLink>>,
        exists: AtomicBool,
    }

    impl MockLinkFactory {
        /// Factory whose device node always "exists".
        pub fn new() -> Self {
            Self {
                outcomes: Mutex::new(VecDeque::new()),
                opened: Mutex::new(Vec::new()),
                exists: AtomicBool::new(true),
            }
        }

        /// Script the next `open()` outcomes, in order.
        pub fn script_open(&self, outcome: OpenOutcome) {
            self.outcomes.lock().push_back(outcome);
        }

        /// Links handed out so far, oldest first.
        pub fn opened(&self) -> Vec<MockLink> {
            self.opened.lock().clone()
        }

        /// Control whether the device node appears present.
        pub fn set_exists(&self, exists: bool) {
            self.exists.store(exists, Ordering::Relaxed);
        }
    }

    impl Default for MockLinkFactory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl LinkFactory for MockLinkFactory {
        fn open(&self, port: &str, _baud_rate: u32) -> ScopeResult<Box<dyn SerialLink>> {
            match self.outcomes.lock().pop_front() {
                Some(OpenOutcome::Busy) => {
                    Err(ScopeError::Serial(format!("'{port}': device busy")))
                }
                Some(OpenOutcome::Link(link)) => {
                    self.opened.lock().push(link.clone());
                    Ok(Box::new(link))
                }
                None => {
                    let link = MockLink::new();
                    self.opened.lock().push(link.clone());
                    Ok(Box::new(link))
                }
            }
        }

        fn exists(&self, _port: &str) -> bool {
            self.exists.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockLink;
    use super::*;

    #[test]
    fn read_until_keeps_overflow_bytes_buffered() {
        let link = MockLink::new();
        link.state().lock().push_rx(b"hello>world");
        let mut serial = SmartSerial::new(Box::new(link), Some(Duration::from_millis(10)));

        let head = serial.read_until(b'>', None).expect("read");
        assert_eq!(head, b"hello>");
        let rest = serial.read_all_buffered().expect("drain");
        assert_eq!(rest, b"world");
    }

    #[test]
    fn read_until_times_out_when_no_delimiter_arrives() {
        let link = MockLink::new();
        link.state().lock().push_rx(b"partial");
        let mut serial = SmartSerial::new(Box::new(link), Some(Duration::from_millis(1)));
        assert!(matches!(
            serial.read_until(b'>', None),
            Err(ScopeError::SerialTimeout)
        ));
    }

    #[test]
    fn cancellation_interrupts_an_unbounded_read() {
        let link = MockLink::new();
        let mut serial = SmartSerial::new(Box::new(link), None);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            serial.read_until(b'>', Some(&cancel)),
            Err(ScopeError::HardwareAborted)
        ));
    }

    #[test]
    fn drain_is_empty_on_a_quiet_link() {
        let link = MockLink::new();
        let mut serial = SmartSerial::new(Box::new(link), Some(Duration::from_millis(10)));
        assert!(serial.read_all_buffered().expect("drain").is_empty());
    }
}
