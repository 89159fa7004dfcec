//! IOTool microcontroller interface.
//!
//! The IOTool box runs a restricted byte-code interpreter used to drive and
//! time TTL/PWM signals to the microscope hardware. The controller here
//! stores and runs programs over a serial link, and implements the device's
//! reset dance: the firmware re-enumerates its USB serial node on reset, so
//! the port has to be closed, polled for re-appearance, and reopened.
//!
//! ## Protocol
//!
//! Commands are newline-terminated ASCII; the device answers with any output
//! followed by the ready prompt `>`. A stored program is bracketed by
//! `program` / `end` and launched with `run N`; `!` aborts whatever is
//! executing. Leftover bytes in the receive buffer outside a command
//! exchange mean the previous exchange desynchronized, which is treated as
//! fatal for the current call.

pub mod commands;

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::IoToolConfig;
use crate::error::{ScopeError, ScopeResult};
use crate::serial::{CancelToken, LinkFactory, SmartSerial};

/// Prefix disabling command echo, sent once after every reset.
const ECHO_OFF: &[u8] = &[0x80, 0xFF];

/// The firmware's ready prompt.
const READY_PROMPT: u8 = b'>';

/// Delay for the device to reboot after a reset command.
const REBOOT_DELAY: Duration = Duration::from_millis(500);

/// How long to wait for the serial node to re-appear after re-enumeration.
const REAPPEAR_DEADLINE: Duration = Duration::from_secs(5);

/// Back-off schedule for reopening a port the OS still reports busy.
const REOPEN_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(1),
];

/// Timeout used while the link is being brought up; once the device is in a
/// known-good state the port switches to unbounded reads so waiting on a
/// long-running program cannot itself time out.
const INIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Stand-in link used while the real port is closed during a reset.
struct ClosedLink;

impl crate::serial::SerialLink for ClosedLink {
    fn write_all(&mut self, _data: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "port closed for reset",
        ))
    }

    fn read_some(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "port closed for reset",
        ))
    }

    fn bytes_to_read(&self) -> std::io::Result<usize> {
        Ok(0)
    }
}

/// Controller for the IOTool box.
pub struct IoTool {
    config: IoToolConfig,
    factory: Box<dyn LinkFactory>,
    serial: SmartSerial,
    cancel: CancelToken,
}

impl IoTool {
    /// Open the configured port and reset the device into a known-good
    /// state. Fails with [`ScopeError::IoToolUnresponsive`] if the device
    /// does not come back from reset.
    pub fn new(config: IoToolConfig, factory: Box<dyn LinkFactory>) -> ScopeResult<Self> {
        let link = factory.open(&config.serial_port, config.baud_rate)?;
        let serial = SmartSerial::new(link, Some(INIT_TIMEOUT));
        let mut iotool = Self {
            config,
            factory,
            serial,
            cancel: CancelToken::new(),
        };
        iotool.reset()?;
        Ok(iotool)
    }

    /// Token that interrupts a blocking [`IoTool::wait_until_done`]. Cancelling
    /// aborts the running program on the device before the wait returns.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Reset the device to a known-good state.
    ///
    /// Sends an abort plus `reset`, closes the port (the device re-enumerates),
    /// waits for the node to re-appear, reopens it with back-off on busy
    /// errors, disables command echo, and verifies the acknowledgement.
    pub fn reset(&mut self) -> ScopeResult<()> {
        info!(port = %self.config.serial_port, "resetting IOTool");
        self.serial.set_timeout(Some(INIT_TIMEOUT));
        self.serial.write(b"!\nreset\n")?;

        // Close the stale link; the node is about to disappear while the
        // device re-enumerates.
        self.serial = SmartSerial::new(Box::new(ClosedLink), Some(INIT_TIMEOUT));
        thread::sleep(REBOOT_DELAY);

        let wait_start = Instant::now();
        while !self.factory.exists(&self.config.serial_port) {
            if wait_start.elapsed() > REAPPEAR_DEADLINE {
                return Err(ScopeError::IoToolUnresponsive(
                    "device did not re-enumerate after reset".into(),
                ));
            }
            thread::sleep(Duration::from_millis(100));
        }

        let mut link = None;
        let mut last_err = None;
        for backoff in REOPEN_BACKOFF {
            match self.factory.open(&self.config.serial_port, self.config.baud_rate) {
                Ok(l) => {
                    link = Some(l);
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "IOTool port not ready, retrying");
                    last_err = Some(e);
                    thread::sleep(backoff);
                }
            }
        }
        let link = match link {
            Some(link) => link,
            None => {
                let detail = last_err.map_or_else(String::new, |e| e.to_string());
                return Err(ScopeError::IoToolUnresponsive(format!(
                    "could not reopen device after reset: {detail}"
                )));
            }
        };
        self.serial = SmartSerial::new(link, Some(INIT_TIMEOUT));

        let mut echo_off = ECHO_OFF.to_vec();
        echo_off.push(b'\n');
        self.serial.write(&echo_off)?;
        let reply = match self.serial.read_until(READY_PROMPT, None) {
            Ok(reply) => reply,
            Err(ScopeError::SerialTimeout) => {
                return Err(ScopeError::IoToolUnresponsive(
                    "no acknowledgement after reset".into(),
                ))
            }
            Err(e) => return Err(e),
        };
        // One echo of the echo-off bytes comes back; nothing echoes after.
        let mut expected = ECHO_OFF.to_vec();
        expected.extend_from_slice(b"\r\n>");
        if reply != expected {
            return Err(ScopeError::IoToolUnresponsive(format!(
                "unexpected acknowledgement after reset: {reply:02x?}"
            )));
        }
        self.assert_empty_buffer()?;
        // Known-good state reached: switch to unbounded reads so waiting for
        // program completion cannot itself time out.
        self.serial.set_timeout(None);
        Ok(())
    }

    /// Run a series of commands immediately, returning each command's output
    /// (`None` when a command produced nothing but the prompt).
    pub fn execute(&mut self, commands: &[String]) -> ScopeResult<Vec<Option<String>>> {
        self.assert_empty_buffer()?;
        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            let mut line = command.clone().into_bytes();
            line.push(b'\n');
            self.serial.write(&line)?;
            let response = self.wait_until_done()?;
            responses.push(if response.is_empty() { None } else { Some(response) });
        }
        self.assert_empty_buffer()?;
        Ok(responses)
    }

    /// Verify there is no IOTool output that should have been read
    /// previously; leftovers mean the last exchange desynchronized.
    fn assert_empty_buffer(&mut self) -> ScopeResult<()> {
        let buffered = self.serial.read_all_buffered()?;
        if !buffered.is_empty() {
            return Err(ScopeError::UnexpectedOutput(
                String::from_utf8_lossy(&buffered).into_owned(),
            ));
        }
        Ok(())
    }

    /// Store a program on the device without running it. Any output from any
    /// program line is a compile-time rejection and fails the whole store.
    pub fn store_program(&mut self, program: &[String]) -> ScopeResult<()> {
        let mut all = Vec::with_capacity(program.len() + 2);
        all.push("program".to_string());
        all.extend_from_slice(program);
        all.push("end".to_string());
        let responses = self.execute(&all)?;
        let errors: Vec<String> = all
            .iter()
            .zip(&responses)
            .filter_map(|(command, response)| {
                response
                    .as_ref()
                    .map(|response| format!("{command}: {response}"))
            })
            .collect();
        if !errors.is_empty() {
            return Err(ScopeError::Program(errors));
        }
        debug!(lines = program.len(), "stored IOTool program");
        Ok(())
    }

    /// Start the previously stored program for `iters` iterations. The
    /// program runs asynchronously; [`IoTool::wait_until_done`] must be called
    /// afterwards.
    pub fn start_program(&mut self, iters: u32) -> ScopeResult<()> {
        self.assert_empty_buffer()?;
        self.serial.write(format!("run {iters}\n").as_bytes())?;
        Ok(())
    }

    /// Store `program` and immediately start it.
    pub fn store_and_start(&mut self, program: &[String], iters: u32) -> ScopeResult<()> {
        self.store_program(program)?;
        self.start_program(iters)
    }

    /// Block until the running command or program reaches its ready prompt
    /// and return any serial output it produced. Cancellation through the
    /// [`IoTool::cancel_token`] force-terminates the program on the device and
    /// then surfaces [`ScopeError::HardwareAborted`].
    pub fn wait_until_done(&mut self) -> ScopeResult<String> {
        match self.serial.read_until(READY_PROMPT, Some(&self.cancel)) {
            Ok(mut reply) => {
                reply.pop(); // strip the prompt
                Ok(String::from_utf8_lossy(&reply).into_owned())
            }
            Err(ScopeError::HardwareAborted) => {
                warn!("IOTool wait interrupted; aborting running program");
                self.stop()?;
                Err(ScopeError::HardwareAborted)
            }
            Err(e) => Err(e),
        }
    }

    /// Force-terminate a running program or command and confirm the device
    /// settled back at its prompt.
    ///
    /// If a command was mid-execution the `!` and the newline each produce a
    /// prompt; if nothing was running the out-of-place `!` produces an error
    /// and then a prompt. Both are acceptable; anything else left in the
    /// buffer afterwards is a desync.
    pub fn stop(&mut self) -> ScopeResult<()> {
        self.serial.set_timeout(Some(INIT_TIMEOUT));
        let result = self.stop_inner();
        self.serial.set_timeout(None);
        result
    }

    fn stop_inner(&mut self) -> ScopeResult<()> {
        self.serial.write(b"!\n")?;
        match self.serial.read_until(READY_PROMPT, None) {
            Ok(_) => {}
            Err(ScopeError::SerialTimeout) => {
                return Err(ScopeError::IoToolUnresponsive(
                    "no prompt after abort".into(),
                ))
            }
            Err(e) => return Err(e),
        }
        // wait a bit to see if a second prompt appears, then clear the buffer
        thread::sleep(Duration::from_millis(100));
        let buffered = self.serial.read_all_buffered()?;
        if !(buffered.is_empty() || buffered == b">") {
            return Err(ScopeError::UnexpectedOutput(
                String::from_utf8_lossy(&buffered).into_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoToolConfig;
    use crate::serial::mock::{MockLink, MockLinkFactory, OpenOutcome};

    fn echo_ack_link() -> MockLink {
        let link = MockLink::new();
        {
            let state = link.state();
            let mut state = state.lock();
            // reply to the echo-off prefix: its own echo plus the prompt
            state.responses.push_back(b"\x80\xff\r\n>".to_vec());
        }
        link
    }

    fn connected_iotool() -> (IoTool, MockLink) {
        let factory = MockLinkFactory::new();
        let session = echo_ack_link();
        factory.script_open(OpenOutcome::Link(MockLink::new())); // pre-reset port
        factory.script_open(OpenOutcome::Link(session.clone())); // post-reset port
        let iotool =
            IoTool::new(IoToolConfig::default(), Box::new(factory)).expect("reset succeeds");
        (iotool, session)
    }

    #[test]
    fn reset_disables_echo_and_reaches_prompt() {
        let (_iotool, session) = connected_iotool();
        let state = session.state();
        let state = state.lock();
        assert_eq!(state.writes[0], b"\x80\xff\n");
    }

    #[test]
    fn reset_retries_when_port_is_busy() {
        let factory = MockLinkFactory::new();
        factory.script_open(OpenOutcome::Link(MockLink::new()));
        factory.script_open(OpenOutcome::Busy);
        factory.script_open(OpenOutcome::Link(echo_ack_link()));
        assert!(IoTool::new(IoToolConfig::default(), Box::new(factory)).is_ok());
    }

    #[test]
    fn reset_fails_on_bad_acknowledgement() {
        let factory = MockLinkFactory::new();
        factory.script_open(OpenOutcome::Link(MockLink::new()));
        let bad = MockLink::new();
        bad.state().lock().responses.push_back(b"garbage>".to_vec());
        factory.script_open(OpenOutcome::Link(bad));
        assert!(matches!(
            IoTool::new(IoToolConfig::default(), Box::new(factory)),
            Err(ScopeError::IoToolUnresponsive(_))
        ));
    }

    #[test]
    fn execute_returns_command_output() {
        let (mut iotool, session) = connected_iotool();
        session
            .state()
            .lock()
            .responses
            .push_back(b"123 us>".to_vec());
        let responses = iotool
            .execute(&[commands::timer_end(), commands::set_high("B0")])
            .expect("execute");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].as_deref(), Some("123 us"));
        assert_eq!(responses[1], None);
        assert!(session.state().lock().written_text().contains("te\n"));
    }

    #[test]
    fn stray_bytes_before_execute_are_fatal() {
        let (mut iotool, session) = connected_iotool();
        session.state().lock().push_rx(b"stale");
        assert!(matches!(
            iotool.execute(&[commands::set_low("B0")]),
            Err(ScopeError::UnexpectedOutput(_))
        ));
    }

    #[test]
    fn store_program_collects_per_line_errors() {
        let (mut iotool, session) = connected_iotool();
        {
            let state = session.state();
            let mut state = state.lock();
            state.responses.push_back(b">".to_vec()); // program
            state.responses.push_back(b"bad pin>".to_vec()); // sh Q9
            state.responses.push_back(b">".to_vec()); // end
        }
        let err = iotool
            .store_program(&[commands::set_high("Q9")])
            .expect_err("program rejected");
        match err {
            ScopeError::Program(errors) => {
                assert_eq!(errors, vec!["sh Q9: bad pin".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn start_program_writes_run_with_iterations() {
        let (mut iotool, session) = connected_iotool();
        iotool
            .store_program(&[commands::set_high("B0"), commands::set_low("B0")])
            .expect("store");
        iotool.start_program(3).expect("start");
        assert!(session.state().lock().written_text().contains("run 3\n"));
    }

    #[test]
    fn wait_until_done_returns_program_output() {
        let (mut iotool, session) = connected_iotool();
        // the run command itself produces nothing; the prompt only arrives
        // once the program completes
        session.state().lock().responses.push_back(Vec::new());
        iotool.start_program(1).expect("start");
        session.state().lock().push_rx(b"done tokens\n>");
        let output = iotool.wait_until_done().expect("wait");
        assert_eq!(output, "done tokens\n");
    }

    #[test]
    fn cancellation_aborts_the_program_and_propagates() {
        let (mut iotool, session) = connected_iotool();
        session.state().lock().responses.push_back(Vec::new());
        iotool.start_program(1).expect("start");
        iotool.cancel_token().cancel();
        assert!(matches!(
            iotool.wait_until_done(),
            Err(ScopeError::HardwareAborted)
        ));
        // the abort character went out on the wire
        assert!(session.state().lock().written_text().ends_with("!\n"));
    }

    #[test]
    fn stop_tolerates_a_second_prompt() {
        let (mut iotool, session) = connected_iotool();
        session.state().lock().responses.push_back(b">>".to_vec());
        iotool.stop().expect("stop");
    }
}
