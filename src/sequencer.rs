//! The protocol sequencer: one modem session driven through explicit deadlines.
//!
//! A [`Sequencer`] never blocks. Triggers write a command and arm a deadline;
//! the owner calls [`Sequencer::poll`] from its loop and the buffered reply is
//! collected once that deadline has passed. At most one exchange is in flight.

use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::device::{DeviceState, Imei};
use crate::error::{Error, Result};
use crate::nck::{CodeGenerator, DEFAULT_SALT};
use crate::protocol::{parse_identity, parse_status, Command, Grammar};
use crate::sink::PresentationSink;
use crate::transport::{PortConfig, Transport};

/// Time the modem is given to answer before its reply is read.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub port: PortConfig,
    pub settle_delay: Duration,
    // Extra attempts when a deadline finds no matching reply. Zero means one-shot.
    pub retries: u32,
    pub salt: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: PortConfig::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            retries: 0,
            salt: DEFAULT_SALT.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Idle,
    AwaitingIdentity,
    AwaitingStatus,
    AwaitingUnlockAck,
}

// One in-flight command and the deadline its reply is collected at.
#[derive(Debug)]
struct PendingExchange {
    command: Command,
    deadline: Instant,
    retries_left: u32,
    // An identity query issued by a refresh continues into a status query.
    then_status: bool,
}

/// One modem session: owns the transport, the device state and the in-flight exchange.
pub struct Sequencer<T, G, S> {
    transport: T,
    generator: G,
    sink: S,
    config: SessionConfig,
    // Name of the open port, `None` while disconnected.
    port_name: Option<String>,
    device: DeviceState,
    pending: Option<PendingExchange>,
}

impl<T: Transport, G: CodeGenerator, S: PresentationSink> Sequencer<T, G, S> {
    pub fn new(transport: T, generator: G, sink: S, config: SessionConfig) -> Self {
        Self {
            transport,
            generator,
            sink,
            config,
            port_name: None,
            device: DeviceState::default(),
            pending: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.connection() == ConnectionState::Closed {
            return SessionState::Disconnected;
        }
        match self.pending.as_ref().map(|p| p.command.grammar()) {
            None => SessionState::Idle,
            Some(Grammar::Identity) => SessionState::AwaitingIdentity,
            Some(Grammar::LockStatus) => SessionState::AwaitingStatus,
            Some(Grammar::Acknowledgement) => SessionState::AwaitingUnlockAck,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        if self.port_name.is_some() && self.transport.is_open() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// When the in-flight exchange is due, if there is one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Opens `port_name` with the fixed profile and starts a refresh.
    pub fn connect(&mut self, port_name: &str, now: Instant) -> Result<()> {
        if let Some(open) = &self.port_name {
            let err = Error::AlreadyConnected(open.clone());
            return self.reject(err);
        }

        if let Err(e) = self.transport.open(port_name, &self.config.port) {
            warn!("{}", e);
            self.sink.on_status_message("Open error");
            return Err(e);
        }

        info!(port = port_name, config = %self.config.port, "Connected");
        self.port_name = Some(port_name.to_owned());
        self.device.reset();
        self.sink.on_connection_change(true);
        let message = format!("Connected to {} : {}", port_name, self.config.port);
        self.sink.on_status_message(&message);

        // A failed first write is already reported; the connection itself stands.
        if let Err(e) = self.refresh_status(now) {
            debug!("Initial refresh failed: {}", e);
        }
        Ok(())
    }

    /// Closes the port and forgets the in-flight exchange and device state.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(port) = self.port_name.take() else {
            return self.reject(Error::NotConnected);
        };

        if let Some(dropped) = self.pending.take() {
            debug!("Dropping pending {} exchange", dropped.command.grammar());
        }
        self.transport.close();
        self.device.reset();
        info!(port = %port, "Disconnected");
        self.sink.on_connection_change(false);
        self.sink.on_status_message("Disconnected");
        Ok(())
    }

    /// Re-reads the IMEI and then the lock status.
    pub fn refresh_status(&mut self, now: Instant) -> Result<()> {
        self.ensure_idle()?;
        self.start(Command::QueryIdentity, true, now)
    }

    /// Submits the unlock code for the known IMEI, then re-reads the lock status.
    pub fn unlock(&mut self, now: Instant) -> Result<()> {
        self.ensure_idle()?;
        let Some(imei) = self.device.imei().cloned() else {
            return self.reject(Error::NoIdentity);
        };

        let code = match self.device.unlock_code() {
            Some(code) => code.to_owned(),
            None => self.derive_code(&imei)?,
        };
        info!(%imei, "Submitting unlock code");
        self.start(Command::Unlock(code), false, now)
    }

    /// Collects the reply of the in-flight exchange once its deadline has passed.
    pub fn poll(&mut self, now: Instant) {
        let due = matches!(&self.pending, Some(p) if now >= p.deadline);
        if !due {
            return;
        }
        let Some(exchange) = self.pending.take() else {
            return;
        };
        if self.connection() == ConnectionState::Closed {
            debug!("Deadline fired without a connection");
            return;
        }

        let grammar = exchange.command.grammar();
        match grammar {
            Grammar::Identity => {
                let then_status = exchange.then_status;
                match self.collect(parse_identity) {
                    Some(imei) => self.apply_identity(imei),
                    None if self.retry(&exchange, now) => return,
                    None => self.report_no_match(grammar),
                }
                if then_status {
                    let _ = self.start(Command::QueryLockStatus, false, now);
                }
            }
            Grammar::LockStatus => match self.collect(parse_status) {
                Some(report) => {
                    if self.device.set_lock_status(report.status, report.attempts) {
                        info!(status = %report.status, attempts = report.attempts, "Lock status");
                        self.sink.on_lock_status(report.status, report.attempts);
                    } else {
                        debug!(status = %report.status, "Lock status unchanged");
                    }
                }
                None if self.retry(&exchange, now) => {}
                None => self.report_no_match(grammar),
            },
            Grammar::Acknowledgement => {
                self.drain_acknowledgement();
                let _ = self.start(Command::QueryLockStatus, false, now);
            }
        }
    }

    fn ensure_idle(&mut self) -> Result<()> {
        if self.connection() == ConnectionState::Closed {
            return self.reject(Error::NotConnected);
        }
        if let Some(pending) = &self.pending {
            let err = Error::Busy(pending.command.grammar());
            return self.reject(err);
        }
        Ok(())
    }

    // Reports a trigger failure outward and hands it back to the caller.
    fn reject<R>(&mut self, err: Error) -> Result<R> {
        warn!("{}", err);
        self.sink.on_status_message(&err.to_string());
        Err(err)
    }

    fn start(&mut self, command: Command, then_status: bool, now: Instant) -> Result<()> {
        if let Err(e) = self.transport.write(&command.to_bytes()) {
            return self.reject(e);
        }
        let wire = command.to_string();
        debug!(command = wire.trim_end(), "Awaiting {} reply", command.grammar());
        self.pending = Some(PendingExchange {
            command,
            deadline: now + self.config.settle_delay,
            retries_left: self.config.retries,
            then_status,
        });
        Ok(())
    }

    // Re-sends an unanswered command. Returns false once retries are exhausted.
    fn retry(&mut self, exchange: &PendingExchange, now: Instant) -> bool {
        if exchange.retries_left == 0 {
            return false;
        }
        if let Err(e) = self.transport.write(&exchange.command.to_bytes()) {
            warn!("Retry failed: {}", e);
            self.sink.on_status_message(&e.to_string());
            return false;
        }
        debug!(retries_left = exchange.retries_left - 1, "Retrying {} query", exchange.command.grammar());
        self.pending = Some(PendingExchange {
            command: exchange.command.clone(),
            deadline: now + self.config.settle_delay,
            retries_left: exchange.retries_left - 1,
            then_status: exchange.then_status,
        });
        true
    }

    // Drains every buffered line. The first one `parse` accepts is the answer.
    fn collect<R>(&mut self, parse: fn(&[u8]) -> Option<R>) -> Option<R> {
        let mut found = None;
        while self.transport.has_buffered_line() {
            let Some(line) = self.transport.read_line() else {
                break;
            };
            if found.is_none() {
                found = parse(&line);
                if found.is_some() {
                    continue;
                }
            }
            trace!(line = ?String::from_utf8_lossy(&line), "Ignoring line");
        }
        found
    }

    fn apply_identity(&mut self, imei: Imei) {
        if self.device.set_imei(imei.clone()) {
            info!(%imei, "New IMEI");
            self.sink.on_identity(&imei);
        }

        if self.device.unlock_code().is_none() {
            // Already reported; the lock status is still worth reading.
            let _ = self.derive_code(&imei);
        }
    }

    fn derive_code(&mut self, imei: &Imei) -> Result<String> {
        let code = match self.generator.generate(imei, &self.config.salt) {
            Ok(code) => code,
            Err(e) => return self.reject(e),
        };
        debug!(%imei, "Derived unlock code");
        self.device.set_unlock_code(imei, code.clone());
        self.sink.on_unlock_code(&code);
        Ok(code)
    }

    fn drain_acknowledgement(&mut self) {
        while self.transport.has_buffered_line() {
            let Some(line) = self.transport.read_line() else {
                break;
            };
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end();
            if text.contains("ERROR") {
                warn!(reply = text, "Modem rejected the unlock code");
                self.sink.on_status_message(&format!("Unlock rejected: {}", text));
            } else {
                debug!(reply = text, "Unlock reply");
            }
        }
    }

    fn report_no_match(&mut self, grammar: Grammar) {
        let err = Error::NoMatch(grammar);
        warn!("{}", err);
        self.sink.on_status_message(&err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LockStatus;
    use crate::sink::Notification;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    const IMEI: &str = "123456789012345";
    const PORT: &str = "/dev/ttyUSB0";

    // In-memory modem end: records writes, replays queued reply lines.
    #[derive(Default)]
    struct MockTransport {
        open: bool,
        fail_open: bool,
        fail_write: bool,
        written: Vec<Vec<u8>>,
        incoming: VecDeque<Vec<u8>>,
    }

    impl MockTransport {
        fn reply(&mut self, line: &str) {
            self.incoming.push_back(line.as_bytes().to_vec());
        }

        fn last_written(&self) -> &[u8] {
            self.written.last().map(Vec::as_slice).unwrap_or(&[])
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self, port_name: &str, _config: &PortConfig) -> Result<()> {
            if self.fail_open {
                return Err(Error::Open {
                    port: port_name.to_owned(),
                    source: serialport::Error::new(serialport::ErrorKind::NoDevice, "no such device"),
                });
            }
            self.open = true;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn write(&mut self, bytes: &[u8]) -> Result<usize> {
            if self.fail_write {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "unplugged",
                )));
            }
            self.written.push(bytes.to_vec());
            Ok(bytes.len())
        }

        fn has_buffered_line(&mut self) -> bool {
            !self.incoming.is_empty()
        }

        fn read_line(&mut self) -> Option<Vec<u8>> {
            self.incoming.pop_front()
        }
    }

    // Derives "nck-<imei>" and remembers every call.
    #[derive(Default)]
    struct RecordingGenerator {
        fail: bool,
        // Fails only the next call.
        fail_once: Cell<bool>,
        calls: RefCell<Vec<(String, String)>>,
    }

    impl CodeGenerator for RecordingGenerator {
        fn generate(&self, imei: &Imei, salt: &str) -> Result<String> {
            self.calls
                .borrow_mut()
                .push((imei.to_string(), salt.to_owned()));
            if self.fail || self.fail_once.replace(false) {
                return Err(Error::Generator(String::from("boom")));
            }
            Ok(format!("nck-{}", imei))
        }
    }

    type TestSequencer = Sequencer<MockTransport, RecordingGenerator, Vec<Notification>>;

    fn sequencer() -> TestSequencer {
        with_config(SessionConfig::default())
    }

    fn with_config(config: SessionConfig) -> TestSequencer {
        Sequencer::new(
            MockTransport::default(),
            RecordingGenerator::default(),
            Vec::new(),
            config,
        )
    }

    fn settle() -> Duration {
        DEFAULT_SETTLE_DELAY
    }

    // Answers the identity and status queries of one refresh. Returns the time it ended.
    fn answer_refresh(seq: &mut TestSequencer, start: Instant, imei: Option<&str>, status: Option<&str>) -> Instant {
        if let Some(imei) = imei {
            seq.transport_mut().reply(imei);
        }
        let identity_due = start + settle();
        seq.poll(identity_due);

        if let Some(status) = status {
            seq.transport_mut().reply(status);
        }
        let status_due = identity_due + settle();
        seq.poll(status_due);
        status_due
    }

    fn connected() -> (TestSequencer, Instant) {
        let mut seq = sequencer();
        let t0 = Instant::now();
        seq.connect(PORT, t0).unwrap();
        (seq, t0)
    }

    fn lock_notifications(seq: &TestSequencer) -> Vec<&Notification> {
        seq.sink()
            .iter()
            .filter(|n| matches!(n, Notification::LockStatus { .. }))
            .collect()
    }

    // --- Tests for connecting and disconnecting ---

    #[test]
    fn starts_disconnected() {
        let seq = sequencer();
        assert_eq!(seq.state(), SessionState::Disconnected);
        assert_eq!(seq.connection(), ConnectionState::Closed);
        assert_eq!(seq.next_deadline(), None);
    }

    #[test]
    fn connect_reports_profile_and_queries_identity() {
        let (seq, t0) = connected();
        assert_eq!(seq.state(), SessionState::AwaitingIdentity);
        assert_eq!(seq.port_name(), Some(PORT));
        assert_eq!(seq.transport().written, vec![b"AT+CGSN\r\n".to_vec()]);
        assert_eq!(seq.next_deadline(), Some(t0 + settle()));
        assert_eq!(
            seq.sink()[..2],
            [
                Notification::Connection(true),
                Notification::StatusMessage(format!(
                    "Connected to {} : 115200, 8, None, 1, None",
                    PORT
                )),
            ]
        );
    }

    #[test]
    fn open_failure_stays_disconnected() {
        let mut seq = sequencer();
        seq.transport_mut().fail_open = true;
        let result = seq.connect(PORT, Instant::now());
        assert!(matches!(result, Err(Error::Open { .. })));
        assert_eq!(seq.state(), SessionState::Disconnected);
        assert_eq!(*seq.sink(), vec![Notification::StatusMessage(String::from("Open error"))]);
        assert!(seq.transport().written.is_empty());
    }

    #[test]
    fn second_connect_is_rejected() {
        let (mut seq, t0) = connected();
        let result = seq.connect("/dev/ttyUSB1", t0);
        assert!(matches!(result, Err(Error::AlreadyConnected(ref port)) if port == PORT));
        assert_eq!(seq.port_name(), Some(PORT));
    }

    #[test]
    fn disconnect_without_connection_fails() {
        let mut seq = sequencer();
        assert!(matches!(seq.disconnect(), Err(Error::NotConnected)));
    }

    #[test]
    fn disconnect_resets_session() {
        let (mut seq, t0) = connected();
        answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));
        seq.disconnect().unwrap();

        assert_eq!(seq.state(), SessionState::Disconnected);
        assert_eq!(*seq.device(), DeviceState::default());
        assert!(!seq.transport().open);
        assert_eq!(
            seq.sink()[seq.sink().len() - 2..],
            [
                Notification::Connection(false),
                Notification::StatusMessage(String::from("Disconnected")),
            ]
        );
    }

    #[test]
    fn disconnect_while_awaiting_status_suppresses_reply() {
        let (mut seq, t0) = connected();
        seq.transport_mut().reply("123456789012345\r\n");
        seq.poll(t0 + settle());
        assert_eq!(seq.state(), SessionState::AwaitingStatus);

        seq.transport_mut().reply("^CARDLOCK: 1,3,0\r\n");
        seq.disconnect().unwrap();
        seq.poll(t0 + settle() * 10);

        assert!(lock_notifications(&seq).is_empty());
        assert_eq!(seq.device().lock_status(), LockStatus::Unknown);
        assert_eq!(seq.state(), SessionState::Disconnected);
    }

    #[test]
    fn reconnect_starts_from_empty_state() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));
        seq.disconnect().unwrap();
        seq.transport_mut().incoming.clear();

        seq.connect(PORT, t1).unwrap();
        assert_eq!(seq.device().imei(), None);
        assert_eq!(seq.device().attempts_remaining(), None);
        assert_eq!(seq.state(), SessionState::AwaitingIdentity);
    }

    // --- Tests for the refresh cycle ---

    #[test]
    fn poll_before_deadline_does_nothing() {
        let (mut seq, t0) = connected();
        seq.transport_mut().reply("123456789012345\r\n");
        seq.poll(t0);
        assert_eq!(seq.state(), SessionState::AwaitingIdentity);
        assert_eq!(seq.device().imei(), None);
        assert_eq!(seq.transport().incoming.len(), 1);
    }

    #[test]
    fn identity_reply_sets_imei() {
        let (mut seq, t0) = connected();
        seq.transport_mut().reply("123456789012345\r\n");
        seq.poll(t0 + settle());

        assert_eq!(seq.device().imei().map(Imei::as_str), Some(IMEI));
        assert!(seq.sink().contains(&Notification::Identity(Imei::new(IMEI).unwrap())));
        // The code is derived straight away, then the status query follows.
        assert_eq!(seq.device().unlock_code(), Some("nck-123456789012345"));
        assert!(seq
            .sink()
            .contains(&Notification::UnlockCode(String::from("nck-123456789012345"))));
        assert_eq!(seq.transport().last_written(), b"AT^CARDLOCK?\r\n");
        assert_eq!(seq.state(), SessionState::AwaitingStatus);
    }

    #[test]
    fn status_reply_sets_lock_status() {
        let (mut seq, t0) = connected();
        answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));

        assert_eq!(seq.device().lock_status(), LockStatus::Blocked);
        assert_eq!(seq.device().attempts_remaining(), Some(3));
        assert_eq!(
            lock_notifications(&seq),
            vec![&Notification::LockStatus {
                status: LockStatus::Blocked,
                attempts: 3
            }]
        );
        assert_eq!(seq.state(), SessionState::Idle);
    }

    #[test]
    fn first_matching_line_wins_and_rest_is_discarded() {
        let (mut seq, t0) = connected();
        seq.transport_mut().reply("AT+CGSN\r\n");
        seq.transport_mut().reply("111111111111111\r\n");
        seq.transport_mut().reply("222222222222222\r\n");
        seq.transport_mut().reply("OK\r\n");
        seq.poll(t0 + settle());

        assert_eq!(seq.device().imei().map(Imei::as_str), Some("111111111111111"));
        assert!(seq.transport().incoming.is_empty());
    }

    #[test]
    fn missing_identity_still_queries_status() {
        let (mut seq, t0) = connected();
        seq.transport_mut().reply("ERROR\r\n");
        seq.poll(t0 + settle());

        assert_eq!(seq.device().imei(), None);
        assert!(seq.sink().contains(&Notification::StatusMessage(String::from(
            "no response matched the identity grammar"
        ))));
        assert!(seq.generator.calls.borrow().is_empty());
        assert_eq!(seq.state(), SessionState::AwaitingStatus);
    }

    #[test]
    fn status_no_match_keeps_previous_values() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));

        seq.refresh_status(t1).unwrap();
        answer_refresh(&mut seq, t1, Some("123456789012345\r\n"), Some("^CARDLOCK: 7,3,0\r\n"));

        assert_eq!(seq.device().lock_status(), LockStatus::Blocked);
        assert_eq!(seq.device().attempts_remaining(), Some(3));
        assert_eq!(lock_notifications(&seq).len(), 1);
        assert_eq!(
            seq.sink().last(),
            Some(&Notification::StatusMessage(String::from(
                "no response matched the lock status grammar"
            )))
        );
    }

    #[test]
    fn refresh_is_idempotent() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 2,10,0\r\n"));
        let first = seq.device().clone();

        seq.refresh_status(t1).unwrap();
        answer_refresh(&mut seq, t1, Some("123456789012345\r\n"), Some("^CARDLOCK: 2,10,0\r\n"));

        assert_eq!(*seq.device(), first);
        assert_eq!(seq.device().lock_status(), LockStatus::Unblocked);
        assert_eq!(seq.device().attempts_remaining(), Some(10));
        // Same IMEI, so the code is not derived again.
        assert_eq!(seq.generator.calls.borrow().len(), 1);
    }

    #[test]
    fn new_imei_replaces_unlock_code() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));
        assert_eq!(seq.device().unlock_code(), Some("nck-123456789012345"));

        seq.refresh_status(t1).unwrap();
        answer_refresh(&mut seq, t1, Some("543210987654321\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));

        assert_eq!(seq.device().imei().map(Imei::as_str), Some("543210987654321"));
        assert_eq!(seq.device().unlock_code(), Some("nck-543210987654321"));
        assert_eq!(seq.generator.calls.borrow().len(), 2);
    }

    #[test]
    fn triggers_rejected_while_busy() {
        let (mut seq, t0) = connected();
        let result = seq.refresh_status(t0);
        assert!(matches!(result, Err(Error::Busy(Grammar::Identity))));
        assert!(matches!(seq.unlock(t0), Err(Error::Busy(Grammar::Identity))));
        assert_eq!(seq.transport().written.len(), 1);
    }

    #[test]
    fn triggers_rejected_while_awaiting_status() {
        let (mut seq, t0) = connected();
        seq.transport_mut().reply("123456789012345\r\n");
        let t1 = t0 + settle();
        seq.poll(t1);
        assert_eq!(seq.state(), SessionState::AwaitingStatus);
        let sent = seq.transport().written.len();

        assert!(matches!(seq.refresh_status(t1), Err(Error::Busy(Grammar::LockStatus))));
        assert!(matches!(seq.unlock(t1), Err(Error::Busy(Grammar::LockStatus))));
        assert_eq!(seq.transport().written.len(), sent);
        assert_eq!(seq.state(), SessionState::AwaitingStatus);
    }

    #[test]
    fn triggers_rejected_while_awaiting_unlock_reply() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));
        seq.unlock(t1).unwrap();
        assert_eq!(seq.state(), SessionState::AwaitingUnlockAck);
        let sent = seq.transport().written.len();

        assert!(matches!(seq.refresh_status(t1), Err(Error::Busy(Grammar::Acknowledgement))));
        assert!(matches!(seq.unlock(t1), Err(Error::Busy(Grammar::Acknowledgement))));
        assert_eq!(seq.transport().written.len(), sent);
        assert_eq!(seq.state(), SessionState::AwaitingUnlockAck);
    }

    #[test]
    fn unchanged_values_are_not_notified_again() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));
        seq.refresh_status(t1).unwrap();
        let t2 = answer_refresh(&mut seq, t1, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));

        let identities = seq
            .sink()
            .iter()
            .filter(|n| matches!(n, Notification::Identity(_)))
            .count();
        assert_eq!(identities, 1);
        assert_eq!(lock_notifications(&seq).len(), 1);

        // A changed attempt count is reported.
        seq.refresh_status(t2).unwrap();
        answer_refresh(&mut seq, t2, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,2,0\r\n"));
        assert_eq!(lock_notifications(&seq).len(), 2);
    }

    #[test]
    fn refresh_requires_connection() {
        let mut seq = sequencer();
        assert!(matches!(seq.refresh_status(Instant::now()), Err(Error::NotConnected)));
        assert!(seq.transport().written.is_empty());
    }

    #[test]
    fn write_failure_leaves_session_idle() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));

        seq.transport_mut().fail_write = true;
        assert!(matches!(seq.refresh_status(t1), Err(Error::Io(_))));
        assert_eq!(seq.state(), SessionState::Idle);
    }

    #[test]
    fn retries_resend_until_reply_arrives() {
        let mut seq = with_config(SessionConfig {
            retries: 1,
            ..SessionConfig::default()
        });
        let t0 = Instant::now();
        seq.connect(PORT, t0).unwrap();

        let t1 = t0 + settle();
        seq.poll(t1);
        assert_eq!(seq.state(), SessionState::AwaitingIdentity);
        assert_eq!(seq.transport().written.len(), 2);
        assert_eq!(seq.transport().last_written(), b"AT+CGSN\r\n");

        seq.transport_mut().reply("123456789012345\r\n");
        seq.poll(t1 + settle());
        assert_eq!(seq.device().imei().map(Imei::as_str), Some(IMEI));
        assert_eq!(seq.state(), SessionState::AwaitingStatus);
    }

    #[test]
    fn retries_are_bounded() {
        let mut seq = with_config(SessionConfig {
            retries: 2,
            ..SessionConfig::default()
        });
        let mut now = Instant::now();
        seq.connect(PORT, now).unwrap();
        for _ in 0..3 {
            now += settle();
            seq.poll(now);
        }
        // Three identity writes, then the chained status query.
        assert_eq!(seq.transport().written.len(), 4);
        assert_eq!(seq.state(), SessionState::AwaitingStatus);
    }

    // --- Tests for unlocking ---

    #[test]
    fn unlock_without_identity_sends_nothing() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, None, Some("^CARDLOCK: 1,3,0\r\n"));
        let sent = seq.transport().written.len();

        assert!(matches!(seq.unlock(t1), Err(Error::NoIdentity)));
        assert_eq!(seq.transport().written.len(), sent);
        assert_eq!(seq.state(), SessionState::Idle);
        assert_eq!(
            seq.sink().last(),
            Some(&Notification::StatusMessage(String::from(
                "IMEI unknown, refresh before unlocking"
            )))
        );
    }

    #[test]
    fn unlock_submits_code_and_requeries_status() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));

        seq.unlock(t1).unwrap();
        assert_eq!(
            *seq.generator.calls.borrow(),
            vec![(String::from(IMEI), String::from(DEFAULT_SALT))]
        );
        assert_eq!(
            seq.transport().last_written(),
            b"AT^CARDLOCK=\"nck-123456789012345\"\r\n"
        );
        assert_eq!(seq.state(), SessionState::AwaitingUnlockAck);

        seq.transport_mut().reply("OK\r\n");
        let t2 = t1 + settle();
        seq.poll(t2);
        assert_eq!(seq.transport().last_written(), b"AT^CARDLOCK?\r\n");
        assert_eq!(seq.state(), SessionState::AwaitingStatus);

        seq.transport_mut().reply("^CARDLOCK: 2,3,0\r\n");
        seq.poll(t2 + settle());
        assert_eq!(seq.device().lock_status(), LockStatus::Unblocked);
        assert_eq!(seq.state(), SessionState::Idle);
    }

    #[test]
    fn rejected_unlock_is_reported() {
        let (mut seq, t0) = connected();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));

        seq.unlock(t1).unwrap();
        seq.transport_mut().reply("+CME ERROR: 16\r\n");
        seq.poll(t1 + settle());

        assert!(seq.sink().contains(&Notification::StatusMessage(String::from(
            "Unlock rejected: +CME ERROR: 16"
        ))));
        assert_eq!(seq.state(), SessionState::AwaitingStatus);
    }

    #[test]
    fn unlock_derives_missing_code() {
        let mut seq = Sequencer::new(
            MockTransport::default(),
            RecordingGenerator {
                fail_once: Cell::new(true),
                ..RecordingGenerator::default()
            },
            Vec::new(),
            SessionConfig::default(),
        );
        let t0 = Instant::now();
        seq.connect(PORT, t0).unwrap();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));
        assert_eq!(seq.device().unlock_code(), None);
        seq.sink_mut().clear();

        seq.unlock(t1).unwrap();

        let expected_call = (String::from(IMEI), String::from(DEFAULT_SALT));
        assert_eq!(*seq.generator.calls.borrow(), vec![expected_call.clone(), expected_call]);
        assert_eq!(seq.device().unlock_code(), Some("nck-123456789012345"));
        assert_eq!(
            *seq.sink(),
            vec![Notification::UnlockCode(String::from("nck-123456789012345"))]
        );
        assert_eq!(
            seq.transport().last_written(),
            b"AT^CARDLOCK=\"nck-123456789012345\"\r\n"
        );
        assert_eq!(seq.state(), SessionState::AwaitingUnlockAck);
    }

    #[test]
    fn generator_failure_blocks_unlock() {
        let mut seq = Sequencer::new(
            MockTransport::default(),
            RecordingGenerator {
                fail: true,
                ..RecordingGenerator::default()
            },
            Vec::new(),
            SessionConfig::default(),
        );
        let t0 = Instant::now();
        seq.connect(PORT, t0).unwrap();
        let t1 = answer_refresh(&mut seq, t0, Some("123456789012345\r\n"), Some("^CARDLOCK: 1,3,0\r\n"));
        // Status was still read after the failed derivation.
        assert_eq!(seq.device().lock_status(), LockStatus::Blocked);
        assert_eq!(seq.device().unlock_code(), None);

        let sent = seq.transport().written.len();
        assert!(matches!(seq.unlock(t1), Err(Error::Generator(_))));
        assert_eq!(seq.transport().written.len(), sent);
        assert_eq!(seq.generator.calls.borrow().len(), 2);
    }
}
