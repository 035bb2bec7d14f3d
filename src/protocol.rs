//! AT command framing and the two response grammars the modem answers with.
//!
//! Response lines are matched with their `\r\n` terminator still attached. A
//! line that deviates from the exact shape is a non-match, never a partial parse.

use std::fmt;

use crate::device::{Imei, LockStatus, IMEI_LEN};

/// Line terminator used by both commands and replies.
pub const TERMINATOR: &[u8] = b"\r\n";

const STATUS_PREFIX: &[u8] = b"^CARDLOCK: ";
const STATUS_SUFFIX: &[u8] = b",0\r\n";

// Commands the sequencer sends to the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    QueryIdentity,
    QueryLockStatus,
    // Carries the derived credential.
    Unlock(String),
}

impl Command {
    /// The grammar the reply to this command is matched against.
    pub fn grammar(&self) -> Grammar {
        match self {
            Command::QueryIdentity => Grammar::Identity,
            Command::QueryLockStatus => Grammar::LockStatus,
            Command::Unlock(_) => Grammar::Acknowledgement,
        }
    }

    /// Frames the command as it goes on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::QueryIdentity => f.write_str("AT+CGSN\r\n"),
            Command::QueryLockStatus => f.write_str("AT^CARDLOCK?\r\n"),
            Command::Unlock(code) => write!(f, "AT^CARDLOCK=\"{}\"\r\n", code),
        }
    }
}

/// The shape of reply expected for a pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    Identity,
    LockStatus,
    // Unlock replies are consumed without being parsed.
    Acknowledgement,
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grammar::Identity => f.write_str("identity"),
            Grammar::LockStatus => f.write_str("lock status"),
            Grammar::Acknowledgement => f.write_str("unlock acknowledgement"),
        }
    }
}

/// A parsed `^CARDLOCK` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub status: LockStatus,
    pub attempts: u8,
}

/// Matches a bare IMEI line: exactly 15 decimal digits followed by `\r\n`.
pub fn parse_identity(line: &[u8]) -> Option<Imei> {
    let digits = line.strip_suffix(TERMINATOR)?;
    if digits.len() != IMEI_LEN {
        return None;
    }
    Imei::new(std::str::from_utf8(digits).ok()?)
}

/// Matches `^CARDLOCK: <status>,<attempts>,0\r\n` with status in 1..=3 and
/// one or two attempt digits.
pub fn parse_status(line: &[u8]) -> Option<StatusReport> {
    let body = line.strip_prefix(STATUS_PREFIX)?.strip_suffix(STATUS_SUFFIX)?;

    // What remains is "<s>,<a>" or "<s>,<aa>".
    let (&code, rest) = body.split_first()?;
    let attempts = rest.strip_prefix(b",")?;
    if !code.is_ascii_digit() || attempts.is_empty() || attempts.len() > 2 {
        return None;
    }
    if !attempts.iter().all(u8::is_ascii_digit) {
        return None;
    }

    let status = LockStatus::from_code(code - b'0')?;
    let attempts = attempts.iter().fold(0u8, |acc, d| acc * 10 + (d - b'0'));
    Some(StatusReport { status, attempts })
}
