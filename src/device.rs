//! Device state tracked for a connected modem.

use std::fmt;

/// Number of decimal digits in an IMEI.
pub const IMEI_LEN: usize = 15;

/// Placeholder shown for any field that is not known yet.
pub const BLANK: &str = "N/A";

/// A validated 15-digit device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Imei(String);

impl Imei {
    /// Returns `None` unless `digits` is exactly 15 ASCII decimal digits.
    pub fn new(digits: &str) -> Option<Self> {
        let valid = digits.len() == IMEI_LEN && digits.bytes().all(|b| b.is_ascii_digit());
        valid.then(|| Self(digits.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Imei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SIM/network lock status as reported by `^CARDLOCK`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Blocked,
    Unblocked,
    Custom,
    // Never parsed from the modem, only the initial value.
    #[default]
    Unknown,
}

impl LockStatus {
    /// Maps the modem's numeric status code. Codes outside 1..=3 have no mapping.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(LockStatus::Blocked),
            2 => Some(LockStatus::Unblocked),
            3 => Some(LockStatus::Custom),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LockStatus::Blocked => "BLOCKED",
            LockStatus::Unblocked => "UNBLOCKED",
            LockStatus::Custom => "CUSTOM",
            LockStatus::Unknown => BLANK,
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything learned about the modem during one connection.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DeviceState {
    imei: Option<Imei>,
    lock_status: LockStatus,
    attempts_remaining: Option<u8>,
    // Always derived from the current `imei`.
    unlock_code: Option<String>,
}

impl DeviceState {
    pub fn imei(&self) -> Option<&Imei> {
        self.imei.as_ref()
    }

    pub fn lock_status(&self) -> LockStatus {
        self.lock_status
    }

    pub fn attempts_remaining(&self) -> Option<u8> {
        self.attempts_remaining
    }

    pub fn unlock_code(&self) -> Option<&str> {
        self.unlock_code.as_deref()
    }

    /// Stores a freshly parsed IMEI, dropping the unlock code if the identity changed.
    /// Returns `true` when the stored IMEI changed.
    pub fn set_imei(&mut self, imei: Imei) -> bool {
        if self.imei.as_ref() == Some(&imei) {
            return false;
        }
        self.unlock_code = None;
        self.imei = Some(imei);
        true
    }

    /// Stores a code derived from `source`. Rejected unless `source` is the current IMEI.
    pub fn set_unlock_code(&mut self, source: &Imei, code: String) -> bool {
        if self.imei.as_ref() != Some(source) {
            return false;
        }
        self.unlock_code = Some(code);
        true
    }

    /// Returns `true` when either the status or the attempt count changed.
    pub fn set_lock_status(&mut self, status: LockStatus, attempts: u8) -> bool {
        let changed = self.lock_status != status || self.attempts_remaining != Some(attempts);
        self.lock_status = status;
        self.attempts_remaining = Some(attempts);
        changed
    }

    /// Forgets everything, as at the start of a new connection.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
