//! Outward notifications of a modem session.

use crate::device::{Imei, LockStatus};

/// Receives every outward update a session produces.
pub trait PresentationSink {
    fn on_status_message(&mut self, text: &str);
    fn on_identity(&mut self, imei: &Imei);
    fn on_lock_status(&mut self, status: LockStatus, attempts: u8);
    fn on_unlock_code(&mut self, code: &str);
    fn on_connection_change(&mut self, is_open: bool);
}

/// One sink callback captured as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StatusMessage(String),
    Identity(Imei),
    LockStatus { status: LockStatus, attempts: u8 },
    UnlockCode(String),
    Connection(bool),
}

// Queues notifications for a front end to drain on its own schedule.
impl PresentationSink for Vec<Notification> {
    fn on_status_message(&mut self, text: &str) {
        self.push(Notification::StatusMessage(text.to_owned()));
    }

    fn on_identity(&mut self, imei: &Imei) {
        self.push(Notification::Identity(imei.clone()));
    }

    fn on_lock_status(&mut self, status: LockStatus, attempts: u8) {
        self.push(Notification::LockStatus { status, attempts });
    }

    fn on_unlock_code(&mut self, code: &str) {
        self.push(Notification::UnlockCode(code.to_owned()));
    }

    fn on_connection_change(&mut self, is_open: bool) {
        self.push(Notification::Connection(is_open));
    }
}
