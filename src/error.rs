//! Errors a modem session can report.

use crate::protocol::Grammar;

pub type Result<T, E = Error> = std::result::Result<T, E>;

// Every failure of a session is recoverable by re-issuing a trigger.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The serial port could not be opened.
    #[error("open error on '{port}': {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    /// A deadline fired but no buffered line matched the expected grammar.
    #[error("no response matched the {0} grammar")]
    NoMatch(Grammar),
    /// Unlock was requested before the IMEI was read.
    #[error("IMEI unknown, refresh before unlocking")]
    NoIdentity,
    /// A trigger arrived while an exchange was still in flight.
    #[error("busy waiting for {0} response")]
    Busy(Grammar),
    #[error("not connected")]
    NotConnected,
    #[error("already connected to '{0}'")]
    AlreadyConnected(String),
    #[error("serial i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// The unlock credential could not be derived.
    #[error("unlock code generator failed: {0}")]
    Generator(String),
}
