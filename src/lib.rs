//! # Datacard Unlocker Library
//!
//! This library drives a Huawei-style cellular datacard over a serial port. It
//! reads the modem's IMEI, queries its `^CARDLOCK` status and, when the card is
//! locked, submits the derived unlock code and reads the status back.
//!
//! The [`Sequencer`] owns the whole session. It talks to the modem through a
//! [`Transport`], derives codes through a [`CodeGenerator`] and reports every
//! change to a [`PresentationSink`].

pub mod device;
pub mod error;
pub mod nck;
pub mod protocol;
pub mod sequencer;
pub mod sink;
pub mod transport;

pub use device::{DeviceState, Imei, LockStatus};
pub use error::{Error, Result};
pub use nck::{CodeGenerator, ExternalGenerator, DEFAULT_SALT};
pub use protocol::{parse_identity, parse_status, Command, Grammar, StatusReport};
pub use sequencer::{ConnectionState, Sequencer, SessionConfig, SessionState, DEFAULT_SETTLE_DELAY};
pub use sink::{Notification, PresentationSink};
pub use transport::{LineBuffer, PortConfig, SerialTransport, Transport};
