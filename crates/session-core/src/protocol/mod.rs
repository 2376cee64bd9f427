//! Wire codecs for the two peers
//!
//! [`telephony`] speaks the carrier's media stream events, [`engine`] the
//! realtime speech engine's events. Both decode one text frame at a time and
//! report anything they cannot use as a protocol violation.

pub mod engine;
pub mod telephony;

pub use engine::{EngineCommand, EngineEvent, SessionParameters};
pub use telephony::{StreamStart, TelephonyCommand, TelephonyEvent};
