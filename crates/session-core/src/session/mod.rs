//! Call sessions
//!
//! A [`CallSession`] is a cheap handle; the relay tasks and the supervisor
//! share one block of state behind it.

mod call_session;
pub mod state;
pub(crate) mod supervisor;
mod tasks;

pub use call_session::CallSession;
pub use state::SessionState;
