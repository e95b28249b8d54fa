//! The PostgreSQL frontend/backend protocol, version 3.0.
//!
//! <https://www.postgresql.org/docs/current/protocol.html>
//!
//! Message-type bytes such as `'S'`, `'D'`, `'C'`, `'E'` are reused with unrelated meanings
//! depending on direction, so [`backend`] and [`frontend`] keep separate tag namespaces rather
//! than sharing one `Tag` enum. Dispatch in [`crate::connection`] is always driven by direction:
//! everything read off the socket is a [`backend::BackendMessage`], everything written to it is
//! encoded by a type in [`frontend`].
pub mod backend;
pub mod frontend;
pub mod scram;

use std::fmt;

/// Startup protocol version 3.0: major 3, minor 0, packed as `(3 << 16) | 0`.
pub const PROTOCOL_VERSION: i32 = 196_608;

/// A malformed frame or a message that made no sense for the connection's current state.
#[derive(Debug)]
pub struct ProtocolError(pub(crate) String);

impl ProtocolError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::error::Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error: {}", self.0)
    }
}
