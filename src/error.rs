//! `postro` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    connection::ParseError,
    postgres::{ProtocolError, backend::ErrorFields, scram::ScramError},
};

/// A specialized [`Result`] type for `postro` operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible errors from the `postro` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// `true` for [`ErrorKind::Server`], the only kind a connection recovers from without
    /// closing: the caller may issue another query on the same connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind, ErrorKind::Server(_))
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        ErrorKind::Usage(msg.into()).into()
    }

    pub(crate) fn timeout() -> Self {
        ErrorKind::Timeout.into()
    }

    pub(crate) fn authentication(msg: impl Into<String>) -> Self {
        ErrorKind::Authentication(msg.into()).into()
    }
}

/// All possible error kinds from the `postro` library.
pub enum ErrorKind {
    /// The TCP connection failed, or was closed mid-message.
    Transport(io::Error),
    /// A message violated the wire protocol's framing or encoding rules.
    Protocol(ProtocolError),
    /// The server requested an authentication method this core does not support, or the
    /// SCRAM exchange itself failed in a way not captured by [`ErrorKind::Scram`].
    Authentication(String),
    /// A SCRAM-SHA-256 exchange failed; always fatal to the connection.
    Scram(ScramError),
    /// The server responded with `ErrorResponse`. Recoverable: the server always follows it
    /// with `ReadyForQuery`, so the connection remains usable for further queries.
    Server(ErrorFields),
    /// `DATABASE_URL`/`postgres://` URL could not be parsed.
    Config(ParseError),
    /// The server did not respond within the connection's query timeout. Fatal: the
    /// connection's framing state is no longer trustworthy once a read is abandoned mid-frame.
    Timeout,
    /// The caller used the connection in a way its current state does not allow (querying
    /// while still authenticating, or while another query is in flight).
    Usage(String),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<io::Error>e => ErrorKind::Transport(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<ErrorFields>e => ErrorKind::Server(e));
from!(<ScramError>e => ErrorKind::Scram(e));
from!(<ParseError>e => ErrorKind::Config(e));

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Authentication(msg) => write!(f, "authentication failed: {msg}"),
            Self::Scram(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::Config(e) => e.fmt(f),
            Self::Timeout => f.write_str("timed out waiting for the server"),
            Self::Usage(msg) => f.write_str(msg),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
