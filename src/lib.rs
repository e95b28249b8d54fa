//! A PostgreSQL frontend/backend wire protocol client: connection handshake, authentication
//! (trust, cleartext, MD5, SCRAM-SHA-256), and the simple query protocol.
//!
//! Pooling, the extended (prepared-statement) query protocol, transactions, `COPY`, and typed
//! value decoding beyond text/`NULL` are not implemented by this crate — see the crate's
//! top-level docs in the repository for the full list of what's in and out of scope.
//!
//! # Examples
//!
//! ```no_run
//! use postro_protocol::Connection;
//!
//! # async fn app() -> postro_protocol::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let result = conn.query("SELECT 420, 'Foo'").await?;
//! let row = &result.rows()[0];
//!
//! assert_eq!(row.get(0).unwrap().as_str(), Some("420"));
//! assert_eq!(row.get(1).unwrap().as_str(), Some("Foo"));
//! # Ok(())
//! # }
//! ```
pub mod common;
mod ext;

// Protocol
pub mod postgres;

// Component
pub mod row;

// Connection
pub mod connection;

mod error;

pub use connection::{Config, Connection, QueryResult};
pub use error::{Error, ErrorKind, Result};
pub use row::{FieldDescriptor, Row, Value};
