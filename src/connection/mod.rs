//! The client connection: handshake, authentication, and simple-query execution.
//!
//! A [`Connection`] owns exactly one in-flight operation at a time: the simple query protocol
//! never pipelines, so there is no portal/cursor bookkeeping and no event bus to multiplex
//! replies onto — just one accumulator buffer and a loop that dispatches whatever frame arrives
//! next.
use std::{collections::HashMap, sync::Arc};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, timeout};

use crate::common::{ByteStr, span, verbose, verbose_warn};
use crate::postgres::backend::{self, Authentication, BackendMessage, ErrorFields};
use crate::postgres::frontend;
use crate::postgres::scram::ScramClient;
use crate::row::{FieldDescriptor, Row, Value};
use crate::{Error, Result};

mod config;
pub use config::{Config, ParseError};

/// Default time a [`Connection::query`] call waits for the server before giving up.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Authenticating,
    Ready,
    Busy,
    /// Closed by the caller via [`Connection::close`].
    Closed,
    /// Left unusable by a protocol violation, transport failure, or query timeout. Unlike
    /// [`State::Closed`], nothing told the peer; the socket may still be open, but the framing
    /// state can no longer be trusted.
    Failed,
}

/// A single connection to a Postgres server.
///
/// Generic over the transport so tests can drive the handshake and query state machine over
/// [`tokio::io::duplex`] without a live server; `Connection::connect` and `connect_env` fix
/// `S = TcpStream`.
pub struct Connection<S = tokio::net::TcpStream> {
    io: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    state: State,
    parameters: HashMap<String, String>,
    backend_key: Option<(i32, i32)>,
    query_timeout: Duration,
    notice_sink: Option<Box<dyn FnMut(ErrorFields) + Send>>,
}

/// The outcome of a [`Connection::query`] call: the rows produced (if any) plus the server's
/// command tag.
#[derive(Debug, Clone)]
pub struct QueryResult {
    fields: Arc<[FieldDescriptor]>,
    rows: Vec<Row>,
    command: String,
    command_tag: String,
    row_count: u64,
    oid: Option<u32>,
}

impl QueryResult {
    /// The rows returned by a `SELECT`-like statement, empty for DDL/DML without a `RETURNING`
    /// clause.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// The column descriptors shared by every row in [`QueryResult::rows`].
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// The first word of the command tag, e.g. `"SELECT"`, `"INSERT"`, `"VACUUM"`, or
    /// `"EMPTY"` for an empty query string.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The raw `CommandComplete` tag text, e.g. `"INSERT 0 1"`, or `"EMPTY"` for an empty query
    /// string, or `"UNKNOWN"` if the server sent neither (should not happen in practice).
    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// The row count carried by the command tag (`0` for commands that don't report one, e.g.
    /// `VACUUM`, and for `EmptyQueryResponse`).
    pub fn rows_affected(&self) -> u64 {
        self.row_count
    }

    /// The inserted row's OID, only ever present for a single-row `INSERT` against a table with
    /// OIDs (a feature Postgres itself has deprecated).
    pub fn oid(&self) -> Option<u32> {
        self.oid
    }
}

impl Connection<tokio::net::TcpStream> {
    /// Connect and complete the startup/authentication handshake.
    pub async fn connect(config: &Config) -> Result<Self> {
        let stream = tokio::net::TcpStream::connect((config.host(), config.port()))
            .await
            .map_err(Error::from)?;
        let _ = stream.set_nodelay(true);
        Self::handshake(stream, config).await
    }

    /// [`Connection::connect`] using [`Config::from_env`].
    pub async fn connect_env() -> Result<Self> {
        Self::connect(&Config::from_env()).await
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the startup handshake (and, for a custom transport, authentication) over an
    /// already-established stream.
    pub async fn handshake(io: S, config: &Config) -> Result<Self> {
        span!("connection.handshake");

        let mut conn = Self {
            io,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            state: State::Authenticating,
            parameters: HashMap::new(),
            backend_key: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            notice_sink: None,
        };

        frontend::encode_startup(&mut conn.write_buf, config.user(), config.database(), config.client_encoding());
        conn.flush().await?;

        conn.authenticate(config).await?;

        loop {
            let (tag, body) = conn.read_message().await?;
            match backend::decode(tag, body)? {
                BackendMessage::ParameterStatus { name, value } => {
                    conn.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData { process_id, secret_key } => {
                    conn.backend_key = Some((process_id, secret_key));
                }
                BackendMessage::NoticeResponse(fields) => conn.handle_notice(fields),
                BackendMessage::ReadyForQuery { .. } => {
                    conn.state = State::Ready;
                    return Ok(conn);
                }
                BackendMessage::ErrorResponse(fields) => return Err(fields.into()),
                other => {
                    return Err(crate::postgres::ProtocolError::new(format!(
                        "unexpected message during startup: {other:?}"
                    ))
                    .into());
                }
            }
        }
    }

    /// Set how long [`Connection::query`] waits for the server before failing with
    /// [`crate::error::ErrorKind::Timeout`].
    pub fn set_query_timeout(&mut self, timeout: Duration) {
        self.query_timeout = timeout;
    }

    /// Install a callback invoked for every `NoticeResponse` the server sends outside of an
    /// active query's result stream (Postgres can emit these at any time, e.g. from a
    /// `NOTIFY`-adjacent warning).
    pub fn set_notice_handler<F>(&mut self, f: F)
    where
        F: FnMut(ErrorFields) + Send + 'static,
    {
        self.notice_sink = Some(Box::new(f));
    }

    /// A run-time parameter the server reported via `ParameterStatus` (e.g. `"server_version"`,
    /// `"TimeZone"`), updated whenever the server sends a new value.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// The backend process ID from `BackendKeyData`, for out-of-band cancellation. Cancellation
    /// itself is out of scope for this core.
    pub fn backend_process_id(&self) -> Option<i32> {
        self.backend_key.map(|(pid, _)| pid)
    }

    /// Run one SQL string through the simple query protocol.
    ///
    /// Rejects if this connection is still authenticating, already running a query, or closed.
    /// A server-side error (`ErrorResponse`) is always followed by `ReadyForQuery`, so the
    /// connection stays usable for the next call; a protocol violation, transport failure, or
    /// timeout leaves the connection unusable and every later call fails with the same kind of
    /// error.
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        match self.state {
            State::Ready => {}
            State::Authenticating => {
                return Err(Error::usage("cannot query a connection that is still authenticating"));
            }
            State::Busy => return Err(Error::usage("a query is already in progress on this connection")),
            State::Closed => return Err(Error::usage("connection is closed")),
            State::Failed => return Err(Error::usage("connection is unusable after a prior failure")),
        }

        self.state = State::Busy;
        verbose!(sql, "sending Query");

        self.write_buf.clear();
        frontend::encode_query(&mut self.write_buf, sql);
        if let Err(e) = self.flush().await {
            self.state = State::Failed;
            return Err(e);
        }

        self.run_query().await
    }

    async fn run_query(&mut self) -> Result<QueryResult> {
        let mut fields: Arc<[FieldDescriptor]> = Arc::from(Vec::new());
        let mut rows = Vec::new();
        let mut command = "UNKNOWN".to_owned();
        let mut command_tag = "UNKNOWN".to_owned();
        let mut row_count = 0u64;
        let mut oid = None;
        let mut server_error = None;

        loop {
            let (tag, body) = match timeout(self.query_timeout, self.read_message()).await {
                Ok(Ok(framed)) => framed,
                Ok(Err(e)) => {
                    self.state = State::Failed;
                    return Err(e);
                }
                Err(_) => {
                    self.state = State::Failed;
                    return Err(Error::timeout());
                }
            };

            let message = match backend::decode(tag, body) {
                Ok(m) => m,
                Err(e) => {
                    self.state = State::Failed;
                    return Err(e.into());
                }
            };

            match message {
                BackendMessage::RowDescription(f) => fields = f,
                BackendMessage::DataRow(values) => {
                    let values = values
                        .into_iter()
                        .map(|v| match v {
                            Some(bytes) => {
                                Value::Text(ByteStr::from_utf8(bytes).unwrap_or_else(|_| ByteStr::copy_from_str("")))
                            }
                            None => Value::Null,
                        })
                        .collect();
                    rows.push(Row::new(fields.clone(), values));
                }
                BackendMessage::CommandComplete(tag_str) => {
                    let parsed = backend::parse_command_complete(&tag_str);
                    command = parsed.command;
                    row_count = parsed.row_count;
                    oid = parsed.oid;
                    command_tag = tag_str;
                }
                BackendMessage::EmptyQueryResponse => {
                    command = "EMPTY".to_owned();
                    command_tag = "EMPTY".to_owned();
                }
                BackendMessage::NoData => {}
                BackendMessage::ErrorResponse(e) => server_error = Some(e),
                BackendMessage::NoticeResponse(e) => self.handle_notice(e),
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ReadyForQuery { .. } => {
                    self.state = State::Ready;
                    return match server_error {
                        Some(fields) => Err(fields.into()),
                        None => Ok(QueryResult { fields, rows, command, command_tag, row_count, oid }),
                    };
                }
                other => {
                    self.state = State::Failed;
                    return Err(crate::postgres::ProtocolError::new(format!(
                        "unexpected message during query: {other:?}"
                    ))
                    .into());
                }
            }
        }
    }

    /// Send `Terminate` and shut down the transport's write half. The connection is unusable
    /// afterward regardless of whether the server is still listening.
    pub async fn close(mut self) -> Result<()> {
        self.write_buf.clear();
        frontend::encode_terminate(&mut self.write_buf);
        let _ = self.flush().await;
        let _ = self.io.shutdown().await;
        self.state = State::Closed;
        Ok(())
    }

    async fn authenticate(&mut self, config: &Config) -> Result<()> {
        loop {
            let (tag, body) = self.read_message().await?;
            let message = backend::decode(tag, body)?;

            let auth = match message {
                BackendMessage::Authentication(auth) => auth,
                BackendMessage::ErrorResponse(fields) => return Err(fields.into()),
                other => {
                    return Err(crate::postgres::ProtocolError::new(format!(
                        "expected an authentication message, got {other:?}"
                    ))
                    .into());
                }
            };

            match auth {
                Authentication::Ok => return Ok(()),
                Authentication::CleartextPassword => {
                    self.write_buf.clear();
                    frontend::encode_password(&mut self.write_buf, config.password().as_bytes(), true);
                    self.flush().await?;
                }
                Authentication::Md5Password { salt } => {
                    let hash = md5_password(config.user(), config.password(), &salt);
                    self.write_buf.clear();
                    frontend::encode_password(&mut self.write_buf, hash.as_bytes(), true);
                    self.flush().await?;
                }
                Authentication::Sasl { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(Error::authentication(format!(
                            "server only offered unsupported SASL mechanisms: {mechanisms:?}"
                        )));
                    }
                    self.scram_exchange(config).await?;
                    return Ok(());
                }
                Authentication::SaslContinue { .. } | Authentication::SaslFinal { .. } => {
                    return Err(Error::authentication("SASL message received out of order"));
                }
                Authentication::Unsupported { subtype } => {
                    return Err(Error::authentication(format!("unsupported authentication method {subtype}")));
                }
            }
        }
    }

    async fn scram_exchange(&mut self, config: &Config) -> Result<()> {
        let mut scram = ScramClient::new(config.user());

        self.write_buf.clear();
        frontend::encode_sasl_initial(&mut self.write_buf, "SCRAM-SHA-256", scram.client_first_message().as_bytes());
        self.flush().await?;

        let server_first = match self.expect_authentication().await? {
            Authentication::SaslContinue { data } => data,
            other => return Err(unexpected_sasl_step("server-first-message", &other)),
        };
        scram
            .continue_with_server_first(&server_first, config.password())
            .map_err(Error::from)?;

        self.write_buf.clear();
        let client_final_message = scram.client_final_message().map_err(Error::from)?;
        frontend::encode_password(&mut self.write_buf, client_final_message.as_bytes(), false);
        self.flush().await?;

        let server_final = match self.expect_authentication().await? {
            Authentication::SaslFinal { data } => data,
            other => return Err(unexpected_sasl_step("server-final-message", &other)),
        };
        scram.verify_server_final(&server_final).map_err(Error::from)?;

        match self.expect_authentication().await? {
            Authentication::Ok => Ok(()),
            other => Err(unexpected_sasl_step("AuthenticationOk", &other)),
        }
    }

    async fn expect_authentication(&mut self) -> Result<Authentication> {
        let (tag, body) = self.read_message().await?;
        match backend::decode(tag, body)? {
            BackendMessage::Authentication(auth) => Ok(auth),
            BackendMessage::ErrorResponse(fields) => Err(fields.into()),
            other => Err(crate::postgres::ProtocolError::new(format!(
                "expected an authentication message, got {other:?}"
            ))
            .into()),
        }
    }

    fn handle_notice(&mut self, fields: ErrorFields) {
        verbose!(message = fields.message(), "received NoticeResponse");
        if let Some(sink) = &mut self.notice_sink {
            sink(fields);
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.io.write_all(&self.write_buf).await.map_err(Error::from)?;
        self.write_buf.clear();
        Ok(())
    }

    /// Read one complete frame off the wire: buffer bytes until a 5-byte header (tag + BE i32
    /// length) and its full body are present, then split it off without a copy.
    async fn read_message(&mut self) -> Result<(u8, bytes::Bytes)> {
        loop {
            if self.read_buf.len() >= 5 {
                let tag = self.read_buf[0];
                let len = (&self.read_buf[1..5]).get_i32();

                if len < 4 {
                    verbose_warn!(len, "backend sent a message length below the 4-byte minimum, resyncing");
                    self.read_buf.advance(1);
                    continue;
                }

                let len = len as usize;
                if self.read_buf.len() >= 1 + len {
                    self.read_buf.advance(5);
                    let body = self.read_buf.split_to(len - 4).freeze();
                    return Ok((tag, body));
                }
            }

            if self.read_buf.capacity() == self.read_buf.len() {
                self.read_buf.reserve(8 * 1024);
            }
            let n = self.io.read_buf(&mut self.read_buf).await.map_err(Error::from)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}

fn unexpected_sasl_step(expected: &str, got: &Authentication) -> Error {
    crate::postgres::ProtocolError::new(format!("expected {expected}, got {got:?}")).into()
}

fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::{Digest, Md5};

    let mut inner = Md5::new();
    inner.update(password.as_bytes());
    inner.update(user.as_bytes());
    let inner_hex = hex(&inner.finalize());

    let mut outer = Md5::new();
    outer.update(inner_hex.as_bytes());
    outer.update(salt);
    let outer_hex = hex(&outer.finalize());

    format!("md5{outer_hex}")
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("writing to a String never fails");
    }
    s
}
