//! Backend (server-to-client) messages and the decoders that read them off the wire.
//!
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>
use std::{collections::HashMap, fmt, sync::Arc};

use bytes::{Buf, Bytes};

use crate::{common::ByteStr, postgres::ProtocolError, row::FieldDescriptor};

/// Message-type bytes the backend sends. Unrelated to [`crate::postgres::frontend::tag`], which
/// reuses several of the same ASCII letters for different frontend messages.
pub mod tag {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const NO_DATA: u8 = b'n';
}

/// The `Authentication*` family, discriminated by the subtype `i32` at the front of the body.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-AUTHENTICATIONOK>
#[derive(Debug)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    Unsupported { subtype: i32 },
}

/// A single backend message, tagged by direction so that `'S'`/`'D'`/`'C'`/`'E'` can never be
/// confused with their frontend-side reuse.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery { status: u8 },
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    RowDescription(Arc<[FieldDescriptor]>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    EmptyQueryResponse,
    NoData,
    /// A message type this core does not interpret (e.g. `NoticeResponse` sub-fields it is not
    /// asked to parse, or extended-query messages outside this core's scope).
    Unknown { tag: u8, body: Bytes },
}

/// Decode one complete frame (tag already stripped, `body` is exactly `length` bytes after the
/// 4-byte length prefix) into a [`BackendMessage`].
pub fn decode(tag: u8, mut body: Bytes) -> Result<BackendMessage, ProtocolError> {
    use self::tag as t;

    Ok(match tag {
        t::AUTHENTICATION => BackendMessage::Authentication(decode_authentication(body)?),
        t::PARAMETER_STATUS => {
            let name = read_cstring(&mut body);
            let value = read_cstring(&mut body);
            BackendMessage::ParameterStatus { name: name.to_string(), value: value.to_string() }
        }
        t::BACKEND_KEY_DATA => {
            if body.len() < 8 {
                return Err(ProtocolError::new("truncated BackendKeyData"));
            }
            BackendMessage::BackendKeyData { process_id: body.get_i32(), secret_key: body.get_i32() }
        }
        t::READY_FOR_QUERY => {
            let status = body.first().copied().unwrap_or(b'I');
            BackendMessage::ReadyForQuery { status }
        }
        t::ERROR_RESPONSE => BackendMessage::ErrorResponse(parse_key_value_pairs(body)),
        t::NOTICE_RESPONSE => BackendMessage::NoticeResponse(parse_key_value_pairs(body)),
        t::ROW_DESCRIPTION => BackendMessage::RowDescription(Arc::from(parse_row_description(body))),
        t::DATA_ROW => BackendMessage::DataRow(parse_data_row(body)),
        t::COMMAND_COMPLETE => BackendMessage::CommandComplete(read_cstring(&mut body).to_string()),
        t::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        t::NO_DATA => BackendMessage::NoData,
        other => BackendMessage::Unknown { tag: other, body },
    })
}

fn decode_authentication(mut body: Bytes) -> Result<Authentication, ProtocolError> {
    if body.len() < 4 {
        return Err(ProtocolError::new("truncated Authentication message"));
    }
    let subtype = body.get_i32();
    Ok(match subtype {
        0 => Authentication::Ok,
        3 => Authentication::CleartextPassword,
        5 => {
            if body.len() < 4 {
                return Err(ProtocolError::new("truncated AuthenticationMD5Password"));
            }
            let mut salt = [0u8; 4];
            body.copy_to_slice(&mut salt);
            Authentication::Md5Password { salt }
        }
        10 => {
            let mut mechanisms = Vec::new();
            loop {
                if body.is_empty() {
                    break;
                }
                if body[0] == 0 {
                    break;
                }
                mechanisms.push(read_cstring(&mut body).to_string());
            }
            Authentication::Sasl { mechanisms }
        }
        11 => Authentication::SaslContinue { data: body },
        12 => Authentication::SaslFinal { data: body },
        other => Authentication::Unsupported { subtype: other },
    })
}

/// Scan `buf` for a `0` byte, returning the UTF-8 decode of the span preceding it and advancing
/// `buf` past the terminator. If no terminator is found, returns what was read and drains `buf`
/// to empty rather than erroring on truncated input.
pub fn read_cstring(buf: &mut Bytes) -> ByteStr {
    match buf.iter().position(|&b| b == 0) {
        Some(pos) => {
            let value = buf.split_to(pos);
            buf.advance(1); // the nul
            ByteStr::from_utf8(value).unwrap_or_else(|_| ByteStr::copy_from_str(""))
        }
        None => {
            let value = buf.split_to(buf.len());
            ByteStr::from_utf8(value).unwrap_or_else(|_| ByteStr::copy_from_str(""))
        }
    }
}

/// `ErrorResponse`/`NoticeResponse` field mapping: a 1-byte field code followed by a
/// null-terminated string, repeated until a standalone `0` byte or end of buffer.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug, Default, Clone)]
pub struct ErrorFields(HashMap<char, String>);

impl ErrorFields {
    /// Look up a single-character field code, e.g. `'C'` for SQLSTATE.
    pub fn field(&self, code: char) -> Option<&str> {
        self.0.get(&code).map(String::as_str)
    }

    /// `S`: severity (or `V`, the non-localized variant, when present).
    pub fn severity(&self) -> Option<&str> {
        self.field('V').or_else(|| self.field('S'))
    }

    /// `C`: the SQLSTATE code.
    pub fn code(&self) -> Option<&str> {
        self.field('C')
    }

    /// `M`: the primary human-readable message.
    pub fn message(&self) -> &str {
        self.field('M').unwrap_or("")
    }

    /// `D`: an optional secondary message carrying more detail.
    pub fn detail(&self) -> Option<&str> {
        self.field('D')
    }

    /// `H`: an optional suggestion of what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.field('H')
    }
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{} ({code})", self.message()),
            None => f.write_str(self.message()),
        }
    }
}

pub fn parse_key_value_pairs(mut body: Bytes) -> ErrorFields {
    let mut fields = HashMap::new();
    loop {
        let Some(&code) = body.first() else { break };
        if code == 0 {
            break;
        }
        body.advance(1);
        let value = read_cstring(&mut body);
        fields.insert(code as char, value.to_string());
    }
    ErrorFields(fields)
}

/// The parsed form of a `CommandComplete` tag, e.g. `"INSERT 0 1"` or `"SELECT 3"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag {
    pub command: String,
    pub row_count: u64,
    pub oid: Option<u32>,
}

/// Parse a `CommandComplete` tag string: three space-separated tokens starting with
/// (case-insensitively) `INSERT` carry an oid and a row count; anything else takes
/// its row count from the last whitespace-separated token, defaulting to zero when that token
/// isn't an integer.
pub fn parse_command_complete(tag: &str) -> CommandTag {
    let tokens: Vec<&str> = tag.split(' ').filter(|s| !s.is_empty()).collect();

    let Some(&command) = tokens.first() else {
        return CommandTag { command: String::new(), row_count: 0, oid: None };
    };

    if tokens.len() == 3 && command.eq_ignore_ascii_case("INSERT") {
        let oid = tokens[1].parse().ok();
        let row_count = tokens[2].parse().unwrap_or(0);
        return CommandTag { command: command.to_owned(), row_count, oid };
    }

    let row_count = tokens.last().and_then(|t| t.parse().ok()).unwrap_or(0);
    CommandTag { command: command.to_owned(), row_count, oid: None }
}

/// `RowDescription`: a field count followed by that many field records.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-ROWDESCRIPTION>
pub fn parse_row_description(mut body: Bytes) -> Vec<FieldDescriptor> {
    if body.len() < 2 {
        return Vec::new();
    }
    let field_count = body.get_i16();
    let mut fields = Vec::with_capacity(field_count.max(0) as usize);

    for _ in 0..field_count {
        // name + table_oid(4) + column_attr_num(2) + data_type_oid(4) + data_type_size(2)
        // + type_modifier(4) + format(2)
        if body.is_empty() {
            break;
        }
        let name = read_cstring(&mut body);
        if body.len() < 18 {
            break;
        }
        fields.push(FieldDescriptor {
            name,
            table_oid: body.get_i32(),
            column_attr_num: body.get_i16(),
            data_type_oid: body.get_i32(),
            data_type_size: body.get_i16(),
            type_modifier: body.get_i32(),
            format: body.get_i16(),
        });
    }

    fields
}

/// `DataRow`: a column count followed by, for each column, a 4-byte length (`-1` for `NULL`)
/// and that many raw value bytes.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-DATAROW>
pub fn parse_data_row(mut body: Bytes) -> Vec<Option<Bytes>> {
    if body.len() < 2 {
        return Vec::new();
    }
    let column_count = body.get_i16();
    let mut values = Vec::with_capacity(column_count.max(0) as usize);

    for _ in 0..column_count {
        if body.len() < 4 {
            break;
        }
        let len = body.get_i32();
        if len == -1 {
            values.push(None);
            continue;
        }
        let len = len.max(0) as usize;
        if body.len() < len {
            values.push(Some(body.split_to(body.len())));
            break;
        }
        values.push(Some(body.split_to(len)));
    }

    values
}

/// Split a SCRAM attribute-value list (`"r=...,s=...,i=..."`) on `,`, then each entry on the
/// *first* `=` so that values (e.g. a base64 salt) may themselves contain `=`.
pub fn parse_scram_params(s: &str) -> HashMap<&str, &str> {
    s.split(',')
        .filter_map(|pair| pair.split_once('='))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_complete_insert() {
        let tag = parse_command_complete("INSERT 12345 7");
        assert_eq!(tag.command, "INSERT");
        assert_eq!(tag.oid, Some(12345));
        assert_eq!(tag.row_count, 7);
    }

    #[test]
    fn command_complete_select() {
        let tag = parse_command_complete("SELECT 42");
        assert_eq!(tag.command, "SELECT");
        assert_eq!(tag.row_count, 42);
        assert_eq!(tag.oid, None);
    }

    #[test]
    fn command_complete_no_count() {
        let tag = parse_command_complete("VACUUM");
        assert_eq!(tag.command, "VACUUM");
        assert_eq!(tag.row_count, 0);
        assert_eq!(tag.oid, None);
    }

    #[test]
    fn cstring_without_terminator_reads_to_end() {
        let mut buf = Bytes::from_static(b"no-terminator");
        let s = read_cstring(&mut buf);
        assert_eq!(&*s, "no-terminator");
        assert!(buf.is_empty());
    }

    #[test]
    fn data_row_null_and_value() {
        let mut body = bytes::BytesMut::new();
        body.extend_from_slice(&2i16.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(b"x");

        let values = parse_data_row(body.freeze());
        assert_eq!(values.len(), 2);
        assert!(values[0].is_none());
        assert_eq!(values[1].as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn scram_params_value_may_contain_equals() {
        let params = parse_scram_params("r=abc,s=YWJj,i=4096,x=a=b");
        assert_eq!(params.get("r"), Some(&"abc"));
        assert_eq!(params.get("s"), Some(&"YWJj"));
        assert_eq!(params.get("i"), Some(&"4096"));
        assert_eq!(params.get("x"), Some(&"a=b"));
    }

    #[test]
    fn error_fields_roundtrip() {
        let mut body = bytes::BytesMut::new();
        body.extend_from_slice(b"SERROR\0");
        body.extend_from_slice(b"C42P01\0");
        body.extend_from_slice(b"Mrelation does not exist\0");
        body.extend_from_slice(b"\0");

        let fields = parse_key_value_pairs(body.freeze());
        assert_eq!(fields.code(), Some("42P01"));
        assert_eq!(fields.message(), "relation does not exist");
    }
}
