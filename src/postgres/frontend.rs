//! Frontend (client-to-server) messages: encoders that build outbound frames.
//!
//! Every client-to-server frame except [`Startup`] is `[type: u8][length: i32 BE][body]`, where
//! `length` includes itself but not the type byte. [`Startup`] is the one untyped frame: it is
//! only ever sent, never received, so it does not share [`BackendMessage`]'s or any frontend
//! `Tag` namespace.
//!
//! [`BackendMessage`]: crate::postgres::backend::BackendMessage
use bytes::{BufMut, BytesMut};

use crate::ext::{BufMutExt, StrExt, UsizeExt};
use crate::postgres::PROTOCOL_VERSION;

/// Message-type bytes the frontend sends. `'p'` is reused for cleartext, MD5, and SASL
/// responses alike; which one the server expects is tracked by the authentication state
/// machine, not by the wire.
pub mod tag {
    pub const QUERY: u8 = b'Q';
    pub const PASSWORD_MESSAGE: u8 = b'p';
    pub const TERMINATE: u8 = b'X';
}

/// The untyped startup frame: `[length][protocol version][(key\0 value\0)*][\0]`.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-STARTUPMESSAGE>
pub fn encode_startup(buf: &mut BytesMut, user: &str, database: &str, client_encoding: &str) {
    let params: [(&str, &str); 3] =
        [("user", user), ("database", database), ("client_encoding", client_encoding)];

    let body_len: u32 = params
        .iter()
        .map(|(k, v)| k.nul_string_len() + v.nul_string_len())
        .sum::<u32>()
        + 1; // trailing nul

    let len = 4 /* version */ + body_len + 4 /* length itself */;

    buf.put_i32(len.try_into().expect("startup message too large"));
    buf.put_i32(PROTOCOL_VERSION);
    for (k, v) in params {
        buf.put_nul_string(k);
        buf.put_nul_string(v);
    }
    buf.put_u8(0);
}

/// `Query`: a single SQL string, nul-terminated.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-QUERY>
pub fn encode_query(buf: &mut BytesMut, sql: &str) {
    buf.put_u8(tag::QUERY);
    buf.put_i32((4 + sql.nul_string_len()) as i32);
    buf.put_nul_string(sql);
}

/// `PasswordMessage`, reused for cleartext/MD5 responses (`with_terminator = true`) and for
/// SCRAM client-first/client-final follow-ups sent as plain `'p'` frames (`with_terminator =
/// false`, since those bodies are not C strings).
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-PASSWORDMESSAGE>
pub fn encode_password(buf: &mut BytesMut, bytes: &[u8], with_terminator: bool) {
    let extra = if with_terminator { 1 } else { 0 };
    buf.put_u8(tag::PASSWORD_MESSAGE);
    buf.put_i32((4 + bytes.len() + extra).to_u32() as i32);
    buf.put_slice(bytes);
    if with_terminator {
        buf.put_u8(0);
    }
}

/// `SASLInitialResponse`: `mechanism\0` followed by a 4-byte length-prefixed `client_first`.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-SASLINITIALRESPONSE>
pub fn encode_sasl_initial(buf: &mut BytesMut, mechanism: &str, client_first: &[u8]) {
    let len = 4 + mechanism.nul_string_len() as usize + 4 + client_first.len();
    buf.put_u8(tag::PASSWORD_MESSAGE);
    buf.put_i32(len as i32);
    buf.put_nul_string(mechanism);
    buf.put_i32(client_first.len().to_u32() as i32);
    buf.put_slice(client_first);
}

/// `Terminate`: the fixed 5-byte frame `[0x58, 0, 0, 0, 4]`.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-TERMINATE>
pub fn encode_terminate(buf: &mut BytesMut) {
    buf.put_u8(tag::TERMINATE);
    buf.put_i32(4);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn startup_roundtrips_params() {
        let mut buf = BytesMut::new();
        encode_startup(&mut buf, "alice", "alice", "UTF8");

        let len = (&buf[0..4]).get_i32();
        assert_eq!(len as usize, buf.len());

        let mut body = buf.split_off(4).freeze();
        assert_eq!(body.get_i32(), PROTOCOL_VERSION);

        let mut params = Vec::new();
        loop {
            if body.is_empty() || body[0] == 0 {
                break;
            }
            let key = crate::postgres::backend::read_cstring(&mut body);
            let value = crate::postgres::backend::read_cstring(&mut body);
            params.push((key.to_string(), value.to_string()));
        }

        assert_eq!(
            params,
            vec![
                ("user".into(), "alice".into()),
                ("database".into(), "alice".into()),
                ("client_encoding".into(), "UTF8".into()),
            ]
        );
    }

    #[test]
    fn terminate_is_five_fixed_bytes() {
        let mut buf = BytesMut::new();
        encode_terminate(&mut buf);
        assert_eq!(&buf[..], &[0x58, 0, 0, 0, 4]);
    }

    #[test]
    fn query_length_excludes_tag_byte() {
        let mut buf = BytesMut::new();
        encode_query(&mut buf, "SELECT 1");
        assert_eq!(buf[0], tag::QUERY);
        let len = (&buf[1..5]).get_i32() as usize;
        assert_eq!(len + 1, buf.len());
    }
}
