//! Shared helpers for the integration suite: a tiny frame-writer and a SCRAM-SHA-256 server
//! double, since no live Postgres server is assumed reachable while testing this core.
use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

/// Write a length-prefixed backend frame `[tag][len][body]`.
pub async fn send_frame<W: AsyncWrite + Unpin>(w: &mut W, tag: u8, body: &[u8]) {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_i32((body.len() + 4) as i32);
    buf.extend_from_slice(body);
    w.write_all(&buf).await.unwrap();
}

/// Drain the untyped Startup frame the client sends first.
pub async fn drain_startup<S: AsyncRead + Unpin>(server: &mut S) {
    let mut len_buf = [0u8; 4];
    server.read_exact(&mut len_buf).await.unwrap();
    let len = i32::from_be_bytes(len_buf) as usize;
    let mut rest = vec![0u8; len - 4];
    server.read_exact(&mut rest).await.unwrap();
}

/// Read one complete typed frame the client sends, returning `(tag, body)`.
pub async fn read_frame<S: AsyncRead + Unpin>(server: &mut S) -> (u8, Vec<u8>) {
    let mut tag = [0u8; 1];
    server.read_exact(&mut tag).await.unwrap();
    let mut len_buf = [0u8; 4];
    server.read_exact(&mut len_buf).await.unwrap();
    let len = i32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len - 4];
    server.read_exact(&mut body).await.unwrap();
    (tag[0], body)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// RFC 5802's `Hi(str, salt, i)`, duplicated here (not exported by the crate) so the test double
/// can play the server side of the exchange.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(password).unwrap();
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = u;
    for _ in 1..iterations {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(password).unwrap();
        mac.update(&u);
        u = mac.finalize().into_bytes().into();
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    result
}

/// A minimal SCRAM-SHA-256 server double: knows the expected password in cleartext, verifies the
/// client's proof against it, and signs its own `server-final-message` the same way a real
/// backend would. Used to exercise the client's SCRAM engine end-to-end rather than trusting the
/// RFC test vector alone.
pub struct ScramServer {
    password: String,
    salt: [u8; 16],
    iterations: u32,
}

impl ScramServer {
    pub fn new(password: &str) -> Self {
        Self { password: password.to_owned(), salt: *b"0123456789abcdef", iterations: 4096 }
    }

    /// Drive the three SASL round-trips over `server`. Returns `Ok(())` if the exchange
    /// completed (the client's proof matched), `Err(())` if it was rejected.
    pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(&self, server: &mut S) -> Result<(), ()> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

        let mut mechs = Vec::new();
        mechs.extend_from_slice(b"SCRAM-SHA-256\0");
        mechs.push(0);
        let mut body = BytesMut::new();
        body.put_i32(10);
        body.extend_from_slice(&mechs);
        send_frame(server, b'R', &body).await;

        let (tag, sasl_init_body) = read_frame(server).await;
        assert_eq!(tag, b'p');
        let nul = sasl_init_body.iter().position(|&b| b == 0).unwrap();
        let mut rest = &sasl_init_body[nul + 1..];
        let client_first_len = i32::from_be_bytes(rest[..4].try_into().unwrap()) as usize;
        rest = &rest[4..];
        let client_first = std::str::from_utf8(&rest[..client_first_len]).unwrap();

        let client_first_bare = client_first.strip_prefix("n,,").unwrap();
        let client_nonce = client_first_bare.rsplit("r=").next().unwrap();

        let server_nonce = format!("{client_nonce}server-half");
        let salt_b64 = BASE64.encode(self.salt);
        let server_first = format!("r={server_nonce},s={salt_b64},i={}", self.iterations);

        let mut sf_body = BytesMut::new();
        sf_body.put_i32(11);
        sf_body.extend_from_slice(server_first.as_bytes());
        send_frame(server, b'R', &sf_body).await;

        let (tag, client_final_body) = read_frame(server).await;
        assert_eq!(tag, b'p');
        let client_final = std::str::from_utf8(&client_final_body).unwrap();

        let client_final_without_proof = client_final.rsplit_once(",p=").map(|(a, _)| a).unwrap();
        let proof_b64 = client_final.rsplit_once(",p=").map(|(_, b)| b).unwrap();
        let client_proof = BASE64.decode(proof_b64).unwrap();

        let salted_password = hi(self.password.as_bytes(), &self.salt, self.iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let auth_message = format!("{client_first_bare},{server_first},{client_final_without_proof}");
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

        let mut recovered_client_key = [0u8; 32];
        for i in 0..32 {
            recovered_client_key[i] = client_proof[i] ^ client_signature[i];
        }
        let recovered_stored_key = Sha256::digest(recovered_client_key);

        if recovered_stored_key.as_slice() != stored_key.as_slice() {
            let mut final_body = BytesMut::new();
            final_body.put_i32(12);
            final_body.extend_from_slice(b"e=invalid-proof");
            send_frame(server, b'R', &final_body).await;
            return Err(());
        }

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
        let v_b64 = BASE64.encode(server_signature);
        let server_final = format!("v={v_b64}");

        let mut fin_body = BytesMut::new();
        fin_body.put_i32(12);
        fin_body.extend_from_slice(server_final.as_bytes());
        send_frame(server, b'R', &fin_body).await;

        send_frame(server, b'R', &0i32.to_be_bytes()).await; // AuthenticationOk
        Ok(())
    }
}
