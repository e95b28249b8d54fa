//! SCRAM-SHA-256 client-side exchange (RFC 5802, RFC 7677).
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::postgres::backend::parse_scram_params;

type HmacSha256 = Hmac<Sha256>;

const CLIENT_KEY: &[u8] = b"Client Key";
const SERVER_KEY: &[u8] = b"Server Key";
/// Base64 of the GS2 header `n,,` (no channel binding, no authzid).
const CBIND_B64: &str = "biws";

/// SCRAM-SHA-256 client state, alive only for the duration of one authentication exchange.
pub struct ScramClient {
    client_nonce: String,
    client_first_message_bare: String,
    client_first_message: String,
    server_nonce: Option<String>,
    salt: Option<Vec<u8>>,
    iterations: Option<u32>,
    salted_password: Option<[u8; 32]>,
    auth_message: Option<String>,
    client_final_message: Option<String>,
}

/// A failure in the SCRAM exchange: a malformed server message, a nonce that doesn't extend the
/// client's, or (in [`ScramClient::verify_server_final`]) a signature mismatch. All are fatal to
/// the connection per the authentication state machine.
#[derive(Debug)]
pub enum ScramError {
    MissingField(char),
    InvalidUtf8,
    InvalidBase64,
    InvalidIterationCount,
    NonceMismatch,
    ServerRejected(String),
    SignatureMismatch,
    InvalidState,
}

impl std::error::Error for ScramError {}

impl fmt::Display for ScramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(c) => write!(f, "SCRAM message missing field {c:?}"),
            Self::InvalidUtf8 => write!(f, "SCRAM message was not valid UTF-8"),
            Self::InvalidBase64 => write!(f, "SCRAM message contained invalid base64"),
            Self::InvalidIterationCount => write!(f, "SCRAM message contained invalid iteration count"),
            Self::NonceMismatch => write!(f, "server nonce does not extend client nonce"),
            Self::ServerRejected(msg) => write!(f, "server rejected SCRAM exchange: {msg}"),
            Self::SignatureMismatch => write!(f, "SCRAM server signature did not match"),
            Self::InvalidState => write!(f, "SCRAM method called before continue_with_server_first"),
        }
    }
}

impl ScramClient {
    /// Begin an exchange: draw a fresh client nonce and build `client-first-message`.
    pub fn new(user: &str) -> Self {
        let mut nonce_bytes = [0u8; 18];
        rand::Rng::fill(&mut rand::rng(), &mut nonce_bytes);
        let client_nonce = BASE64.encode(nonce_bytes);

        let client_first_message_bare = format!("n={},r={}", sasl_name(user), client_nonce);
        let client_first_message = format!("n,,{client_first_message_bare}");

        Self {
            client_nonce,
            client_first_message_bare,
            client_first_message,
            server_nonce: None,
            salt: None,
            iterations: None,
            salted_password: None,
            auth_message: None,
            client_final_message: None,
        }
    }

    /// The `client-first-message` to send as a `SASLInitialResponse`.
    pub fn client_first_message(&self) -> &str {
        &self.client_first_message
    }

    /// Consume the server's `server-first-message`, derive the client proof, and build
    /// `client-final-message`. Once this returns successfully, `salt`, `iterations`, and the
    /// server nonce are fixed for the remainder of the exchange.
    pub fn continue_with_server_first(&mut self, body: &[u8], password: &str) -> Result<(), ScramError> {
        let server_first_message = std::str::from_utf8(body).map_err(|_| ScramError::InvalidUtf8)?;
        let params = parse_scram_params(server_first_message);

        let server_nonce = *params.get("r").ok_or(ScramError::MissingField('r'))?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceMismatch);
        }

        let salt_b64 = *params.get("s").ok_or(ScramError::MissingField('s'))?;
        let salt = BASE64.decode(salt_b64).map_err(|_| ScramError::InvalidBase64)?;

        let iterations: u32 = params
            .get("i")
            .ok_or(ScramError::MissingField('i'))?
            .parse()
            .map_err(|_| ScramError::InvalidIterationCount)?;

        // NFKC is a simplification of full SASLprep (RFC 4013), which additionally prohibits
        // control characters and maps certain non-ASCII spaces; printable-ASCII passwords are
        // unaffected by the difference.
        let normalized_password: String = password.nfkc().collect();
        let salted_password = hi(normalized_password.as_bytes(), &salt, iterations);

        let client_key = hmac_sha256(&salted_password, CLIENT_KEY);
        let stored_key = Sha256::digest(client_key);

        let client_final_message_without_proof = format!("c={CBIND_B64},r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare, server_first_message, client_final_message_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        self.client_final_message = Some(format!(
            "{client_final_message_without_proof},p={}",
            BASE64.encode(client_proof)
        ));
        self.server_nonce = Some(server_nonce.to_owned());
        self.salt = Some(salt);
        self.iterations = Some(iterations);
        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);

        Ok(())
    }

    /// The `client-final-message` to send as a follow-up `'p'` frame (no trailing NUL).
    pub fn client_final_message(&self) -> Result<&str, ScramError> {
        self.client_final_message.as_deref().ok_or(ScramError::InvalidState)
    }

    /// Verify the server's `server-final-message` against the expected server signature.
    pub fn verify_server_final(&self, body: &[u8]) -> Result<(), ScramError> {
        let server_final_message = std::str::from_utf8(body).map_err(|_| ScramError::InvalidUtf8)?;

        if let Some(err) = server_final_message.strip_prefix("e=") {
            return Err(ScramError::ServerRejected(err.to_owned()));
        }

        let params = parse_scram_params(server_final_message);
        let v_b64 = *params.get("v").ok_or(ScramError::MissingField('v'))?;
        let server_signature = BASE64.decode(v_b64).map_err(|_| ScramError::InvalidBase64)?;

        let salted_password = self.salted_password.ok_or(ScramError::InvalidState)?;
        let auth_message = self.auth_message.as_deref().ok_or(ScramError::InvalidState)?;

        let server_key = hmac_sha256(&salted_password, SERVER_KEY);
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());

        if constant_time_eq(&expected, &server_signature) {
            Ok(())
        } else {
            Err(ScramError::SignatureMismatch)
        }
    }
}

/// SASLprep's name-escaping rule: `=` becomes `=3D`, `,` becomes `=2C`.
fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts a key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// RFC 5802's `Hi(str, salt, i)`: PBKDF2-HMAC-SHA-256 with a 32-byte output, computed directly
/// atop `hmac`/`sha2` rather than pulling in a separate `pbkdf2` dependency.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(password).expect("HMAC accepts a key of any size");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = u;

    for _ in 1..iterations {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(password).expect("HMAC accepts a key of any size");
        mac.update(&u);
        u = mac.finalize().into_bytes().into();
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }

    result
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare without branching on the first differing byte, so a timing side-channel can't be
/// used to guess the server signature one byte at a time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
