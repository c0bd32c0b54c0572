//! SCRAM-SHA-256 authentication for PostgreSQL (RFC 5802 / RFC 7677).
//!
//! Channel binding is not offered; the client always sends the `n,,`
//! GS2 header.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{PgError, PgResult};

type HmacSha256 = Hmac<Sha256>;

/// SCRAM-SHA-256 client state machine.
///
/// ```rust,ignore
/// let mut scram = ScramClient::new("postgres", "secret");
/// send(scram.client_first_message());
/// send(scram.process_server_first(&server_first)?);
/// scram.verify_server_final(&server_final)?;
/// ```
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
    client_first_bare: String,
    auth_message: String,
    salted_password: [u8; 32],
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let bytes: [u8; 18] = rand::thread_rng().r#gen();
        Self::with_nonce(username, password, &STANDARD.encode(bytes))
    }

    /// Use a fixed client nonce instead of a random one.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.replace('=', "=3D").replace(',', "=2C"),
            password: password.to_string(),
            nonce: nonce.to_string(),
            client_first_bare: String::new(),
            auth_message: String::new(),
            salted_password: [0; 32],
        }
    }

    /// The client-first-message sent in SASLInitialResponse.
    pub fn client_first_message(&mut self) -> Vec<u8> {
        self.client_first_bare = format!("n={},r={}", self.username, self.nonce);
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consume the server-first-message and produce the client-final-message.
    pub fn process_server_first(&mut self, server_first: &[u8]) -> PgResult<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| auth_error("server-first-message is not UTF-8"))?;

        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                server_nonce = Some(v);
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(v);
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = v.parse::<u32>().ok();
            }
        }
        let server_nonce = server_nonce.ok_or_else(|| auth_error("missing server nonce"))?;
        let salt = salt.ok_or_else(|| auth_error("missing salt"))?;
        let iterations = iterations
            .filter(|&i| i > 0)
            .ok_or_else(|| auth_error("missing or invalid iteration count"))?;

        if !server_nonce.starts_with(&self.nonce) || server_nonce.len() == self.nonce.len() {
            return Err(auth_error("server nonce does not extend the client nonce"));
        }
        let salt = STANDARD
            .decode(salt)
            .map_err(|_| auth_error("salt is not valid base64"))?;

        self.salted_password = hi(self.password.as_bytes(), &salt, iterations)?;

        let without_proof = format!("c=biws,r={}", server_nonce);
        self.auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_key = hmac(&self.salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);
        let signature = hmac(&stored_key, self.auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        Ok(format!("{},p={}", without_proof, STANDARD.encode(proof)).into_bytes())
    }

    /// Check the server's signature in the server-final-message.
    pub fn verify_server_final(&self, server_final: &[u8]) -> PgResult<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| auth_error("server-final-message is not UTF-8"))?;
        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(PgError::Auth(format!("server rejected SCRAM exchange: {}", reason)));
        }
        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| auth_error("missing server signature"))?;
        let received = STANDARD
            .decode(verifier)
            .map_err(|_| auth_error("server signature is not valid base64"))?;

        let server_key = hmac(&self.salted_password, b"Server Key")?;
        let expected = hmac(&server_key, self.auth_message.as_bytes())?;
        if received.as_slice() == expected.as_slice() {
            Ok(())
        } else {
            Err(auth_error("server signature mismatch"))
        }
    }
}

fn auth_error(message: &str) -> PgError {
    PgError::Auth(message.to_string())
}

fn hmac(key: &[u8], message: &[u8]) -> PgResult<[u8; 32]> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| auth_error("invalid HMAC key length"))?;
    mac.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Hi() from RFC 5802: PBKDF2 with HMAC-SHA-256 and a single output block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> PgResult<[u8; 32]> {
    let mut first = salt.to_vec();
    first.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &first)?;
    let mut result = u;
    for _ in 1..iterations {
        u = hmac(password, &u)?;
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vector from RFC 7677, section 3.
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    #[test]
    fn test_rfc7677_exchange() {
        let mut scram = ScramClient::with_nonce("user", "pencil", CLIENT_NONCE);
        assert_eq!(
            scram.client_first_message(),
            b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec()
        );

        let client_final = scram.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        scram
            .verify_server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
    }

    #[test]
    fn test_wrong_server_signature() {
        let mut scram = ScramClient::with_nonce("user", "pencil", CLIENT_NONCE);
        scram.client_first_message();
        scram.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        let err = scram
            .verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(matches!(err, PgError::Auth(_)));
    }

    #[test]
    fn test_server_nonce_must_extend_client_nonce() {
        let mut scram = ScramClient::with_nonce("user", "pencil", CLIENT_NONCE);
        scram.client_first_message();
        let err = scram
            .process_server_first(b"r=somethingelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert!(matches!(err, PgError::Auth(_)));
    }

    #[test]
    fn test_random_nonces_differ() {
        let mut a = ScramClient::new("u", "p");
        let mut b = ScramClient::new("u", "p");
        assert_ne!(a.client_first_message(), b.client_first_message());
    }
}
