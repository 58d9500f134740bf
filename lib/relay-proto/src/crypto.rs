//! Password hashing, the nonce-challenge secretbox primitive, and base64
//! helpers shared by the auth state machine and the admin CLI.

use aead::{Aead, KeyInit};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use rand::RngCore;
use xsalsa20poly1305::{Nonce, XSalsa20Poly1305};
use zeroize::Zeroize;

pub const SALT_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const MAC_SIZE: usize = 16;
/// `nonce24 || secretbox(u32)` — 24 + 4 + 16.
pub const NONCE_HASH_SIZE: usize = NONCE_SIZE + 4 + MAC_SIZE;

/// `opslimit=INTERACTIVE, memlimit=128 MiB, alg=Argon2id v1.3`.
const ARGON2_MEMORY_KIB: u32 = 128 * 1024;
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;

#[derive(Debug)]
pub enum CryptoError {
    HashFailed,
    DecryptFailed,
    BadEncoding,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::HashFailed => write!(f, "argon2 hash failed"),
            CryptoError::DecryptFailed => write!(f, "secretbox decryption failed"),
            CryptoError::BadEncoding => write!(f, "base64 decode produced unexpected length"),
        }
    }
}

impl std::error::Error for CryptoError {}

fn argon2() -> Argon2<'static> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(KEY_SIZE),
    )
    .expect("static argon2 params are valid");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Derives the 32-byte secretbox key from a password and a 16-byte salt.
pub fn derive_key(password: &[u8], salt: &[u8; SALT_SIZE]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let mut out = [0u8; KEY_SIZE];
    argon2()
        .hash_password_into(password, salt, &mut out)
        .map_err(|_| CryptoError::HashFailed)?;
    Ok(out)
}

pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub fn random_nonce32() -> u32 {
    rand::thread_rng().next_u32()
}

fn random_nonce24() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Builds `nonce24 || secretbox(plaintext = nonce_le_bytes, key = pwkey, nonce = nonce24)`.
pub fn seal_nonce_challenge(key: &[u8; KEY_SIZE], challenge: u32) -> [u8; NONCE_HASH_SIZE] {
    let nonce24 = random_nonce24();
    let cipher = XSalsa20Poly1305::new_from_slice(key).expect("32-byte key");
    let mut plaintext = [0u8; 4];
    LittleEndian::write_u32(&mut plaintext, challenge);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce24), plaintext.as_ref())
        .expect("secretbox encryption of 4 bytes cannot fail");

    let mut out = [0u8; NONCE_HASH_SIZE];
    out[..NONCE_SIZE].copy_from_slice(&nonce24);
    out[NONCE_SIZE..].copy_from_slice(&sealed);
    out
}

/// Decrypts `nonce_hash` with `key` and reports whether the enclosed 32-bit
/// integer equals `expected`.
pub fn verify_nonce_challenge(
    key: &[u8; KEY_SIZE],
    nonce_hash: &[u8; NONCE_HASH_SIZE],
    expected: u32,
) -> bool {
    let nonce24 = &nonce_hash[..NONCE_SIZE];
    let sealed = &nonce_hash[NONCE_SIZE..];
    let cipher = match XSalsa20Poly1305::new_from_slice(key) {
        Ok(c) => c,
        Err(_) => return false,
    };
    let plaintext = match cipher.decrypt(Nonce::from_slice(nonce24), sealed) {
        Ok(p) => p,
        Err(_) => return false,
    };
    if plaintext.len() != 4 {
        return false;
    }
    LittleEndian::read_u32(&plaintext) == expected
}

/// `salt || key`, base64 standard-with-padding encoded, for the
/// `user_account.password_b64` column.
pub fn encode_password_blob(salt: &[u8; SALT_SIZE], key: &[u8; KEY_SIZE]) -> String {
    let mut buf = Vec::with_capacity(SALT_SIZE + KEY_SIZE);
    buf.extend_from_slice(salt);
    buf.extend_from_slice(key);
    let encoded = BASE64.encode(&buf);
    buf.zeroize();
    encoded
}

pub fn decode_password_blob(blob: &str) -> Result<([u8; SALT_SIZE], [u8; KEY_SIZE]), CryptoError> {
    let raw = BASE64.decode(blob).map_err(|_| CryptoError::BadEncoding)?;
    if raw.len() != SALT_SIZE + KEY_SIZE {
        return Err(CryptoError::BadEncoding);
    }
    let mut salt = [0u8; SALT_SIZE];
    let mut key = [0u8; KEY_SIZE];
    salt.copy_from_slice(&raw[..SALT_SIZE]);
    key.copy_from_slice(&raw[SALT_SIZE..]);
    Ok((salt, key))
}

/// Encodes an arbitrary payload to base64, rejecting anything that would not
/// decode back to exactly `expected_len` bytes — used for the store-and-
/// forward queue's size cap.
pub fn encode_payload(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64.decode(encoded).map_err(|_| CryptoError::BadEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_blob_round_trips() {
        let salt = random_salt();
        let key = derive_key(b"hunter2", &salt).unwrap();
        let blob = encode_password_blob(&salt, &key);
        let (salt2, key2) = decode_password_blob(&blob).unwrap();
        assert_eq!(salt, salt2);
        assert_eq!(key, key2);
    }

    #[test]
    fn nonce_challenge_round_trips() {
        let salt = random_salt();
        let key = derive_key(b"correct horse", &salt).unwrap();
        let n = random_nonce32();
        let sealed = seal_nonce_challenge(&key, n);
        assert!(verify_nonce_challenge(&key, &sealed, n));
        assert!(!verify_nonce_challenge(&key, &sealed, n.wrapping_add(1)));
    }

    #[test]
    fn nonce_challenge_rejects_wrong_key() {
        let salt = random_salt();
        let key_a = derive_key(b"a", &salt).unwrap();
        let key_b = derive_key(b"b", &salt).unwrap();
        let n = random_nonce32();
        let sealed = seal_nonce_challenge(&key_a, n);
        assert!(!verify_nonce_challenge(&key_b, &sealed, n));
    }

    #[test]
    fn decode_password_blob_rejects_bad_length() {
        let short = BASE64.encode(b"too short");
        assert!(decode_password_blob(&short).is_err());
    }
}
