//! Key material and permission MACs
//!
//! The per-object file key is never stored in the clear. Each permission
//! carries a wrap of the file key produced by XORing it against
//! `sha256(masterKey ':' hex(permissionIV))`, plus a MAC binding the grantee,
//! the five capability bits, and the wrapped key under the same master key.
//! Recovering the file key is the same XOR applied again.

mod stream;

use std::fmt;

use sha2::{Digest, Sha256};

pub use stream::{
    adjust_iv, apply_ctr, ByteRange, ContentCipher, RangeWindow, CIPHER_BLOCK_SIZE,
};

/// Size of file keys and permission IVs in bytes (256 bits)
pub const KEY_SIZE: usize = 32;
/// Size of the content cipher IV in bytes (AES block size)
pub const CONTENT_IV_SIZE: usize = 16;

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("master key must not be empty")]
    EmptyMasterKey,
    #[error("refusing to wrap {0} bytes, key wrap covers at most a sha256 hash")]
    WrapTooLong(usize),
    #[error("invalid key size, expected {expected}, got {got}")]
    KeySize { expected: usize, got: usize },
    #[error("invalid iv size, expected {expected}, got {got}")]
    IvSize { expected: usize, got: usize },
}

/// The process-wide master passphrase used to wrap file keys and key the
/// permission MACs. Loaded from configuration at startup; read-only after.
#[derive(Clone)]
pub struct MasterKey(String);

impl MasterKey {
    pub fn new(passphrase: impl Into<String>) -> Result<Self, CryptoError> {
        let passphrase = passphrase.into();
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyMasterKey);
        }
        Ok(MasterKey(passphrase))
    }

    /// Hex sha256 of the passphrase, stored as the cache canary so cluster
    /// members can detect divergent master key configuration.
    pub fn canary(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Create a random 256-bit key
pub fn create_key() -> [u8; KEY_SIZE] {
    let mut buff = [0u8; KEY_SIZE];
    getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
    buff
}

/// Create a random per-permission IV
pub fn create_permission_iv() -> [u8; KEY_SIZE] {
    create_key()
}

/// Create a content cipher IV. The low four bytes are zeroed so the CTR
/// counter has room to run without wrapping into the random prefix.
pub fn create_content_iv() -> [u8; CONTENT_IV_SIZE] {
    let mut iv = [0u8; CONTENT_IV_SIZE];
    getrandom::getrandom(&mut iv).expect("failed to generate random bytes");
    iv[CONTENT_IV_SIZE - 1] = 0;
    iv[CONTENT_IV_SIZE - 2] = 0;
    iv[CONTENT_IV_SIZE - 3] = 0;
    iv[CONTENT_IV_SIZE - 4] = 0;
    iv
}

/// Random name for a ciphertext blob: 32 bytes, hex encoded
pub fn create_random_name() -> String {
    hex::encode(create_key())
}

/// Wrap or unwrap a file key: XOR against a hash derived from the master key
/// and the permission IV. Applying the function twice with the same inputs
/// returns the original key.
///
/// The derivation is of the form H(secret || data) with fixed-length data, so
/// hash extension is not a concern. Inputs longer than one hash are refused;
/// this construction is for keys, not content.
pub fn apply_passphrase(
    master: &MasterKey,
    permission_iv: &[u8],
    file_key: &[u8],
) -> Result<[u8; KEY_SIZE], CryptoError> {
    if file_key.len() > KEY_SIZE {
        return Err(CryptoError::WrapTooLong(file_key.len()));
    }
    let mut hasher = Sha256::new();
    hasher.update(master.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(hex::encode(permission_iv).as_bytes());
    let hash = hasher.finalize();

    let mut result = [0u8; KEY_SIZE];
    for (i, b) in file_key.iter().enumerate() {
        result[i] = hash[i] ^ b;
    }
    Ok(result)
}

/// Repeatable MAC over the key components of a permission, of the form
/// H(secret || grantee || capability bits || wrapped key).
#[allow(clippy::too_many_arguments)]
pub fn permission_mac(
    master: &MasterKey,
    grantee: &str,
    create: bool,
    read: bool,
    update: bool,
    delete: bool,
    share: bool,
    encrypted_key: &[u8],
) -> [u8; KEY_SIZE] {
    let material = format!(
        "{}:{}:{},{},{},{},{}:{}",
        master.as_str(),
        grantee,
        create,
        read,
        update,
        delete,
        share,
        hex::encode(encrypted_key)
    );
    Sha256::digest(material.as_bytes()).into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_apply_passphrase_round_trip() {
        let master = MasterKey::new("passphrase").unwrap();
        let iv = create_permission_iv();
        let key = create_key();

        let wrapped = apply_passphrase(&master, &iv, &key).unwrap();
        assert_ne!(wrapped, key);
        let unwrapped = apply_passphrase(&master, &iv, &wrapped).unwrap();
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn test_apply_passphrase_differs_by_iv() {
        let master = MasterKey::new("passphrase").unwrap();
        let key = create_key();
        let a = apply_passphrase(&master, &create_permission_iv(), &key).unwrap();
        let b = apply_passphrase(&master, &create_permission_iv(), &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_apply_passphrase_rejects_long_input() {
        let master = MasterKey::new("passphrase").unwrap();
        let long = [0u8; 33];
        assert!(apply_passphrase(&master, &[0u8; 32], &long).is_err());
    }

    #[test]
    fn test_permission_mac_is_sensitive_to_flags() {
        let master = MasterKey::new("passphrase").unwrap();
        let key = create_key();
        let a = permission_mac(&master, "g", true, true, false, false, false, &key);
        let b = permission_mac(&master, "g", true, false, true, false, false, &key);
        assert_ne!(a, b);
    }

    #[test]
    fn test_content_iv_counter_space() {
        let iv = create_content_iv();
        assert_eq!(&iv[12..], &[0, 0, 0, 0]);
    }
}
