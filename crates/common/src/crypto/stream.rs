//! CTR-mode content cipher with random access
//!
//! Content is encrypted with AES-256 in counter mode so a read can start at
//! any cipher block: the handler aligns the requested offset down to a block
//! boundary, adds the skipped block count to the IV, and re-biases the
//! user-visible range to line the plaintext back up.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha2::{Digest, Sha256};

use super::{CryptoError, CONTENT_IV_SIZE, KEY_SIZE};

/// AES block size; reads must align to this
pub const CIPHER_BLOCK_SIZE: u64 = 16;

type Aes256Ctr = Ctr128BE<Aes256>;

/// A half-open byte range request against plaintext content. `stop` is
/// inclusive, matching the HTTP Range header; `None` means to end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub stop: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, stop: Option<u64>) -> Self {
        ByteRange { start, stop }
    }

    /// The content length reported for this range against a file of
    /// `full_length` bytes.
    pub fn reported_length(&self, full_length: u64) -> u64 {
        let stop = match self.stop {
            Some(s) => s.min(full_length.saturating_sub(1)),
            None => full_length.saturating_sub(1),
        };
        stop + 1 - self.start.min(stop + 1)
    }

    /// The cipher-block-aligned offset at or below `start`
    pub fn cipher_start(&self) -> u64 {
        (self.start / CIPHER_BLOCK_SIZE) * CIPHER_BLOCK_SIZE
    }
}

/// Adjust the content IV for a read beginning mid-stream: add the number of
/// whole cipher blocks skipped to the IV as a big-endian integer, and re-bias
/// the range so it is relative to the aligned offset.
pub fn adjust_iv(original: &[u8; CONTENT_IV_SIZE], range: &mut ByteRange) -> [u8; CONTENT_IV_SIZE] {
    let mut iv = *original;
    let blocks_skipped = range.start / CIPHER_BLOCK_SIZE;

    let mut carry = blocks_skipped as u128;
    for i in (0..CONTENT_IV_SIZE).rev() {
        if carry == 0 {
            break;
        }
        let sum = iv[i] as u128 + (carry & 0xff);
        iv[i] = (sum & 0xff) as u8;
        carry = (carry >> 8) + (sum >> 8);
    }

    range.start -= blocks_skipped * CIPHER_BLOCK_SIZE;
    if let Some(stop) = range.stop.as_mut() {
        *stop -= blocks_skipped * CIPHER_BLOCK_SIZE;
    }
    iv
}

/// Streaming content cipher that keeps a running sha256 and byte count of the
/// bytes fed in. Encryption and decryption are the same keystream XOR; the
/// digest is taken over the input before the XOR is applied, so on upload it
/// is the plaintext hash.
pub struct ContentCipher {
    cipher: Aes256Ctr,
    hash: Sha256,
    size: u64,
}

impl ContentCipher {
    pub fn new(key: &[u8], iv: &[u8; CONTENT_IV_SIZE]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::KeySize {
                expected: KEY_SIZE,
                got: key.len(),
            });
        }
        Ok(ContentCipher {
            cipher: Aes256Ctr::new(key.into(), iv.into()),
            hash: Sha256::new(),
            size: 0,
        })
    }

    /// Hash the chunk, then XOR it in place with the keystream
    pub fn encrypt_chunk(&mut self, chunk: &mut [u8]) {
        self.hash.update(&chunk[..]);
        self.cipher.apply_keystream(chunk);
        self.size += chunk.len() as u64;
    }

    /// XOR the chunk in place with the keystream, recovering plaintext
    pub fn decrypt_chunk(&mut self, chunk: &mut [u8]) {
        self.cipher.apply_keystream(chunk);
        self.size += chunk.len() as u64;
    }

    /// The digest over everything fed to [`encrypt_chunk`] and the total
    /// byte count.
    pub fn finish(self) -> (Vec<u8>, u64) {
        (self.hash.finalize().to_vec(), self.size)
    }
}

/// One-shot keystream application for small buffers and tests
pub fn apply_ctr(key: &[u8], iv: &[u8; CONTENT_IV_SIZE], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut cipher = ContentCipher::new(key, iv)?;
    let mut out = data.to_vec();
    cipher.decrypt_chunk(&mut out);
    Ok(out)
}

/// Trims a decrypted, block-aligned stream down to the exact byte window the
/// client asked for.
#[derive(Debug)]
pub struct RangeWindow {
    skip: u64,
    remaining: Option<u64>,
}

impl RangeWindow {
    pub fn new(range: &ByteRange) -> Self {
        RangeWindow {
            skip: range.start,
            remaining: range.stop.map(|stop| stop + 1 - range.start),
        }
    }

    /// Pass everything through unmodified
    pub fn unbounded() -> Self {
        RangeWindow {
            skip: 0,
            remaining: None,
        }
    }

    /// Trim a chunk to the window, returning `None` when the chunk falls
    /// entirely outside it.
    pub fn apply(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        let mut begin = 0usize;
        if self.skip > 0 {
            let skipped = (chunk.len() as u64).min(self.skip);
            self.skip -= skipped;
            begin = skipped as usize;
            if begin >= chunk.len() {
                return None;
            }
        }
        let mut end = chunk.len();
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            let take = (*remaining).min((end - begin) as u64);
            end = begin + take as usize;
            *remaining -= take;
        }
        Some(chunk[begin..end].to_vec())
    }

    pub fn done(&self) -> bool {
        self.remaining == Some(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{create_content_iv, create_key};

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = create_key();
        let iv = create_content_iv();
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut enc = ContentCipher::new(&key, &iv).unwrap();
        let mut buf = plaintext.clone();
        enc.encrypt_chunk(&mut buf);
        let (hash, size) = enc.finish();
        assert_eq!(size, plaintext.len() as u64);
        assert_eq!(hash, Sha256::digest(&plaintext).to_vec());
        assert_ne!(buf, plaintext);

        let mut dec = ContentCipher::new(&key, &iv).unwrap();
        dec.decrypt_chunk(&mut buf);
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_adjusted_iv_matches_mid_stream_decrypt() {
        let key = create_key();
        let iv = create_content_iv();

        // 5 blocks of recognizable plaintext
        let plaintext: Vec<u8> = (0u8..80).collect();
        let ciphertext = apply_ctr(&key, &iv, &plaintext).unwrap();

        // Ask for bytes 35..=70; aligned start is block 2 (offset 32)
        let mut range = ByteRange::new(35, Some(70));
        let cipher_start = range.cipher_start() as usize;
        assert_eq!(cipher_start, 32);
        let adjusted = adjust_iv(&iv, &mut range);
        assert_eq!(range, ByteRange::new(3, Some(38)));

        let mut dec = ContentCipher::new(&key, &adjusted).unwrap();
        let mut tail = ciphertext[cipher_start..].to_vec();
        dec.decrypt_chunk(&mut tail);

        let mut window = RangeWindow::new(&range);
        let served = window.apply(&tail).unwrap();
        assert_eq!(served, &plaintext[35..=70]);
        assert!(window.done());
    }

    #[test]
    fn test_adjust_iv_carries_across_bytes() {
        let mut iv = [0u8; CONTENT_IV_SIZE];
        iv[CONTENT_IV_SIZE - 1] = 0xff;
        let mut range = ByteRange::new(CIPHER_BLOCK_SIZE, None);
        let adjusted = adjust_iv(&iv, &mut range);
        assert_eq!(adjusted[CONTENT_IV_SIZE - 1], 0x00);
        assert_eq!(adjusted[CONTENT_IV_SIZE - 2], 0x01);
        assert_eq!(range.start, 0);
    }

    #[test]
    fn test_range_window_partition_equals_whole() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut window = RangeWindow::new(&ByteRange::new(10, Some(59)));
        let mut out = Vec::new();
        for chunk in data.chunks(7) {
            if let Some(part) = window.apply(chunk) {
                out.extend_from_slice(&part);
            }
        }
        assert_eq!(out, &data[10..=59]);
    }

    #[test]
    fn test_reported_length() {
        let r = ByteRange::new(17, Some(10000));
        assert_eq!(r.reported_length(40000), 9984);
        let open = ByteRange::new(100, None);
        assert_eq!(open.reported_length(200), 100);
    }
}
