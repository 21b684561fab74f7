//! SecurityLayer: an optional record-level encode/decode wrapper installed
//! by the `Authenticator` after a successful SASL negotiation with a
//! security layer, interposed between the Framer and the Transport
//! (spec.md §3/§4.2/§4.3). Passthrough (no wrapper at all) is used when no
//! security layer was negotiated.
//!
//! The AEAD scheme is grounded on
//! `SleepingPills-bushhammer/server/lib/flux/src/crypto.rs`
//! (`crypto_aead_chacha20poly1305_ietf_{encrypt,decrypt}` keyed by a
//! per-direction key, nonce derived from a monotonic sequence counter);
//! none of the five teacher-eligible repos carry a SASL implementation, so
//! the handshake/mechanism negotiation in `auth.rs` is original logic, but
//! the wire-level AEAD record codec reuses this established pattern rather
//! than inventing a new one.

use std::collections::VecDeque;
use std::io;

use byteorder::{LittleEndian, WriteBytesExt};
use ctor::ctor;

use crate::error::{Error, Result};
use crate::transport::Transport;

pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;
const NONCE_OFFSET: usize = NONCE_SIZE - 8;

const RECORD_LENGTH_SIZE: usize = 4;
const MAX_RECORD_PLAINTEXT: usize = 256 * 1024;

#[ctor]
fn init_sodium() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("cryptography initialization failed");
        }
    }
}

fn nonce_bytes(sequence: u64) -> [u8; NONCE_SIZE] {
    let mut bytes = [0u8; NONCE_SIZE];
    (&mut bytes[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(sequence)
        .expect("fixed-size buffer write cannot fail");
    bytes
}

fn aead_encrypt(plain: &[u8], key: &[u8; KEY_SIZE], nonce: u64) -> Vec<u8> {
    let nonce_bytes = nonce_bytes(nonce);
    let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
    let result = unsafe {
        libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            std::ptr::null(),
            0,
            std::ptr::null(),
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        )
    };
    debug_assert!(result >= 0, "chacha20poly1305 encryption cannot fail given valid inputs");
    cipher
}

fn aead_decrypt(cipher: &[u8], key: &[u8; KEY_SIZE], nonce: u64) -> Result<Vec<u8>> {
    if cipher.len() < MAC_SIZE {
        return Err(Error::protocol("security record shorter than MAC size"));
    }
    let nonce_bytes = nonce_bytes(nonce);
    let mut plain = vec![0u8; cipher.len() - MAC_SIZE];
    let result = unsafe {
        libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            std::ptr::null(),
            0,
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        )
    };
    if result < 0 {
        return Err(Error::protocol("security layer record failed authentication"));
    }
    Ok(plain)
}

/// The record-oriented encode/decode strategy. `SecuredTransport` drives
/// this; `Passthrough` means "no security layer", represented simply by
/// never constructing a `SecuredTransport` at all.
pub trait SecurityCodec: Send {
    fn encode_record(&mut self, plaintext: &[u8]) -> Vec<u8>;

    /// Attempt to decode one complete record from the front of `buffer`,
    /// consuming its bytes on success. Returns `Ok(None)` if `buffer` does
    /// not yet contain a whole record.
    fn decode_record(&mut self, buffer: &mut Vec<u8>) -> Result<Option<Vec<u8>>>;
}

/// AEAD session keys negotiated by a SASL mechanism with a security layer
/// (spec.md §4.3).
pub struct SaslCodec {
    send_key: [u8; KEY_SIZE],
    recv_key: [u8; KEY_SIZE],
    send_sequence: u64,
    recv_sequence: u64,
}

impl SaslCodec {
    pub fn new(send_key: [u8; KEY_SIZE], recv_key: [u8; KEY_SIZE]) -> Self {
        SaslCodec {
            send_key,
            recv_key,
            send_sequence: 0,
            recv_sequence: 0,
        }
    }
}

impl SecurityCodec for SaslCodec {
    fn encode_record(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = aead_encrypt(plaintext, &self.send_key, self.send_sequence);
        self.send_sequence += 1;

        let mut record = Vec::with_capacity(RECORD_LENGTH_SIZE + cipher.len());
        record.extend_from_slice(&(cipher.len() as u32).to_be_bytes());
        record.extend_from_slice(&cipher);
        record
    }

    fn decode_record(&mut self, buffer: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
        if buffer.len() < RECORD_LENGTH_SIZE {
            return Ok(None);
        }
        let declared = u32::from_be_bytes(buffer[0..RECORD_LENGTH_SIZE].try_into().unwrap()) as usize;
        if declared > MAX_RECORD_PLAINTEXT + MAC_SIZE {
            return Err(Error::protocol("security layer record too large"));
        }
        if buffer.len() < RECORD_LENGTH_SIZE + declared {
            return Ok(None);
        }

        let cipher: Vec<u8> = buffer.drain(0..RECORD_LENGTH_SIZE + declared).skip(RECORD_LENGTH_SIZE).collect();
        let plain = aead_decrypt(&cipher, &self.recv_key, self.recv_sequence)?;
        self.recv_sequence += 1;
        Ok(Some(plain))
    }
}

/// Wraps any `Transport` with a `SecurityCodec`, exposing the same
/// byte-pipe interface (spec.md §3: "optional wrapper exposing the same
/// byte-pipe interface"). `try_write` accepts the whole plaintext buffer
/// into an internal queue immediately and opportunistically flushes
/// encoded bytes to the inner transport; `try_read` decodes whole records
/// as they arrive and hands out bytes from a leftover queue across
/// multiple calls, matching the "a single read may deliver bytes
/// previously cached" contract.
pub struct SecuredTransport {
    inner: Box<dyn Transport>,
    codec: Box<dyn SecurityCodec>,
    read_ciphertext: Vec<u8>,
    read_plaintext: VecDeque<u8>,
    write_ciphertext: VecDeque<u8>,
}

impl SecuredTransport {
    pub fn new(inner: Box<dyn Transport>, codec: Box<dyn SecurityCodec>) -> Self {
        SecuredTransport {
            inner,
            codec,
            read_ciphertext: Vec::new(),
            read_plaintext: VecDeque::new(),
            write_ciphertext: VecDeque::new(),
        }
    }

    fn flush_write_queue(&mut self) -> io::Result<()> {
        while !self.write_ciphertext.is_empty() {
            let (front, _) = self.write_ciphertext.as_slices();
            match self.inner.try_write(front) {
                Ok(0) => break,
                Ok(n) => {
                    self.write_ciphertext.drain(0..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Transport for SecuredTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.read_plaintext.is_empty() {
            let n = self.read_plaintext.len().min(buf.len());
            for (dst, src) in buf.iter_mut().zip(self.read_plaintext.drain(0..n)) {
                *dst = src;
            }
            return Ok(n);
        }

        let mut scratch = [0u8; 65536];
        match self.inner.try_read(&mut scratch) {
            Ok(0) => return Ok(0),
            Ok(n) => self.read_ciphertext.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        loop {
            match self.codec.decode_record(&mut self.read_ciphertext) {
                Ok(Some(record)) => self.read_plaintext.extend(record),
                Ok(None) => break,
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }

        if self.read_plaintext.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no complete record yet"));
        }

        let n = self.read_plaintext.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.read_plaintext.drain(0..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let encoded = self.codec.encode_record(buf);
        self.write_ciphertext.extend(encoded);
        self.flush_write_queue()?;
        Ok(buf.len())
    }

    fn pollable_fd(&self) -> std::os::fd::RawFd {
        self.inner.pollable_fd()
    }

    fn stderr_fd(&self) -> Option<std::os::fd::RawFd> {
        self.inner.stderr_fd()
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        !self.write_ciphertext.is_empty()
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.flush_write_queue();
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypts_and_decrypts_a_round_trip() {
        let key_a = [7u8; KEY_SIZE];
        let key_b = [9u8; KEY_SIZE];

        let mut sender = SaslCodec::new(key_a, key_b);
        let mut receiver = SaslCodec::new(key_b, key_a);

        let record = sender.encode_record(b"hello dispatcher");
        let mut buffer = record;
        let decoded = receiver.decode_record(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, b"hello dispatcher");
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_record_returns_none_until_complete() {
        let key = [1u8; KEY_SIZE];
        let mut sender = SaslCodec::new(key, key);
        let mut receiver = SaslCodec::new(key, key);

        let record = sender.encode_record(b"partial");
        let mut buffer = record[..record.len() - 1].to_vec();
        assert!(receiver.decode_record(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let key = [3u8; KEY_SIZE];
        let mut sender = SaslCodec::new(key, key);
        let mut receiver = SaslCodec::new(key, key);

        let mut record = sender.encode_record(b"integrity");
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        assert!(receiver.decode_record(&mut record).is_err());
    }
}
