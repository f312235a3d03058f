//! MAC generate/verify for the symmetric key-store authentication mode
//! (spec.md §4.6, §6).
//!
//! Grounded in `mycrl-turn-rs`'s STUN message-integrity handling
//! (`lib/stun` depends on `hmac`+`sha-1`+`md5` for the same
//! keyed-MAC-over-a-wire-message shape); we additionally support SHA-256
//! since newer NTP keyfiles commonly use it.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;

/// Symmetric-key MAC algorithm, selected per key-id by the key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl MacAlgorithm {
    /// Digest length in bytes, one of [`crate::packet::KNOWN_MAC_LENGTHS`].
    #[must_use]
    pub const fn digest_len(self) -> usize {
        match self {
            MacAlgorithm::Md5 => 16,
            MacAlgorithm::Sha1 => 20,
            MacAlgorithm::Sha256 => 32,
        }
    }
}

/// Compute the MAC of `data` under `key` with the given algorithm.
#[must_use]
pub fn generate(algorithm: MacAlgorithm, key: &[u8], data: &[u8]) -> Vec<u8> {
    match algorithm {
        MacAlgorithm::Md5 => run::<Hmac<Md5>>(key, data),
        MacAlgorithm::Sha1 => run::<Hmac<Sha1>>(key, data),
        MacAlgorithm::Sha256 => run::<Hmac<Sha256>>(key, data),
    }
}

/// Verify `mac` against `data` under `key`, in constant time with respect
/// to the comparison (the HMAC computation itself is not constrained to be
/// constant-time beyond what the `hmac` crate already provides).
#[must_use]
pub fn verify(algorithm: MacAlgorithm, key: &[u8], data: &[u8], mac: &[u8]) -> bool {
    if mac.len() != algorithm.digest_len() {
        return false;
    }
    let expected = generate(algorithm, key, data);
    constant_time_eq(&expected, mac)
}

fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    Mac::update(&mut mac, data);
    Mac::finalize(mac).into_bytes().to_vec()
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_for_each_algorithm() {
        let key = b"super-secret-key-material";
        let data = b"ntp header bytes go here";
        for alg in [MacAlgorithm::Md5, MacAlgorithm::Sha1, MacAlgorithm::Sha256] {
            let mac = generate(alg, key, data);
            assert_eq!(mac.len(), alg.digest_len());
            assert!(verify(alg, key, data, &mac));
        }
    }

    #[test]
    fn tampered_mac_fails() {
        let key = b"key";
        let data = b"data";
        let mut mac = generate(MacAlgorithm::Sha256, key, data);
        mac[0] ^= 0xFF;
        assert!(!verify(MacAlgorithm::Sha256, key, data, &mac));
    }

    #[test]
    fn wrong_length_fails_fast() {
        let key = b"key";
        let data = b"data";
        assert!(!verify(MacAlgorithm::Sha1, key, data, &[0u8; 4]));
    }
}
