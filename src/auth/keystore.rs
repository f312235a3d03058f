//! Symmetric key store (spec.md §3, §4.2): keys loaded from a keyfile,
//! indexed by key-id, used to generate/verify MACs over NTP packets.

use std::collections::HashMap;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::auth::mac::{self, MacAlgorithm};
use crate::{Error, Result};

/// Minimum key length, in bytes, below which [`KeyStore::create_warns`]
/// flags the key as weak. Mirrors the "checks and warns on missing/short
/// authentication keys" requirement in spec.md §4.2 `create()`.
pub const MIN_KEY_LEN: usize = 16;

/// A single symmetric key entry, as read from a keyfile line.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    #[zeroize(skip)]
    pub id: u32,
    #[zeroize(skip)]
    pub algorithm: MacAlgorithm,
    pub material: Vec<u8>,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// A parsed keyfile entry, prior to being indexed into a [`KeyStore`].
#[derive(Debug, Clone)]
pub struct KeyFileEntry {
    pub id: u32,
    pub algorithm: MacAlgorithm,
    pub material: Vec<u8>,
}

/// Keys loaded from a keyfile, indexed by key-id (spec.md §3 `ServerKey` is
/// the cookie engine's *separate* AEAD ring; this is the §4.6 symmetric
/// MAC key table).
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: HashMap<u32, Key>,
}

impl KeyStore {
    #[must_use]
    pub fn new() -> Self {
        KeyStore {
            keys: HashMap::new(),
        }
    }

    /// Build a store from already-parsed entries (the keyfile's own text
    /// format is an external-collaborator concern per spec.md §1; this is
    /// the narrow contract boundary).
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = KeyFileEntry>) -> Self {
        let mut keys = HashMap::new();
        for entry in entries {
            keys.insert(
                entry.id,
                Key {
                    id: entry.id,
                    algorithm: entry.algorithm,
                    material: entry.material,
                },
            );
        }
        KeyStore { keys }
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&Key> {
        self.keys.get(&id)
    }

    pub fn insert(&mut self, entry: KeyFileEntry) {
        self.keys.insert(
            entry.id,
            Key {
                id: entry.id,
                algorithm: entry.algorithm,
                material: entry.material,
            },
        );
    }

    /// True if the key is absent or shorter than [`MIN_KEY_LEN`] — the
    /// condition `create()` should warn on (spec.md §4.2).
    #[must_use]
    pub fn create_warns(&self, id: u32) -> bool {
        match self.keys.get(&id) {
            None => true,
            Some(key) => key.material.len() < MIN_KEY_LEN,
        }
    }

    /// Generate a MAC over `data` under the stored key `id`.
    pub fn generate(&self, id: u32, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.keys.get(&id).ok_or(Error::UnknownKey)?;
        Ok(mac::generate(key.algorithm, &key.material, data))
    }

    /// Verify `mac` over `data` under the stored key `id`.
    #[must_use]
    pub fn verify(&self, id: u32, data: &[u8], tag: &[u8]) -> bool {
        match self.keys.get(&id) {
            Some(key) => mac::verify(key.algorithm, &key.material, data, tag),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_fails_generate() {
        let store = KeyStore::new();
        assert_eq!(store.generate(1, b"data"), Err(Error::UnknownKey));
    }

    #[test]
    fn missing_key_warns() {
        let store = KeyStore::new();
        assert!(store.create_warns(1));
    }

    #[test]
    fn short_key_warns() {
        let store = KeyStore::from_entries([KeyFileEntry {
            id: 1,
            algorithm: MacAlgorithm::Md5,
            material: vec![0u8; 4],
        }]);
        assert!(store.create_warns(1));
    }

    #[test]
    fn full_length_key_does_not_warn() {
        let store = KeyStore::from_entries([KeyFileEntry {
            id: 1,
            algorithm: MacAlgorithm::Sha256,
            material: vec![0xAB; MIN_KEY_LEN],
        }]);
        assert!(!store.create_warns(1));
    }

    #[test]
    fn generate_then_verify_round_trips() {
        let store = KeyStore::from_entries([KeyFileEntry {
            id: 5,
            algorithm: MacAlgorithm::Sha1,
            material: vec![0x42; 20],
        }]);
        let mac = store.generate(5, b"payload").unwrap();
        assert!(store.verify(5, b"payload", &mac));
        assert!(!store.verify(5, b"tampered", &mac));
    }
}
