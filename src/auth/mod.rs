//! Authentication: symmetric MAC key store (spec.md §3, §4.6).

pub mod keystore;
pub mod mac;

pub use keystore::{Key, KeyFileEntry, KeyStore};
pub use mac::MacAlgorithm;
