//! Crate-wide error type.
//!
//! Mirrors the shape of the teacher's `sntpc::types::Error`: a flat,
//! hand-written enum rather than a `thiserror`-derived one, because the
//! variant set here maps directly onto the error kinds enumerated in the
//! protocol specification (malformed packet, auth failure, replay, rate
//! limit, KoD, version mismatch, fatal I/O) and needs no formatting
//! machinery beyond `Debug`/`Display`.

use core::fmt;

/// Library result type.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur while running the NTP protocol engine.
///
/// Transient conditions (malformed packet, auth failure, replay, rate
/// limit, KoD) are normally *not* surfaced as `Err` to callers — the
/// receive path in `source` and `server` absorbs them and drops the
/// datagram per the error handling design (spec.md §7). This type exists
/// for the boundaries that do need to fail loudly: codec parsing, key
/// store loading, cookie decode, and scheduler setup.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet shorter than the 48-byte header, or not a multiple of 4 bytes.
    MalformedPacket,
    /// `LVM` version nibble outside `[NTP_MIN_COMPAT_VERSION, NTP_MAX_COMPAT_VERSION]`.
    ProtocolVersionMismatch,
    /// Extension field or MAC trailer failed to parse.
    MalformedTrailer,
    /// MAC present but did not verify under the expected key.
    AuthFailure,
    /// Key id referenced by a packet is not present in the key store.
    UnknownKey,
    /// Symmetric key material is absent or too short to be used safely.
    WeakOrMissingKey,
    /// Packet resubmitted a transmit/originate timestamp already seen.
    ReplayDetected,
    /// Client access log declined to answer due to rate limiting.
    RateLimited,
    /// Cookie ciphertext failed to authenticate, or named a rotated-out key.
    CookieDecodeFailed,
    /// Server key ring exhausted its id space or ran out of memory budget.
    KeyRingExhausted,
    /// Persisted state (key cache, pidfile) could not be read or written.
    Persistence,
    /// Underlying transport failed transiently; caller should retry later.
    Io,
    /// Operation is not valid for the association's current mode or state.
    InvalidState,
    /// A configuration value (poll bounds, thresholds, …) was out of range.
    InvalidConfig,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::MalformedPacket => "packet too short or misaligned",
            Error::ProtocolVersionMismatch => "unsupported NTP version",
            Error::MalformedTrailer => "malformed extension field or MAC trailer",
            Error::AuthFailure => "MAC verification failed",
            Error::UnknownKey => "referenced key id not present in key store",
            Error::WeakOrMissingKey => "symmetric key missing or too short",
            Error::ReplayDetected => "duplicate or replayed packet",
            Error::RateLimited => "client access log rate limit exceeded",
            Error::CookieDecodeFailed => "cookie failed to authenticate or decode",
            Error::KeyRingExhausted => "server key ring exhausted",
            Error::Persistence => "persisted state I/O failed",
            Error::Io => "transient network I/O error",
            Error::InvalidState => "operation invalid for current association state",
            Error::InvalidConfig => "configuration value out of range",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Io
    }
}
