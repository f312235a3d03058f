//! Narrow external-contract configuration structs (SPEC_FULL.md §A.3).
//!
//! Configuration file parsing and command-line handling are explicitly out
//! of scope (spec.md §1); this module only defines the parameter shapes
//! the core accepts once something else has parsed them.

use crate::timestamp::Seconds;

/// Lower/upper bound on `local_poll`, clamped per spec.md §4.2 `create()`.
pub const MIN_POLL: i8 = 0;
pub const MAX_POLL: i8 = 24;

/// Delay before the very first transmit after `start()` (spec.md §4.2
/// `start()`).
pub const INITIAL_DELAY: Seconds = Seconds(0.2);
/// Gap between a presend and the sample-bearing transmit that follows it.
pub const WARM_UP_DELAY: Seconds = Seconds(2.0);
/// Fixed interval between burst transmits, before/after a reply
/// (spec.md §4.2.2 `get_transmit_delay`).
pub const BURST_TIMEOUT: Seconds = Seconds(2.0);
pub const BURST_INTERVAL: Seconds = Seconds(2.0);
/// Cap on how long a server is allowed to take between request and reply
/// before test **TA** rejects the exchange in client mode.
pub const MAX_SERVER_INTERVAL: Seconds = Seconds(3.0 * 3600.0);
/// Root distance ceiling for test **T7**.
pub const NTP_MAX_DISPERSION: Seconds = Seconds(16.0);
/// Ceiling `minpoll` can be raised to in response to a KoD RATE kiss.
pub const MAX_KOD_RATE_POLL: i8 = 17;
/// Acceptable window, in seconds, for a late kernel/hardware timestamp
/// update to replace a previously recorded `local_tx` (spec.md §4.3
/// `process_tx_known`).
pub const MAX_TX_DELAY: Seconds = Seconds(0.1);
/// Width of the reachability shift register (glossary "Reach register").
pub const SOURCE_REACH_BITS: u32 = 8;
/// Consecutive unanswered transmits after which a source is marked
/// unreachable (spec.md §8 "Reachability").
pub const REACHABILITY_TIMEOUT_COUNT: u32 = 9;

/// Whether a configured association is the client end of a client/server
/// exchange, or a symmetric-active peer (spec.md §4.2 `create()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Server,
    Peer,
}

/// Authentication mode negotiated for a source (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Symmetric,
    MsSntp,
    MsSntpExtended,
}

/// Parameters accepted by [`crate::source::Source::create`].
#[derive(Debug, Clone, Copy)]
pub struct SourceParams {
    pub minpoll: i8,
    pub maxpoll: i8,
    pub max_delay: Seconds,
    pub max_delay_ratio: f64,
    pub max_delay_dev_ratio: f64,
    pub min_stratum: u8,
    pub poll_target: u32,
    pub auth_mode: AuthMode,
    pub key_id: u32,
    pub auto_offline: bool,
    pub presend_minpoll: i8,
    pub interleaved: bool,
}

impl Default for SourceParams {
    fn default() -> Self {
        SourceParams {
            minpoll: 6,
            maxpoll: 10,
            max_delay: Seconds(3.0),
            max_delay_ratio: 0.0,
            max_delay_dev_ratio: 0.0,
            min_stratum: 0,
            poll_target: 8,
            auth_mode: AuthMode::None,
            key_id: 0,
            auto_offline: false,
            presend_minpoll: 0,
            interleaved: false,
        }
    }
}

/// Parameters governing the server path and the subsystems it shares with
/// the coordinator (access filter defaults, rate limiting, cookie
/// rotation).
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub rotate_interval: Seconds,
    pub rate_limit_threshold_hz: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            rotate_interval: Seconds(3600.0),
            rate_limit_threshold_hz: 4.0,
        }
    }
}
