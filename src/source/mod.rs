//! Per-source association state machine (NCR) (spec.md §3, §4.2).
//!
//! This is the densest subsystem in the crate: the operating-mode FSM
//! ([`fsm`]), the transmit path ([`transmit`]) and the receive path with
//! its eleven validation tests ([`receive`]) all operate on the single
//! [`Source`] aggregate defined here.

mod fsm;
mod receive;
mod transmit;

pub use fsm::OperatingMode;
pub use receive::{ReceiveContext, ReceiveOutcome, ValidationMask};
pub use transmit::{TransmitAction, TransmitContext};

use crate::clock::SourceStatsHandle;
use crate::config::{AuthMode, SourceKind, SourceParams, MAX_POLL, MIN_POLL, SOURCE_REACH_BITS};
use crate::ident::{IpAddress, RefId};
use crate::timestamp::{LocalInstant, NtpTimestamp, Seconds};

/// The association's role: the client end of a client/server exchange, or
/// a symmetric-active peer (spec.md §3 "association mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationMode {
    Client,
    Active,
}

impl From<SourceKind> for AssociationMode {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Server => AssociationMode::Client,
            SourceKind::Peer => AssociationMode::Active,
        }
    }
}

/// Where a recorded local timestamp came from — the daemon's own
/// `now()`, a kernel software timestamp, or a NIC hardware timestamp
/// (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampProvenance {
    Daemon,
    Kernel,
    Hardware,
}

/// A recorded local send/receive instant with its error estimate and
/// provenance (spec.md §3 `local_rx`, `local_tx`).
#[derive(Debug, Clone, Copy)]
pub struct LocalSample {
    pub instant: LocalInstant,
    pub error: Seconds,
    pub provenance: TimestampProvenance,
}

/// One configured NTP association (spec.md §3 `Source`).
#[derive(Debug)]
pub struct Source {
    pub remote: IpAddress,
    pub association: AssociationMode,
    pub mode: OperatingMode,

    pub minpoll: i8,
    pub maxpoll: i8,
    pub local_poll: i8,
    pub poll_score: f64,
    pub poll_target: u32,

    pub remote_poll: i8,
    pub remote_stratum: u8,

    pub max_delay: Seconds,
    pub max_delay_ratio: f64,
    pub max_delay_dev_ratio: f64,
    pub min_stratum: u8,

    pub auth_mode: AuthMode,
    pub key_id: u32,
    pub interleaved: bool,

    pub remote_ntp_rx: NtpTimestamp,
    pub remote_ntp_tx: NtpTimestamp,
    pub local_ntp_rx: NtpTimestamp,
    pub local_ntp_tx: NtpTimestamp,

    pub local_rx: Option<LocalSample>,
    pub local_tx: Option<LocalSample>,

    pub tx_count: u32,
    pub valid_rx: bool,
    pub updated_timestamps: bool,
    pub valid_timestamps: bool,

    pub burst_total: u32,
    pub burst_good: u32,
    pub auto_offline: bool,

    pub presend_minpoll: i8,
    pub presend_done: bool,

    /// Reachability shift register, width [`SOURCE_REACH_BITS`].
    pub reach: u8,
    pub refid: RefId,
    pub stats: SourceStatsHandle,

    /// Extra delay owed to the next transmit after a KoD RATE kiss
    /// (spec.md §4.2.3 step 9).
    pub kod_extra_delay: Seconds,

    /// Whether a client-mode ephemeral socket is currently open.
    pub client_socket_open: bool,
    pub local_addr: IpAddress,
}

impl Source {
    /// Create a new, initially offline association (spec.md §4.2
    /// `create()`).
    #[must_use]
    pub fn create(
        remote: IpAddress,
        kind: SourceKind,
        params: SourceParams,
        stats: SourceStatsHandle,
    ) -> Self {
        let minpoll = params.minpoll.clamp(MIN_POLL, MAX_POLL);
        let maxpoll = params.maxpoll.clamp(minpoll, MAX_POLL);
        Source {
            remote,
            association: AssociationMode::from(kind),
            mode: OperatingMode::Offline,
            minpoll,
            maxpoll,
            local_poll: minpoll,
            poll_score: 0.0,
            poll_target: params.poll_target,
            remote_poll: minpoll,
            remote_stratum: 0,
            max_delay: params.max_delay,
            max_delay_ratio: params.max_delay_ratio,
            max_delay_dev_ratio: params.max_delay_dev_ratio,
            min_stratum: params.min_stratum,
            auth_mode: params.auth_mode,
            key_id: params.key_id,
            interleaved: params.interleaved,
            remote_ntp_rx: NtpTimestamp::ZERO,
            remote_ntp_tx: NtpTimestamp::ZERO,
            local_ntp_rx: NtpTimestamp::ZERO,
            local_ntp_tx: NtpTimestamp::ZERO,
            local_rx: None,
            local_tx: None,
            tx_count: 0,
            valid_rx: false,
            updated_timestamps: false,
            valid_timestamps: false,
            burst_total: 0,
            burst_good: 0,
            auto_offline: params.auto_offline,
            presend_minpoll: params.presend_minpoll,
            presend_done: false,
            reach: 0,
            refid: remote.to_refid(),
            stats,
            kod_extra_delay: Seconds::ZERO,
            client_socket_open: false,
            local_addr: IpAddress::Unspec,
        }
    }

    /// Does this key store entry exist and look strong enough? Surfaced as
    /// a warning-worthy condition from `create()`, not a hard error
    /// (spec.md §4.2 "checks and warns on missing/short authentication
    /// keys").
    #[must_use]
    pub fn auth_key_is_weak(&self, keystore: &crate::auth::KeyStore) -> bool {
        self.auth_mode == AuthMode::Symmetric && keystore.create_warns(self.key_id)
    }

    /// Clear per-exchange state without touching configuration (spec.md
    /// §4.2 `reset_instance()`).
    pub fn reset_instance(&mut self) {
        self.remote_ntp_rx = NtpTimestamp::ZERO;
        self.remote_ntp_tx = NtpTimestamp::ZERO;
        self.local_ntp_rx = NtpTimestamp::ZERO;
        self.local_ntp_tx = NtpTimestamp::ZERO;
        self.local_rx = None;
        self.local_tx = None;
        self.tx_count = 0;
        self.valid_rx = false;
        self.updated_timestamps = false;
        self.valid_timestamps = false;
        self.presend_done = false;
    }

    /// Adjust the clamped thresholds, logging is the caller's
    /// responsibility (spec.md §4.2 `modify_*`).
    pub fn modify_minpoll(&mut self, minpoll: i8) {
        self.minpoll = minpoll.clamp(MIN_POLL, MAX_POLL);
        self.maxpoll = self.maxpoll.max(self.minpoll);
        self.clamp_poll();
    }

    pub fn modify_maxpoll(&mut self, maxpoll: i8) {
        self.maxpoll = maxpoll.clamp(MIN_POLL, MAX_POLL);
        self.minpoll = self.minpoll.min(self.maxpoll);
        self.clamp_poll();
    }

    pub fn modify_max_delay(&mut self, max_delay: Seconds) {
        self.max_delay = max_delay;
    }

    pub fn modify_max_delay_ratio(&mut self, ratio: f64) {
        self.max_delay_ratio = ratio;
    }

    pub fn modify_max_delay_dev_ratio(&mut self, ratio: f64) {
        self.max_delay_dev_ratio = ratio;
    }

    pub fn modify_min_stratum(&mut self, min_stratum: u8) {
        self.min_stratum = min_stratum;
    }

    fn clamp_poll(&mut self) {
        self.local_poll = self.local_poll.clamp(self.minpoll, self.maxpoll);
    }

    /// Inform the engine the local clock has been slewed, reprojecting
    /// recorded local timestamps into the new timescale (spec.md §4.2
    /// `slew_times`).
    pub fn slew_times(&mut self, when: LocalInstant, dfreq: f64, doffset: Seconds) {
        if let Some(sample) = &mut self.local_rx {
            *sample = reproject(*sample, when, dfreq, doffset);
        }
        if let Some(sample) = &mut self.local_tx {
            *sample = reproject(*sample, when, dfreq, doffset);
        }
    }

    /// Change the remote address, resetting state and refid (spec.md §4.2
    /// `change_remote_address`).
    pub fn change_remote_address(&mut self, new: IpAddress) {
        self.remote = new;
        self.refid = new.to_refid();
        self.reset_instance();
    }

    fn update_reachability(&mut self, good: bool) {
        self.reach <<= 1;
        if good {
            self.reach |= 1;
        }
        let mask = ((1u32 << SOURCE_REACH_BITS) - 1) as u8;
        self.reach &= mask;
    }

    /// True once [`crate::config::REACHABILITY_TIMEOUT_COUNT`] consecutive
    /// transmits have gone unanswered (spec.md §8 "Reachability").
    #[must_use]
    fn consecutive_misses(&self) -> u32 {
        self.tx_count
    }

    /// Poll adjustment, shared by the transmit and receive paths (spec.md
    /// §4.2.2 step 8, §4.2.3 step 8).
    fn adjust_poll(&mut self, delta: f64) {
        self.poll_score += delta;
        while self.poll_score >= 1.0 && self.local_poll < self.maxpoll {
            self.local_poll += 1;
            self.poll_score -= 1.0;
        }
        while self.poll_score <= -1.0 && self.local_poll > self.minpoll {
            self.local_poll -= 1;
            self.poll_score += 1.0;
        }
        self.clamp_poll();
    }

    /// Drive `local_poll` toward a "too large an error" correction (spec.md
    /// §4.2.3 step 8 poll-adjustment rule).
    fn adjust_poll_for_error(&mut self, error: Seconds, distance: Seconds) {
        if distance.0 > 0.0 && error.0.abs() > distance.0 {
            let shift = (error.0.abs() / distance.0).log2().ceil().max(1.0);
            self.local_poll = (self.local_poll - shift as i8).clamp(self.minpoll, self.maxpoll);
            self.poll_score = 0.0;
        } else {
            self.adjust_poll(1.0 / self.poll_target.max(1) as f64);
        }
    }
}

fn reproject(sample: LocalSample, when: LocalInstant, dfreq: f64, doffset: Seconds) -> LocalSample {
    let age = when.duration_since(sample.instant);
    let correction = Seconds(age.0 * dfreq) + doffset;
    LocalSample {
        instant: sample.instant.add_seconds(correction),
        ..sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SourceStatsHandle;
    use std::net::Ipv4Addr;

    fn make_source() -> Source {
        Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Server,
            SourceParams {
                minpoll: 6,
                maxpoll: 10,
                ..SourceParams::default()
            },
            SourceStatsHandle(0),
        )
    }

    #[test]
    fn create_clamps_poll_bounds() {
        let source = Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Server,
            SourceParams {
                minpoll: -5,
                maxpoll: 99,
                ..SourceParams::default()
            },
            SourceStatsHandle(0),
        );
        assert_eq!(source.minpoll, MIN_POLL);
        assert_eq!(source.maxpoll, MAX_POLL);
    }

    #[test]
    fn poll_stays_within_bounds_after_many_adjustments() {
        let mut source = make_source();
        for _ in 0..1000 {
            source.adjust_poll(0.37);
        }
        assert!(source.local_poll >= source.minpoll && source.local_poll <= source.maxpoll);
        for _ in 0..1000 {
            source.adjust_poll(-0.91);
        }
        assert!(source.local_poll >= source.minpoll && source.local_poll <= source.maxpoll);
    }

    #[test]
    fn reset_instance_clears_counters_not_config() {
        let mut source = make_source();
        source.tx_count = 5;
        source.valid_rx = true;
        source.minpoll = 7;
        source.reset_instance();
        assert_eq!(source.tx_count, 0);
        assert!(!source.valid_rx);
        assert_eq!(source.minpoll, 7);
    }
}
