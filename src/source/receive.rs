//! Receive path: the eleven conformance tests and sample computation
//! (spec.md §4.2.3).

use super::{AssociationMode, LocalSample, Source, TimestampProvenance};
use crate::auth::KeyStore;
use crate::clock::{ClockDiscipline, Sample};
use crate::config::{AuthMode, MAX_SERVER_INTERVAL, NTP_MAX_DISPERSION};
use crate::ident::{IpAddress, RefId};
use crate::packet::{AuthTrailer, LeapIndicator, NtpPacket};
use crate::timestamp::{LocalInstant, NtpTimestamp, Seconds};

/// The eleven boolean conformance tests, kept as a single bitset so
/// `valid`/`synced`/`good` are cheap derived masks rather than separate
/// booleans threaded through the call stack (spec.md §9 design notes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationMask(u16);

const T1: u16 = 1 << 0;
const T2: u16 = 1 << 1;
const T3: u16 = 1 << 2;
const T5: u16 = 1 << 3;
const T6: u16 = 1 << 4;
const T7: u16 = 1 << 5;
const TA: u16 = 1 << 6;
const TB: u16 = 1 << 7;
const TC: u16 = 1 << 8;
const TD: u16 = 1 << 9;

impl ValidationMask {
    fn set(&mut self, bit: u16, pass: bool) {
        if pass {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    #[must_use]
    pub fn t1(self) -> bool {
        self.0 & T1 != 0
    }
    #[must_use]
    pub fn t2(self) -> bool {
        self.0 & T2 != 0
    }
    #[must_use]
    pub fn valid_packet(self) -> bool {
        self.0 & (T1 | T2 | T3 | T5) == (T1 | T2 | T3 | T5)
    }
    #[must_use]
    pub fn synced_packet(self) -> bool {
        self.valid_packet() && self.0 & (T6 | T7) == (T6 | T7)
    }
    #[must_use]
    pub fn good_packet(self) -> bool {
        self.synced_packet() && self.0 & (TA | TB | TC | TD) == (TA | TB | TC | TD)
    }
}

/// What the receive path decided to do with an incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Rejected before authentication/format checks could even run.
    Malformed,
    /// Failed one or more of T1/T2/T3/T5: dropped, no state updated beyond
    /// bookkeeping already described in step 6.
    Rejected(ValidationMask),
    /// Passed `valid_packet` but not `synced_packet`/`good_packet`; some
    /// bookkeeping (reachability, remote poll) may still have updated.
    Accepted(ValidationMask),
    /// A Kiss-o'-Death RATE packet; poll adaptation was informed, no
    /// sample was ever considered.
    KissOfDeath,
}

/// Context the caller supplies for one receive-path invocation — values
/// owned by the coordinator/clock subsystem rather than by `Source`
/// itself.
pub struct ReceiveContext<'a> {
    pub local_addr: IpAddress,
    pub rx_ts: LocalInstant,
    pub precision: i8,
    pub keystore: &'a KeyStore,
}

impl Source {
    /// `process_rx_known` (spec.md §4.2.3): validate, score, and (if
    /// `good_packet`) hand a sample to the clock subsystem.
    pub fn process_rx_known(
        &mut self,
        pkt: &NtpPacket,
        ctx: &ReceiveContext<'_>,
        clock: &mut impl ClockDiscipline,
    ) -> ReceiveOutcome {
        if self.is_kiss_of_death(pkt) {
            return self.handle_kod(pkt);
        }

        let mut mask = self.run_tests(pkt, ctx, &*clock);

        // Step 6: valid_rx guard — demote a second "valid" reply within
        // the same exchange, and a presend echo never yields a sample.
        if mask.valid_packet() && self.valid_rx {
            mask.set(T2, false);
            mask.set(T3, false);
        }
        if self.presend_done && !self.updated_timestamps {
            mask.set(TA, false);
        }

        if !mask.valid_packet() {
            return ReceiveOutcome::Rejected(mask);
        }

        // Step 5: timestamp bookkeeping.
        self.update_timestamps(pkt, ctx.rx_ts, mask);

        // Step 7.
        if mask.synced_packet() {
            self.remote_poll = pkt.header.poll;
            self.remote_stratum = pkt.header.stratum;
            self.tx_count = 0;
            self.update_reachability(true);
            self.valid_rx = true;
        }

        // Step 8.
        if mask.good_packet() {
            self.accumulate_good_sample(pkt, ctx, clock);
        }

        ReceiveOutcome::Accepted(mask)
    }

    fn is_kiss_of_death(&self, pkt: &NtpPacket) -> bool {
        pkt.header.stratum == 0 && pkt.header.leap == LeapIndicator::Unsynchronised
    }

    fn handle_kod(&mut self, pkt: &NtpPacket) -> ReceiveOutcome {
        // Only T1/T2/T5-equivalent checks apply to a KoD (spec.md §4.2.3
        // step 9): must not be a duplicate and must authenticate if we
        // require authentication.
        if pkt.header.transmit_timestamp == self.remote_ntp_tx {
            return ReceiveOutcome::Rejected(ValidationMask::default());
        }
        if self.auth_mode != AuthMode::None && !matches!(pkt.trailer, AuthTrailer::Symmetric { .. })
        {
            return ReceiveOutcome::Rejected(ValidationMask::default());
        }

        if pkt.header.ref_id == RefId::kod(b"RATE") {
            self.minpoll = self.minpoll.max(pkt.header.poll);
            self.minpoll = self.minpoll.min(crate::config::MAX_KOD_RATE_POLL);
            self.maxpoll = self.maxpoll.max(self.minpoll);
            self.burst_total = 0;
            self.burst_good = 0;
            if matches!(
                self.mode,
                super::OperatingMode::BurstWasOnline | super::OperatingMode::BurstWasOffline
            ) {
                self.mode = if self.mode == super::OperatingMode::BurstWasOnline {
                    super::OperatingMode::Online
                } else {
                    super::OperatingMode::Offline
                };
            }
            self.kod_extra_delay = Seconds(4.0 * 2f64.powi(i32::from(self.minpoll)));
        }
        ReceiveOutcome::KissOfDeath
    }

    fn run_tests(
        &self,
        pkt: &NtpPacket,
        ctx: &ReceiveContext<'_>,
        clock: &impl ClockDiscipline,
    ) -> ValidationMask {
        let mut mask = ValidationMask::default();

        // T1: not a duplicate transmit.
        mask.set(T1, pkt.header.transmit_timestamp != self.remote_ntp_tx);

        // T2: originate matches our last transmit (basic) or our last
        // receive (interleaved) — the interleaved branch additionally
        // marks this exchange as interleaved.
        let basic_match = pkt.header.originate_timestamp == self.local_ntp_tx;
        let interleaved_match =
            self.interleaved && pkt.header.originate_timestamp == self.local_ntp_rx;
        mask.set(T2, basic_match || interleaved_match);

        // T3: none of the three wire timestamps is zero.
        mask.set(
            T3,
            !pkt.header.originate_timestamp.is_zero()
                && !pkt.header.receive_timestamp.is_zero()
                && !pkt.header.transmit_timestamp.is_zero(),
        );

        // T5: authentication.
        mask.set(T5, self.check_auth(pkt, ctx.keystore));

        // T6: synchronisation / sanity.
        mask.set(
            T6,
            pkt.header.leap != LeapIndicator::Unsynchronised
                && pkt.header.stratum < crate::packet::NTP_MAX_STRATUM
                && pkt.header.stratum != 0,
        );

        // T7: root distance.
        let root_distance =
            pkt.header.root_delay.to_seconds() * 0.5 + pkt.header.root_dispersion.to_seconds();
        mask.set(T7, root_distance < NTP_MAX_DISPERSION);

        let (delay, offset) =
            self.compute_delay_offset(pkt, ctx.rx_ts, ctx.precision, mask.t2() && self.interleaved);

        // TA: delay ceiling, mode-dependent.
        let ta = delay <= self.max_delay
            && (self.association != AssociationMode::Client
                || self.server_interval(pkt, ctx.rx_ts) <= MAX_SERVER_INTERVAL)
            && (!(self.interleaved && mask.t2())
                || delay <= Seconds(2f64.powi(i32::from(self.remote_poll))) * 0.5);
        mask.set(TA, ta);

        // TB: delay ratio vs. the best round-trip delay seen so far.
        let min_rtt = clock.min_round_trip_delay(self.stats);
        let tb = self.max_delay_ratio <= 1.0
            || min_rtt.0 <= 0.0
            || delay.0 / min_rtt.0 <= self.max_delay_ratio;
        mask.set(TB, tb);

        // TC: clock subsystem's own sample-consistency check.
        mask.set(
            TC,
            clock.is_good_sample(self.stats, offset, delay, self.max_delay_dev_ratio),
        );

        // TD: anti-loop — our stratum above 1, or the clock isn't in
        // normal mode, or the peer's refid doesn't match our own (would
        // indicate a timing loop through this interface).
        let td = clock.local_stratum() > 1
            || !clock.is_normal_mode()
            || pkt.header.ref_id != clock.local_refid();
        mask.set(TD, td);

        mask
    }

    fn check_auth(&self, pkt: &NtpPacket, keystore: &KeyStore) -> bool {
        if self.auth_mode == AuthMode::None {
            return true;
        }
        match &pkt.trailer {
            AuthTrailer::Symmetric { key_id, mac } => {
                *key_id == self.key_id
                    && keystore.verify(*key_id, &pkt.mac_signed_prefix(*key_id), mac)
            }
            AuthTrailer::MsSntp if self.auth_mode == AuthMode::MsSntp => true,
            AuthTrailer::MsSntpExtended if self.auth_mode == AuthMode::MsSntpExtended => true,
            _ => false,
        }
    }

    fn server_interval(&self, pkt: &NtpPacket, rx_ts: LocalInstant) -> Seconds {
        let local_ntp_now = NtpTimestamp::from(rx_ts);
        local_ntp_now.wrapping_diff(pkt.header.receive_timestamp)
    }

    /// Basic/interleaved delay+offset computation (spec.md §4.2.3 steps 3-4).
    /// `delay` is clamped to at least the local precision before it is
    /// returned, per step 4 ("clamp `delay` to at least the local
    /// precision").
    fn compute_delay_offset(
        &self,
        pkt: &NtpPacket,
        rx_ts: LocalInstant,
        precision: i8,
        interleaved: bool,
    ) -> (Seconds, Seconds) {
        let (local_tx_ts, remote_rx_ts) = if interleaved {
            let prev_local_tx = self
                .local_tx
                .map(|s| NtpTimestamp::from(s.instant))
                .unwrap_or(NtpTimestamp::ZERO);
            (prev_local_tx, self.remote_ntp_rx)
        } else {
            (self.local_ntp_tx, pkt.header.receive_timestamp)
        };

        let local_now = NtpTimestamp::from(rx_ts);
        let local_interval = local_now.wrapping_diff(local_tx_ts);
        let remote_interval = pkt.header.transmit_timestamp.wrapping_diff(remote_rx_ts);
        let delay = (local_interval - remote_interval)
            .abs()
            .max(Seconds(2f64.powi(i32::from(precision))));

        // offset = ((T2 - T1) + (T3 - T4)) / 2, each difference resolved
        // with `wrapping_diff` rather than against an absolute zero point —
        // the four timestamps span one exchange, so their pairwise
        // differences stay well inside the +/-2^31 s window `wrapping_diff`
        // requires even though the timestamps themselves do not.
        let t2_minus_t1 = remote_rx_ts.wrapping_diff(local_tx_ts);
        let t3_minus_t4 = pkt.header.transmit_timestamp.wrapping_diff(local_now);
        let offset = (t2_minus_t1 + t3_minus_t4) * 0.5;

        (delay, offset)
    }

    fn update_timestamps(&mut self, pkt: &NtpPacket, rx_ts: LocalInstant, mask: ValidationMask) {
        match self.association {
            AssociationMode::Client => {
                if !self.updated_timestamps {
                    self.remote_ntp_rx = pkt.header.receive_timestamp;
                    self.remote_ntp_tx = pkt.header.transmit_timestamp;
                    self.local_rx = Some(LocalSample {
                        instant: rx_ts,
                        error: Seconds::ZERO,
                        provenance: TimestampProvenance::Daemon,
                    });
                    self.local_ntp_rx = NtpTimestamp::from(rx_ts);
                    self.valid_timestamps = mask.synced_packet();
                    self.updated_timestamps = true;
                }
            }
            AssociationMode::Active => {
                let replay_guarded = mask.valid_packet()
                    || (!self.updated_timestamps
                        && mask.0 & T5 != 0
                        && pkt.header.transmit_timestamp.wrapping_diff(self.remote_ntp_tx).0
                            > 0.0);
                if replay_guarded {
                    self.remote_ntp_rx = pkt.header.receive_timestamp;
                    self.remote_ntp_tx = pkt.header.transmit_timestamp;
                    self.local_rx = Some(LocalSample {
                        instant: rx_ts,
                        error: Seconds::ZERO,
                        provenance: TimestampProvenance::Daemon,
                    });
                    self.local_ntp_rx = NtpTimestamp::from(rx_ts);
                    self.valid_timestamps = mask.synced_packet();
                    self.updated_timestamps = true;
                }
            }
        }
    }

    fn accumulate_good_sample(
        &mut self,
        pkt: &NtpPacket,
        ctx: &ReceiveContext<'_>,
        clock: &mut impl ClockDiscipline,
    ) {
        let interleaved_now = self.interleaved && self.local_tx.is_some();
        let (delay, offset) =
            self.compute_delay_offset(pkt, ctx.rx_ts, ctx.precision, interleaved_now);
        // `skew` is the clock subsystem's own frequency-uncertainty term
        // ((freq_hi - freq_lo) / 2, spec.md §4.2.3 step 4); it isn't
        // locally available data the way the precision clamp above is, so
        // it's left at 0.0 pending a `ClockDiscipline` accessor for it.
        let skew = 0.0;
        let dispersion = Seconds(2f64.powi(i32::from(ctx.precision)) + skew * delay.0.abs());

        let sample_time = ctx.rx_ts;
        let estimated_offset = clock.predict_offset(self.stats, sample_time);

        clock.accumulate_sample(
            self.stats,
            Sample {
                sample_time,
                offset,
                delay,
                dispersion,
                root_delay: pkt.header.root_delay.to_seconds() + delay,
                root_dispersion: pkt.header.root_dispersion.to_seconds() + dispersion,
                stratum: pkt.header.stratum.max(self.min_stratum),
                leap: pkt.header.leap,
            },
        );
        clock.select_source();

        let distance = pkt.header.root_delay.to_seconds() * 0.5 + pkt.header.root_dispersion.to_seconds() + dispersion;
        let error = (offset - estimated_offset).abs();
        self.adjust_poll_for_error(error, distance);

        if self.burst_good > 0 {
            self.burst_good -= 1;
            if self.burst_good == 0 {
                self.mode = match self.mode {
                    super::OperatingMode::BurstWasOnline => super::OperatingMode::Online,
                    super::OperatingMode::BurstWasOffline => super::OperatingMode::Offline,
                    other => other,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeyStore;
    use crate::clock::{NullClock, SourceStatsHandle};
    use crate::config::{SourceKind, SourceParams};
    use crate::packet::{Mode, NtpHeader};
    use std::net::Ipv4Addr;

    fn make_source() -> Source {
        let mut source = Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Server,
            SourceParams {
                minpoll: 6,
                maxpoll: 10,
                max_delay: Seconds(3.0),
                ..SourceParams::default()
            },
            SourceStatsHandle(0),
        );
        source.take_online();
        source
    }

    fn basic_reply(originate: NtpTimestamp, transmit: NtpTimestamp) -> NtpPacket {
        NtpPacket {
            header: NtpHeader {
                leap: LeapIndicator::NoWarning,
                version: 4,
                mode: Mode::Server,
                stratum: 2,
                poll: 6,
                precision: -20,
                root_delay: crate::timestamp::NtpShort::from_seconds(Seconds(0.01)),
                root_dispersion: crate::timestamp::NtpShort::from_seconds(Seconds(0.01)),
                ref_id: RefId(0),
                reference_timestamp: NtpTimestamp::new(100, 0),
                originate_timestamp: originate,
                receive_timestamp: NtpTimestamp::new(200, 0),
                transmit_timestamp: transmit,
            },
            extensions: Vec::new(),
            trailer: AuthTrailer::None,
        }
    }

    #[test]
    fn duplicate_reply_is_rejected_by_t1() {
        let mut source = make_source();
        source.local_ntp_tx = NtpTimestamp::new(199, 0);
        source.remote_ntp_tx = NtpTimestamp::new(200, 0);

        let pkt = basic_reply(NtpTimestamp::new(199, 0), NtpTimestamp::new(200, 0));
        let keystore = KeyStore::new();
        let ctx = ReceiveContext {
            local_addr: IpAddress::Unspec,
            rx_ts: LocalInstant::new(1000, 0),
            precision: -20,
            keystore: &keystore,
        };
        let mut clock = NullClock::new();
        let outcome = source.process_rx_known(&pkt, &ctx, &mut clock);
        match outcome {
            ReceiveOutcome::Rejected(mask) => assert!(!mask.t1()),
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert!(clock.samples().is_empty());
    }

    #[test]
    fn basic_valid_reply_accumulates_sample() {
        // All timestamps are derived from one `LocalInstant` baseline with
        // sub-second offsets, so the NTP-era wraparound arithmetic in
        // `wrapping_diff` sees realistic (small) separations rather than
        // the ~2^31 s spread that raw small `NtpTimestamp` constants like
        // `(199, 0)` produce against a `LocalInstant` baseline near "now".
        let query = LocalInstant::new(2_000_000_000, 0);
        let mut source = make_source();
        source.local_ntp_tx = query.to_ntp(0.0);
        source.remote_ntp_tx = NtpTimestamp::ZERO;

        let mut pkt = basic_reply(
            source.local_ntp_tx,
            query.add_seconds(Seconds(0.05)).to_ntp(0.0),
        );
        pkt.header.receive_timestamp = query.add_seconds(Seconds(0.03)).to_ntp(0.0);
        // Distinguish from `NullClock::local_refid() == RefId(0)` so T D's
        // anti-loop check passes.
        pkt.header.ref_id = RefId(0x7f00_0001);

        let keystore = KeyStore::new();
        let ctx = ReceiveContext {
            local_addr: IpAddress::Unspec,
            rx_ts: query.add_seconds(Seconds(0.08)),
            precision: -20,
            keystore: &keystore,
        };
        let mut clock = NullClock::new();
        let outcome = source.process_rx_known(&pkt, &ctx, &mut clock);
        assert!(matches!(outcome, ReceiveOutcome::Accepted(m) if m.good_packet()));
        assert_eq!(clock.samples().len(), 1);
        assert!(source.valid_rx);
    }

    #[test]
    fn kod_rate_raises_minpoll_and_adds_delay() {
        let mut source = make_source();
        source.remote_ntp_tx = NtpTimestamp::ZERO;
        let mut pkt = basic_reply(NtpTimestamp::ZERO, NtpTimestamp::new(1, 0));
        pkt.header.stratum = 0;
        pkt.header.leap = LeapIndicator::Unsynchronised;
        pkt.header.ref_id = RefId::kod(b"RATE");
        pkt.header.poll = 10;

        let keystore = KeyStore::new();
        let ctx = ReceiveContext {
            local_addr: IpAddress::Unspec,
            rx_ts: LocalInstant::new(1000, 0),
            precision: -20,
            keystore: &keystore,
        };
        let mut clock = NullClock::new();
        let outcome = source.process_rx_known(&pkt, &ctx, &mut clock);
        assert_eq!(outcome, ReceiveOutcome::KissOfDeath);
        assert_eq!(source.minpoll, 10);
        assert!(source.kod_extra_delay.0 > 0.0);
        assert!(clock.samples().is_empty());
    }
}
