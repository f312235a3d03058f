//! Transmit path (spec.md §4.2.2).

use super::{AssociationMode, LocalSample, OperatingMode, Source, TimestampProvenance};
use crate::auth::KeyStore;
use crate::config::{
    AuthMode, BURST_INTERVAL, BURST_TIMEOUT, MAX_SERVER_INTERVAL, WARM_UP_DELAY,
};
use crate::packet::{AuthTrailer, LeapIndicator, Mode, NtpHeader, NtpPacket};
use crate::timestamp::{LocalInstant, NtpShort, NtpTimestamp, Seconds};

/// Everything the caller (coordinator) needs to actually perform a
/// transmit: the wire bytes, the next timer delay, and an optional
/// receive-timeout to arm (spec.md §4.2.2 step 11).
#[derive(Debug, Clone)]
pub struct TransmitAction {
    pub packet: Vec<u8>,
    pub next_delay: Seconds,
    pub receive_timeout: Option<Seconds>,
}

/// Collects the ambient values the clock subsystem and caller own that the
/// transmit path needs but does not itself compute (spec.md §1 "external
/// collaborators").
#[derive(Debug, Clone, Copy)]
pub struct TransmitContext {
    pub now: LocalInstant,
    pub our_stratum: u8,
    pub root_delay: Seconds,
    pub root_dispersion: Seconds,
    pub precision: i8,
    pub fuzz: f64,
}

impl Source {
    /// Allow the source to transmit; schedule the first transmit (spec.md
    /// §4.2 `start()`). `time_since_last_tx` lets a restarted daemon avoid
    /// immediately bursting a source it was already polling recently.
    pub fn start(&mut self, time_since_last_tx: Option<Seconds>) -> Seconds {
        self.take_online();
        let expected_interval = Seconds(2f64.powi(i32::from(self.local_poll)));
        match time_since_last_tx {
            Some(since) => (expected_interval - since).max(crate::config::INITIAL_DELAY),
            None => crate::config::INITIAL_DELAY,
        }
    }

    /// `get_transmit_delay` (spec.md §4.2.2): the interval until the next
    /// scheduled transmit.
    #[must_use]
    pub fn get_transmit_delay(
        &self,
        on_tx: bool,
        last_tx: Seconds,
        just_presend: bool,
        our_stratum: u8,
    ) -> Seconds {
        if just_presend {
            return WARM_UP_DELAY + self.kod_extra_delay;
        }

        let base = match self.mode {
            OperatingMode::BurstWasOnline | OperatingMode::BurstWasOffline => {
                if on_tx {
                    BURST_TIMEOUT
                } else {
                    BURST_INTERVAL
                }
            }
            OperatingMode::Online | OperatingMode::Offline => match self.association {
                AssociationMode::Client => Seconds(2f64.powi(i32::from(self.local_poll))),
                AssociationMode::Active => {
                    let poll_exp = self.local_poll.min(self.remote_poll).max(self.minpoll);
                    let mut delay = Seconds(2f64.powi(i32::from(poll_exp)));
                    let higher_stratum_peer = self.remote_stratum > 0
                        && self.remote_stratum > our_stratum;
                    if higher_stratum_peer && last_tx.0 * 1.1 < delay.0 {
                        delay = delay * 1.1;
                    } else if self.remote_stratum == our_stratum
                        && !on_tx
                        && last_tx.0 / delay.0.max(f64::EPSILON) > 0.6
                    {
                        delay = delay * 1.1;
                    }
                    (delay - last_tx).max(Seconds::ZERO)
                }
            },
        };

        base + self.kod_extra_delay
    }

    /// Run the transmit path (spec.md §4.2.2). Returns `None` if the
    /// source ended up offline after the TX-edge FSM transition (step 2):
    /// the caller must not send anything and must not re-arm a timer.
    pub fn on_transmit_due(
        &mut self,
        ctx: TransmitContext,
        keystore: &KeyStore,
    ) -> Option<TransmitAction> {
        // Step 1: TX-edge FSM transitions use the burst counter left over
        // from the previous cycle.
        self.maybe_end_burst_on_tx();

        // Step 2.
        if self.is_offline() {
            return None;
        }

        // Step 3: client mode always transmits from a fresh ephemeral
        // socket; opening/closing the real socket is the coordinator's
        // job, we just track the intent.
        if self.association == AssociationMode::Client {
            self.client_socket_open = true;
        }

        // Step 4: presend.
        let is_presend = self.presend_minpoll > 0
            && self.presend_minpoll <= self.local_poll
            && !self.presend_done;
        if is_presend {
            self.presend_done = true;
        }

        // Step 5: build the packet.
        let interleaved_eligible = self.local_tx.is_some();
        let originate = if self.interleaved && interleaved_eligible {
            self.remote_ntp_rx
        } else {
            self.remote_ntp_tx
        };

        let cooked_now = ctx.now.to_ntp(ctx.fuzz);
        let transmit_ts = if self.interleaved && interleaved_eligible {
            NtpTimestamp::from(self.local_tx.expect("checked above").instant)
        } else {
            cooked_now
        };

        // "receive" carries the last time we heard from this peer (zero on
        // a source's very first query), fuzzed by the local precision.
        let receive_ts = self
            .local_rx
            .map(|sample| sample.instant.to_ntp(ctx.fuzz))
            .unwrap_or(NtpTimestamp::ZERO);

        let header = NtpHeader {
            leap: LeapIndicator::NoWarning,
            version: 4,
            mode: match self.association {
                AssociationMode::Client => Mode::Client,
                AssociationMode::Active => Mode::SymmetricActive,
            },
            stratum: ctx.our_stratum.min(crate::packet::NTP_MAX_STRATUM),
            poll: self.local_poll,
            precision: ctx.precision,
            root_delay: NtpShort::from_seconds(ctx.root_delay),
            root_dispersion: NtpShort::from_seconds(ctx.root_dispersion),
            ref_id: self.refid,
            reference_timestamp: NtpTimestamp::ZERO,
            originate_timestamp: originate,
            receive_timestamp: receive_ts,
            transmit_timestamp: transmit_ts,
        };

        let mut packet = NtpPacket {
            header,
            extensions: Vec::new(),
            trailer: AuthTrailer::None,
        };

        // Step 6: authentication.
        match self.auth_mode {
            AuthMode::Symmetric => {
                if let Ok(mac) = keystore.generate(self.key_id, &packet.mac_signed_prefix(self.key_id)) {
                    packet.trailer = AuthTrailer::Symmetric {
                        key_id: self.key_id,
                        mac,
                    };
                }
            }
            AuthMode::MsSntp | AuthMode::MsSntpExtended => {
                // Signing is delegated to an external helper process
                // (spec.md §1); we mark the slot and leave the digest zero
                // for the helper to fill in before the datagram leaves.
                packet.trailer = AuthTrailer::MsSntp;
            }
            AuthMode::None => {}
        }

        let bytes = packet.serialize();

        // Step 7: record the send.
        self.local_tx = Some(LocalSample {
            instant: ctx.now,
            error: Seconds::ZERO,
            provenance: TimestampProvenance::Daemon,
        });
        self.local_ntp_tx = cooked_now;
        self.tx_count += 1;
        self.valid_rx = false;
        self.updated_timestamps = false;

        // Step 8.
        if self.tx_count >= 2 {
            let sync_peer = self.association == AssociationMode::Active;
            self.adjust_poll(if sync_peer { 0.1 } else { 0.25 });
            self.on_unanswered_transmit();
        }

        // Step 9.
        if matches!(
            self.mode,
            OperatingMode::BurstWasOnline | OperatingMode::BurstWasOffline
        ) {
            self.burst_total = self.burst_total.saturating_sub(1);
        }

        // Step 10.
        let next_delay = self.get_transmit_delay(true, Seconds::ZERO, is_presend, ctx.our_stratum);
        self.kod_extra_delay = Seconds::ZERO;

        // Step 11.
        let receive_timeout = (self.association == AssociationMode::Client)
            .then_some(self.max_delay + MAX_SERVER_INTERVAL);

        Some(TransmitAction {
            packet: bytes,
            next_delay,
            receive_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeyStore;
    use crate::clock::SourceStatsHandle;
    use crate::config::{SourceKind, SourceParams};
    use crate::ident::IpAddress;
    use std::net::Ipv4Addr;

    fn make_source() -> Source {
        let mut source = Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Server,
            SourceParams {
                minpoll: 6,
                maxpoll: 10,
                ..SourceParams::default()
            },
            SourceStatsHandle(0),
        );
        source.take_online();
        source
    }

    fn ctx(now: LocalInstant) -> TransmitContext {
        TransmitContext {
            now,
            our_stratum: 3,
            root_delay: Seconds(0.01),
            root_dispersion: Seconds(0.001),
            precision: -20,
            fuzz: 0.0,
        }
    }

    #[test]
    fn offline_source_does_not_transmit() {
        let mut source = make_source();
        source.take_offline();
        let keystore = KeyStore::new();
        let action = source.on_transmit_due(ctx(LocalInstant::new(1000, 0)), &keystore);
        assert!(action.is_none());
    }

    #[test]
    fn online_client_transmits_and_schedules_poll_interval() {
        let mut source = make_source();
        let keystore = KeyStore::new();
        let action = source
            .on_transmit_due(ctx(LocalInstant::new(1000, 0)), &keystore)
            .unwrap();
        assert!(!action.packet.is_empty());
        assert_eq!(source.tx_count, 1);
        assert!(action.receive_timeout.is_some());
        assert!((action.next_delay.0 - 64.0).abs() < 1e-6);
    }

    #[test]
    fn two_unanswered_transmits_mark_unreachable_bit() {
        let mut source = make_source();
        let keystore = KeyStore::new();
        source.on_transmit_due(ctx(LocalInstant::new(1000, 0)), &keystore);
        source.on_transmit_due(ctx(LocalInstant::new(1064, 0)), &keystore);
        assert_eq!(source.reach & 1, 0);
    }
}
