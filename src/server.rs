//! Server path: unsolicited-request handling for addresses with no
//! configured source (spec.md §4.3).

use crate::access_filter::AccessFilter;
use crate::auth::KeyStore;
use crate::client_log::{ClientAccessLog, LogIndex};
use crate::config::MAX_TX_DELAY;
use crate::ident::{IpAddress, RefId};
use crate::packet::{AuthTrailer, LeapIndicator, Mode, NtpHeader, NtpPacket};
use crate::source::{LocalSample, Source, TimestampProvenance};
use crate::timestamp::{LocalInstant, NtpShort, NtpTimestamp, Seconds};

/// Ambient values the server path needs from the clock subsystem and the
/// caller, mirroring [`crate::source::transmit`]'s `TransmitContext`
/// (spec.md §1 "external collaborators").
#[derive(Debug, Clone, Copy)]
pub struct ServerContext {
    pub now: LocalInstant,
    pub leap: LeapIndicator,
    pub our_stratum: u8,
    pub refid: RefId,
    pub reference_timestamp: NtpTimestamp,
    pub root_delay: Seconds,
    pub root_dispersion: Seconds,
    pub precision: i8,
    pub fuzz: f64,
}

/// Why a datagram was dropped rather than answered (spec.md §4.3 steps 1-6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Didn't arrive on a socket opened for unsolicited server traffic.
    NotServerSocket,
    /// `access_filter` denied the remote address.
    Denied,
    /// Packet mode has no server-path response (anything but `Client` or
    /// `SymmetricActive`).
    UnsupportedMode,
    /// `client_access_log` rate limiter fired.
    RateLimited,
    /// MAC present but invalid, or an unrecognised auth trailer shape.
    AuthFailed,
}

/// A built reply, plus the log slot it was accounted against (the caller
/// needs the index to later call [`process_tx_unknown`]).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerReply {
    pub packet: Vec<u8>,
    pub log_index: LogIndex,
}

/// What the server path decided to do with an unsolicited datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOutcome {
    Dropped(DropReason),
    Replied(ServerReply),
}

/// `process_rx_unknown` (spec.md §4.3 steps 1-8): handle a packet that
/// didn't match any configured source.
pub fn handle_unsolicited(
    pkt: &NtpPacket,
    remote_ip: IpAddress,
    arrived_on_server_socket: bool,
    ctx: &ServerContext,
    access_filter: &AccessFilter,
    client_log: &mut ClientAccessLog,
    keystore: &KeyStore,
) -> ServerOutcome {
    // Step 1.
    if !arrived_on_server_socket {
        return ServerOutcome::Dropped(DropReason::NotServerSocket);
    }

    // Step 2.
    if !access_filter.is_allowed(remote_ip) {
        return ServerOutcome::Dropped(DropReason::Denied);
    }

    // Step 3.
    let reply_mode = match pkt.header.mode {
        Mode::Client => Mode::Server,
        Mode::SymmetricActive => Mode::SymmetricPassive,
        _ => return ServerOutcome::Dropped(DropReason::UnsupportedMode),
    };

    // Step 4.
    let log_index = client_log.log_ntp_access(remote_ip, ctx.now);

    // Step 5.
    if client_log.limit_ntp_response_rate(log_index) {
        return ServerOutcome::Dropped(DropReason::RateLimited);
    }

    // Step 6: authentication. A valid MAC is echoed (key id carried over,
    // digest recomputed once the reply body is fixed); `None` and `MsSntp`
    // reply unauthenticated; anything else — a bad MAC, or the MS-SNTP
    // extended shape this server doesn't speak — drops the datagram.
    let reply_trailer = match &pkt.trailer {
        AuthTrailer::None => AuthTrailer::None,
        AuthTrailer::Symmetric { key_id, mac } => {
            if keystore.verify(*key_id, &pkt.mac_signed_prefix(*key_id), mac) {
                AuthTrailer::Symmetric {
                    key_id: *key_id,
                    mac: Vec::new(),
                }
            } else {
                return ServerOutcome::Dropped(DropReason::AuthFailed);
            }
        }
        AuthTrailer::MsSntp => AuthTrailer::MsSntp,
        AuthTrailer::MsSntpExtended => return ServerOutcome::Dropped(DropReason::AuthFailed),
    };

    // Step 7: interleaved-mode echo. `now_ts` stands in for both the
    // receive and transmit instants of this exchange — the server path
    // runs synchronously, so there's no daylight between "received" and
    // "about to reply" the way there is for a polled client source.
    let now_ts = ctx.now.to_ntp(ctx.fuzz);
    let stored = client_log.get_ntp_timestamps(log_index);
    let interleaved = stored
        .map_or(false, |(rx, tx)| rx == pkt.header.originate_timestamp && !tx.is_zero());

    let (originate_ts, transmit_ts) = if interleaved {
        let (_, stored_tx) = stored.expect("checked above");
        (pkt.header.originate_timestamp, stored_tx)
    } else {
        (pkt.header.transmit_timestamp, now_ts)
    };

    let header = NtpHeader {
        leap: ctx.leap,
        version: pkt.header.version,
        mode: reply_mode,
        stratum: ctx.our_stratum.min(crate::packet::NTP_MAX_STRATUM),
        poll: pkt.header.poll,
        precision: ctx.precision,
        root_delay: NtpShort::from_seconds(ctx.root_delay),
        root_dispersion: NtpShort::from_seconds(ctx.root_dispersion),
        ref_id: ctx.refid,
        reference_timestamp: ctx.reference_timestamp,
        originate_timestamp: originate_ts,
        receive_timestamp: now_ts,
        transmit_timestamp: transmit_ts,
    };

    let mut packet = NtpPacket {
        header,
        extensions: Vec::new(),
        trailer: reply_trailer,
    };

    if let AuthTrailer::Symmetric { key_id, .. } = &packet.trailer {
        let key_id = *key_id;
        match keystore.generate(key_id, &packet.mac_signed_prefix(key_id)) {
            Ok(mac) => packet.trailer = AuthTrailer::Symmetric { key_id, mac },
            Err(_) => return ServerOutcome::Dropped(DropReason::AuthFailed),
        }
    }

    let bytes = packet.serialize();

    // Step 8: the next exchange's interleaved-echo check reads these back.
    client_log.set_ntp_timestamps(log_index, now_ts, now_ts);

    ServerOutcome::Replied(ServerReply {
        packet: bytes,
        log_index,
    })
}

/// `process_tx_known` (spec.md §4.3): once the kernel/NIC reports a more
/// precise transmit instant for a datagram a configured source already
/// recorded as `local_tx`, fold it in — but only if the correction is
/// small and the source hasn't since moved on to a different exchange.
pub fn process_tx_known(
    source: &mut Source,
    sent: &NtpPacket,
    new_instant: LocalInstant,
    provenance: TimestampProvenance,
) -> bool {
    let Some(prior) = source.local_tx else {
        return false;
    };
    if sent.header.transmit_timestamp != source.local_ntp_tx {
        return false;
    }
    let delay = new_instant.duration_since(prior.instant);
    if delay.0 < 0.0 || delay.0 > MAX_TX_DELAY.0 {
        return false;
    }
    source.local_tx = Some(LocalSample {
        instant: new_instant,
        error: Seconds::ZERO,
        provenance,
    });
    true
}

/// `process_tx_unknown` (spec.md §4.3): the same late-timestamp refinement
/// for a reply logged in the client access table rather than a configured
/// source. The caller tracks `prior_tx_instant` itself (the access log only
/// stores the wire `NtpTimestamp`, not a monotonic instant) from whatever
/// short-lived send bookkeeping it keeps per in-flight datagram.
pub fn process_tx_unknown(
    client_log: &mut ClientAccessLog,
    log_index: LogIndex,
    sent: &NtpPacket,
    prior_tx_instant: LocalInstant,
    new_instant: LocalInstant,
) -> bool {
    let Some((stored_rx, stored_tx)) = client_log.get_ntp_timestamps(log_index) else {
        return false;
    };
    if stored_rx != sent.header.receive_timestamp || stored_tx != sent.header.transmit_timestamp {
        return false;
    }
    let delay = new_instant.duration_since(prior_tx_instant);
    if delay.0 < 0.0 || delay.0 > MAX_TX_DELAY.0 {
        return false;
    }
    client_log.set_ntp_timestamps(log_index, stored_rx, NtpTimestamp::from(new_instant));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_filter::Action;
    use crate::auth::{KeyFileEntry, MacAlgorithm};
    use crate::client_log::RateLimitConfig;
    use crate::clock::SourceStatsHandle;
    use crate::config::{SourceKind, SourceParams};
    use std::net::Ipv4Addr;

    fn ctx(now: LocalInstant) -> ServerContext {
        ServerContext {
            now,
            leap: LeapIndicator::NoWarning,
            our_stratum: 2,
            refid: RefId(0x7f00_0001),
            reference_timestamp: NtpTimestamp::new(1_000, 0),
            root_delay: Seconds(0.001),
            root_dispersion: Seconds(0.002),
            precision: -20,
            fuzz: 0.0,
        }
    }

    fn client_request(mode: Mode, transmit: NtpTimestamp) -> NtpPacket {
        NtpPacket {
            header: NtpHeader {
                leap: LeapIndicator::NoWarning,
                version: 4,
                mode,
                stratum: 0,
                poll: 6,
                precision: -18,
                root_delay: NtpShort::from_seconds(Seconds::ZERO),
                root_dispersion: NtpShort::from_seconds(Seconds::ZERO),
                ref_id: RefId(0),
                reference_timestamp: NtpTimestamp::ZERO,
                originate_timestamp: NtpTimestamp::ZERO,
                receive_timestamp: NtpTimestamp::ZERO,
                transmit_timestamp: transmit,
            },
            extensions: Vec::new(),
            trailer: AuthTrailer::None,
        }
    }

    #[test]
    fn denied_address_is_dropped() {
        let filter = AccessFilter::new(Action::Deny);
        let mut log = ClientAccessLog::new(RateLimitConfig::default());
        let keystore = KeyStore::new();
        let pkt = client_request(Mode::Client, NtpTimestamp::new(10, 0));
        let ip = IpAddress::V4(Ipv4Addr::new(203, 0, 113, 9));
        let outcome = handle_unsolicited(&pkt, ip, true, &ctx(LocalInstant::new(1000, 0)), &filter, &mut log, &keystore);
        assert_eq!(outcome, ServerOutcome::Dropped(DropReason::Denied));
    }

    #[test]
    fn off_server_socket_is_dropped() {
        let filter = AccessFilter::new(Action::Allow);
        let mut log = ClientAccessLog::new(RateLimitConfig::default());
        let keystore = KeyStore::new();
        let pkt = client_request(Mode::Client, NtpTimestamp::new(10, 0));
        let ip = IpAddress::V4(Ipv4Addr::new(203, 0, 113, 9));
        let outcome = handle_unsolicited(&pkt, ip, false, &ctx(LocalInstant::new(1000, 0)), &filter, &mut log, &keystore);
        assert_eq!(outcome, ServerOutcome::Dropped(DropReason::NotServerSocket));
    }

    #[test]
    fn basic_client_request_gets_server_reply_echoing_transmit() {
        let filter = AccessFilter::new(Action::Allow);
        let mut log = ClientAccessLog::new(RateLimitConfig::default());
        let keystore = KeyStore::new();
        let client_tx = NtpTimestamp::new(5_000, 0);
        let pkt = client_request(Mode::Client, client_tx);
        let ip = IpAddress::V4(Ipv4Addr::new(203, 0, 113, 9));

        let outcome = handle_unsolicited(&pkt, ip, true, &ctx(LocalInstant::new(1000, 0)), &filter, &mut log, &keystore);
        let reply = match outcome {
            ServerOutcome::Replied(r) => r,
            other => panic!("expected Replied, got {other:?}"),
        };
        let parsed = NtpPacket::parse(&reply.packet).unwrap();
        assert_eq!(parsed.header.mode, Mode::Server);
        assert_eq!(parsed.header.originate_timestamp, client_tx);
        assert_ne!(parsed.header.receive_timestamp, NtpTimestamp::ZERO);
    }

    #[test]
    fn second_exchange_uses_interleaved_echo() {
        let filter = AccessFilter::new(Action::Allow);
        let mut log = ClientAccessLog::new(RateLimitConfig::default());
        let keystore = KeyStore::new();
        let ip = IpAddress::V4(Ipv4Addr::new(203, 0, 113, 9));

        let first = client_request(Mode::Client, NtpTimestamp::new(5_000, 0));
        let outcome = handle_unsolicited(&first, ip, true, &ctx(LocalInstant::new(1000, 0)), &filter, &mut log, &keystore);
        let first_reply = match outcome {
            ServerOutcome::Replied(r) => r,
            other => panic!("expected Replied, got {other:?}"),
        };
        let (first_rx, first_tx) = log.get_ntp_timestamps(first_reply.log_index).unwrap();

        // The client's second request echoes our first reply's receive
        // timestamp back as its originate — the interleaved-mode signal.
        let mut second = client_request(Mode::Client, NtpTimestamp::new(5_010, 0));
        second.header.originate_timestamp = first_rx;

        let outcome = handle_unsolicited(&second, ip, true, &ctx(LocalInstant::new(1010, 0)), &filter, &mut log, &keystore);
        let second_reply = match outcome {
            ServerOutcome::Replied(r) => r,
            other => panic!("expected Replied, got {other:?}"),
        };
        let parsed = NtpPacket::parse(&second_reply.packet).unwrap();
        assert_eq!(parsed.header.originate_timestamp, first_rx);
        assert_eq!(parsed.header.transmit_timestamp, first_tx);
    }

    #[test]
    fn rate_limited_client_is_dropped() {
        let filter = AccessFilter::new(Action::Allow);
        let mut log = ClientAccessLog::new(RateLimitConfig { threshold_hz: 10.0 });
        let keystore = KeyStore::new();
        let ip = IpAddress::V4(Ipv4Addr::new(198, 51, 100, 5));
        let mut now = LocalInstant::new(2_000_000, 0);
        let mut limited = false;
        for i in 0..200u32 {
            now = now.add_seconds(Seconds(0.001));
            let pkt = client_request(Mode::Client, NtpTimestamp::new(6_000 + i as u32, 0));
            let outcome = handle_unsolicited(&pkt, ip, true, &ctx(now), &filter, &mut log, &keystore);
            if outcome == ServerOutcome::Dropped(DropReason::RateLimited) {
                limited = true;
                break;
            }
        }
        assert!(limited);
    }

    #[test]
    fn valid_mac_is_echoed_with_fresh_digest() {
        let filter = AccessFilter::new(Action::Allow);
        let mut log = ClientAccessLog::new(RateLimitConfig::default());
        let keystore = KeyStore::from_entries([KeyFileEntry {
            id: 7,
            algorithm: MacAlgorithm::Sha1,
            material: vec![0x42; 20],
        }]);
        let mut pkt = client_request(Mode::Client, NtpTimestamp::new(5_000, 0));
        let mac = keystore.generate(7, &pkt.mac_signed_prefix(7)).unwrap();
        pkt.trailer = AuthTrailer::Symmetric { key_id: 7, mac };
        let ip = IpAddress::V4(Ipv4Addr::new(203, 0, 113, 9));

        let outcome = handle_unsolicited(&pkt, ip, true, &ctx(LocalInstant::new(1000, 0)), &filter, &mut log, &keystore);
        let reply = match outcome {
            ServerOutcome::Replied(r) => r,
            other => panic!("expected Replied, got {other:?}"),
        };
        let parsed = NtpPacket::parse(&reply.packet).unwrap();
        match &parsed.trailer {
            AuthTrailer::Symmetric { key_id, mac } => {
                assert_eq!(*key_id, 7);
                assert!(keystore.verify(7, &parsed.mac_signed_prefix(7), mac));
            }
            other => panic!("expected Symmetric trailer, got {other:?}"),
        }
    }

    #[test]
    fn bad_mac_is_dropped() {
        let filter = AccessFilter::new(Action::Allow);
        let mut log = ClientAccessLog::new(RateLimitConfig::default());
        let keystore = KeyStore::from_entries([KeyFileEntry {
            id: 7,
            algorithm: MacAlgorithm::Sha1,
            material: vec![0x42; 20],
        }]);
        let mut pkt = client_request(Mode::Client, NtpTimestamp::new(5_000, 0));
        pkt.trailer = AuthTrailer::Symmetric {
            key_id: 7,
            mac: vec![0xFF; 20],
        };
        let ip = IpAddress::V4(Ipv4Addr::new(203, 0, 113, 9));
        let outcome = handle_unsolicited(&pkt, ip, true, &ctx(LocalInstant::new(1000, 0)), &filter, &mut log, &keystore);
        assert_eq!(outcome, ServerOutcome::Dropped(DropReason::AuthFailed));
    }

    #[test]
    fn process_tx_known_refines_instant_within_window() {
        let mut source = Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Server,
            SourceParams::default(),
            SourceStatsHandle(0),
        );
        let sent_tx = NtpTimestamp::new(42, 0);
        source.local_ntp_tx = sent_tx;
        let approx_instant = LocalInstant::new(1000, 0);
        source.local_tx = Some(LocalSample {
            instant: approx_instant,
            error: Seconds::ZERO,
            provenance: TimestampProvenance::Daemon,
        });
        let sent = client_request(Mode::Client, sent_tx);

        let refined_instant = approx_instant.add_seconds(Seconds(0.01));
        let updated = process_tx_known(&mut source, &sent, refined_instant, TimestampProvenance::Kernel);
        assert!(updated);
        assert_eq!(source.local_tx.unwrap().instant, refined_instant);
        assert_eq!(source.local_tx.unwrap().provenance, TimestampProvenance::Kernel);
    }

    #[test]
    fn process_tx_known_rejects_stale_packet() {
        let mut source = Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Server,
            SourceParams::default(),
            SourceStatsHandle(0),
        );
        source.local_ntp_tx = NtpTimestamp::new(42, 0);
        let approx_instant = LocalInstant::new(1000, 0);
        source.local_tx = Some(LocalSample {
            instant: approx_instant,
            error: Seconds::ZERO,
            provenance: TimestampProvenance::Daemon,
        });
        // Packet names a different transmit timestamp: this source has
        // since moved on to a later exchange.
        let sent = client_request(Mode::Client, NtpTimestamp::new(43, 0));
        let updated = process_tx_known(
            &mut source,
            &sent,
            approx_instant.add_seconds(Seconds(0.01)),
            TimestampProvenance::Kernel,
        );
        assert!(!updated);
    }

    #[test]
    fn process_tx_known_rejects_correction_outside_window() {
        let mut source = Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Server,
            SourceParams::default(),
            SourceStatsHandle(0),
        );
        let sent_tx = NtpTimestamp::new(42, 0);
        source.local_ntp_tx = sent_tx;
        let approx_instant = LocalInstant::new(1000, 0);
        source.local_tx = Some(LocalSample {
            instant: approx_instant,
            error: Seconds::ZERO,
            provenance: TimestampProvenance::Daemon,
        });
        let sent = client_request(Mode::Client, sent_tx);
        // MAX_TX_DELAY is 0.1s; 1s later is well outside the window.
        let updated = process_tx_known(
            &mut source,
            &sent,
            approx_instant.add_seconds(Seconds(1.0)),
            TimestampProvenance::Kernel,
        );
        assert!(!updated);
    }
}
