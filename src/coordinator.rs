//! Coordinator (spec.md §2, §9): owns every shared resource — configured
//! sources, server sockets, the access filter, client access log, key
//! store, cookie ring, and the clock discipline implementation — and wires
//! them together over the [`crate::scheduler::Scheduler`].
//!
//! The scheduler's callbacks are plain `FnMut(&mut Scheduler)` /
//! `FnMut(&mut Scheduler, RawFd, EventMask)` closures with no channel for
//! extra state. Every closure here instead captures a clone of an
//! `Rc<RefCell<Shared<C>>>` handle onto the coordinator's state, the usual
//! way a hand-rolled single-threaded reactor threads state through its own
//! callbacks without a runtime to do it for you.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::access_filter::{AccessFilter, Action};
use crate::auth::{KeyFileEntry, KeyStore};
use crate::client_log::{ClientAccessLog, RateLimitConfig};
use crate::clock::ClockDiscipline;
use crate::config::{ServerConfig, SourceKind, SourceParams};
use crate::cookie::{Cookie, ServerKeyRing};
use crate::error::{Error, Result};
use crate::ident::{IpAddress, RefId};
use crate::packet::{LeapIndicator, NtpPacket};
use crate::scheduler::{DelayClass, EventId, EventMask, Scheduler};
use crate::server::{self, ServerContext, ServerOutcome};
use crate::source::{ReceiveContext, Source, TransmitContext};
use crate::timestamp::{LocalInstant, NtpTimestamp, Seconds};

/// Opaque handle identifying one configured source, distinct from the
/// clock subsystem's [`crate::clock::SourceStatsHandle`] (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u32);

struct SourceEntry {
    source: Source,
    transmit_timer: Option<EventId>,
    receive_timer: Option<EventId>,
}

/// Values the coordinator advertises on every reply/request it builds,
/// normally owned and updated by the clock subsystem (spec.md §1 "external
/// collaborators").
#[derive(Debug, Clone, Copy)]
pub struct LocalClockInfo {
    pub stratum: u8,
    pub leap: LeapIndicator,
    pub refid: RefId,
    pub reference_timestamp: NtpTimestamp,
    pub root_delay: Seconds,
    pub root_dispersion: Seconds,
    pub precision: i8,
}

impl Default for LocalClockInfo {
    fn default() -> Self {
        LocalClockInfo {
            stratum: 16,
            leap: LeapIndicator::Unsynchronised,
            refid: RefId(0),
            reference_timestamp: NtpTimestamp::ZERO,
            root_delay: Seconds::ZERO,
            root_dispersion: Seconds::ZERO,
            precision: -20,
        }
    }
}

struct Shared<C> {
    sources: HashMap<SourceId, SourceEntry>,
    remote_index: HashMap<IpAddress, SourceId>,
    client_sockets: HashMap<SourceId, UdpSocket>,
    server_sockets: HashMap<bool, UdpSocket>,
    access_filter: AccessFilter,
    client_log: ClientAccessLog,
    keystore: KeyStore,
    cookies: ServerKeyRing,
    clock: C,
    clock_info: LocalClockInfo,
    next_id: u32,
}

fn to_socket_addr(ip: IpAddress) -> Option<SocketAddr> {
    let addr: Option<std::net::IpAddr> = ip.into();
    addr.map(|a| SocketAddr::new(a, 123))
}

/// Dispatches inbound datagrams, drives the per-source transmit/receive
/// cycle, and owns the scheduler's run loop (spec.md §2).
pub struct Coordinator<C: ClockDiscipline + 'static> {
    scheduler: Scheduler,
    shared: Rc<RefCell<Shared<C>>>,
}

impl<C: ClockDiscipline + 'static> Coordinator<C> {
    /// # Errors
    /// Returns an I/O error if the scheduler's OS poll instance cannot be
    /// created.
    pub fn new(clock: C) -> std::io::Result<Self> {
        Self::with_server_config(clock, ServerConfig::default())
    }

    /// # Errors
    /// Returns an I/O error if the scheduler's OS poll instance cannot be
    /// created.
    pub fn with_server_config(clock: C, server_config: ServerConfig) -> std::io::Result<Self> {
        let shared = Rc::new(RefCell::new(Shared {
            sources: HashMap::new(),
            remote_index: HashMap::new(),
            client_sockets: HashMap::new(),
            server_sockets: HashMap::new(),
            access_filter: AccessFilter::new(Action::Deny),
            client_log: ClientAccessLog::new(RateLimitConfig {
                threshold_hz: server_config.rate_limit_threshold_hz,
            }),
            keystore: KeyStore::new(),
            cookies: ServerKeyRing::new(server_config.rotate_interval),
            clock,
            clock_info: LocalClockInfo::default(),
            next_id: 0,
        }));
        let mut coordinator = Coordinator {
            scheduler: Scheduler::new()?,
            shared,
        };
        coordinator.arm_cookie_rotation();
        Ok(coordinator)
    }

    /// Update the values advertised on every built reply/request (spec.md
    /// §1). The caller (the clock subsystem's owner) is expected to call
    /// this whenever stratum/leap/refid change.
    pub fn set_clock_info(&mut self, info: LocalClockInfo) {
        self.shared.borrow_mut().clock_info = info;
    }

    // -- access filter / key material -----------------------------------

    pub fn add_access_rule(&mut self, addr: IpAddress, prefix_len: u8, action: Action) {
        self.shared
            .borrow_mut()
            .access_filter
            .add_rule(addr, prefix_len, action);
    }

    pub fn load_keys(&mut self, entries: impl IntoIterator<Item = KeyFileEntry>) {
        let mut state = self.shared.borrow_mut();
        for entry in entries {
            state.keystore.insert(entry);
        }
    }

    /// Reconstruct the server cookie ring from persisted entries (spec.md
    /// §4.4, §6), replacing whatever ring was generated at construction.
    ///
    /// # Errors
    /// Returns [`Error::Persistence`] if any entry has the wrong key length.
    pub fn restore_cookie_keys(
        &mut self,
        entries: impl IntoIterator<Item = (u32, Vec<u8>)>,
        rotate_interval: Seconds,
    ) -> Result<()> {
        let ring = ServerKeyRing::from_entries(entries, rotate_interval)?;
        self.shared.borrow_mut().cookies = ring;
        Ok(())
    }

    #[must_use]
    pub fn cookie_key_entries(&self) -> Vec<(u32, Vec<u8>)> {
        self.shared.borrow().cookies.to_entries()
    }

    /// # Errors
    /// Returns [`Error::InvalidState`] if the underlying AEAD operation
    /// fails.
    pub fn generate_cookie(&self, c2s: &[u8], s2c: &[u8]) -> Result<Cookie> {
        self.shared.borrow().cookies.generate_cookie(c2s, s2c)
    }

    /// # Errors
    /// Returns [`Error::CookieDecodeFailed`] on any integrity, key-id, or
    /// rotated-out-key failure.
    pub fn decode_cookie(&self, cookie: &[u8], half_len: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        self.shared.borrow().cookies.decode_cookie(cookie, half_len)
    }

    fn arm_cookie_rotation(&mut self) {
        let interval = self.shared.borrow().cookies.rotate_interval();
        let shared = self.shared.clone();
        self.scheduler.add_timeout_by_delay(interval, move |scheduler| {
            Self::on_cookie_rotation(&shared, scheduler);
        });
    }

    fn on_cookie_rotation(shared: &Rc<RefCell<Shared<C>>>, scheduler: &mut Scheduler) {
        let interval = {
            let mut state = shared.borrow_mut();
            state.cookies.rotate_keys(LocalInstant::now());
            state.cookies.rotate_interval()
        };
        let shared2 = shared.clone();
        scheduler.add_timeout_by_delay(interval, move |scheduler| {
            Self::on_cookie_rotation(&shared2, scheduler);
        });
    }

    // -- server sockets ---------------------------------------------------

    /// Open or close the IPv4/IPv6 server sockets to match whatever the
    /// access filter currently allows (spec.md §5 "server sockets are
    /// opened lazily when the access filter first allows any address of
    /// that family").
    ///
    /// # Errors
    /// Returns an error if a socket that needs to open cannot bind.
    pub fn sync_server_sockets(&mut self, v4_bind: SocketAddr, v6_bind: SocketAddr) -> Result<()> {
        let (want_v4, want_v6) = {
            let state = self.shared.borrow();
            (
                state.access_filter.has_any_allow_for_family(false),
                state.access_filter.has_any_allow_for_family(true),
            )
        };
        self.ensure_server_socket(false, want_v4, v4_bind)?;
        self.ensure_server_socket(true, want_v6, v6_bind)?;
        Ok(())
    }

    fn ensure_server_socket(&mut self, v6: bool, want: bool, bind_addr: SocketAddr) -> Result<()> {
        let already_open = self.shared.borrow().server_sockets.contains_key(&v6);
        if want && !already_open {
            let socket = UdpSocket::bind(bind_addr)?;
            socket.set_nonblocking(true)?;
            let fd = socket.as_raw_fd();
            self.shared.borrow_mut().server_sockets.insert(v6, socket);
            let shared = self.shared.clone();
            self.scheduler.add_file_handler(fd, EventMask::Input, move |_scheduler, fd, _mask| {
                Self::on_server_readable(&shared, fd);
            })?;
        } else if !want && already_open {
            if let Some(socket) = self.shared.borrow_mut().server_sockets.remove(&v6) {
                self.scheduler.remove_file_handler(socket.as_raw_fd());
            }
        }
        Ok(())
    }

    fn on_server_readable(shared: &Rc<RefCell<Shared<C>>>, fd: RawFd) {
        loop {
            let mut buf = [0u8; 512];
            let recv = {
                let state = shared.borrow();
                let Some(socket) = state.server_sockets.values().find(|s| s.as_raw_fd() == fd)
                else {
                    return;
                };
                socket.recv_from(&mut buf)
            };
            match recv {
                Ok((len, from)) => {
                    Self::handle_server_datagram(shared, &buf[..len], from, from.is_ipv6());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    fn handle_server_datagram(
        shared: &Rc<RefCell<Shared<C>>>,
        buf: &[u8],
        from: SocketAddr,
        is_v6: bool,
    ) {
        let Ok(pkt) = NtpPacket::parse(buf) else {
            return;
        };
        let remote_ip = IpAddress::from(from.ip());
        let mut state = shared.borrow_mut();

        let known_id = state.remote_index.get(&remote_ip).copied();
        if let Some(id) = known_id {
            let Shared {
                ref mut sources,
                ref keystore,
                ref mut clock,
                ref clock_info,
                ..
            } = *state;
            if let Some(entry) = sources.get_mut(&id) {
                let ctx = ReceiveContext {
                    local_addr: IpAddress::Unspec,
                    rx_ts: LocalInstant::now(),
                    precision: clock_info.precision,
                    keystore,
                };
                let _ = entry.source.process_rx_known(&pkt, &ctx, clock);
            }
            return;
        }

        let Shared {
            ref access_filter,
            ref mut client_log,
            ref keystore,
            ref clock_info,
            ref server_sockets,
            ..
        } = *state;

        let ctx = ServerContext {
            now: LocalInstant::now(),
            leap: clock_info.leap,
            our_stratum: clock_info.stratum,
            refid: clock_info.refid,
            reference_timestamp: clock_info.reference_timestamp,
            root_delay: clock_info.root_delay,
            root_dispersion: clock_info.root_dispersion,
            precision: clock_info.precision,
            fuzz: 0.0,
        };

        let outcome = server::handle_unsolicited(
            &pkt,
            remote_ip,
            true,
            &ctx,
            access_filter,
            client_log,
            keystore,
        );

        if let ServerOutcome::Replied(reply) = outcome {
            if let Some(socket) = server_sockets.get(&is_v6) {
                let _ = socket.send_to(&reply.packet, from);
            }
        }
    }

    // -- sources -----------------------------------------------------------

    /// Configure a new association and bring it online (spec.md §4.2
    /// `create()` + `start()`).
    pub fn add_source(&mut self, remote: IpAddress, kind: SourceKind, params: SourceParams) -> SourceId {
        let refid = remote.to_refid();
        let handle = self.shared.borrow_mut().clock.register_source(refid);
        let source = Source::create(remote, kind, params, handle);

        let id = {
            let mut state = self.shared.borrow_mut();
            let id = SourceId(state.next_id);
            state.next_id += 1;
            state.remote_index.insert(remote, id);
            state.sources.insert(
                id,
                SourceEntry {
                    source,
                    transmit_timer: None,
                    receive_timer: None,
                },
            );
            id
        };

        self.take_source_online(id);
        id
    }

    /// Take a source offline and release its clock-subsystem arena entry
    /// and any open sockets/timers (spec.md §4.2).
    pub fn remove_source(&mut self, id: SourceId) {
        self.take_source_offline(id);
        let mut state = self.shared.borrow_mut();
        if let Some(entry) = state.sources.remove(&id) {
            state.remote_index.remove(&entry.source.remote);
            state.clock.destroy_instance(entry.source.stats);
        }
    }

    pub fn take_source_online(&mut self, id: SourceId) {
        let delay = {
            let mut state = self.shared.borrow_mut();
            let Some(entry) = state.sources.get_mut(&id) else {
                return;
            };
            entry.source.start(None)
        };
        self.arm_transmit(id, delay);
    }

    pub fn take_source_offline(&mut self, id: SourceId) {
        let (transmit_timer, receive_timer) = {
            let mut state = self.shared.borrow_mut();
            let Some(entry) = state.sources.get_mut(&id) else {
                return;
            };
            entry.source.take_offline();
            (entry.transmit_timer.take(), entry.receive_timer.take())
        };
        if let Some(t) = transmit_timer {
            self.scheduler.remove_timeout(t);
        }
        if let Some(t) = receive_timer {
            self.scheduler.remove_timeout(t);
        }
        if let Some(socket) = self.shared.borrow_mut().client_sockets.remove(&id) {
            self.scheduler.remove_file_handler(socket.as_raw_fd());
        }
    }

    /// # Errors
    /// Returns [`Error::InvalidState`] for a `Peer` association, or if `id`
    /// names no configured source.
    pub fn initiate_source_burst(&mut self, id: SourceId, good: u32, total: u32) -> Result<()> {
        let mut state = self.shared.borrow_mut();
        let entry = state.sources.get_mut(&id).ok_or(Error::InvalidState)?;
        entry.source.initiate_burst(good, total)
    }

    pub fn change_source_remote_address(&mut self, id: SourceId, new: IpAddress) {
        let mut state = self.shared.borrow_mut();
        if let Some(entry) = state.sources.get_mut(&id) {
            let old = entry.source.remote;
            entry.source.change_remote_address(new);
            state.remote_index.remove(&old);
            state.remote_index.insert(new, id);
        }
    }

    /// Run an arbitrary reconfiguration command against one source's
    /// `modify_*` methods (spec.md §2 "fan out reconfiguration commands").
    pub fn with_source_mut<R>(&mut self, id: SourceId, f: impl FnOnce(&mut Source) -> R) -> Option<R> {
        let mut state = self.shared.borrow_mut();
        state.sources.get_mut(&id).map(|entry| f(&mut entry.source))
    }

    fn arm_transmit(&mut self, id: SourceId, delay: Seconds) {
        let shared = self.shared.clone();
        let timer = self.scheduler.add_timeout_in_class(
            delay,
            Seconds(0.1),
            Seconds(0.05),
            DelayClass::NTP_SAMPLING,
            move |scheduler| {
                Self::on_transmit_timer(&shared, scheduler, id);
            },
        );
        if let Some(entry) = self.shared.borrow_mut().sources.get_mut(&id) {
            entry.transmit_timer = Some(timer);
        }
    }

    fn on_transmit_timer(shared: &Rc<RefCell<Shared<C>>>, scheduler: &mut Scheduler, id: SourceId) {
        let action = {
            let mut state = shared.borrow_mut();
            let Shared {
                ref mut sources,
                ref keystore,
                ref clock_info,
                ..
            } = *state;
            let Some(entry) = sources.get_mut(&id) else {
                return;
            };
            let ctx = TransmitContext {
                now: LocalInstant::now(),
                our_stratum: clock_info.stratum,
                root_delay: clock_info.root_delay,
                root_dispersion: clock_info.root_dispersion,
                precision: clock_info.precision,
                fuzz: 0.0,
            };
            entry.source.on_transmit_due(ctx, keystore)
        };

        let Some(action) = action else {
            // TX-edge FSM transition left the source offline; nothing to
            // send and nothing to re-arm.
            return;
        };

        let remote_addr = {
            let state = shared.borrow();
            state
                .sources
                .get(&id)
                .and_then(|e| to_socket_addr(e.source.remote))
        };
        if let Some(remote_addr) = remote_addr {
            Self::send_from_ephemeral(shared, scheduler, id, &action.packet, remote_addr);
        }

        if let Some(timeout) = action.receive_timeout {
            let shared2 = shared.clone();
            let receive_timer = scheduler.add_timeout_by_delay(timeout, move |scheduler| {
                Self::on_receive_timeout(&shared2, scheduler, id);
            });
            if let Some(entry) = shared.borrow_mut().sources.get_mut(&id) {
                entry.receive_timer = Some(receive_timer);
            }
        }

        let shared3 = shared.clone();
        let next_timer = scheduler.add_timeout_in_class(
            action.next_delay,
            Seconds(0.1),
            Seconds(0.05),
            DelayClass::NTP_SAMPLING,
            move |scheduler| {
                Self::on_transmit_timer(&shared3, scheduler, id);
            },
        );
        if let Some(entry) = shared.borrow_mut().sources.get_mut(&id) {
            entry.transmit_timer = Some(next_timer);
        }
    }

    fn send_from_ephemeral(
        shared: &Rc<RefCell<Shared<C>>>,
        scheduler: &mut Scheduler,
        id: SourceId,
        packet: &[u8],
        remote_addr: SocketAddr,
    ) {
        let needs_socket = !shared.borrow().client_sockets.contains_key(&id);
        if needs_socket {
            let bind_addr: SocketAddr = if remote_addr.is_ipv6() {
                "[::]:0".parse().expect("valid literal address")
            } else {
                "0.0.0.0:0".parse().expect("valid literal address")
            };
            let Ok(socket) = UdpSocket::bind(bind_addr) else {
                return;
            };
            if socket.set_nonblocking(true).is_err() {
                return;
            }
            let fd = socket.as_raw_fd();
            shared.borrow_mut().client_sockets.insert(id, socket);
            let shared2 = shared.clone();
            let _ = scheduler.add_file_handler(fd, EventMask::Input, move |scheduler, fd, _mask| {
                Self::on_client_readable(&shared2, scheduler, fd);
            });
        }

        let state = shared.borrow();
        if let Some(socket) = state.client_sockets.get(&id) {
            let _ = socket.send_to(packet, remote_addr);
        }
    }

    fn on_receive_timeout(shared: &Rc<RefCell<Shared<C>>>, scheduler: &mut Scheduler, id: SourceId) {
        if let Some(socket) = shared.borrow_mut().client_sockets.remove(&id) {
            scheduler.remove_file_handler(socket.as_raw_fd());
        }
    }

    fn on_client_readable(shared: &Rc<RefCell<Shared<C>>>, scheduler: &mut Scheduler, fd: RawFd) {
        let found = {
            let state = shared.borrow();
            state
                .client_sockets
                .iter()
                .find(|(_, s)| s.as_raw_fd() == fd)
                .map(|(id, _)| *id)
        };
        let Some(id) = found else {
            return;
        };

        loop {
            let mut buf = [0u8; 512];
            let recv = {
                let state = shared.borrow();
                let Some(socket) = state.client_sockets.get(&id) else {
                    return;
                };
                socket.recv_from(&mut buf)
            };
            match recv {
                Ok((len, from)) => Self::handle_known_reply(shared, id, &buf[..len], from),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        // Client mode transmits and listens from a fresh ephemeral socket
        // each cycle (spec.md §4.2.2 step 3); once we've drained whatever
        // arrived, retire it.
        if let Some(socket) = shared.borrow_mut().client_sockets.remove(&id) {
            scheduler.remove_file_handler(socket.as_raw_fd());
        }
    }

    fn handle_known_reply(shared: &Rc<RefCell<Shared<C>>>, id: SourceId, buf: &[u8], _from: SocketAddr) {
        let Ok(pkt) = NtpPacket::parse(buf) else {
            return;
        };
        let mut state = shared.borrow_mut();
        let Shared {
            ref mut sources,
            ref keystore,
            ref mut clock,
            ref clock_info,
            ..
        } = *state;
        let Some(entry) = sources.get_mut(&id) else {
            return;
        };
        let ctx = ReceiveContext {
            local_addr: IpAddress::Unspec,
            rx_ts: LocalInstant::now(),
            precision: clock_info.precision,
            keystore,
        };
        let _ = entry.source.process_rx_known(&pkt, &ctx, clock);
    }

    // -- run loop ----------------------------------------------------------

    /// # Errors
    /// Returns an I/O error if a poll iteration fails.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        self.scheduler.run_once()
    }

    /// # Errors
    /// Returns an I/O error if a poll iteration fails.
    pub fn run(&mut self) -> std::io::Result<()> {
        self.scheduler.main_loop()
    }

    pub fn quit(&mut self) {
        self.scheduler.quit_program();
    }
}
