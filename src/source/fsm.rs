//! Operating-mode state machine (spec.md §4.2.1).

use super::Source;
use crate::config::REACHABILITY_TIMEOUT_COUNT;

/// The association's current operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Offline,
    Online,
    BurstWasOnline,
    BurstWasOffline,
}

impl Source {
    /// `Offline -> Online`; arms the initial timer via `start()` at the
    /// call site (spec.md §4.2.1).
    pub fn take_online(&mut self) {
        if self.mode == OperatingMode::Offline {
            self.mode = OperatingMode::Online;
        } else if self.mode == OperatingMode::BurstWasOffline {
            self.mode = OperatingMode::BurstWasOnline;
        }
    }

    /// `Online -> Offline`: cancel timers, mark unreachable, close the
    /// client socket (spec.md §4.2.1). Timer cancellation and socket
    /// closure are the coordinator's responsibility once this returns
    /// `true`.
    pub fn take_offline(&mut self) -> bool {
        let was_active = matches!(
            self.mode,
            OperatingMode::Online | OperatingMode::BurstWasOnline
        );
        match self.mode {
            OperatingMode::Online => self.mode = OperatingMode::Offline,
            OperatingMode::BurstWasOnline => self.mode = OperatingMode::BurstWasOffline,
            OperatingMode::Offline | OperatingMode::BurstWasOffline => {}
        }
        if was_active {
            self.reach = 0;
            self.client_socket_open = false;
        }
        was_active
    }

    /// Begin a burst of `total` transmits, requiring `good` good replies
    /// (spec.md §4.2.1, §4.2 `initiate_burst`). Valid only in `Client`
    /// association mode.
    ///
    /// # Errors
    /// Returns [`crate::error::Error::InvalidState`] for a `Peer`
    /// association.
    pub fn initiate_burst(&mut self, good: u32, total: u32) -> crate::error::Result<()> {
        if self.association != super::AssociationMode::Client {
            return Err(crate::error::Error::InvalidState);
        }
        self.burst_good = good;
        self.burst_total = total;
        self.mode = match self.mode {
            OperatingMode::Online => OperatingMode::BurstWasOnline,
            OperatingMode::Offline => OperatingMode::BurstWasOffline,
            already_bursting => already_bursting,
        };
        Ok(())
    }

    /// Called from the transmit path after decrementing `burst_total`: ends
    /// the burst if the counter has run out (spec.md §4.2.1 TX-edge rules).
    pub(super) fn maybe_end_burst_on_tx(&mut self) {
        match self.mode {
            OperatingMode::BurstWasOnline if self.burst_total <= 1 => {
                self.mode = OperatingMode::Online;
            }
            OperatingMode::BurstWasOffline if self.burst_total <= 0 => {
                self.mode = OperatingMode::Offline;
            }
            _ => {}
        }
    }

    /// Two consecutive unanswered transmissions mark reachability false;
    /// with `auto_offline` this further triggers `take_offline` (spec.md
    /// §4.2.1).
    pub(super) fn on_unanswered_transmit(&mut self) {
        if self.tx_count >= 2 {
            self.update_reachability(false);
            if self.auto_offline {
                self.take_offline();
            }
        }
    }

    /// True once [`REACHABILITY_TIMEOUT_COUNT`] consecutive transmits have
    /// gone unanswered (spec.md §8 "Reachability").
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        self.consecutive_misses() >= REACHABILITY_TIMEOUT_COUNT
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        matches!(
            self.mode,
            OperatingMode::Offline | OperatingMode::BurstWasOffline
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SourceStatsHandle;
    use crate::config::{SourceKind, SourceParams};
    use crate::ident::IpAddress;
    use std::net::Ipv4Addr;

    fn make_source() -> Source {
        Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Server,
            SourceParams::default(),
            SourceStatsHandle(0),
        )
    }

    #[test]
    fn take_online_then_offline_round_trips() {
        let mut source = make_source();
        assert_eq!(source.mode, OperatingMode::Offline);
        source.take_online();
        assert_eq!(source.mode, OperatingMode::Online);
        assert!(source.take_offline());
        assert_eq!(source.mode, OperatingMode::Offline);
    }

    #[test]
    fn burst_transitions_back_to_prior_mode() {
        let mut source = make_source();
        source.take_online();
        source.initiate_burst(2, 4).unwrap();
        assert_eq!(source.mode, OperatingMode::BurstWasOnline);
        source.burst_total = 1;
        source.maybe_end_burst_on_tx();
        assert_eq!(source.mode, OperatingMode::Online);
    }

    #[test]
    fn burst_invalid_for_peer_association() {
        let mut source = Source::create(
            IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
            SourceKind::Peer,
            SourceParams::default(),
            SourceStatsHandle(0),
        );
        assert!(source.initiate_burst(1, 1).is_err());
    }

    #[test]
    fn reachability_trips_after_nine_misses() {
        let mut source = make_source();
        source.tx_count = 9;
        assert!(source.is_unreachable());
        source.tx_count = 8;
        assert!(!source.is_unreachable());
    }
}
