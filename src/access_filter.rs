//! Access filter: IP allow/deny table keyed by prefix, with constant-time
//! longest-prefix lookup (spec.md §2, §4.3).
//!
//! No crate in this corner of the ecosystem owns "match an IP against a
//! CIDR table" strongly enough to justify a dependency here (unlike the
//! AEAD cookie engine's use of `aes-siv`); this is a small enough primitive
//! that a hand-rolled masked-compare table is the idiomatic choice, and it
//! keeps the lookup itself allocation-free and data-independent in its
//! control flow.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::ident::IpAddress;

/// The filter's verdict for an address: explicit deny or allow, or the
/// configured default when no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy)]
struct Rule<A> {
    addr: A,
    prefix_len: u8,
    action: Action,
}

/// Allow/deny table. Rules are checked in longest-prefix-first order;
/// within the same prefix length, the most recently added rule wins (so
/// callers can override earlier rules by re-adding them).
#[derive(Debug, Clone)]
pub struct AccessFilter {
    default_action: Action,
    v4: Vec<Rule<Ipv4Addr>>,
    v6: Vec<Rule<Ipv6Addr>>,
}

impl AccessFilter {
    /// A filter with no rules, falling back to `default_action` for every
    /// address.
    #[must_use]
    pub fn new(default_action: Action) -> Self {
        AccessFilter {
            default_action,
            v4: Vec::new(),
            v6: Vec::new(),
        }
    }

    /// Add (or override) a rule covering `addr/prefix_len`.
    pub fn add_rule(&mut self, addr: IpAddress, prefix_len: u8, action: Action) {
        match addr {
            IpAddress::V4(a) => {
                let prefix_len = prefix_len.min(32);
                self.v4.push(Rule {
                    addr: a,
                    prefix_len,
                    action,
                });
            }
            IpAddress::V6(a) => {
                let prefix_len = prefix_len.min(128);
                self.v6.push(Rule {
                    addr: a,
                    prefix_len,
                    action,
                });
            }
            IpAddress::Unspec => {}
        }
    }

    /// Remove every rule. Does not change `default_action`.
    pub fn clear(&mut self) {
        self.v4.clear();
        self.v6.clear();
    }

    /// True if any rule currently governs an address of `addr`'s family
    /// (used to decide whether a server socket for that family should stay
    /// open — spec.md §5 "Server sockets ... opened lazily when the access
    /// filter first allows any address of that family").
    #[must_use]
    pub fn has_any_allow_for_family(&self, v6: bool) -> bool {
        if v6 {
            self.v6.iter().any(|r| r.action == Action::Allow)
        } else {
            self.v4.iter().any(|r| r.action == Action::Allow)
        }
    }

    /// Longest-prefix-match lookup. Every rule of the matching family is
    /// visited unconditionally (no early return on match), so the lookup's
    /// control flow does not depend on which rule — if any — matches.
    #[must_use]
    pub fn is_allowed(&self, ip: IpAddress) -> bool {
        self.lookup(ip) == Action::Allow
    }

    #[must_use]
    pub fn lookup(&self, ip: IpAddress) -> Action {
        match ip {
            IpAddress::V4(addr) => Self::lookup_v4(&self.v4, addr, self.default_action),
            IpAddress::V6(addr) => Self::lookup_v6(&self.v6, addr, self.default_action),
            IpAddress::Unspec => self.default_action,
        }
    }

    fn lookup_v4(rules: &[Rule<Ipv4Addr>], addr: Ipv4Addr, default: Action) -> Action {
        let target = u32::from(addr);
        let mut best: Option<(u8, Action)> = None;
        for rule in rules {
            let mask = prefix_mask_32(rule.prefix_len);
            let matches = (u32::from(rule.addr) & mask) == (target & mask);
            let candidate = match best {
                Some((best_len, _)) => rule.prefix_len >= best_len,
                None => true,
            };
            if matches && candidate {
                best = Some((rule.prefix_len, rule.action));
            }
        }
        best.map_or(default, |(_, action)| action)
    }

    fn lookup_v6(rules: &[Rule<Ipv6Addr>], addr: Ipv6Addr, default: Action) -> Action {
        let target = u128::from(addr);
        let mut best: Option<(u8, Action)> = None;
        for rule in rules {
            let mask = prefix_mask_128(rule.prefix_len);
            let matches = (u128::from(rule.addr) & mask) == (target & mask);
            let candidate = match best {
                Some((best_len, _)) => rule.prefix_len >= best_len,
                None => true,
            };
            if matches && candidate {
                best = Some((rule.prefix_len, rule.action));
            }
        }
        best.map_or(default, |(_, action)| action)
    }
}

fn prefix_mask_32(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn prefix_mask_128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deny_with_no_rules() {
        let filter = AccessFilter::new(Action::Deny);
        assert!(!filter.is_allowed(IpAddress::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut filter = AccessFilter::new(Action::Deny);
        filter.add_rule(
            IpAddress::V4(Ipv4Addr::new(10, 0, 0, 0)),
            8,
            Action::Allow,
        );
        filter.add_rule(
            IpAddress::V4(Ipv4Addr::new(10, 1, 2, 0)),
            24,
            Action::Deny,
        );
        assert!(filter.is_allowed(IpAddress::V4(Ipv4Addr::new(10, 1, 1, 1))));
        assert!(!filter.is_allowed(IpAddress::V4(Ipv4Addr::new(10, 1, 2, 50))));
    }

    #[test]
    fn v6_prefix_match() {
        let mut filter = AccessFilter::new(Action::Deny);
        filter.add_rule(
            IpAddress::V6("2001:db8::".parse().unwrap()),
            32,
            Action::Allow,
        );
        assert!(filter.is_allowed(IpAddress::V6("2001:db8::1".parse().unwrap())));
        assert!(!filter.is_allowed(IpAddress::V6("2001:db9::1".parse().unwrap())));
    }

    #[test]
    fn unspec_falls_back_to_default() {
        let filter = AccessFilter::new(Action::Allow);
        assert!(filter.is_allowed(IpAddress::Unspec));
    }

    #[test]
    fn has_any_allow_tracks_family() {
        let mut filter = AccessFilter::new(Action::Deny);
        assert!(!filter.has_any_allow_for_family(false));
        filter.add_rule(
            IpAddress::V4(Ipv4Addr::new(192, 168, 0, 0)),
            16,
            Action::Allow,
        );
        assert!(filter.has_any_allow_for_family(false));
        assert!(!filter.has_any_allow_for_family(true));
    }
}
