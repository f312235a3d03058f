//! IP identity types (spec.md §3): [`IpAddress`] and the derived [`RefId`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An IP address as carried through the engine. Distinct from
/// `std::net::IpAddr` only in that it has an explicit "unspecified" variant
/// used for associations that haven't resolved an address yet (e.g. a peer
/// configured by name before DNS resolves).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpAddress {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Unspec,
}

impl IpAddress {
    #[must_use]
    pub fn is_unspec(self) -> bool {
        matches!(self, IpAddress::Unspec)
    }

    /// Derive this association's 32-bit reference identifier: the raw
    /// address for IPv4, or the first 32 bits of a hash of the address for
    /// IPv6 (spec.md §3).
    #[must_use]
    pub fn to_refid(self) -> RefId {
        match self {
            IpAddress::V4(v4) => RefId(u32::from_be_bytes(v4.octets())),
            IpAddress::V6(v6) => RefId(fnv1a32(&v6.octets())),
            IpAddress::Unspec => RefId(0),
        }
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => IpAddress::V4(v4),
            IpAddr::V6(v6) => IpAddress::V6(v6),
        }
    }
}

impl From<IpAddress> for Option<IpAddr> {
    fn from(addr: IpAddress) -> Self {
        match addr {
            IpAddress::V4(v4) => Some(IpAddr::V4(v4)),
            IpAddress::V6(v6) => Some(IpAddr::V6(v6)),
            IpAddress::Unspec => None,
        }
    }
}

/// 32-bit peer "reference identifier" advertised in packets (spec.md §3,
/// §6). For stratum-0 Kiss-o'-Death responses this instead carries a
/// 4-character ASCII code (e.g. `"RATE"`); see [`RefId::as_kod_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefId(pub u32);

impl RefId {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        RefId(bits)
    }

    #[must_use]
    pub const fn to_bits(self) -> u32 {
        self.0
    }

    /// Build a Kiss-o'-Death refid from a 4-character ASCII code, e.g.
    /// `RefId::kod(b"RATE")`.
    #[must_use]
    pub const fn kod(code: &[u8; 4]) -> Self {
        RefId(u32::from_be_bytes(*code))
    }

    /// Interpret as a 4-character ASCII KoD code, if it looks like one.
    #[must_use]
    pub fn as_kod_code(self) -> Option<[u8; 4]> {
        let bytes = self.0.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            Some(bytes)
        } else {
            None
        }
    }
}

/// FNV-1a 32-bit hash, used only to fold an IPv6 address into a 32-bit
/// refid. Not a security boundary — collisions here only affect the
/// anti-loop heuristic T-D, which has other defenses (stratum, clock mode).
fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_refid_is_raw_address() {
        let addr = IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(addr.to_refid().0, u32::from_be_bytes([192, 0, 2, 1]));
    }

    #[test]
    fn v6_refid_is_stable_hash() {
        let addr = IpAddress::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let a = addr.to_refid();
        let b = addr.to_refid();
        assert_eq!(a, b);
    }

    #[test]
    fn kod_round_trips() {
        let id = RefId::kod(b"RATE");
        assert_eq!(id.as_kod_code().unwrap(), *b"RATE");
    }
}
