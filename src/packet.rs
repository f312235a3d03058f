//! NTP packet codec (spec.md §4.6, §6).
//!
//! The 48-byte header is parsed and serialized with explicit big-endian
//! field access, in the same style the teacher's `RawNtpPacket`/`NtpPacket`
//! conversion uses (`to_be_bytes`/`from_be_bytes` over a fixed byte array)
//! rather than pulling in a buffer crate — there's no need for one at a
//! fixed 48-byte prefix. The trailing extension-field / MAC region is new
//! (the teacher never carries one), scanned byte-by-byte from offset 48.

use crate::ident::RefId;
use crate::timestamp::{NtpShort, NtpTimestamp};
use crate::{Error, Result};

pub const HEADER_LEN: usize = 48;
pub const NTP_MIN_COMPAT_VERSION: u8 = 1;
pub const NTP_MAX_COMPAT_VERSION: u8 = 4;
pub const NTP_MAX_STRATUM: u8 = 16;

/// MAC digest sizes the engine recognises when scanning a packet's trailer
/// (spec.md §6): `{16, 20, 24, 32, 40, 48, 64}` bytes.
pub const KNOWN_MAC_LENGTHS: [usize; 7] = [16, 20, 24, 32, 40, 48, 64];

/// Extension fields are only valid on NTPv4 packets and must be a multiple
/// of 4 bytes, at least 16 including the 4-byte type+length prefix.
const EXT_FIELD_MIN_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapIndicator {
    NoWarning,
    InsertSecond,
    DeleteSecond,
    Unsynchronised,
}

impl LeapIndicator {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => LeapIndicator::NoWarning,
            1 => LeapIndicator::InsertSecond,
            2 => LeapIndicator::DeleteSecond,
            _ => LeapIndicator::Unsynchronised,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            LeapIndicator::NoWarning => 0,
            LeapIndicator::InsertSecond => 1,
            LeapIndicator::DeleteSecond => 2,
            LeapIndicator::Unsynchronised => 3,
        }
    }
}

/// Association / packet mode nibble (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Reserved,
    SymmetricActive,
    SymmetricPassive,
    Client,
    Server,
    Broadcast,
    ControlReserved,
    PrivateReserved,
}

impl Mode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            1 => Mode::SymmetricActive,
            2 => Mode::SymmetricPassive,
            3 => Mode::Client,
            4 => Mode::Server,
            5 => Mode::Broadcast,
            6 => Mode::ControlReserved,
            7 => Mode::PrivateReserved,
            _ => Mode::Reserved,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Mode::Reserved => 0,
            Mode::SymmetricActive => 1,
            Mode::SymmetricPassive => 2,
            Mode::Client => 3,
            Mode::Server => 4,
            Mode::Broadcast => 5,
            Mode::ControlReserved => 6,
            Mode::PrivateReserved => 7,
        }
    }
}

/// The fixed 48-byte NTP header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtpHeader {
    pub leap: LeapIndicator,
    pub version: u8,
    pub mode: Mode,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: NtpShort,
    pub root_dispersion: NtpShort,
    pub ref_id: RefId,
    pub reference_timestamp: NtpTimestamp,
    pub originate_timestamp: NtpTimestamp,
    pub receive_timestamp: NtpTimestamp,
    pub transmit_timestamp: NtpTimestamp,
}

impl NtpHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = (self.leap.to_bits() << 6) | (self.version << 3) | self.mode.to_bits();
        buf[1] = self.stratum;
        buf[2] = self.poll as u8;
        buf[3] = self.precision as u8;
        buf[4..8].copy_from_slice(&self.root_delay.to_bits().to_be_bytes());
        buf[8..12].copy_from_slice(&self.root_dispersion.to_bits().to_be_bytes());
        buf[12..16].copy_from_slice(&self.ref_id.to_bits().to_be_bytes());
        buf[16..24].copy_from_slice(&self.reference_timestamp.to_bits().to_be_bytes());
        buf[24..32].copy_from_slice(&self.originate_timestamp.to_bits().to_be_bytes());
        buf[32..40].copy_from_slice(&self.receive_timestamp.to_bits().to_be_bytes());
        buf[40..48].copy_from_slice(&self.transmit_timestamp.to_bits().to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let lvm = buf[0];
        let leap = LeapIndicator::from_bits(lvm >> 6);
        let version = (lvm >> 3) & 0b111;
        let mode = Mode::from_bits(lvm);

        if version < NTP_MIN_COMPAT_VERSION || version > NTP_MAX_COMPAT_VERSION {
            return Err(Error::ProtocolVersionMismatch);
        }

        Ok(NtpHeader {
            leap,
            version,
            mode,
            stratum: buf[1],
            poll: buf[2] as i8,
            precision: buf[3] as i8,
            root_delay: NtpShort::from_bits(be32(buf, 4)),
            root_dispersion: NtpShort::from_bits(be32(buf, 8)),
            ref_id: RefId::from_bits(be32(buf, 12)),
            reference_timestamp: NtpTimestamp::from_bits(be64(buf, 16)),
            originate_timestamp: NtpTimestamp::from_bits(be64(buf, 24)),
            receive_timestamp: NtpTimestamp::from_bits(be64(buf, 32)),
            transmit_timestamp: NtpTimestamp::from_bits(be64(buf, 40)),
        })
    }
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
}

fn be64(buf: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(buf[at..at + 8].try_into().unwrap())
}

/// One NTPv4 extension field: 16-bit type, 16-bit length (header + body,
/// multiple of 4), body padded to a 32-bit boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionField {
    pub field_type: u16,
    pub body: Vec<u8>,
}

/// The authentication trailer, if any (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthTrailer {
    None,
    /// A 32-bit key id followed by an N-byte MAC, `N` one of
    /// [`KNOWN_MAC_LENGTHS`].
    Symmetric { key_id: u32, mac: Vec<u8> },
    /// MS-SNTP 20-byte authenticator with an all-zero 16-byte digest:
    /// signing is delegated to an external signer.
    MsSntp,
    /// MS-SNTP 72-byte extended authenticator with an all-zero 64-byte
    /// digest.
    MsSntpExtended,
}

/// A fully parsed packet: header, any NTPv4 extension fields, and the
/// trailing authenticator.
#[derive(Debug, Clone, PartialEq)]
pub struct NtpPacket {
    pub header: NtpHeader,
    pub extensions: Vec<ExtensionField>,
    pub trailer: AuthTrailer,
}

impl NtpPacket {
    /// Parse a full packet, including scanning the trailer starting at byte
    /// 48 (spec.md §4.2.3 step 1, §4.6).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN || buf.len() % 4 != 0 {
            return Err(Error::MalformedPacket);
        }

        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
        let header = NtpHeader::decode(&header_bytes)?;

        let tail = &buf[HEADER_LEN..];
        let (extensions, trailer) = parse_tail(tail, header.version)?;

        Ok(NtpPacket {
            header,
            extensions,
            trailer,
        })
    }

    /// Serialize the header plus extension fields plus trailer.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 32);
        out.extend_from_slice(&self.header.encode());

        for ext in &self.extensions {
            let body_len = round_up_4(ext.body.len());
            let total_len = 4 + body_len;
            out.extend_from_slice(&ext.field_type.to_be_bytes());
            out.extend_from_slice(&(total_len as u16).to_be_bytes());
            out.extend_from_slice(&ext.body);
            out.resize(out.len() + (body_len - ext.body.len()), 0);
        }

        match &self.trailer {
            AuthTrailer::None => {}
            AuthTrailer::Symmetric { key_id, mac } => {
                out.extend_from_slice(&key_id.to_be_bytes());
                out.extend_from_slice(mac);
            }
            AuthTrailer::MsSntp => {
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(&[0u8; 16]);
            }
            AuthTrailer::MsSntpExtended => {
                out.extend_from_slice(&[0u8; 8]);
                out.extend_from_slice(&[0u8; 64]);
            }
        }

        out
    }

    /// The byte span over which a MAC should be computed: header plus
    /// extension fields plus the 4-byte key id (spec.md §4.2.2 step 6:
    /// "a MAC spanning header+keyid").
    #[must_use]
    pub fn mac_signed_prefix(&self, key_id: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 4);
        out.extend_from_slice(&self.header.encode());
        for ext in &self.extensions {
            let body_len = round_up_4(ext.body.len());
            out.extend_from_slice(&ext.field_type.to_be_bytes());
            out.extend_from_slice(&((4 + body_len) as u16).to_be_bytes());
            out.extend_from_slice(&ext.body);
            out.resize(out.len() + (body_len - ext.body.len()), 0);
        }
        out.extend_from_slice(&key_id.to_be_bytes());
        out
    }
}

fn round_up_4(n: usize) -> usize {
    (n + 3) & !3
}

/// Parse everything after the 48-byte header: NTPv4 extension fields, then
/// a MAC or MS-SNTP trailer.
///
/// Ambiguity between "one more extension field" and "the MAC trailer" is
/// resolved by trying the MAC interpretation first at each step, per
/// spec.md §4.6: only continue treating a tail chunk as an extension field
/// once that chunk's length does not exactly match a recognised MAC size
/// *and* there's more than a MAC-shaped remainder left after it.
fn parse_tail(tail: &[u8], version: u8) -> Result<(Vec<ExtensionField>, AuthTrailer)> {
    if tail.is_empty() {
        return Ok((Vec::new(), AuthTrailer::None));
    }

    // NTPv3 MS-SNTP special cases take the whole tail.
    if version == 3 {
        if tail.len() == 20 && tail[4..20].iter().all(|&b| b == 0) {
            return Ok((Vec::new(), AuthTrailer::MsSntp));
        }
        if tail.len() == 72 && tail[8..72].iter().all(|&b| b == 0) {
            return Ok((Vec::new(), AuthTrailer::MsSntpExtended));
        }
    }

    if let Some(mac) = try_mac(tail) {
        return Ok((Vec::new(), mac));
    }

    let mut extensions = Vec::new();
    let mut rest = tail;

    while !rest.is_empty() {
        if let Some(mac) = try_mac(rest) {
            return Ok((extensions, mac));
        }

        if rest.len() < EXT_FIELD_MIN_LEN {
            return Err(Error::MalformedTrailer);
        }

        let field_type = u16::from_be_bytes([rest[0], rest[1]]);
        let field_len = u16::from_be_bytes([rest[2], rest[3]]) as usize;

        if field_len < EXT_FIELD_MIN_LEN || field_len % 4 != 0 || field_len > rest.len() {
            return Err(Error::MalformedTrailer);
        }

        extensions.push(ExtensionField {
            field_type,
            body: rest[4..field_len].to_vec(),
        });

        rest = &rest[field_len..];
    }

    Ok((extensions, AuthTrailer::None))
}

/// A chunk looks like a symmetric-key MAC trailer if it is `4 + N` bytes
/// for some recognised `N` in [`KNOWN_MAC_LENGTHS`], with nothing left over.
fn try_mac(chunk: &[u8]) -> Option<AuthTrailer> {
    for &mac_len in &KNOWN_MAC_LENGTHS {
        if chunk.len() == 4 + mac_len {
            let key_id = u32::from_be_bytes(chunk[..4].try_into().unwrap());
            return Some(AuthTrailer::Symmetric {
                key_id,
                mac: chunk[4..].to_vec(),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Seconds;

    fn sample_header() -> NtpHeader {
        NtpHeader {
            leap: LeapIndicator::NoWarning,
            version: 4,
            mode: Mode::Client,
            stratum: 2,
            poll: 6,
            precision: -20,
            root_delay: NtpShort::from_seconds(Seconds(0.01)),
            root_dispersion: NtpShort::from_seconds(Seconds(0.02)),
            ref_id: RefId::from_bits(0x01020304),
            reference_timestamp: NtpTimestamp::new(100, 0),
            originate_timestamp: NtpTimestamp::new(101, 0),
            receive_timestamp: NtpTimestamp::new(102, 0),
            transmit_timestamp: NtpTimestamp::new(103, 0),
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let encoded = header.encode();
        let decoded = NtpHeader::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn rejects_short_packet() {
        let buf = [0u8; 10];
        assert_eq!(NtpPacket::parse(&buf), Err(Error::MalformedPacket));
    }

    #[test]
    fn rejects_unaligned_packet() {
        let buf = [0u8; 49];
        assert_eq!(NtpPacket::parse(&buf), Err(Error::MalformedPacket));
    }

    #[test]
    fn rejects_bad_version() {
        let mut header = sample_header();
        header.version = 7;
        let mut buf = header.encode();
        // version lives packed into byte 0; force an out-of-range value directly.
        buf[0] = (0 << 6) | (7 << 3) | Mode::Client.to_bits();
        assert_eq!(NtpPacket::parse(&buf), Err(Error::ProtocolVersionMismatch));
    }

    #[test]
    fn symmetric_mac_trailer_round_trips() {
        let packet = NtpPacket {
            header: sample_header(),
            extensions: Vec::new(),
            trailer: AuthTrailer::Symmetric {
                key_id: 42,
                mac: vec![0xAB; 20],
            },
        };
        let bytes = packet.serialize();
        let parsed = NtpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.trailer, packet.trailer);
    }

    #[test]
    fn extension_field_then_mac_round_trips() {
        let packet = NtpPacket {
            header: sample_header(),
            extensions: vec![ExtensionField {
                field_type: 0x0104,
                body: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12],
            }],
            trailer: AuthTrailer::Symmetric {
                key_id: 7,
                mac: vec![0x11; 16],
            },
        };
        let bytes = packet.serialize();
        let parsed = NtpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.extensions, packet.extensions);
        assert_eq!(parsed.trailer, packet.trailer);
    }

    #[test]
    fn ntpv3_ms_sntp_trailer_detected() {
        let mut header = sample_header();
        header.version = 3;
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&[0u8; 16]);
        let parsed = NtpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.trailer, AuthTrailer::MsSntp);
    }

    #[test]
    fn ntpv3_ms_sntp_extended_trailer_detected() {
        let mut header = sample_header();
        header.version = 3;
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&[0u8; 64]);
        let parsed = NtpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.trailer, AuthTrailer::MsSntpExtended);
    }

    #[test]
    fn malformed_extension_field_is_rejected() {
        let header = sample_header();
        let mut bytes = header.encode().to_vec();
        // length field claims more than remains.
        bytes.extend_from_slice(&[0x01, 0x04, 0xFF, 0xFF]);
        bytes.extend_from_slice(&[0u8; 8]);
        assert_eq!(NtpPacket::parse(&bytes), Err(Error::MalformedTrailer));
    }
}
