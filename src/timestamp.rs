//! Timestamp arithmetic (spec.md §3).
//!
//! Three representations coexist and are never mixed:
//!
//! - [`NtpTimestamp`] — the 64-bit NTP fixed-point wire value. Arithmetic is
//!   modulo 2^32 per field; era resolution happens only when converting to
//!   or from a [`LocalInstant`].
//! - [`LocalInstant`] — a monotonic seconds+nanoseconds pair. Differences
//!   and orderings are only meaningful within this domain.
//! - [`Seconds`] — a plain `f64` newtype for offsets, delays and
//!   dispersions. Never used to hold an absolute timestamp.

use std::time::Duration;

/// NTP epoch (1 Jan 1900) to UNIX epoch (1 Jan 1970) delta, in seconds.
///
/// Kept under the same name and value the teacher's `NtpPacket` constant
/// uses (`NTP_TIMESTAMP_DELTA`).
pub const NTP_TIMESTAMP_DELTA: u32 = 2_208_988_800;

/// `2^32`, used throughout for NTP fixed-point conversions.
const TWO_POW_32: f64 = 4_294_967_296.0;
/// `2^16`, used for `NtpShort` fixed-point conversions.
const TWO_POW_16: f64 = 65_536.0;

/// Earliest second representable without ambiguity: the spec calls this the
/// "era-split constant". We fix it at the NTP era boundary nearest to the
/// date this engine was written, matching the chrony convention of
/// resolving eras relative to "now" rather than carrying a hardcoded
/// absolute cutoff that goes stale.
pub const ERA_SPLIT: i64 = 0;

/// A 64-bit NTP timestamp: high 32 bits are whole seconds since the NTP
/// epoch (mod 2^32), low 32 bits are a binary fraction of a second.
///
/// All arithmetic on the raw fields is modulo 2^32; only [`NtpTimestamp::wrapping_diff`]
/// and [`NtpTimestamp::to_local`] perform era resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    seconds: u32,
    fraction: u32,
}

impl NtpTimestamp {
    pub const ZERO: NtpTimestamp = NtpTimestamp { seconds: 0, fraction: 0 };

    #[must_use]
    pub const fn new(seconds: u32, fraction: u32) -> Self {
        NtpTimestamp { seconds, fraction }
    }

    /// Construct from the big-endian 64-bit wire representation.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        NtpTimestamp {
            seconds: (bits >> 32) as u32,
            fraction: bits as u32,
        }
    }

    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.seconds as u64) << 32) | self.fraction as u64
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.seconds == 0 && self.fraction == 0
    }

    #[must_use]
    pub const fn seconds_field(self) -> u32 {
        self.seconds
    }

    #[must_use]
    pub const fn fraction_field(self) -> u32 {
        self.fraction
    }

    /// Signed difference `self - other`, in seconds, resolved as a 32-bit
    /// two's-complement difference on the seconds field the way the wire
    /// format does (invariant (ii): well-defined for timestamps within
    /// +/-2^31 s of each other — i.e. the entire useful range before the
    /// next era rollover).
    #[must_use]
    pub fn wrapping_diff(self, other: NtpTimestamp) -> Seconds {
        let sec_diff = self.seconds.wrapping_sub(other.seconds) as i32;
        let frac_diff = self.fraction as i64 - other.fraction as i64;
        Seconds(sec_diff as f64 + frac_diff as f64 / TWO_POW_32)
    }

    /// Add a (possibly negative, possibly fractional) number of seconds,
    /// wrapping modulo 2^32 in the seconds field.
    #[must_use]
    pub fn add_seconds(self, delta: Seconds) -> NtpTimestamp {
        let total_frac = self.fraction as f64 + delta.0.fract() * TWO_POW_32;
        let (sec_carry, frac) = if total_frac < 0.0 {
            let borrow = (-total_frac / TWO_POW_32).ceil() as i64;
            (-borrow, total_frac + borrow as f64 * TWO_POW_32)
        } else {
            let carry = (total_frac / TWO_POW_32).floor() as i64;
            (carry, total_frac - carry as f64 * TWO_POW_32)
        };
        let seconds = self
            .seconds
            .wrapping_add(delta.0.trunc() as i64 as u32)
            .wrapping_add(sec_carry as u32);
        NtpTimestamp {
            seconds,
            fraction: frac.round() as u32,
        }
    }

    /// Convert to a [`LocalInstant`] relative to `now`, resolving the era so
    /// that the result lands within +/-2^31 s of `now` — "nearest era to
    /// now" per spec.md §3.
    #[must_use]
    pub fn to_local(self, now: LocalInstant) -> LocalInstant {
        let now_ntp = LocalInstant::to_ntp_unfuzzed(now);
        let diff = self.wrapping_diff(now_ntp);
        now.add_seconds(diff)
    }

    /// Convert to a [`LocalInstant`], optionally fuzzing the fractional part
    /// by up to `2^precision` seconds the way the transmit path does for the
    /// receive timestamp field (spec.md §4.2.2 step 5). `precision` is the
    /// usual NTP log2-seconds precision exponent (negative for sub-second).
    #[must_use]
    pub fn to_local_fuzzed(self, now: LocalInstant, precision: i8, fuzz: f64) -> LocalInstant {
        let magnitude = 2f64.powi(precision as i32);
        let fuzzed = self.add_seconds(Seconds(fuzz * magnitude));
        fuzzed.to_local(now)
    }
}

impl From<LocalInstant> for NtpTimestamp {
    fn from(instant: LocalInstant) -> Self {
        LocalInstant::to_ntp_unfuzzed(instant)
    }
}

/// A monotonic instant, seconds + nanoseconds since an arbitrary but fixed
/// reference. The only domain in which subtraction and ordering are safe;
/// never serialized on the wire directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LocalInstant {
    /// Seconds since UNIX epoch, as tracked by the cooked-time service.
    secs: i64,
    nanos: u32,
}

impl LocalInstant {
    #[must_use]
    pub const fn new(secs: i64, nanos: u32) -> Self {
        LocalInstant { secs, nanos }
    }

    #[must_use]
    pub fn now() -> Self {
        let dur = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        LocalInstant {
            secs: dur.as_secs() as i64,
            nanos: dur.subsec_nanos(),
        }
    }

    #[must_use]
    pub fn duration_since(self, earlier: LocalInstant) -> Seconds {
        Seconds(
            (self.secs - earlier.secs) as f64
                + (self.nanos as f64 - earlier.nanos as f64) / 1e9,
        )
    }

    #[must_use]
    pub fn add_seconds(self, delta: Seconds) -> LocalInstant {
        let total_nanos = self.nanos as f64 + delta.0.fract() * 1e9;
        let (carry_secs, nanos) = if total_nanos < 0.0 {
            let borrow = (-total_nanos / 1e9).ceil() as i64;
            (-borrow, total_nanos + borrow as f64 * 1e9)
        } else {
            let carry = (total_nanos / 1e9).floor() as i64;
            (carry, total_nanos - carry as f64 * 1e9)
        };
        LocalInstant {
            secs: self.secs + delta.0.trunc() as i64 + carry_secs,
            nanos: nanos.round() as u32,
        }
    }

    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::new(self.secs.max(0) as u64, self.nanos)
    }

    /// Convert without any timestamp fuzz applied — invariant (i) round
    /// trips exactly through this path to within 2^-32 s.
    #[must_use]
    fn to_ntp_unfuzzed(self) -> NtpTimestamp {
        let seconds = (self.secs + NTP_TIMESTAMP_DELTA as i64) as u32;
        let fraction = ((self.nanos as f64 / 1e9) * TWO_POW_32).round() as u32;
        NtpTimestamp { seconds, fraction }
    }

    /// Full conversion with optional random fuzz, matching invariant (i):
    /// `ntp_to_local(local_to_ntp(t, fuzz)) == t` within `2^-32 s + fuzz`.
    #[must_use]
    pub fn to_ntp(self, fuzz: f64) -> NtpTimestamp {
        self.to_ntp_unfuzzed().add_seconds(Seconds(fuzz))
    }
}

/// A plain seconds value used for offsets, delays and dispersions. Never an
/// absolute timestamp — see spec.md §9 "double arithmetic near timestamps".
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Seconds(pub f64);

impl Seconds {
    pub const ZERO: Seconds = Seconds(0.0);

    #[must_use]
    pub fn abs(self) -> Seconds {
        Seconds(self.0.abs())
    }

    #[must_use]
    pub fn max(self, other: Seconds) -> Seconds {
        Seconds(self.0.max(other.0))
    }

    #[must_use]
    pub fn min(self, other: Seconds) -> Seconds {
        Seconds(self.0.min(other.0))
    }
}

impl std::ops::Add for Seconds {
    type Output = Seconds;
    fn add(self, rhs: Seconds) -> Seconds {
        Seconds(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Seconds {
    type Output = Seconds;
    fn sub(self, rhs: Seconds) -> Seconds {
        Seconds(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Seconds {
    type Output = Seconds;
    fn neg(self) -> Seconds {
        Seconds(-self.0)
    }
}

impl std::ops::Mul<f64> for Seconds {
    type Output = Seconds;
    fn mul(self, rhs: f64) -> Seconds {
        Seconds(self.0 * rhs)
    }
}

/// `NtpShort`: a 16.16 fixed-point seconds value used for root delay and
/// root dispersion (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpShort(u32);

impl NtpShort {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        NtpShort(bits)
    }

    #[must_use]
    pub const fn to_bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_seconds(seconds: Seconds) -> Self {
        NtpShort((seconds.0.max(0.0) * TWO_POW_16).round() as u32)
    }

    #[must_use]
    pub fn to_seconds(self) -> Seconds {
        Seconds(self.0 as f64 / TWO_POW_16)
    }
}
