//! Client access log (spec.md §3, §4.5): per-client hit counters, rate
//! estimation, rate-limit decisions, and the interleaved-mode timestamp
//! bookkeeping the server path needs.
//!
//! Modelled as a flat, growable table of slots rather than a pointer-chased
//! hash-with-buckets: each IP hashes to a home slot-group of
//! [`SLOT_SIZE`] entries, and collisions within that group evict by the
//! policy in spec.md §3/§8 ("Hash-table eviction"). This keeps every
//! record contiguous and avoids the cyclic-reference traps the corpus
//! flags for exactly this kind of "hash table with handles into it" shape.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::ident::IpAddress;
use crate::timestamp::{LocalInstant, NtpTimestamp, Seconds};

/// Number of records sharing a hash bucket before eviction kicks in
/// (spec.md §3).
pub const SLOT_SIZE: usize = 4;

/// Upper bound on the number of buckets the table will grow to, in group
/// units (i.e. `MAX_GROUPS * SLOT_SIZE` is the hard record cap) — the
/// "doubles up to a memory budget" clause of spec.md §3.
pub const MAX_GROUPS: usize = 1 << 16;

const INITIAL_GROUPS: usize = 16;

/// Hit category, each tracked with its own counter, last-access time and
/// rate estimate (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Ntp,
    CommandGood,
    CommandAuth,
    CommandBad,
}

const CATEGORY_COUNT: usize = 4;

fn category_idx(category: Category) -> usize {
    match category {
        Category::Ntp => 0,
        Category::CommandGood => 1,
        Category::CommandAuth => 2,
        Category::CommandBad => 3,
    }
}

/// Minimum value the scaled-log2 rate estimate saturates at (spec.md §8).
pub const MIN_RATE: i16 = -128;
const RATE_SCALE: f64 = 4.0;

#[derive(Debug, Clone)]
struct Record {
    ip: IpAddress,
    hit_count: [u64; CATEGORY_COUNT],
    last_hit: [Option<LocalInstant>; CATEGORY_COUNT],
    rate: [i16; CATEGORY_COUNT],
    local_ntp_rx: NtpTimestamp,
    local_ntp_tx: NtpTimestamp,
}

impl Record {
    fn new(ip: IpAddress) -> Self {
        Record {
            ip,
            hit_count: [0; CATEGORY_COUNT],
            last_hit: [None; CATEGORY_COUNT],
            rate: [MIN_RATE; CATEGORY_COUNT],
            local_ntp_rx: NtpTimestamp::ZERO,
            local_ntp_tx: NtpTimestamp::ZERO,
        }
    }

    fn last_hit_max(&self) -> Option<LocalInstant> {
        self.last_hit
            .iter()
            .flatten()
            .copied()
            .max_by(|a, b| a.duration_since(*b).0.partial_cmp(&0.0).unwrap())
    }

    fn total_hits(&self) -> u64 {
        self.hit_count.iter().sum()
    }
}

/// Opaque handle into the table, returned by [`ClientAccessLog::log_ntp_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogIndex(usize);

/// The rate threshold above which [`ClientAccessLog::limit_ntp_response_rate`]
/// starts dropping replies, expressed the same scaled-log2 units as the
/// per-category rate estimate.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Requests/second threshold, converted internally to scaled-log2 units.
    pub threshold_hz: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig { threshold_hz: 4.0 }
    }
}

pub struct ClientAccessLog {
    groups: Vec<Vec<Record>>,
    rate_limit: RateLimitConfig,
}

impl ClientAccessLog {
    #[must_use]
    pub fn new(rate_limit: RateLimitConfig) -> Self {
        ClientAccessLog {
            groups: (0..INITIAL_GROUPS).map(|_| Vec::new()).collect(),
            rate_limit,
        }
    }

    fn group_for(&self, ip: IpAddress) -> usize {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        (hasher.finish() as usize) % self.groups.len()
    }

    /// Find-or-insert an `ip` record, updating its NTP hit counter and rate
    /// estimate, and return a stable index for later queries (spec.md
    /// §4.5).
    pub fn log_ntp_access(&mut self, ip: IpAddress, now: LocalInstant) -> LogIndex {
        self.maybe_grow();
        let group_idx = self.group_for(ip);

        let existing = self.groups[group_idx].iter().position(|r| r.ip == ip);
        let slot = match existing {
            Some(pos) => pos,
            None => self.insert_evicting(group_idx, ip),
        };

        self.touch(group_idx, slot, Category::Ntp, now);
        LogIndex(self.flatten_index(group_idx, slot))
    }

    /// Log a command-channel hit under the given category (`CommandGood`,
    /// `CommandAuth` or `CommandBad`); same find-or-insert/evict discipline
    /// as [`ClientAccessLog::log_ntp_access`].
    pub fn log_command_access(
        &mut self,
        ip: IpAddress,
        category: Category,
        now: LocalInstant,
    ) -> LogIndex {
        self.maybe_grow();
        let group_idx = self.group_for(ip);
        let existing = self.groups[group_idx].iter().position(|r| r.ip == ip);
        let slot = match existing {
            Some(pos) => pos,
            None => self.insert_evicting(group_idx, ip),
        };
        self.touch(group_idx, slot, category, now);
        LogIndex(self.flatten_index(group_idx, slot))
    }

    fn insert_evicting(&mut self, group_idx: usize, ip: IpAddress) -> usize {
        let group = &mut self.groups[group_idx];
        if group.len() < SLOT_SIZE {
            group.push(Record::new(ip));
            return group.len() - 1;
        }
        // Evict the record with the oldest max(last_ntp_hit, last_cmd_hit),
        // ties broken by smallest total hit count (spec.md §3, §8).
        let victim = group
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let by_time = match (a.last_hit_max(), b.last_hit_max()) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(ta), Some(tb)) => ta
                        .duration_since(tb)
                        .0
                        .partial_cmp(&0.0)
                        .unwrap_or(std::cmp::Ordering::Equal),
                };
                by_time.then_with(|| a.total_hits().cmp(&b.total_hits()))
            })
            .map(|(idx, _)| idx)
            .expect("group is non-empty");
        group[victim] = Record::new(ip);
        victim
    }

    fn touch(&mut self, group_idx: usize, slot: usize, category: Category, now: LocalInstant) {
        let record = &mut self.groups[group_idx][slot];
        let cat = category_idx(category);
        if let Some(last) = record.last_hit[cat] {
            let interval = now.duration_since(last);
            record.rate[cat] = update_rate(record.rate[cat], interval);
        }
        record.last_hit[cat] = Some(now);
        record.hit_count[cat] += 1;
    }

    /// Rough doubling policy up to [`MAX_GROUPS`] (spec.md §3 "on fill, the
    /// table doubles up to a memory budget"). Triggered when more than half
    /// of the groups are already at capacity.
    fn maybe_grow(&mut self) {
        if self.groups.len() >= MAX_GROUPS {
            return;
        }
        let full = self
            .groups
            .iter()
            .filter(|g| g.len() >= SLOT_SIZE)
            .count();
        if full * 2 < self.groups.len() {
            return;
        }
        let old_groups = std::mem::take(&mut self.groups);
        let new_len = (old_groups.len() * 2).min(MAX_GROUPS);
        self.groups = (0..new_len).map(|_| Vec::new()).collect();
        for group in old_groups {
            for record in group {
                let group_idx = self.group_for(record.ip);
                if self.groups[group_idx].len() < SLOT_SIZE {
                    self.groups[group_idx].push(record);
                }
                // else: dropped on regrow, extremely unlikely at 2x with a
                // well-distributed hash and SLOT_SIZE >= 4.
            }
        }
    }

    fn flatten_index(&self, group_idx: usize, slot: usize) -> usize {
        group_idx * SLOT_SIZE + slot
    }

    fn unflatten(&self, index: LogIndex) -> (usize, usize) {
        (index.0 / SLOT_SIZE, index.0 % SLOT_SIZE)
    }

    /// Leaky-bucket rate-limit decision from the NTP category's current
    /// rate estimate: monotone in hit rate (spec.md §4.5, §8).
    #[must_use]
    pub fn limit_ntp_response_rate(&self, index: LogIndex) -> bool {
        let (group_idx, slot) = self.unflatten(index);
        let Some(record) = self.groups.get(group_idx).and_then(|g| g.get(slot)) else {
            return false;
        };
        let threshold = scaled_log2_rate(self.rate_limit.threshold_hz);
        record.rate[category_idx(Category::Ntp)] > threshold
    }

    /// Borrow the stored `(local_ntp_rx, local_ntp_tx)` pair for interleaved
    /// replies (spec.md §4.5).
    #[must_use]
    pub fn get_ntp_timestamps(&self, index: LogIndex) -> Option<(NtpTimestamp, NtpTimestamp)> {
        let (group_idx, slot) = self.unflatten(index);
        self.groups
            .get(group_idx)
            .and_then(|g| g.get(slot))
            .map(|r| (r.local_ntp_rx, r.local_ntp_tx))
    }

    /// Save the pair of timestamps the server just used, for the next
    /// interleaved exchange (spec.md §4.3 step 8).
    pub fn set_ntp_timestamps(&mut self, index: LogIndex, rx: NtpTimestamp, tx: NtpTimestamp) {
        let (group_idx, slot) = self.unflatten(index);
        if let Some(record) = self.groups.get_mut(group_idx).and_then(|g| g.get_mut(slot)) {
            record.local_ntp_rx = rx;
            record.local_ntp_tx = tx;
        }
    }
}

/// `scaled_log2(interval)`: `RATE_SCALE * -log2(interval)`, clamped to
/// `[MIN_RATE, 0]` (spec.md §3, §8).
fn scaled_log2_rate(rate_hz: f64) -> i16 {
    if rate_hz <= 0.0 {
        return MIN_RATE;
    }
    let value = RATE_SCALE * rate_hz.log2();
    value.clamp(f64::from(MIN_RATE), 0.0).round() as i16
}

fn scaled_log2_interval(interval: Seconds) -> i16 {
    if interval.0 <= 0.0 {
        return 0;
    }
    let value = RATE_SCALE * -interval.0.log2();
    value.clamp(f64::from(MIN_RATE), 0.0).round() as i16
}

/// Pull the stored rate one step toward `-scaled_log2(interval)`, saturating
/// on large jumps (spec.md §3 "exponential-moving-average approximation").
fn update_rate(current: i16, interval: Seconds) -> i16 {
    let target = -scaled_log2_interval(interval);
    let step = (target - current) / 2;
    (current + step).clamp(MIN_RATE, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_then_read_timestamps_round_trips() {
        let mut log = ClientAccessLog::new(RateLimitConfig::default());
        let ip = IpAddress::V4(std::net::Ipv4Addr::new(192, 0, 2, 1));
        let idx = log.log_ntp_access(ip, LocalInstant::new(1000, 0));
        log.set_ntp_timestamps(idx, NtpTimestamp::new(1, 2), NtpTimestamp::new(3, 4));
        let (rx, tx) = log.get_ntp_timestamps(idx).unwrap();
        assert_eq!(rx, NtpTimestamp::new(1, 2));
        assert_eq!(tx, NtpTimestamp::new(3, 4));
    }

    #[test]
    fn eviction_picks_oldest_last_hit() {
        let mut log = ClientAccessLog::new(RateLimitConfig::default());
        // 64 distinct IPs against 16 groups guarantees several collisions,
        // exercising insert_evicting without needing to expose group_for.
        let base = LocalInstant::new(1_000_000, 0);
        let mut ips = Vec::new();
        for i in 0..64u8 {
            ips.push(IpAddress::V4(std::net::Ipv4Addr::new(10, 0, 0, i)));
        }
        for (i, ip) in ips.iter().enumerate() {
            log.log_ntp_access(*ip, base.add_seconds(Seconds(i as f64)));
        }
        // None of this should panic and the table should have grown past
        // its initial size given enough load.
        assert!(log.groups.len() >= INITIAL_GROUPS);
    }

    #[test]
    fn rate_estimator_converges_toward_target() {
        let interval = Seconds(0.25); // 4 Hz
        let mut rate = MIN_RATE;
        for _ in 0..64 {
            rate = update_rate(rate, interval);
        }
        let target = scaled_log2_rate(4.0);
        assert!((rate - target).abs() <= 1, "rate = {rate}, target = {target}");
    }

    #[test]
    fn rate_limit_is_monotone_in_hit_rate() {
        let mut log = ClientAccessLog::new(RateLimitConfig { threshold_hz: 10.0 });
        let ip = IpAddress::V4(std::net::Ipv4Addr::new(198, 51, 100, 7));
        let mut now = LocalInstant::new(2_000_000, 0);
        let mut idx = log.log_ntp_access(ip, now);
        // Hammer the slot at 1000 Hz; eventually the rate limiter should
        // start returning true.
        let mut limited = false;
        for _ in 0..200 {
            now = now.add_seconds(Seconds(0.001));
            idx = log.log_ntp_access(ip, now);
            if log.limit_ntp_response_rate(idx) {
                limited = true;
                break;
            }
        }
        assert!(limited);
    }
}
