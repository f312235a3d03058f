//! Clock-discipline contract (spec.md §1, §9): the feedback controller
//! (PLL/FLL, frequency estimation, step/slew drivers) is an external
//! collaborator out of scope for this crate. This module defines the
//! narrow boundary the per-source engine calls across, plus a `SourceStats`
//! arena — modelling the cyclic `Source ↔ SourceStats ↔ Coordinator`
//! reference the design notes flag as an opaque handle into storage the
//! clock subsystem owns, rather than a reference `Source` would have to
//! hold (spec.md §9).

use crate::ident::RefId;
use crate::packet::LeapIndicator;
use crate::timestamp::{LocalInstant, Seconds};

/// Opaque handle into the clock subsystem's per-source statistics arena.
/// `Source` stores this, never a reference, so destruction is an explicit
/// `destroy_instance` call rather than a lifetime (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceStatsHandle(pub u64);

/// What the receive path hands the clock subsystem for every accepted
/// sample (spec.md §4.2.3 step 8).
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub sample_time: LocalInstant,
    pub offset: Seconds,
    pub delay: Seconds,
    pub dispersion: Seconds,
    pub root_delay: Seconds,
    pub root_dispersion: Seconds,
    pub stratum: u8,
    pub leap: LeapIndicator,
}

/// The four operations the core calls across the clock-discipline boundary
/// (spec.md §1). A production binary wires a PLL/FLL implementation here;
/// tests use [`NullClock`].
pub trait ClockDiscipline {
    /// Register a new statistics arena entry for a freshly created source.
    fn register_source(&mut self, refid: RefId) -> SourceStatsHandle;

    /// Release a source's statistics arena entry.
    fn destroy_instance(&mut self, handle: SourceStatsHandle);

    /// Feed an accepted sample into the source's regression/stats state.
    fn accumulate_sample(&mut self, handle: SourceStatsHandle, sample: Sample);

    /// Predict the current offset for `handle` at `sample_time`, called
    /// immediately before `accumulate_sample` so poll adaptation can
    /// compare the prediction against the freshly measured offset (spec.md
    /// §4.2.3 step 8).
    fn predict_offset(&self, handle: SourceStatsHandle, sample_time: LocalInstant) -> Seconds;

    /// True if the candidate `(offset, delay)` pair is statistically
    /// consistent with `handle`'s recent history under the given deviation
    /// ratio threshold (test **TC**, spec.md §4.2.3).
    fn is_good_sample(
        &self,
        handle: SourceStatsHandle,
        offset: Seconds,
        delay: Seconds,
        max_delay_dev_ratio: f64,
    ) -> bool;

    /// Re-run source selection across every registered source; has no
    /// return value because the result is consumed internally by the
    /// clock subsystem's own state (spec.md §4.2.3 step 8).
    fn select_source(&mut self);

    /// Minimum round-trip delay observed for `handle` so far, used by
    /// test **TB** (`delay / min_round_trip_delay <= max_delay_ratio`).
    fn min_round_trip_delay(&self, handle: SourceStatsHandle) -> Seconds;

    /// The local reference identifier currently advertised on the
    /// receiving interface, used by the anti-loop test **TD**.
    fn local_refid(&self) -> RefId;

    /// True if the clock is in `Normal` mode (as opposed to e.g. a manual
    /// step in progress), used by test **TD**.
    fn is_normal_mode(&self) -> bool;

    /// Current effective stratum of the local clock (1 if disciplined from
    /// a reference clock, 0 if unsynchronised).
    fn local_stratum(&self) -> u8;
}

/// A no-op clock discipline for tests: accepts every sample, never rejects
/// on dispersion, and reports a fixed stratum/refid.
#[derive(Debug, Default)]
pub struct NullClock {
    next_handle: u64,
    samples: Vec<(SourceStatsHandle, Sample)>,
}

impl NullClock {
    #[must_use]
    pub fn new() -> Self {
        NullClock::default()
    }

    #[must_use]
    pub fn samples(&self) -> &[(SourceStatsHandle, Sample)] {
        &self.samples
    }
}

impl ClockDiscipline for NullClock {
    fn register_source(&mut self, _refid: RefId) -> SourceStatsHandle {
        let handle = SourceStatsHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn destroy_instance(&mut self, handle: SourceStatsHandle) {
        self.samples.retain(|(h, _)| *h != handle);
    }

    fn accumulate_sample(&mut self, handle: SourceStatsHandle, sample: Sample) {
        self.samples.push((handle, sample));
    }

    fn predict_offset(&self, handle: SourceStatsHandle, _sample_time: LocalInstant) -> Seconds {
        self.samples
            .iter()
            .rev()
            .find(|(h, _)| *h == handle)
            .map_or(Seconds::ZERO, |(_, s)| s.offset)
    }

    fn is_good_sample(
        &self,
        _handle: SourceStatsHandle,
        _offset: Seconds,
        _delay: Seconds,
        _max_delay_dev_ratio: f64,
    ) -> bool {
        true
    }

    fn select_source(&mut self) {}

    fn min_round_trip_delay(&self, handle: SourceStatsHandle) -> Seconds {
        self.samples
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, s)| s.delay)
            .fold(Seconds(f64::INFINITY), Seconds::min)
    }

    fn local_refid(&self) -> RefId {
        RefId(0)
    }

    fn is_normal_mode(&self) -> bool {
        true
    }

    fn local_stratum(&self) -> u8 {
        1
    }
}
