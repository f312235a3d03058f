//! Cooperative single-threaded event scheduler (spec.md §4.1, §5).
//!
//! Built directly on `mio`'s non-blocking reactor rather than an async
//! runtime: the spec is explicit that handlers run to completion without
//! preemption and that there are no suspension points other than explicit
//! nonblocking socket I/O (spec.md §5) — that's a hand-rolled poll loop's
//! natural shape, not a `Future`'s. `mio` is the idiomatic "I manage my own
//! reactor" primitive in the network-daemon corner of the Rust ecosystem
//! this crate's teacher and sibling examples occupy.

use std::collections::{BinaryHeap, HashMap};
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;

use crate::timestamp::{LocalInstant, Seconds};

/// Readiness mask a file handler cares about (spec.md §3 "file handlers
/// registered by descriptor + event mask").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMask {
    Input,
    Exception,
    InputAndException,
}

impl EventMask {
    fn to_interest(self) -> Interest {
        match self {
            EventMask::Input => Interest::READABLE,
            EventMask::Exception => Interest::PRIORITY,
            EventMask::InputAndException => Interest::READABLE | Interest::PRIORITY,
        }
    }
}

/// Opaque handle returned by every `add_*` method; pass it to
/// [`Scheduler::remove_timeout`] / [`Scheduler::remove_file_handler`] to
/// cancel. Cancellation is always safe and idempotent (spec.md §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

/// A timeout delay "class": timeouts registered in the same class are
/// spaced out from each other to avoid network synchronisation (spec.md
/// §3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelayClass(pub u32);

impl DelayClass {
    pub const NTP_SAMPLING: DelayClass = DelayClass(0);
    pub const NTP_BROADCAST: DelayClass = DelayClass(1);
}

type TimeoutCallback = Box<dyn FnMut(&mut Scheduler)>;
type FileCallback = Box<dyn FnMut(&mut Scheduler, RawFd, EventMask)>;

struct TimeoutEntry {
    id: EventId,
    deadline: LocalInstant,
    seq: u64,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want earliest deadline
        // first, ties broken by insertion order (spec.md §4.1).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct ClassState {
    counter: u32,
}

struct FileHandlerEntry {
    fd: RawFd,
    mask: EventMask,
    callback: FileCallback,
}

/// The cooperative event loop itself.
pub struct Scheduler {
    poll: Poll,
    events: Events,
    file_handlers: HashMap<Token, FileHandlerEntry>,
    fd_tokens: HashMap<RawFd, Token>,
    timeouts: BinaryHeap<TimeoutEntry>,
    timeout_callbacks: HashMap<EventId, TimeoutCallback>,
    classes: HashMap<DelayClass, ClassState>,
    next_token: usize,
    next_event_id: u64,
    next_seq: u64,
    last_event_time: Option<LocalInstant>,
    quit: bool,
}

impl Scheduler {
    /// # Errors
    /// Returns an I/O error if the underlying OS poll instance cannot be
    /// created.
    pub fn new() -> std::io::Result<Self> {
        Ok(Scheduler {
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            file_handlers: HashMap::new(),
            fd_tokens: HashMap::new(),
            timeouts: BinaryHeap::new(),
            timeout_callbacks: HashMap::new(),
            classes: HashMap::new(),
            next_token: 0,
            next_event_id: 0,
            next_seq: 0,
            last_event_time: None,
            quit: false,
        })
    }

    fn fresh_event_id(&mut self) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        id
    }

    fn fresh_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Register a callback to be invoked whenever `fd` becomes ready per
    /// `mask`.
    ///
    /// # Errors
    /// Returns an I/O error if the descriptor cannot be registered with the
    /// OS poll instance.
    pub fn add_file_handler(
        &mut self,
        fd: RawFd,
        mask: EventMask,
        callback: impl FnMut(&mut Scheduler, RawFd, EventMask) + 'static,
    ) -> std::io::Result<EventId> {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, mask.to_interest())?;

        self.file_handlers.insert(
            token,
            FileHandlerEntry {
                fd,
                mask,
                callback: Box::new(callback),
            },
        );
        self.fd_tokens.insert(fd, token);

        Ok(EventId(token.0 as u64))
    }

    /// Deregister the handler for `fd`. Idempotent: a second call for the
    /// same descriptor is a no-op.
    pub fn remove_file_handler(&mut self, fd: RawFd) {
        if let Some(token) = self.fd_tokens.remove(&fd) {
            if let Some(mut entry) = self.file_handlers.remove(&token) {
                let _ = self.poll.registry().deregister(&mut SourceFd(&entry.fd));
            }
        }
    }

    /// Arm a one-shot timeout roughly `delay` seconds from now.
    pub fn add_timeout_by_delay(
        &mut self,
        delay: Seconds,
        callback: impl FnMut(&mut Scheduler) + 'static,
    ) -> EventId {
        let deadline = LocalInstant::now().add_seconds(delay);
        self.schedule(deadline, callback)
    }

    /// Arm a timeout in a delay `class`: the effective delay is
    /// `delay + separation * class_counter + randomness * U(0,1)`, which
    /// spaces timeouts registered in the same class apart by at least
    /// `separation` (spec.md §4.1).
    pub fn add_timeout_in_class(
        &mut self,
        delay: Seconds,
        separation: Seconds,
        randomness: Seconds,
        class: DelayClass,
        callback: impl FnMut(&mut Scheduler) + 'static,
    ) -> EventId {
        let counter = {
            let state = self.classes.entry(class).or_default();
            let c = state.counter;
            state.counter = state.counter.wrapping_add(1);
            c
        };

        let jitter = if randomness.0 > 0.0 {
            rand::thread_rng().gen_range(0.0..1.0) * randomness.0
        } else {
            0.0
        };

        let effective_delay = Seconds(delay.0 + separation.0 * f64::from(counter) + jitter);
        self.add_timeout_by_delay(effective_delay, callback)
    }

    fn schedule(
        &mut self,
        deadline: LocalInstant,
        callback: impl FnMut(&mut Scheduler) + 'static,
    ) -> EventId {
        let id = self.fresh_event_id();
        let seq = self.fresh_seq();
        self.timeout_callbacks.insert(id, Box::new(callback));
        self.timeouts.push(TimeoutEntry { id, deadline, seq });
        id
    }

    /// Cancel a previously scheduled timeout. Always safe; a no-op if `id`
    /// already fired or was already removed (spec.md §5).
    pub fn remove_timeout(&mut self, id: EventId) {
        self.timeout_callbacks.remove(&id);
        // Lazily purged from the heap when it would otherwise fire; see
        // `next_deadline`/`run_expired_timeouts`.
    }

    /// The instant at which the most recently dispatched handler started
    /// (spec.md §4.1).
    #[must_use]
    pub fn last_event_time(&self) -> Option<LocalInstant> {
        self.last_event_time
    }

    /// Request that [`Scheduler::main_loop`] return after the current
    /// iteration.
    pub fn quit_program(&mut self) {
        self.quit = true;
    }

    fn next_deadline(&mut self) -> Option<LocalInstant> {
        loop {
            match self.timeouts.peek() {
                None => return None,
                Some(entry) => {
                    if self.timeout_callbacks.contains_key(&entry.id) {
                        return Some(entry.deadline);
                    }
                    // Cancelled: drop the stale heap entry and keep looking.
                    self.timeouts.pop();
                }
            }
        }
    }

    /// Run every timeout whose deadline has passed, in deadline order, ties
    /// broken by insertion order (spec.md §5).
    fn run_expired_timeouts(&mut self, now: LocalInstant) {
        loop {
            let due = match self.timeouts.peek() {
                Some(entry) if entry.deadline <= now => true,
                _ => false,
            };
            if !due {
                break;
            }
            let entry = self.timeouts.pop().expect("peeked Some above");
            let Some(mut callback) = self.timeout_callbacks.remove(&entry.id) else {
                continue; // cancelled between peek and pop
            };
            self.last_event_time = Some(LocalInstant::now());
            callback(self);
        }
    }

    /// Run a single iteration: dispatch any due timeouts, then block for
    /// at most the time until the next one (or indefinitely if none are
    /// pending) waiting for file-descriptor readiness.
    ///
    /// # Errors
    /// Returns an I/O error if the underlying poll call fails.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        let now = LocalInstant::now();
        self.run_expired_timeouts(now);

        let timeout = self.next_deadline().map(|deadline| {
            let remaining = deadline.duration_since(LocalInstant::now());
            if remaining.0 <= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(remaining.0)
            }
        });

        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        self.poll.poll(&mut events, timeout)?;

        let ready: Vec<(Token, EventMask)> = events
            .iter()
            .map(|ev| {
                let mask = if ev.is_readable() {
                    EventMask::Input
                } else {
                    EventMask::Exception
                };
                (ev.token(), mask)
            })
            .collect();
        self.events = events;

        for (token, mask) in ready {
            let Some(mut entry) = self.file_handlers.remove(&token) else {
                continue; // removed by an earlier callback this tick
            };
            self.last_event_time = Some(LocalInstant::now());
            let fd = entry.fd;
            (entry.callback)(self, fd, mask);
            // Re-insert unless the callback itself removed/replaced this fd.
            if !self.fd_tokens.contains_key(&fd) {
                self.fd_tokens.insert(fd, token);
            }
            if self.fd_tokens.get(&fd) == Some(&token) {
                self.file_handlers.insert(token, entry);
            }
        }

        let now = LocalInstant::now();
        self.run_expired_timeouts(now);

        Ok(())
    }

    /// Run until [`Scheduler::quit_program`] is called.
    ///
    /// # Errors
    /// Returns an I/O error if a poll iteration fails.
    pub fn main_loop(&mut self) -> std::io::Result<()> {
        self.quit = false;
        while !self.quit {
            self.run_once()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn timeouts_fire_in_deadline_order() {
        let mut scheduler = Scheduler::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        scheduler.add_timeout_by_delay(Seconds(0.0), move |s| {
            o1.borrow_mut().push(1);
            s.quit_program();
        });
        let o2 = order.clone();
        scheduler.add_timeout_by_delay(Seconds(0.0), move |_| {
            o2.borrow_mut().push(2);
        });

        scheduler.run_once().unwrap();
        // both zero-delay timeouts are due; first-in-first-out on ties.
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn cancelled_timeout_never_fires() {
        let mut scheduler = Scheduler::new().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let id = scheduler.add_timeout_by_delay(Seconds(0.0), move |_| {
            *f.borrow_mut() = true;
        });
        scheduler.remove_timeout(id);
        // idempotent
        scheduler.remove_timeout(id);
        scheduler.run_once().unwrap();
        assert!(!*fired.borrow());
    }

    #[test]
    fn class_spacing_increases_delay_each_call() {
        let mut scheduler = Scheduler::new().unwrap();
        let deadlines = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..3 {
            let d = deadlines.clone();
            scheduler.add_timeout_in_class(
                Seconds(0.0),
                Seconds(10.0),
                Seconds(0.0),
                DelayClass::NTP_SAMPLING,
                move |_| {
                    d.borrow_mut().push(());
                },
            );
        }
        // three entries queued with increasing deadlines 0, 10, 20s out.
        assert_eq!(scheduler.timeouts.len(), 3);
        let mut sorted: Vec<LocalInstant> =
            scheduler.timeouts.iter().map(|e| e.deadline).collect();
        sorted.sort();
        let gap_a = sorted[1].duration_since(sorted[0]).0;
        let gap_b = sorted[2].duration_since(sorted[1]).0;
        assert!((gap_a - 10.0).abs() < 0.5, "gap_a = {gap_a}");
        assert!((gap_b - 10.0).abs() < 0.5, "gap_b = {gap_b}");
    }
}
