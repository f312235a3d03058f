//! NTP protocol engine
//!
//! # Overview
//!
//! This crate implements the protocol-level core of an NTP daemon: packet
//! encode/decode, the per-source association state machine (timestamp
//! bookkeeping, the eleven conformance tests, poll adaptation, burst mode),
//! the unsolicited-request server path, a cooperative single-threaded
//! scheduler, and the supporting subsystems a daemon needs around them
//! (access filtering, client access logging/rate limiting, symmetric-key
//! authentication, and an AEAD cookie engine for NTS-style session
//! resumption).
//!
//! What it deliberately does **not** do: discipline the system clock. The
//! feedback controller (PLL/FLL, frequency estimation, stepping vs.
//! slewing) is modeled as an external collaborator behind the
//! [`clock::ClockDiscipline`] trait — a production binary wires a real
//! implementation in; tests use [`clock::NullClock`]. Likewise, reading
//! configuration files and command-line arguments is out of scope: this
//! crate only defines the narrow parameter shapes (see [`config`]) that
//! something else hands to it once parsed.
//!
//! # Usage
//!
//! Put this in your `Cargo.toml`:
//! ```cargo
//! [dependencies]
//! ntp-core = "0.1"
//! ```
//!
//! The [`coordinator::Coordinator`] is the crate's top-level entry point: it
//! owns the scheduler, the configured sources, the server sockets, and every
//! shared subsystem, and drives the whole thing from a single `run()` call.
//!
//! ```no_run
//! use ntp_core::clock::NullClock;
//! use ntp_core::config::{SourceKind, SourceParams};
//! use ntp_core::coordinator::Coordinator;
//! use ntp_core::ident::IpAddress;
//! use std::net::Ipv4Addr;
//!
//! # fn main() -> std::io::Result<()> {
//! let mut coordinator = Coordinator::new(NullClock::new())?;
//! coordinator.add_source(
//!     IpAddress::V4(Ipv4Addr::new(192, 0, 2, 1)),
//!     SourceKind::Server,
//!     SourceParams::default(),
//! );
//! coordinator.run()
//! # }
//! ```
//!
//! ## Features
//!
//! - `std` (default): enabled unconditionally today; kept as a feature so a
//!   future `no_std` split has somewhere to attach.
//! - `log` (default): routes internal diagnostics (malformed packets, auth
//!   failures, rate limiting) through the `log` facade, rate-limited per
//!   [`diag::RateLimitedLog`] so a noisy remote can't flood the log.

pub mod access_filter;
pub mod auth;
pub mod client_log;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod cookie;
pub mod diag;
pub mod error;
pub mod ident;
pub mod packet;
pub mod persist;
pub mod scheduler;
pub mod server;
pub mod source;
pub mod timestamp;

pub use coordinator::{Coordinator, LocalClockInfo, SourceId};
pub use error::{Error, Result};
