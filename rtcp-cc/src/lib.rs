// Copyright (C) 2022, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! BBR congestion control with token-bucket rate-limit detection.
//!
//! This crate implements the control logic of the BBR v1 congestion control
//! algorithm, extended with a classifier that recognizes token-bucket rate
//! limiters on the path and caps the pacing rate at the limited rate,
//! periodically probing whether the limit is still in place.
//!
//! The crate does no I/O. The transport computes a delivery rate [`Sample`]
//! for every ACK and hands it, together with a [`Connection`] summary, to
//! [`Bbr::on_ack()`]; the returned [`Output`] carries the pacing rate and
//! congestion window to apply.
//!
//! ```
//! use std::time::Duration;
//! use std::time::Instant;
//!
//! let mut config = rtcp_cc::Config::new();
//! config.set_probe_interval(10)?;
//!
//! let limits = rtcp_cc::Limits::default();
//! let mut conn = rtcp_cc::Connection::default();
//! let now = Instant::now();
//!
//! let mut bbr = rtcp_cc::Bbr::new(&config, &conn, &limits, now);
//!
//! conn.delivered = 10;
//! conn.in_order_delivered = 10;
//!
//! let sample = rtcp_cc::Sample {
//!     delivered: 10,
//!     interval: Duration::from_millis(20),
//!     rtt: Some(Duration::from_millis(20)),
//!     acked_sacked: 10,
//!     ..Default::default()
//! };
//!
//! let out = bbr.on_ack(&sample, &conn, &limits, now + Duration::from_millis(20));
//! assert!(out.cwnd >= 10);
//! # Ok::<(), rtcp_cc::Error>(())
//! ```

#[macro_use]
extern crate log;

mod bandwidth;
mod bbr;
mod config;
mod diagnostics;
mod error;
mod minmax;
mod pmodrl;
mod sample;

#[cfg(test)]
mod testing;

pub use crate::bandwidth::Bandwidth;
pub use crate::bandwidth::BBR_UNIT;
pub use crate::bandwidth::BW_UNIT;

pub use crate::bbr::Bbr;
pub use crate::bbr::Mode;
pub use crate::bbr::Output;
pub use crate::bbr::INFINITE_SSTHRESH;

pub use crate::config::Config;

pub use crate::diagnostics::LogObserver;
pub use crate::diagnostics::Observer;
pub use crate::diagnostics::Report;
pub use crate::diagnostics::Snapshot;

pub use crate::error::Error;
pub use crate::error::Result;

pub use crate::minmax::Minmax;
pub use crate::minmax::Tick;

pub use crate::pmodrl::Classification;
pub use crate::pmodrl::Detection;
pub use crate::pmodrl::Exclusion;
pub use crate::pmodrl::UpperBound;

pub use crate::sample::CaState;
pub use crate::sample::Connection;
pub use crate::sample::Event;
pub use crate::sample::Limits;
pub use crate::sample::Sample;
pub use crate::sample::INITIAL_WINDOW_PACKETS;
