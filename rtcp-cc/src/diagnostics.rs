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

//! Observability of the engine's internal state.

use serde::Serialize;

use crate::bbr::Mode;
use crate::pmodrl::Classification;
use crate::pmodrl::UpperBound;

/// Point-in-time view of an engine.
///
/// Bandwidths are in packets per microsecond scaled by
/// [`BW_UNIT`](crate::BW_UNIT); pacing rates in bytes per second.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub mode: Mode,

    pub cycle_index: usize,

    pub pacing_rate: u64,

    pub cwnd: u64,

    pub pacing_gain: u64,

    pub cwnd_gain: u64,

    pub min_rtt_us: Option<u64>,

    /// Bandwidth estimate in use.
    pub bandwidth: u64,

    /// Windowed max of the delivery rate samples.
    pub max_bandwidth: u64,

    pub long_term_bandwidth: u64,

    pub long_term_in_use: bool,

    pub full_bandwidth_reached: bool,

    pub round_count: u64,

    pub classification: Classification,

    /// See [`Classification::code()`].
    pub classification_code: u8,

    pub upper_bound: UpperBound,

    pub probe_active: bool,

    /// Index of the best-fitting candidate, 0 being the largest burst.
    pub best_index: usize,

    /// Burst of the best candidate, in packets scaled by `BW_UNIT`.
    pub best_burst: u64,

    /// Rate of the best candidate.
    pub best_rate: u64,

    pub pre_loss_goodput: u64,

    /// Time from flow start to rate-limit detection.
    pub detected_after_us: Option<u64>,

    /// Bytes acknowledged at rate-limit detection.
    pub detected_bytes_acked: Option<u64>,
}

/// Receives a [`Snapshot`] after every update of an engine.
pub trait Observer {
    fn on_update(&mut self, snapshot: &Snapshot);
}

/// An [`Observer`] that logs every snapshot at trace level.
#[derive(Debug, Default)]
pub struct LogObserver {
    trace_id: String,
}

impl LogObserver {
    pub fn new(trace_id: &str) -> Self {
        LogObserver {
            trace_id: trace_id.to_string(),
        }
    }
}

impl Observer for LogObserver {
    fn on_update(&mut self, snapshot: &Snapshot) {
        trace!(
            "{} mode={:?} pacing_rate={} cwnd={} bw={} class={}",
            self.trace_id,
            snapshot.mode,
            snapshot.pacing_rate,
            snapshot.cwnd,
            snapshot.bandwidth,
            snapshot.classification_code,
        );
    }
}

/// Final state of a released engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Report {
    pub snapshot: Snapshot,

    /// Periodic `"{bytes_acked};{code};{burst};{rate}-"` entries.
    pub history: String,
}
