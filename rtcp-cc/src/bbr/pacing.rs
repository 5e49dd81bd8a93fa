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

use super::*;

use crate::bandwidth::BW_UNIT;

/// Below 1.2Mbps (in bytes/sec) a single packet per burst is enough.
const MIN_TSO_RATE: u64 = 1_200_000 / 8;

/// Largest burst the transport can hand to the NIC at once, in bytes.
const GSO_MAX_SIZE: u64 = 65536;

const MAX_HEADER_SIZE: u64 = 320;

/// Upper bound on the burst size, in packets.
const TSO_SEGS_MAX: u64 = 0x7f;

/// Assumed RTT when the transport has no estimate yet.
const DEFAULT_INIT_RTT: Duration = Duration::from_millis(1);

fn bbr_bw_to_pacing_rate(bw: Bandwidth, gain: u64, limits: &Limits) -> u64 {
    bw.to_bytes_per_second(limits.mss, gain)
        .min(limits.max_pacing_rate)
}

// Seeds the pacing rate from cwnd and smoothed RTT, before bandwidth
// samples are available.
pub(super) fn bbr_init_pacing_rate_from_rtt(
    b: &mut Bbr, conn: &Connection, limits: &Limits,
) {
    let rtt = match conn.srtt {
        Some(srtt) => {
            b.has_seen_rtt = true;

            srtt.max(Duration::from_micros(1))
        },

        None => DEFAULT_INIT_RTT,
    };

    let bw = Bandwidth::from_scaled(crate::bandwidth::saturate(
        u128::from(b.cwnd) * u128::from(BW_UNIT) / rtt.as_micros().max(1),
    ));

    b.pacing_rate = bbr_bw_to_pacing_rate(bw, HIGH_GAIN, limits);
}

// Pace using the bandwidth estimate and gain. The rate never drops before
// the pipe is full, unless a rate-limit bound applies.
pub(super) fn bbr_set_pacing_rate(b: &mut Bbr, cx: &Ack, bw: Bandwidth, gain: u64) {
    let mut rate = bbr_bw_to_pacing_rate(bw, gain, cx.limits);
    let mut capped = false;

    if let Some(bound) = b.classifier.pacing_bound(&b.config, cx.limits.mss) {
        let bound = bound.min(cx.limits.max_pacing_rate);

        if rate > bound {
            rate = bound;
            capped = true;
        }
    }

    if !b.has_seen_rtt && cx.conn.srtt.is_some() {
        bbr_init_pacing_rate_from_rtt(b, cx.conn, cx.limits);
    }

    if b.full_bw_reached || rate > b.pacing_rate || capped {
        b.pacing_rate = rate;
    }
}

pub(super) fn bbr_min_tso_segs(b: &Bbr) -> u64 {
    if b.pacing_rate < MIN_TSO_RATE {
        1
    } else {
        2
    }
}

// Burst size targeting about one burst per 2^-pacing_shift seconds.
pub(super) fn bbr_tso_segs_goal(b: &Bbr, limits: &Limits) -> u64 {
    let bytes = b
        .pacing_rate
        .checked_shr(limits.pacing_shift)
        .unwrap_or(0)
        .min(GSO_MAX_SIZE - 1 - MAX_HEADER_SIZE);

    let segs = (bytes / limits.mss.max(1)).max(bbr_min_tso_segs(b));

    segs.min(TSO_SEGS_MAX)
}
