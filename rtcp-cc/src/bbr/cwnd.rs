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

// Estimated BDP for the given bandwidth and gain, in packets. Falls back to
// the initial window until the min RTT is known.
pub(super) fn bbr_bdp(b: &Bbr, limits: &Limits, bw: Bandwidth, gain: u64) -> u64 {
    match b.min_rtt {
        Some(min_rtt) => bw.bdp(min_rtt, gain),

        None => limits.initial_cwnd,
    }
}

// Room for TSO bursts on both ends and for the probing phase of the cycle.
pub(super) fn bbr_quantization_budget(b: &Bbr, limits: &Limits, cwnd: u64) -> u64 {
    // Allow enough full-sized bursts in flight at the sender and receiver.
    let cwnd = cwnd.saturating_add(3 * pacing::bbr_tso_segs_goal(b, limits));

    // Round up to an even number to allow per-ACK delayed ACKs.
    let mut cwnd = cwnd.saturating_add(1) & !1;

    // Ensure gain cycling gets inflight above BDP even for small BDPs.
    if b.mode == Mode::ProbeBw && b.cycle_index == 0 {
        cwnd = cwnd.saturating_add(2);
    }

    cwnd
}

pub(super) fn bbr_inflight(
    b: &Bbr, limits: &Limits, bw: Bandwidth, gain: u64,
) -> u64 {
    let inflight = bbr_bdp(b, limits, bw, gain);

    bbr_quantization_budget(b, limits, inflight)
}

// Packets expected to be in the network by the time the next queued packet
// departs.
pub(super) fn bbr_packets_in_net_at_edt(b: &Bbr, cx: &Ack, inflight_now: u64) -> u64 {
    let interval = cx
        .conn
        .earliest_departure
        .map(|edt| edt.saturating_duration_since(cx.now))
        .unwrap_or_default();

    let interval_delivered = b.bw().delivered_over(interval);

    let mut inflight_at_edt = inflight_now;

    // Include the burst about to be sent while probing.
    if b.pacing_gain > BBR_UNIT {
        inflight_at_edt =
            inflight_at_edt.saturating_add(pacing::bbr_tso_segs_goal(b, cx.limits));
    }

    inflight_at_edt.saturating_sub(interval_delivered)
}

pub(super) fn bbr_save_cwnd(b: &mut Bbr) {
    if b.prev_ca_state < CaState::Recovery && b.mode != Mode::ProbeRtt {
        b.prior_cwnd = b.cwnd;
    } else {
        // Loss recovery or ProbeRTT already lowered cwnd; keep the larger one.
        b.prior_cwnd = b.prior_cwnd.max(b.cwnd);
    }
}

// Packet conservation on the first round of recovery, and cwnd restoration
// on exit. Returns the cwnd to apply when conservation is in effect.
fn bbr_set_cwnd_to_recover_or_restore(
    b: &mut Bbr, cx: &Ack, acked: u64,
) -> (u64, bool) {
    let prev_state = b.prev_ca_state;
    let state = cx.conn.ca_state;

    let mut cwnd = b.cwnd;

    if cx.sample.losses > 0 {
        cwnd = cwnd.saturating_sub(cx.sample.losses).max(1);
    }

    if state == CaState::Recovery && prev_state != CaState::Recovery {
        b.packet_conservation = true;
        b.next_round_delivered = cx.conn.delivered;
        b.classifier.restart_round(cx.conn.delivered);

        cwnd = cx.conn.in_flight.saturating_add(acked);
    } else if prev_state >= CaState::Recovery && state < CaState::Recovery {
        cwnd = cwnd.max(b.prior_cwnd);
        b.packet_conservation = false;
    }

    b.prev_ca_state = state;

    if b.packet_conservation {
        return (cwnd.max(cx.conn.in_flight.saturating_add(acked)), true);
    }

    (cwnd, false)
}

pub(super) fn bbr_set_cwnd(
    b: &mut Bbr, cx: &Ack, acked: u64, bw: Bandwidth, gain: u64,
) {
    if acked > 0 {
        let (cwnd, conserving) = bbr_set_cwnd_to_recover_or_restore(b, cx, acked);

        b.cwnd = cwnd;

        if !conserving {
            let target = bbr_bdp(b, cx.limits, bw, gain)
                .saturating_add(ack_aggregation::bbr_ack_aggregation_cwnd(b));
            let target = bbr_quantization_budget(b, cx.limits, target);

            if b.full_bw_reached {
                // Slow start up toward the target.
                b.cwnd = b.cwnd.saturating_add(acked).min(target);
            } else if b.cwnd < target || cx.conn.delivered < cx.limits.initial_cwnd
            {
                b.cwnd = b.cwnd.saturating_add(acked);
            }

            b.cwnd = b.cwnd.max(CWND_MIN_TARGET);
        }
    }

    b.cwnd = b.cwnd.min(cx.limits.cwnd_clamp);

    if b.mode == Mode::ProbeRtt {
        b.cwnd = b.cwnd.min(CWND_MIN_TARGET);
    }
}
