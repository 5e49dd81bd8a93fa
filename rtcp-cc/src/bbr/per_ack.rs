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

use rand::Rng;

// BBR functions when an ACK is received.
//
pub(super) fn bbr_update_model(b: &mut Bbr, cx: &Ack) {
    bbr_update_bw(b, cx);
    ack_aggregation::bbr_update_ack_aggregation(b, cx);
    bbr_update_cycle_phase(b, cx);
    bbr_check_full_bw_reached(b, cx);
    bbr_check_drain(b, cx);
    bbr_update_min_rtt(b, cx);
    bbr_update_gains(b);
}

// Feeds the ACK to the rate-limit classifier and acts on its verdict.
pub(super) fn bbr_update_classifier(b: &mut Bbr, cx: &Ack) {
    if b.classifier.estimate(&b.config, cx.conn, b.min_rtt, cx.now) {
        long_term::bbr_reset_lt_bw_sampling(b, cx.conn, cx.now);
    }

    b.classifier.track_loss(&b.config, cx.conn, cx.now);

    // The classifier's bound supersedes policer detection.
    if b.classifier.is_enforcing(&b.config) {
        long_term::bbr_reset_lt_bw_sampling(b, cx.conn, cx.now);
    }

    b.classifier.update_round(cx.sample, cx.conn);

    if b.classifier.probe(&b.config, cx.conn) {
        // Start the probe on the bandwidth probing phase of the cycle.
        bbr_advance_cycle_phase(b, cx.now);

        b.cycle_index = 0;
        b.mode = Mode::ProbeBw;
    }
}

fn bbr_update_round(b: &mut Bbr, cx: &Ack) {
    b.round_start = false;

    // See if we've reached the next RTT.
    if cx.sample.prior_delivered >= b.next_round_delivered {
        b.next_round_delivered = cx.conn.delivered;
        b.round_count += 1;
        b.round_start = true;
        b.packet_conservation = false;
    }
}

// Estimates the windowed max bandwidth from the delivery rate
// samples.
fn bbr_update_bw(b: &mut Bbr, cx: &Ack) {
    let s = cx.sample;

    b.round_start = false;

    if !s.is_valid() {
        return;
    }

    bbr_update_round(b, cx);

    long_term::bbr_lt_bw_sampling(b, cx);

    // `is_valid()` guarantees a non-negative count.
    let delivered = u64::try_from(s.delivered).unwrap_or_default();

    let Some(bw) = Bandwidth::from_delivered(delivered, s.interval) else {
        return;
    };

    // Incorporate the new sample into the filter if it is not application
    // limited, or if it beats the current estimate anyway.
    if !s.is_app_limited || bw >= b.max_bw() {
        b.bw.running_max(BW_FILTER_ROUNDS, b.round_count, bw);
    }
}

// Whether the current phase of the gain cycle lasted long enough and did
// its job.
fn bbr_is_next_cycle_phase(b: &Bbr, cx: &Ack) -> bool {
    let elapsed = cx.now.saturating_duration_since(b.cycle_stamp);
    let is_full_length = b.min_rtt.map_or(false, |rtt| elapsed > rtt);

    // The pacing_gain of 1.0 paces at the estimated bw to try to fully use
    // the pipe without creating excess queue.
    if b.pacing_gain == BBR_UNIT {
        return is_full_length;
    }

    let inflight =
        cwnd::bbr_packets_in_net_at_edt(b, cx, cx.sample.prior_in_flight);
    let bw = b.max_bw();

    // A pacing_gain > 1.0 probes for bw by trying to raise inflight to at
    // least pacing_gain * BDP. Stop early on losses, since the higher
    // inflight already exceeded the bottleneck buffer.
    if b.pacing_gain > BBR_UNIT {
        return is_full_length &&
            (cx.sample.losses > 0 ||
                inflight >= cwnd::bbr_inflight(b, cx.limits, bw, b.pacing_gain));
    }

    // A pacing_gain < 1.0 tries to drain the extra queue added while
    // probing. Move on as soon as inflight is down to the estimated BDP.
    is_full_length || inflight <= cwnd::bbr_inflight(b, cx.limits, bw, BBR_UNIT)
}

pub(super) fn bbr_advance_cycle_phase(b: &mut Bbr, now: Instant) {
    b.cycle_index = (b.cycle_index + 1) % CYCLE_LEN;
    b.cycle_stamp = now;
}

fn bbr_update_cycle_phase(b: &mut Bbr, cx: &Ack) {
    if b.mode == Mode::ProbeBw && bbr_is_next_cycle_phase(b, cx) {
        bbr_advance_cycle_phase(b, cx.now);
    }
}

pub(super) fn bbr_reset_probe_bw_mode(b: &mut Bbr, now: Instant) {
    b.mode = Mode::ProbeBw;
    b.cycle_index = CYCLE_LEN - 1 - b.rng.gen_range(0..CYCLE_RAND);

    // Flip to the next phase of the gain cycle.
    bbr_advance_cycle_phase(b, now);
}

fn bbr_reset_mode(b: &mut Bbr, now: Instant) {
    if !b.full_bw_reached {
        init::bbr_reset_startup_mode(b);
    } else {
        bbr_reset_probe_bw_mode(b, now);
    }
}

// Estimates whether the pipe is full: the bandwidth did not grow by 25%
// over three non-application-limited rounds.
fn bbr_check_full_bw_reached(b: &mut Bbr, cx: &Ack) {
    if b.full_bw_reached || !b.round_start || cx.sample.is_app_limited {
        return;
    }

    let bw_thresh = crate::bandwidth::saturate(
        u128::from(b.full_bw.to_scaled()) * u128::from(FULL_BW_THRESH) >>
            crate::bandwidth::BBR_SCALE,
    );

    if b.max_bw().to_scaled() >= bw_thresh {
        b.full_bw = b.max_bw();
        b.full_bw_count = 0;

        return;
    }

    b.full_bw_count += 1;
    b.full_bw_reached = b.full_bw_count >= FULL_BW_COUNT;

    if b.full_bw_reached {
        trace!("pipe full: bw={:?} rounds={}", b.full_bw, b.round_count);
    }
}

// If the pipe is probably full, drain the queue and then enter steady state.
fn bbr_check_drain(b: &mut Bbr, cx: &Ack) {
    let bw = b.max_bw();

    if b.mode == Mode::Startup && b.full_bw_reached {
        b.mode = Mode::Drain;
        b.ssthresh = cwnd::bbr_inflight(b, cx.limits, bw, BBR_UNIT);
    }

    if b.mode == Mode::Drain &&
        cwnd::bbr_packets_in_net_at_edt(b, cx, cx.conn.in_flight) <=
            cwnd::bbr_inflight(b, cx.limits, bw, BBR_UNIT)
    {
        // Fully drained the queue.
        bbr_reset_probe_bw_mode(b, cx.now);
    }
}

pub(super) fn bbr_check_probe_rtt_done(b: &mut Bbr, now: Instant) {
    match b.probe_rtt_done_stamp {
        Some(done) if now > done => (),

        _ => return,
    }

    // Wait another full window before probing again.
    b.min_rtt_stamp = now;
    b.cwnd = b.cwnd.max(b.prior_cwnd);

    bbr_reset_mode(b, now);
}

// The goal of PROBE_RTT mode is to have BBR flows cooperatively and
// periodically drain the bottleneck queue, to converge to measure the true
// min_rtt (unloaded propagation delay). This allows the flows to keep
// queues small (reducing queuing delay and packet loss) and achieve
// fairness among BBR flows.
//
// The min_rtt filter window is 10 seconds. When the min_rtt estimate
// expires, we enter PROBE_RTT mode and cap the cwnd at CWND_MIN_TARGET.
// After at least PROBE_RTT_DURATION at this low cwnd, and at least one
// packet-timed round trip elapsed, we leave PROBE_RTT mode and re-enter the
// previous mode.
//
// Note that flows need only pay 2% if they are busy sending over the last
// 10 seconds. Interactive applications (e.g., Web, RPCs, video chunks)
// often have natural silences or low-rate periods within 10 seconds where
// the rate is low enough for long enough to drain its queue in the
// bottleneck. We pick up these min RTT measurements opportunistically with
// our min_rtt filter.
fn bbr_update_min_rtt(b: &mut Bbr, cx: &Ack) {
    let s = cx.sample;
    let now = cx.now;

    // Track min RTT seen in the min_rtt window.
    let filter_expired = b
        .min_rtt_stamp
        .checked_add(MIN_RTT_WINDOW)
        .map_or(false, |expiry| now > expiry);

    if let Some(rtt) = s.rtt {
        let not_higher = b.min_rtt.map_or(true, |min_rtt| rtt <= min_rtt);

        if not_higher || (filter_expired && !s.is_ack_delayed) {
            b.min_rtt = Some(rtt);
            b.min_rtt_stamp = now;
        }
    }

    if filter_expired && !b.idle_restart && b.mode != Mode::ProbeRtt {
        trace!("entering probe rtt: min_rtt={:?}", b.min_rtt);

        // Dip, drain queue.
        b.mode = Mode::ProbeRtt;
        cwnd::bbr_save_cwnd(b);
        b.probe_rtt_done_stamp = None;
    }

    if b.mode == Mode::ProbeRtt {
        // Ignore low rate samples during this mode.
        if b.probe_rtt_done_stamp.is_none() &&
            cx.conn.in_flight <= CWND_MIN_TARGET
        {
            b.probe_rtt_done_stamp = Some(now + PROBE_RTT_DURATION);
            b.probe_rtt_round_done = false;
            b.next_round_delivered = cx.conn.delivered;
            b.classifier.restart_round(cx.conn.delivered);
        } else if b.probe_rtt_done_stamp.is_some() {
            if b.round_start {
                b.probe_rtt_round_done = true;
            }

            if b.probe_rtt_round_done {
                bbr_check_probe_rtt_done(b, now);
            }
        }
    }

    // Restart after idle ends only once we process a new sample.
    if s.delivered > 0 {
        b.idle_restart = false;
    }
}

pub(super) fn bbr_update_gains(b: &mut Bbr) {
    match b.mode {
        Mode::Startup => {
            b.pacing_gain = HIGH_GAIN;
            b.cwnd_gain = HIGH_GAIN;
        },

        Mode::Drain => {
            // Slow, to drain.
            b.pacing_gain = DRAIN_GAIN;
            // Keep cwnd.
            b.cwnd_gain = HIGH_GAIN;
        },

        Mode::ProbeBw => {
            b.pacing_gain = if b.long_term.use_bw {
                BBR_UNIT
            } else {
                PACING_GAIN_CYCLE[b.cycle_index]
            };
            b.cwnd_gain = CWND_GAIN;
        },

        Mode::ProbeRtt => {
            b.pacing_gain = BBR_UNIT;
            b.cwnd_gain = BBR_UNIT;
        },
    }
}
