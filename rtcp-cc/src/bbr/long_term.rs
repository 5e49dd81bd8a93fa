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

// Token-bucket traffic policers are common (see "An Internet-Wide Analysis
// of Traffic Policing", SIGCOMM 2016). BBR detects token-bucket policers
// and explicitly models their policed rate, to reduce unnecessary losses.
// We estimate that we're policed if we see 2 consecutive sampling intervals
// with consistent throughput and high packet loss. If we think we're being
// policed, set the long-term bandwidth to the average throughput of those
// two intervals.

use super::*;

use crate::bandwidth::BBR_SCALE;

/// Minimum length of a sampling interval, in rounds.
const LT_INTERVAL_MIN_ROUNDS: u32 = 4;

/// Loss rate, out of 256, above which an interval counts as lossy (~20%).
const LT_LOSS_THRESH: u64 = 50;

/// Two intervals are consistent if their rates differ by at most 1/8...
const LT_BW_RATIO: u64 = BBR_UNIT / 8;

/// ...or by at most 4 Kbit/s, in bytes per second.
const LT_BW_DIFF: u64 = 4000 / 8;

/// Rounds the long-term estimate is used for before sampling again.
const LT_BW_MAX_ROUNDS: u32 = 48;

/// Long-term bandwidth sampling state.
#[derive(Debug)]
pub(super) struct LongTerm {
    // Estimated policed rate, once an interval completed.
    pub bw: Bandwidth,

    // Whether the policed rate replaces the max filter.
    pub use_bw: bool,

    is_sampling: bool,

    rounds: u32,

    last_delivered: u64,

    last_lost: u64,

    last_stamp: Instant,
}

impl LongTerm {
    pub fn new(conn: &Connection, now: Instant) -> Self {
        LongTerm {
            bw: Bandwidth::zero(),
            use_bw: false,
            is_sampling: false,
            rounds: 0,
            last_delivered: conn.delivered,
            last_lost: conn.lost,
            last_stamp: now,
        }
    }

    /// Starts a new sampling interval.
    fn reset_interval(&mut self, conn: &Connection, now: Instant) {
        self.last_stamp = now;
        self.last_delivered = conn.delivered;
        self.last_lost = conn.lost;
        self.rounds = 0;
    }

    /// Completely resets long-term bandwidth sampling.
    pub fn reset(&mut self, conn: &Connection, now: Instant) {
        self.bw = Bandwidth::zero();
        self.use_bw = false;
        self.is_sampling = false;

        self.reset_interval(conn, now);
    }
}

pub(super) fn bbr_reset_lt_bw_sampling(b: &mut Bbr, conn: &Connection, now: Instant) {
    b.long_term.reset(conn, now);
}

// Long-term bw sampling interval is done. Estimate whether we're policed.
fn bbr_lt_bw_interval_done(b: &mut Bbr, cx: &Ack, bw: Bandwidth) {
    let lt = &mut b.long_term;

    if lt.bw > Bandwidth::zero() {
        // Is the new bw close to the lt bw from the previous interval?
        let diff = bw.abs_diff(lt.bw);

        let close = u128::from(diff.to_scaled()) * u128::from(BBR_UNIT) <=
            u128::from(LT_BW_RATIO) * u128::from(lt.bw.to_scaled());

        if close ||
            diff.to_bytes_per_second(cx.limits.mss, BBR_UNIT) <= LT_BW_DIFF
        {
            // All criteria are met; estimate we're policed.
            lt.bw = Bandwidth::from_scaled(
                (bw.to_scaled() >> 1) + (lt.bw.to_scaled() >> 1) +
                    (bw.to_scaled() & lt.bw.to_scaled() & 1),
            );
            lt.use_bw = true;
            lt.rounds = 0;

            // Pace at the policed rate.
            b.pacing_gain = BBR_UNIT;

            debug!("policer detected: lt_bw={:?}", lt.bw);

            return;
        }
    }

    lt.bw = bw;
    lt.reset_interval(cx.conn, cx.now);
}

pub(super) fn bbr_lt_bw_sampling(b: &mut Bbr, cx: &Ack) {
    let s = cx.sample;

    if b.long_term.use_bw {
        // Already using the long-term rate; see whether it is time to look
        // for a new one.
        if b.mode == Mode::ProbeBw && b.round_start {
            b.long_term.rounds += 1;

            if b.long_term.rounds >= LT_BW_MAX_ROUNDS {
                b.long_term.reset(cx.conn, cx.now);
                per_ack::bbr_reset_probe_bw_mode(b, cx.now);
            }
        }

        return;
    }

    // Wait for the first loss before sampling, to let the policer exhaust
    // its tokens and estimate the steady-state rate allowed by the policer.
    if !b.long_term.is_sampling {
        if s.losses == 0 {
            return;
        }

        b.long_term.reset_interval(cx.conn, cx.now);
        b.long_term.is_sampling = true;
    }

    // To avoid underestimates, reset sampling if we run out of data.
    if s.is_app_limited {
        b.long_term.reset(cx.conn, cx.now);
        return;
    }

    if b.round_start {
        b.long_term.rounds += 1;
    }

    if b.long_term.rounds < LT_INTERVAL_MIN_ROUNDS {
        return;
    }

    // Sampling interval needs to be longer.
    if b.long_term.rounds > 4 * LT_INTERVAL_MIN_ROUNDS {
        b.long_term.reset(cx.conn, cx.now);
        return;
    }

    // End sampling interval when a packet is lost, so we estimate the
    // policer tokens were exhausted.
    if s.losses == 0 {
        return;
    }

    let lost = cx.conn.lost.saturating_sub(b.long_term.last_lost);
    let delivered = cx.conn.delivered.saturating_sub(b.long_term.last_delivered);

    // Is loss rate (lost/delivered) >= LT_LOSS_THRESH? If not, wait.
    if delivered == 0 ||
        u128::from(lost) << BBR_SCALE <
            u128::from(LT_LOSS_THRESH) * u128::from(delivered)
    {
        return;
    }

    let t = cx.now.saturating_duration_since(b.long_term.last_stamp);

    // Interval is less than one ms, so wait.
    if t.as_millis() < 1 {
        return;
    }

    // Interval too long for a meaningful estimate.
    if t.as_millis() >= u128::from(u32::MAX / 1000) {
        b.long_term.reset(cx.conn, cx.now);
        return;
    }

    let t = Duration::from_millis(t.as_millis() as u64);

    if let Some(bw) = Bandwidth::from_delivered(delivered, t) {
        bbr_lt_bw_interval_done(b, cx, bw);
    }
}
