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

use crate::bandwidth::BBR_SCALE;

/// Gain applied to the aggregation estimate when sizing cwnd.
const EXTRA_ACKED_GAIN: u64 = BBR_UNIT;

/// Rounds each of the two aggregation estimates is kept for.
const EXTRA_ACKED_WIN_ROUNDS: u32 = 5;

/// Saturating cap of the round counter.
const EXTRA_ACKED_WIN_ROUNDS_MAX: u32 = 0x1f;

/// Restart the ACK epoch once this many packets were acknowledged in it.
const ACK_EPOCH_ACKED_RESET_THRESH: u64 = 1 << 20;

/// Saturating cap of the packets acknowledged in an epoch.
const ACK_EPOCH_ACKED_MAX: u64 = 0xfffff;

/// Longest aggregation the cwnd is allowed to absorb.
const EXTRA_ACKED_MAX: Duration = Duration::from_millis(100);

/// Tracks how many packets get acknowledged beyond what the bandwidth
/// estimate predicts, to provision cwnd for ACK aggregation.
#[derive(Debug)]
pub(super) struct AckAggregation {
    epoch_stamp: Instant,

    epoch_acked: u64,

    // Max excess acknowledged packets over the current and previous window.
    extra_acked: [u64; 2],

    win_rounds: u32,

    win_index: usize,
}

impl AckAggregation {
    pub fn new(now: Instant) -> Self {
        AckAggregation {
            epoch_stamp: now,
            epoch_acked: 0,
            extra_acked: [0; 2],
            win_rounds: 0,
            win_index: 0,
        }
    }

    pub fn restart_epoch(&mut self, now: Instant) {
        self.epoch_stamp = now;
        self.epoch_acked = 0;
    }

    /// Max excess acknowledged packets over the last two windows.
    pub fn extra_acked(&self) -> u64 {
        self.extra_acked[0].max(self.extra_acked[1])
    }

    fn update(
        &mut self, round_start: bool, bw: Bandwidth, cwnd: u64, acked: u64,
        now: Instant,
    ) {
        if round_start {
            self.win_rounds = (self.win_rounds + 1).min(EXTRA_ACKED_WIN_ROUNDS_MAX);

            if self.win_rounds >= EXTRA_ACKED_WIN_ROUNDS {
                self.win_rounds = 0;
                self.win_index ^= 1;
                self.extra_acked[self.win_index] = 0;
            }
        }

        // Packets the estimate says should have been acknowledged so far.
        let mut expected =
            bw.delivered_over(now.saturating_duration_since(self.epoch_stamp));

        // Restart the epoch when ACKs fall behind the estimate, and
        // periodically to keep the count bounded.
        if self.epoch_acked <= expected ||
            self.epoch_acked.saturating_add(acked) >= ACK_EPOCH_ACKED_RESET_THRESH
        {
            self.restart_epoch(now);
            expected = 0;
        }

        self.epoch_acked =
            self.epoch_acked.saturating_add(acked).min(ACK_EPOCH_ACKED_MAX);

        let extra = self.epoch_acked.saturating_sub(expected).min(cwnd);

        if extra > self.extra_acked[self.win_index] {
            self.extra_acked[self.win_index] = extra;
        }
    }
}

pub(super) fn bbr_update_ack_aggregation(b: &mut Bbr, cx: &Ack) {
    if cx.sample.acked_sacked == 0 || !cx.sample.is_valid() {
        return;
    }

    let bw = b.bw();

    b.ack_aggregation.update(
        b.round_start,
        bw,
        b.cwnd,
        cx.sample.acked_sacked,
        cx.now,
    );
}

// Extra cwnd to absorb ACK aggregation, once the pipe is full.
pub(super) fn bbr_ack_aggregation_cwnd(b: &Bbr) -> u64 {
    if !b.full_bw_reached {
        return 0;
    }

    let max_aggr_cwnd = b.bw().delivered_over(EXTRA_ACKED_MAX);
    let aggr_cwnd =
        EXTRA_ACKED_GAIN.saturating_mul(b.ack_aggregation.extra_acked()) >> BBR_SCALE;

    aggr_cwnd.min(max_aggr_cwnd)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bandwidth::BW_UNIT;

    #[test]
    fn counts_excess_acks() {
        let mut now = Instant::now();
        let mut agg = AckAggregation::new(now);
        // Just over one packet per ms.
        let bw = Bandwidth::from_scaled(BW_UNIT / 1000 + 1);

        // One ACK per ms, acknowledging what the estimate predicts: the
        // epoch keeps restarting and nothing counts as excess beyond the
        // packets of a single ACK.
        for _ in 0..10 {
            now += Duration::from_millis(1);
            agg.update(false, bw, 100, 1, now);
        }
        assert_eq!(agg.extra_acked(), 1);

        // A stretch ACK of 20 packets after 2ms of silence.
        now += Duration::from_millis(2);
        agg.update(false, bw, 100, 20, now);
        assert_eq!(agg.extra_acked(), 20);

        // Excess is capped by cwnd.
        now += Duration::from_millis(1);
        agg.update(false, bw, 25, 20, now);
        assert_eq!(agg.extra_acked(), 25);
    }

    #[test]
    fn windows_expire() {
        let mut now = Instant::now();
        let mut agg = AckAggregation::new(now);
        let bw = Bandwidth::from_scaled(BW_UNIT / 1000 + 1);

        now += Duration::from_millis(1);
        agg.update(false, bw, 100, 30, now);
        assert_eq!(agg.extra_acked(), 30);

        // After two full windows without aggregation both slots are fresh.
        for _ in 0..(2 * EXTRA_ACKED_WIN_ROUNDS) {
            now += Duration::from_millis(20);
            agg.update(true, bw, 100, 1, now);
        }
        assert_eq!(agg.extra_acked(), 1);
    }

    #[test]
    fn restart_epoch() {
        let now = Instant::now();
        let mut agg = AckAggregation::new(now);

        agg.epoch_acked = 500;
        agg.restart_epoch(now + Duration::from_secs(1));

        assert_eq!(agg.epoch_acked, 0);
        assert_eq!(agg.epoch_stamp, now + Duration::from_secs(1));
    }
}
