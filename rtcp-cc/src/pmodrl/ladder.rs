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

//! Candidate token-bucket fits.
//!
//! Each rung models the flow's progress as `delivered = burst + rate * t`,
//! `t` counted from flow start. Bursts are fixed when the ladder is built;
//! rates only ever grow, to the smallest value that keeps every observed
//! point on or below the line.

use crate::bandwidth::saturate;
use crate::bandwidth::Bandwidth;
use crate::bandwidth::BW_UNIT;

pub const LADDER_LEN: usize = 9;

/// Weight of the pre-loss volume on each rung, scaled by `BW_UNIT`.
const WEIGHTS: [u64; LADDER_LEN] = [
    BW_UNIT,
    BW_UNIT * 7 / 8,
    BW_UNIT * 6 / 8,
    BW_UNIT * 5 / 8,
    BW_UNIT * 4 / 8,
    BW_UNIT * 3 / 8,
    BW_UNIT * 2 / 8,
    BW_UNIT / 8,
    0,
];

/// Fractions used by the classifier are out of 256.
pub(crate) const RATIO_SCALE: u32 = 8;
pub(crate) const RATIO_UNIT: u64 = 1 << RATIO_SCALE;

/// A fitted rate at or below 150/256 (~58.6%) of the pre-loss goodput is an
/// abrupt decrease. The same ratio bounds the lowest burst on the ladder.
pub(crate) const ABRUPT_DECREASE_THRESH: u64 = 150;

/// An observation of the flow: packets delivered `elapsed_us` after start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Point {
    pub delivered: u64,
    pub elapsed_us: u64,
}

/// One rung of the ladder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Candidate {
    /// Burst allowance, in packets scaled by `BW_UNIT`.
    pub burst: u64,

    pub rate: Bandwidth,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Ladder {
    bursts: [u64; LADDER_LEN],
    rates: [u64; LADDER_LEN],
}

impl Ladder {
    /// Spreads bursts between the pre-loss volume and its abrupt-decrease
    /// floor, plus a zero burst, and fits every rung to the pre-loss point.
    pub fn new(pre_loss: Point) -> Self {
        let volume = u128::from(pre_loss.delivered);
        let floor = volume * u128::from(RATIO_UNIT - ABRUPT_DECREASE_THRESH);

        let mut ladder = Ladder::default();

        for (burst, &weight) in ladder.bursts.iter_mut().zip(WEIGHTS.iter()) {
            if weight == 0 {
                *burst = 0;
                continue;
            }

            let weight = u128::from(weight);
            let rest = (u128::from(BW_UNIT) - weight) * floor >> RATIO_SCALE;

            *burst = saturate(volume * weight + rest);
        }

        ladder.fit(pre_loss);

        ladder
    }

    pub fn candidate(&self, i: usize) -> Candidate {
        Candidate {
            burst: self.bursts[i],
            rate: Bandwidth::from_scaled(self.rates[i]),
        }
    }

    /// Raises rates so that every rung's line covers `p`.
    pub fn fit(&mut self, p: Point) {
        for i in 0..LADDER_LEN {
            if let Some(rate) = excess_rate(self.bursts[i], p) {
                self.rates[i] = self.rates[i].max(rate);
            }
        }
    }

    /// Walks up the ladder while the next rung trades enough burst for
    /// rate: a rung is better when the burst it gives up would take more
    /// than half the flow's lifetime to deliver at the rate difference.
    pub fn best_fit(&self, flow_us: u64) -> usize {
        let mut best = 0;

        for i in 1..LADDER_LEN {
            let b_diff = self.bursts[i].abs_diff(self.bursts[best]);
            let r_diff = self.rates[i].abs_diff(self.rates[best]);

            if r_diff == 0 ||
                u128::from(b_diff) * 16 / u128::from(r_diff) >
                    u128::from(flow_us) * 8
            {
                best = i;
            } else {
                break;
            }
        }

        best
    }

    /// Shifts the ladder up by one rung spacing until some rung beats the
    /// top one, refitting the new top rung to `points`.
    ///
    /// Returns `None` if no better rung is found within `limit` shifts.
    pub fn reanchor(
        &mut self, points: &[Point], flow_us: u64, limit: usize,
    ) -> Option<usize> {
        for _ in 0..limit {
            let step = self.bursts[0].saturating_sub(self.bursts[1]);

            self.bursts.copy_within(0..LADDER_LEN - 1, 1);
            self.rates.copy_within(0..LADDER_LEN - 1, 1);

            self.bursts[0] = self.bursts[0].saturating_add(step);
            self.rates[0] = 0;

            for p in points {
                if let Some(rate) = excess_rate(self.bursts[0], *p) {
                    self.rates[0] = self.rates[0].max(rate);
                }
            }

            let best = self.best_fit(flow_us);

            if best != 0 {
                return Some(best);
            }
        }

        None
    }
}

/// Rate needed on top of `burst` to have delivered `p`, if the burst alone
/// does not cover it.
fn excess_rate(burst: u64, p: Point) -> Option<u64> {
    let volume = u128::from(p.delivered) * u128::from(BW_UNIT);

    if p.elapsed_us == 0 || volume <= u128::from(burst) {
        return None;
    }

    Some(saturate((volume - u128::from(burst)) / u128::from(p.elapsed_us)))
}
