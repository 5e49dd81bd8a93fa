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

use std::time::Duration;

/// Scale of [`Bandwidth`]: packets per microsecond are shifted left by 24.
pub const BW_SCALE: u32 = 24;
pub const BW_UNIT: u64 = 1 << BW_SCALE;

/// Scale of gains and other fractions: 256 is 1.0.
pub const BBR_SCALE: u32 = 8;
pub const BBR_UNIT: u64 = 1 << BBR_SCALE;

const NUM_MICROS_PER_SECOND: u64 = 1_000_000;

/// Pace slightly below the estimated rate to keep the bottleneck queue low.
const PACING_MARGIN_PERCENT: u64 = 1;

/// A delivery rate, in packets per microsecond scaled by [`BW_UNIT`].
#[derive(PartialEq, PartialOrd, Eq, Ord, Clone, Copy, Default, Hash)]
pub struct Bandwidth {
    scaled: u64,
}

impl Bandwidth {
    pub const fn zero() -> Self {
        Bandwidth { scaled: 0 }
    }

    pub const fn from_scaled(scaled: u64) -> Self {
        Bandwidth { scaled }
    }

    pub const fn to_scaled(self) -> u64 {
        self.scaled
    }

    pub fn from_packets_per_second(packets: u64) -> Self {
        Bandwidth {
            scaled: saturate(
                u128::from(packets) * u128::from(BW_UNIT) /
                    u128::from(NUM_MICROS_PER_SECOND),
            ),
        }
    }

    /// Returns the rate at which `packets` were delivered over `interval`,
    /// or `None` if the interval is shorter than one microsecond.
    pub fn from_delivered(packets: u64, interval: Duration) -> Option<Self> {
        let micros = interval.as_micros();

        if micros == 0 {
            return None;
        }

        Some(Bandwidth {
            scaled: saturate(u128::from(packets) * u128::from(BW_UNIT) / micros),
        })
    }

    /// Converts to bytes per second with the given gain applied, less the
    /// pacing margin.
    pub fn to_bytes_per_second(self, mss: u64, gain: u64) -> u64 {
        let margin = NUM_MICROS_PER_SECOND / 100 * (100 - PACING_MARGIN_PERCENT);

        let rate = u128::from(self.scaled)
            .saturating_mul(u128::from(mss))
            .saturating_mul(u128::from(gain)) >>
            BBR_SCALE;

        saturate(rate.saturating_mul(u128::from(margin)) >> BW_SCALE)
    }

    /// Packets delivered at this rate over `period`, rounded down.
    pub fn delivered_over(self, period: Duration) -> u64 {
        saturate(
            u128::from(self.scaled).saturating_mul(period.as_micros()) >> BW_SCALE,
        )
    }

    /// Bandwidth-delay product for `rtt` with a gain applied, rounded up.
    pub fn bdp(self, rtt: Duration, gain: u64) -> u64 {
        let w = u128::from(self.scaled).saturating_mul(rtt.as_micros());
        let unit = u128::from(BW_UNIT);

        let w = w.saturating_mul(u128::from(gain)) >> BBR_SCALE;

        saturate(w.saturating_add(unit - 1) / unit)
    }

    pub fn abs_diff(self, other: Bandwidth) -> Bandwidth {
        Bandwidth {
            scaled: self.scaled.abs_diff(other.scaled),
        }
    }
}

pub(crate) fn saturate(v: u128) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let pps = self.scaled as f64 * NUM_MICROS_PER_SECOND as f64 /
            BW_UNIT as f64;

        match pps {
            x if x < 1_000. => write!(f, "{x:.2} pkt/s"),
            x if x < 1_000_000. => write!(f, "{:.2} Kpkt/s", x / 1_000.),
            x => write!(f, "{:.2} Mpkt/s", x / 1_000_000.),
        }
    }
}
