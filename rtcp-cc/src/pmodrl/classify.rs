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
use std::time::Instant;

use super::ladder::Ladder;
use super::ladder::Point;
use super::ladder::ABRUPT_DECREASE_THRESH;
use super::ladder::RATIO_UNIT;
use super::micros;
use super::progress;
use super::Classification;
use super::Classifier;
use super::Detection;
use super::UpperBound;

use crate::bandwidth::Bandwidth;
use crate::sample::Connection;
use crate::Config;

/// Round trips a loss episode must last before it is evaluated.
const EPISODE_RTTS: u32 = 7;

/// Round trips an unchanged fit must hold before a rate limit is declared.
const STABLE_RTTS: u32 = 10;

/// Share of lost packets, in percent, above which an episode is high loss.
const HIGH_LOSS_PERCENT: u128 = 20;

/// Maximum number of ladder shifts before a fit is deemed inconclusive.
const REANCHOR_LIMIT: usize = 32;

impl Classifier {
    /// Refits the candidate ladder and updates the verdict.
    ///
    /// Returns `true` when the long-term bandwidth sampler should be reset,
    /// which happens once, on the first abrupt-decrease fit.
    pub fn estimate(
        &mut self, config: &Config, conn: &Connection, min_rtt: Option<Duration>,
        now: Instant,
    ) -> bool {
        let Some(min_rtt) = min_rtt else {
            return false;
        };

        if self.disabled {
            return false;
        }

        let delivered =
            progress(config, conn).saturating_sub(self.start_delivered);
        let lost = conn.lost.saturating_sub(self.start_lost);

        if !self.high_loss && !self.open_episode(delivered, lost, min_rtt, now) {
            return false;
        }

        let Some(anchor) = self.anchor else {
            return false;
        };

        let elapsed = now.saturating_duration_since(self.flow_start);

        if elapsed.as_millis() < 1 {
            return false;
        }

        let current = Point {
            delivered,
            elapsed_us: micros(elapsed),
        };

        self.ladder.fit(current);

        let mut best = self.ladder.best_fit(current.elapsed_us);

        if best == 0 {
            let points = [current, anchor];

            match self.ladder.reanchor(
                &points,
                current.elapsed_us,
                REANCHOR_LIMIT,
            ) {
                Some(i) => best = i,

                None => {
                    trace!("no conclusive fit after {REANCHOR_LIMIT} shifts");

                    self.best_index = 0;
                    return false;
                },
            }
        }

        self.best_index = best;

        let candidate = self.ladder.candidate(best);

        let abrupt = u128::from(candidate.rate.to_scaled()) *
            u128::from(RATIO_UNIT) <=
            u128::from(ABRUPT_DECREASE_THRESH) *
                u128::from(self.pre_loss_goodput.to_scaled());

        if self.classification == Classification::RateLimited {
            if !abrupt {
                debug!(
                    "rate limit rejected: fit {:?} pre-loss {:?}",
                    candidate.rate, self.pre_loss_goodput
                );

                self.classification = Classification::Rejected;
                self.disabled = true;
            }

            return false;
        }

        if !abrupt {
            self.stable_since = None;
            return false;
        }

        let reset_long_term = !self.long_term_reset_done;
        self.long_term_reset_done = true;

        let since = *self.stable_since.get_or_insert(now);

        if candidate != self.memory {
            self.stable_since = Some(now);
            self.memory = candidate;
        } else if now.saturating_duration_since(since) >
            min_rtt.saturating_mul(STABLE_RTTS)
        {
            self.classification = Classification::RateLimited;
            self.upper_bound = UpperBound::Confirmed;
            self.detection = Some(Detection {
                elapsed,
                bytes_acked: conn.bytes_acked,
            });

            debug!(
                "rate limit detected after {:?}: rate={:?} burst={} pre-loss={:?}",
                elapsed, candidate.rate, candidate.burst, self.pre_loss_goodput
            );
        }

        reset_long_term
    }

    /// Decides whether the current loss episode is a high-loss one, and if
    /// so builds the candidate ladder from the pre-loss progress.
    fn open_episode(
        &mut self, delivered: u64, lost: u64, min_rtt: Duration, now: Instant,
    ) -> bool {
        let Some(start) = self.loss_start else {
            return false;
        };

        match start.checked_add(min_rtt.saturating_mul(EPISODE_RTTS)) {
            Some(end) if now > end => (),

            _ => return false,
        }

        let Some(pre) = self.pre_loss else {
            self.loss_start = None;
            return false;
        };

        let d = u128::from(delivered.saturating_sub(pre.delivered));
        let l = u128::from(lost.saturating_sub(pre.lost));

        if d + l == 0 || l * 100 <= (d + l) * HIGH_LOSS_PERCENT {
            self.loss_start = None;
            return false;
        }

        let span = pre.at.saturating_duration_since(self.flow_start);

        if span.as_millis() < 1 {
            self.loss_start = None;
            return false;
        }

        let anchor = Point {
            delivered: pre.delivered,
            elapsed_us: micros(span),
        };

        self.high_loss = true;
        self.anchor = Some(anchor);
        self.pre_loss_goodput =
            Bandwidth::from_delivered(pre.delivered, span).unwrap_or_default();
        self.ladder = Ladder::new(anchor);

        debug!(
            "high loss episode: delivered={} lost={} pre-loss={:?}",
            d, l, self.pre_loss_goodput
        );

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::pmodrl::ladder::LADDER_LEN;

    const RTT: Duration = Duration::from_millis(20);

    struct Flow {
        config: Config,
        conn: Connection,
        start: Instant,
        now: Instant,
        c: Classifier,
    }

    impl Flow {
        fn new() -> Self {
            let config = Config::new();
            let conn = Connection::default();
            let start = Instant::now();
            let c = Classifier::new(&config, &conn, start);

            Flow {
                config,
                conn,
                start,
                now: start,
                c,
            }
        }

        /// Advances 1ms, delivering and losing the given packet counts.
        fn step(&mut self, delivered: u64, lost: u64) -> bool {
            self.now += Duration::from_millis(1);
            self.conn.delivered += delivered;
            self.conn.in_order_delivered += delivered;
            self.conn.lost += lost;

            let reset =
                self.c
                    .estimate(&self.config, &self.conn, Some(RTT), self.now);
            self.c.track_loss(&self.config, &self.conn, self.now);

            reset
        }

        fn elapsed(&self) -> Duration {
            self.now - self.start
        }
    }

    #[test]
    fn no_loss_no_episode() {
        let mut f = Flow::new();

        for _ in 0..1000 {
            assert!(!f.step(2, 0));
        }

        assert!(!f.c.high_loss);
        assert!(f.c.loss_start.is_none());
        assert_eq!(f.c.classification(), Classification::Unclassified);
    }

    #[test]
    fn light_loss_closes_episode() {
        let mut f = Flow::new();

        for _ in 0..1000 {
            f.step(2, 0);
        }

        // 1 lost packet for 10 delivered is below the high-loss share.
        for i in 0..200 {
            f.step(2, u64::from(i % 5 == 0));
        }

        assert!(!f.c.high_loss);
        assert_eq!(f.c.classification(), Classification::Unclassified);
    }

    #[test]
    fn high_loss_builds_ladder() {
        let mut f = Flow::new();

        for _ in 0..1000 {
            f.step(2, 0);
        }

        for _ in 0..150 {
            f.step(1, 1);
        }

        assert!(f.c.high_loss);

        // 2000 packets over the first second, ending one step before loss
        // was observed.
        let pre = f.c.anchor.unwrap();
        assert_eq!(pre.delivered, 2000);
        assert_eq!(pre.elapsed_us, 1_000_000);
        assert_eq!(
            f.c.pre_loss_goodput(),
            Bandwidth::from_packets_per_second(2000)
        );
    }

    #[test]
    fn steady_limit_is_detected_and_rejected() {
        let mut f = Flow::new();

        for _ in 0..2000 {
            f.step(2, 0);
        }

        let mut resets = 0;

        while f.c.classification() != Classification::RateLimited {
            assert!(f.elapsed() < Duration::from_secs(10));

            if f.step(1, 1) {
                resets += 1;
            }
        }

        assert_eq!(resets, 1);
        assert_eq!(f.c.upper_bound(), UpperBound::Confirmed);

        let detection = f.c.detection().unwrap();
        assert_eq!(detection.elapsed, f.elapsed());

        // The fitted rate sits between the limited rate and the abrupt
        // decrease threshold.
        let rate = f.c.candidate().rate;
        assert!(rate >= Bandwidth::from_packets_per_second(1000));
        assert!(
            u128::from(rate.to_scaled()) * 256 <=
                150 * u128::from(f.c.pre_loss_goodput().to_scaled())
        );
        assert!(f.c.best_index() > 0 && f.c.best_index() < LADDER_LEN);

        // Losses stop and the flow speeds back up: the fit is no longer an
        // abrupt decrease.
        while f.c.classification() == Classification::RateLimited {
            assert!(f.elapsed() < Duration::from_secs(60));

            f.step(3, 0);
        }

        assert_eq!(f.c.classification(), Classification::Rejected);

        // Rejection is final until the classifier is reset.
        let best = f.c.best_index();
        for _ in 0..100 {
            assert!(!f.step(1, 1));
        }
        assert_eq!(f.c.best_index(), best);
        assert_eq!(f.c.classification(), Classification::Rejected);
    }

    #[test]
    fn unstable_fit_stays_unclassified() {
        let mut f = Flow::new();

        for _ in 0..2000 {
            f.step(2, 0);
        }

        // Goodput flips between 1 and 2 packets per ms every round, so the
        // fitted candidate keeps moving.
        for k in 0..10_000 {
            f.step(1 + (k / 20) % 2, 1);

            assert_eq!(f.c.classification(), Classification::Unclassified);
        }

        assert!(f.c.high_loss);
        assert!(f.c.detection().is_none());
    }

    #[test]
    fn no_rtt_no_estimate() {
        let mut f = Flow::new();
        f.c.loss_start = Some(f.start);

        f.now += Duration::from_secs(1);
        f.conn.lost = 100;

        assert!(!f.c.estimate(&f.config, &f.conn, None, f.now));
        assert!(!f.c.high_loss);
        assert_eq!(f.c.loss_start, Some(f.start));
    }
}
