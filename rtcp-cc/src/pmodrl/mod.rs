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

//! Rate-limit detection and probing.
//!
//! After a sustained high-loss episode the classifier fits token-bucket
//! lines `delivered = burst + rate * t` through the flow's pre-loss and
//! current progress, and picks the tightest consistent one. A flow whose
//! fitted rate collapsed well below its pre-loss goodput, and whose fit
//! stays put for ten round trips, is taken to be behind a rate limiter. The
//! fitted rate then caps pacing, and is periodically probed to find out
//! whether the limit moved.

use std::time::Duration;
use std::time::Instant;

use serde::Serialize;

use crate::bandwidth::Bandwidth;
use crate::bandwidth::BBR_UNIT;
use crate::sample::Connection;
use crate::sample::Sample;
use crate::Config;

mod classify;
mod history;
mod ladder;
mod probe;

use history::History;
use ladder::Candidate;
use ladder::Ladder;
use ladder::Point;

/// Probing fractions are in units of 1/20.
const PROBE_FRACTION_UNIT: u64 = 20;

/// Why the classifier was reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Exclusion {
    /// The sender was limited by the peer's receive window.
    ReceiveWindow,

    /// The connection left a retransmission timeout.
    Timeout,

    /// The sample was application limited.
    AppLimited,
}

/// Verdict of the classifier on the current flow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Classification {
    #[default]
    Unclassified,

    /// A token-bucket rate limiter is on the path.
    RateLimited,

    /// A previous rate-limit verdict was contradicted. The classifier stops
    /// until it is reset.
    Rejected,

    /// The classifier was reset while holding a verdict.
    Excluded {
        cause: Exclusion,
        was_rate_limited: bool,
    },
}

impl Classification {
    /// Numeric code used in diagnostics.
    ///
    /// `0` unclassified, `1` rate limited, `2` rejected, then pairs for each
    /// exclusion cause (`5`/`6` receive window, `7`/`8` timeout, `9`/`10`
    /// application limited), the first of each pair when the excluded verdict
    /// was a rate limit.
    pub fn code(self) -> u8 {
        match self {
            Classification::Unclassified => 0,

            Classification::RateLimited => 1,

            Classification::Rejected => 2,

            Classification::Excluded {
                cause,
                was_rate_limited,
            } => {
                let base = match cause {
                    Exclusion::ReceiveWindow => 5,
                    Exclusion::Timeout => 7,
                    Exclusion::AppLimited => 9,
                };

                if was_rate_limited {
                    base
                } else {
                    base + 1
                }
            },
        }
    }
}

/// State of the pacing cap derived from a rate-limit verdict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum UpperBound {
    #[default]
    Unset,

    /// The cap applies.
    Confirmed,

    /// The fitted candidate moved; the cap is lifted until it settles.
    Probing,
}

/// When, and how far into the flow, a rate limit was detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Detection {
    /// Time from flow start to detection.
    pub elapsed: Duration,

    /// Bytes acknowledged on the connection at detection.
    pub bytes_acked: u64,
}

/// Progress of the flow just before the current loss episode started.
#[derive(Clone, Copy, Debug)]
struct PreLoss {
    delivered: u64,
    lost: u64,
    at: Instant,
}

pub(crate) struct Classifier {
    ladder: Ladder,

    best_index: usize,

    classification: Classification,

    /// Start of the current stretch of unchanged abrupt-decrease fits.
    stable_since: Option<Instant>,

    high_loss: bool,

    loss_start: Option<Instant>,

    pre_loss: Option<PreLoss>,

    /// The pre-loss point, once a high-loss episode is established.
    anchor: Option<Point>,

    pre_loss_goodput: Bandwidth,

    flow_start: Instant,

    start_delivered: u64,

    start_lost: u64,

    last_lost: u64,

    detection: Option<Detection>,

    /// Set after a rejection; the classifier stays idle until reset.
    disabled: bool,

    /// Candidate last seen by the stability and probing logic.
    memory: Candidate,

    upper_bound: UpperBound,

    probe_active: bool,

    probe_rounds: u32,

    monitor_rounds: u32,

    next_round_delivered: u64,

    round_start: bool,

    long_term_reset_done: bool,

    history: History,
}

impl Classifier {
    pub fn new(config: &Config, conn: &Connection, now: Instant) -> Self {
        let history =
            History::new(config.history_capacity, config.history_interval);

        Classifier::with_history(config, conn, now, history)
    }

    fn with_history(
        config: &Config, conn: &Connection, now: Instant, history: History,
    ) -> Self {
        Classifier {
            ladder: Ladder::default(),
            best_index: 0,
            classification: Classification::Unclassified,
            stable_since: None,
            high_loss: false,
            loss_start: None,
            pre_loss: None,
            anchor: None,
            pre_loss_goodput: Bandwidth::zero(),
            flow_start: now,
            start_delivered: progress(config, conn),
            start_lost: conn.lost,
            last_lost: conn.lost,
            detection: None,
            disabled: false,
            memory: Candidate::default(),
            upper_bound: UpperBound::Unset,
            probe_active: false,
            probe_rounds: 0,
            monitor_rounds: 0,
            next_round_delivered: 0,
            round_start: false,
            long_term_reset_done: false,
            history,
        }
    }

    /// Starts measuring the flow afresh from `now`.
    pub fn restart_flow(&mut self, config: &Config, conn: &Connection, now: Instant) {
        self.flow_start = now;
        self.start_delivered = progress(config, conn);
        self.start_lost = conn.lost;
    }

    /// Makes the next probing round end once `delivered` is acknowledged.
    pub fn restart_round(&mut self, delivered: u64) {
        self.next_round_delivered = delivered;
    }

    /// Tracks when loss starts, and the flow's progress right before it.
    pub fn track_loss(&mut self, config: &Config, conn: &Connection, now: Instant) {
        if !self.high_loss && self.loss_start.is_none() {
            if conn.lost != self.last_lost {
                self.loss_start = Some(now);
            } else {
                self.pre_loss = Some(PreLoss {
                    delivered: progress(config, conn)
                        .saturating_sub(self.start_delivered),
                    lost: conn.lost.saturating_sub(self.start_lost),
                    at: now,
                });
            }
        }

        self.last_lost = conn.lost;
    }

    /// Advances the probing round counter.
    pub fn update_round(&mut self, sample: &Sample, conn: &Connection) {
        self.round_start = false;

        if sample.is_valid() && sample.prior_delivered >= self.next_round_delivered
        {
            self.next_round_delivered = conn.delivered;
            self.round_start = true;
        }
    }

    /// Whether the rate-limit verdict drives pacing.
    pub fn is_enforcing(&self, config: &Config) -> bool {
        config.enforce && self.classification == Classification::RateLimited
    }

    /// Returns the pacing cap in bytes per second, if one applies.
    pub fn pacing_bound(&self, config: &Config, mss: u64) -> Option<u64> {
        if !self.is_enforcing(config) || self.upper_bound != UpperBound::Confirmed
        {
            return None;
        }

        let mut gain = BBR_UNIT;

        if self.probe_active {
            gain = gain * u64::from(config.probe_fraction) / PROBE_FRACTION_UNIT;
        }

        Some(self.candidate().rate.to_bytes_per_second(mss, gain))
    }

    /// Counts an ACK towards the diagnostic history.
    pub fn record(&mut self, conn: &Connection) {
        let candidate = self.candidate();

        self.history.on_ack(
            conn.bytes_acked,
            self.classification.code(),
            candidate.burst,
            candidate.rate.to_scaled(),
        );
    }

    /// Resets the classifier when the flow's behavior is explained by
    /// something other than a rate limiter.
    pub fn apply_exclusions(
        &mut self, config: &Config, sample: &Sample, conn: &Connection,
        left_timeout: bool, now: Instant,
    ) {
        if config.exclude_rwnd_limited && conn.rwnd_limited {
            self.exclude(Exclusion::ReceiveWindow, config, conn, now);
        }

        if config.exclude_timeout && left_timeout {
            self.exclude(Exclusion::Timeout, config, conn, now);
        }

        if config.exclude_app_limited && sample.is_app_limited {
            self.exclude(Exclusion::AppLimited, config, conn, now);
        }
    }

    fn exclude(
        &mut self, cause: Exclusion, config: &Config, conn: &Connection,
        now: Instant,
    ) {
        let classification = match self.classification {
            Classification::RateLimited => Classification::Excluded {
                cause,
                was_rate_limited: true,
            },

            Classification::Rejected => Classification::Excluded {
                cause,
                was_rate_limited: false,
            },

            other => other,
        };

        if classification != self.classification {
            debug!(
                "classifier reset: {:?} -> {:?}",
                self.classification, classification
            );
        }

        let mut history = std::mem::take(&mut self.history);
        history.rewind();

        *self = Classifier::with_history(config, conn, now, history);
        self.classification = classification;
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn upper_bound(&self) -> UpperBound {
        self.upper_bound
    }

    pub fn probe_active(&self) -> bool {
        self.probe_active
    }

    pub fn best_index(&self) -> usize {
        self.best_index
    }

    pub fn candidate(&self) -> Candidate {
        self.ladder.candidate(self.best_index)
    }

    pub fn pre_loss_goodput(&self) -> Bandwidth {
        self.pre_loss_goodput
    }

    pub fn detection(&self) -> Option<Detection> {
        self.detection
    }

    pub fn history(&self) -> &str {
        self.history.as_str()
    }

    pub fn into_history(self) -> String {
        self.history.into_string()
    }
}

/// Packets counted as progress of the flow.
fn progress(config: &Config, conn: &Connection) -> u64 {
    if config.use_goodput {
        conn.in_order_delivered
    } else {
        conn.delivered
    }
}

fn micros(d: Duration) -> u64 {
    crate::bandwidth::saturate(d.as_micros())
}
