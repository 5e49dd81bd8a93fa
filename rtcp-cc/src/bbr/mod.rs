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

//! BBR congestion control with rate-limit detection.
//!
//! The model follows BBR v1 as described in
//! <https://tools.ietf.org/html/draft-cardwell-iccrg-bbr-congestion-control-00>,
//! in packet units with the fixed-point arithmetic of the Linux
//! implementation, extended with a classifier that caps pacing when a
//! token-bucket rate limiter is detected on the path.

use std::time::Duration;
use std::time::Instant;

use rand::rngs::StdRng;
use serde::Serialize;

use crate::bandwidth::Bandwidth;
use crate::bandwidth::BBR_UNIT;
use crate::diagnostics::Observer;
use crate::diagnostics::Report;
use crate::diagnostics::Snapshot;
use crate::minmax::Minmax;
use crate::pmodrl::Classification;
use crate::pmodrl::Classifier;
use crate::sample::CaState;
use crate::sample::Connection;
use crate::sample::Event;
use crate::sample::Limits;
use crate::sample::Sample;
use crate::Config;

mod ack_aggregation;
mod cwnd;
mod init;
mod long_term;
mod pacing;
mod per_ack;

use ack_aggregation::AckAggregation;
use long_term::LongTerm;

/// Number of phases in the ProbeBW gain cycle.
const CYCLE_LEN: usize = 8;

/// Window length of the max bandwidth filter, in packet-timed round trips.
const BW_FILTER_ROUNDS: u64 = CYCLE_LEN as u64 + 2;

/// Window length of the min RTT filter.
const MIN_RTT_WINDOW: Duration = Duration::from_secs(10);

/// Minimum time spent at `CWND_MIN_TARGET` in ProbeRTT.
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// Gain that allows the sending rate to double each round (2/ln(2)), used in
/// Startup for both pacing and cwnd.
const HIGH_GAIN: u64 = BBR_UNIT * 2885 / 1000 + 1;

/// Inverse of `HIGH_GAIN`, used to drain the Startup queue in one round.
const DRAIN_GAIN: u64 = BBR_UNIT * 1000 / 2885;

/// Steady-state cwnd gain, to tolerate delayed and stretched ACKs.
const CWND_GAIN: u64 = BBR_UNIT * 2;

/// Pacing gain cycle: probe for more bandwidth, drain the queue it built,
/// then cruise.
const PACING_GAIN_CYCLE: [u64; CYCLE_LEN] = [
    BBR_UNIT * 5 / 4,
    BBR_UNIT * 3 / 4,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
];

/// The initial phase is picked randomly among all but the draining one.
const CYCLE_RAND: usize = 7;

/// Smallest cwnd BBR targets, in packets.
const CWND_MIN_TARGET: u64 = 4;

/// Bandwidth must grow by 25% in a round to count as still growing.
const FULL_BW_THRESH: u64 = BBR_UNIT * 5 / 4;

/// Rounds without growth after which the pipe is considered full.
const FULL_BW_COUNT: u32 = 3;

/// Slow start threshold before any estimate exists.
pub const INFINITE_SSTHRESH: u64 = u64::MAX;

/// BBR state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Mode {
    /// Ramp up sending rate rapidly to fill the pipe.
    Startup,

    /// Drain any queue created during Startup.
    Drain,

    /// Discover and share bandwidth: pace around the estimated bandwidth.
    ProbeBw,

    /// Cut inflight to the minimum to probe the path's min RTT.
    ProbeRtt,
}

/// Control decisions to apply on the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Output {
    /// Pacing rate, in bytes per second.
    pub pacing_rate: u64,

    /// Congestion window, in packets.
    pub cwnd: u64,

    /// Slow start threshold, in packets.
    pub ssthresh: u64,

    /// Minimum number of packets per transmission burst.
    pub min_tso_segs: u64,

    /// Preferred number of packets per transmission burst.
    pub tso_segs_goal: u64,

    /// Whether the sender should mark the connection as application limited,
    /// so that the low inflight of ProbeRTT does not pollute rate samples.
    pub mark_app_limited: bool,
}

/// Inputs of a single ACK.
struct Ack<'a> {
    sample: &'a Sample,
    conn: &'a Connection,
    limits: &'a Limits,
    now: Instant,
}

/// Per-connection BBR state.
pub struct Bbr {
    config: Config,

    mode: Mode,

    // Working copy of the connection's cwnd, in packets.
    cwnd: u64,

    // Current pacing rate, in bytes per second.
    pacing_rate: u64,

    ssthresh: u64,

    // Windowed min RTT, and when it was last refreshed.
    min_rtt: Option<Duration>,

    min_rtt_stamp: Instant,

    // End of the current ProbeRTT dwell, once inflight got low enough.
    probe_rtt_done_stamp: Option<Instant>,

    // Whether a full round elapsed since the ProbeRTT dwell started.
    probe_rtt_round_done: bool,

    // Max filter of delivery rate samples over packet-timed rounds.
    bw: Minmax<Bandwidth, u64>,

    // Count of packet-timed round trips elapsed so far.
    round_count: u64,

    // Delivered count that marks the end of the current round.
    next_round_delivered: u64,

    round_start: bool,

    // Loss recovery state seen on the previous ACK.
    prev_ca_state: CaState,

    // Whether cwnd follows packet conservation in the first round of fast
    // recovery.
    packet_conservation: bool,

    // Whether transmission restarted after an idle period and no data was
    // delivered since.
    idle_restart: bool,

    long_term: LongTerm,

    pacing_gain: u64,

    cwnd_gain: u64,

    // Whether BBR estimates it has ever fully utilized its available
    // bandwidth.
    full_bw_reached: bool,

    // Rounds without significant bandwidth growth.
    full_bw_count: u32,

    // Bandwidth at the last significant growth.
    full_bw: Bandwidth,

    cycle_index: usize,

    // Start of the current gain cycle phase.
    cycle_stamp: Instant,

    has_seen_rtt: bool,

    // cwnd saved before recovery or ProbeRTT, restored afterwards.
    prior_cwnd: u64,

    ack_aggregation: AckAggregation,

    rng: StdRng,

    classifier: Classifier,

    observer: Option<Box<dyn Observer>>,
}

impl Bbr {
    /// Creates the engine for a connection starting at `now`.
    pub fn new(
        config: &Config, conn: &Connection, limits: &Limits, now: Instant,
    ) -> Self {
        init::bbr_init(config, conn, limits, now)
    }

    /// Installs an observer called with a [`Snapshot`] after every update.
    pub fn set_observer(&mut self, observer: Box<dyn Observer>) {
        self.observer = Some(observer);
    }

    /// Processes the rate sample of one ACK.
    pub fn on_ack(
        &mut self, sample: &Sample, conn: &Connection, limits: &Limits,
        now: Instant,
    ) -> Output {
        self.cwnd = conn.cwnd;

        let prev_ca_state = self.prev_ca_state;

        let cx = Ack {
            sample,
            conn,
            limits,
            now,
        };

        per_ack::bbr_update_model(self, &cx);
        per_ack::bbr_update_classifier(self, &cx);

        let bw = self.bw();
        pacing::bbr_set_pacing_rate(self, &cx, bw, self.pacing_gain);
        cwnd::bbr_set_cwnd(self, &cx, sample.acked_sacked, bw, self.cwnd_gain);

        self.classifier.record(conn);

        let left_timeout =
            prev_ca_state == CaState::Loss && conn.ca_state != CaState::Loss;

        self.classifier.apply_exclusions(
            &self.config,
            sample,
            conn,
            left_timeout,
            now,
        );

        self.notify();

        self.output(limits)
    }

    /// Processes a loss recovery event.
    pub fn on_event(
        &mut self, event: Event, conn: &Connection, limits: &Limits, now: Instant,
    ) -> Output {
        self.cwnd = conn.cwnd;

        match event {
            Event::EnterRecovery => cwnd::bbr_save_cwnd(self),

            Event::EnterLoss => {
                cwnd::bbr_save_cwnd(self);

                self.prev_ca_state = CaState::Loss;
                self.full_bw = Bandwidth::zero();
                self.round_start = true;

                // Count the timeout as a lossy round for policer detection.
                let sample = Sample {
                    losses: 1,
                    ..Default::default()
                };

                let cx = Ack {
                    sample: &sample,
                    conn,
                    limits,
                    now,
                };

                long_term::bbr_lt_bw_sampling(self, &cx);
            },

            Event::Undo => {
                self.full_bw = Bandwidth::zero();
                self.full_bw_count = 0;

                self.long_term.reset(conn, now);
            },

            Event::IdleRestart => {
                self.idle_restart = true;
                self.ack_aggregation.restart_epoch(now);

                match self.mode {
                    Mode::ProbeBw => {
                        let sample = Sample::default();

                        let cx = Ack {
                            sample: &sample,
                            conn,
                            limits,
                            now,
                        };

                        let bw = self.bw();
                        pacing::bbr_set_pacing_rate(self, &cx, bw, BBR_UNIT);
                    },

                    Mode::ProbeRtt => per_ack::bbr_check_probe_rtt_done(self, now),

                    _ => (),
                }

                self.classifier.restart_flow(&self.config, conn, now);
            },
        }

        self.notify();

        self.output(limits)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Bandwidth estimate in use: the long-term estimate while a policer is
    /// suspected, the windowed max otherwise.
    pub fn bandwidth(&self) -> Bandwidth {
        self.bw()
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    pub fn pacing_rate(&self) -> u64 {
        self.pacing_rate
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    pub fn classification(&self) -> Classification {
        self.classifier.classification()
    }

    /// Returns the current state of the engine.
    pub fn snapshot(&self) -> Snapshot {
        let candidate = self.classifier.candidate();
        let detection = self.classifier.detection();

        Snapshot {
            mode: self.mode,
            cycle_index: self.cycle_index,
            pacing_rate: self.pacing_rate,
            cwnd: self.cwnd,
            pacing_gain: self.pacing_gain,
            cwnd_gain: self.cwnd_gain,
            min_rtt_us: self
                .min_rtt
                .map(|rtt| crate::bandwidth::saturate(rtt.as_micros())),
            bandwidth: self.bw().to_scaled(),
            max_bandwidth: self.max_bw().to_scaled(),
            long_term_bandwidth: self.long_term.bw.to_scaled(),
            long_term_in_use: self.long_term.use_bw,
            full_bandwidth_reached: self.full_bw_reached,
            round_count: self.round_count,
            classification: self.classifier.classification(),
            classification_code: self.classifier.classification().code(),
            upper_bound: self.classifier.upper_bound(),
            probe_active: self.classifier.probe_active(),
            best_index: self.classifier.best_index(),
            best_burst: candidate.burst,
            best_rate: candidate.rate.to_scaled(),
            pre_loss_goodput: self.classifier.pre_loss_goodput().to_scaled(),
            detected_after_us: detection
                .map(|d| crate::bandwidth::saturate(d.elapsed.as_micros())),
            detected_bytes_acked: detection.map(|d| d.bytes_acked),
        }
    }

    /// Diagnostic history recorded so far.
    pub fn history(&self) -> &str {
        self.classifier.history()
    }

    /// Tears the engine down, handing back its final state and the
    /// diagnostic history.
    pub fn release(self) -> Report {
        let snapshot = self.snapshot();

        Report {
            snapshot,
            history: self.classifier.into_history(),
        }
    }

    fn max_bw(&self) -> Bandwidth {
        self.bw.get()
    }

    fn bw(&self) -> Bandwidth {
        if self.long_term.use_bw {
            self.long_term.bw
        } else {
            self.max_bw()
        }
    }

    fn notify(&mut self) {
        if let Some(mut observer) = self.observer.take() {
            observer.on_update(&self.snapshot());

            self.observer = Some(observer);
        }
    }

    fn output(&self, limits: &Limits) -> Output {
        Output {
            pacing_rate: self.pacing_rate,
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            min_tso_segs: pacing::bbr_min_tso_segs(self),
            tso_segs_goal: pacing::bbr_tso_segs_goal(self, limits),
            mark_app_limited: self.mode == Mode::ProbeRtt,
        }
    }
}

impl std::fmt::Debug for Bbr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bbr={{ mode={:?} bw={:?} min_rtt={:?} pacing_rate={} \
             pacing_gain={} cwnd_gain={} cwnd={} full_bw_reached={} \
             round_count={} classification={:?} }}",
            self.mode,
            self.bw(),
            self.min_rtt,
            self.pacing_rate,
            self.pacing_gain,
            self.cwnd_gain,
            self.cwnd,
            self.full_bw_reached,
            self.round_count,
            self.classifier.classification(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use rstest::rstest;

    use crate::pmodrl::Exclusion;
    use crate::pmodrl::UpperBound;
    use crate::testing::TestPath;

    const RTT: Duration = Duration::from_millis(20);

    /// Runs 2 packets per ms for 2 seconds, then halves goodput with 50%
    /// loss until a rate limit is detected.
    fn rate_limited_path(config: &Config) -> TestPath {
        let mut p = TestPath::new(config, RTT);

        p.run(Duration::from_secs(2), 2, 0);

        while p.bbr.classification() != Classification::RateLimited {
            assert!(p.elapsed() < Duration::from_secs(6));

            p.ack(1, 1);
        }

        p
    }

    #[test]
    fn startup_to_probe_bw() {
        let mut p = TestPath::new(&Config::new(), RTT);
        let mut pacing_rate = 0;

        while p.bbr.mode() == Mode::Startup {
            assert!(p.elapsed() < Duration::from_millis(500));

            let out = p.ack(2, 0);

            // The pacing rate never drops before the pipe is full.
            if p.bbr.mode() == Mode::Startup {
                assert!(out.pacing_rate >= pacing_rate);
                pacing_rate = out.pacing_rate;
            }
        }

        // The Startup queue is small enough for Drain to end immediately.
        assert_eq!(p.bbr.mode(), Mode::ProbeBw);
        assert!(p.bbr.full_bw_reached);
        assert_ne!(p.bbr.ssthresh, INFINITE_SSTHRESH);
        assert_eq!(p.bbr.min_rtt(), Some(RTT));

        // The estimate is the max sample: 40 packets per round trip.
        assert_eq!(
            p.bbr.bandwidth(),
            Bandwidth::from_delivered(40, RTT).unwrap()
        );
    }

    #[test]
    fn probe_bw_gain_cycle() {
        let mut p = TestPath::new(&Config::new(), RTT);

        while p.bbr.mode() != Mode::ProbeBw {
            assert!(p.elapsed() < Duration::from_millis(500));

            p.ack(2, 0);
        }

        // Enough inflight for the probing phase to end.
        p.in_flight = Some(100);

        let mut gains = Vec::new();

        for _ in 0..1000 {
            p.ack(2, 0);

            let s = p.bbr.snapshot();

            assert_eq!(s.cwnd_gain, CWND_GAIN);

            if gains.last() != Some(&s.pacing_gain) {
                gains.push(s.pacing_gain);
            }
        }

        assert!(gains.contains(&(BBR_UNIT * 5 / 4)));
        assert!(gains.contains(&(BBR_UNIT * 3 / 4)));
        assert!(gains.contains(&BBR_UNIT));

        // Draining always follows probing.
        for w in gains.windows(2) {
            if w[0] == BBR_UNIT * 5 / 4 {
                assert_eq!(w[1], BBR_UNIT * 3 / 4);
            }
        }
    }

    #[test]
    fn probe_rtt() {
        let mut p = TestPath::new(&Config::new(), RTT);

        p.run(Duration::from_secs(1), 1, 0);
        assert_eq!(p.bbr.mode(), Mode::ProbeBw);

        // From now on every RTT sample is above the min.
        let refreshed = p.now;
        p.queueing = Duration::from_millis(5);

        let mut out = p.ack(1, 0);

        while p.bbr.mode() != Mode::ProbeRtt {
            assert!(p.elapsed() < Duration::from_secs(12));

            out = p.ack(1, 0);
        }

        // The min RTT estimate expired, and the current sample replaced it.
        assert!(p.now - refreshed > MIN_RTT_WINDOW);
        assert!(p.now - refreshed < MIN_RTT_WINDOW + 2 * p.step);
        assert_eq!(p.bbr.min_rtt(), Some(RTT + p.queueing));
        assert!(out.cwnd <= CWND_MIN_TARGET);
        assert!(out.mark_app_limited);

        // Nothing happens until inflight is low enough.
        for _ in 0..300 {
            out = p.ack(1, 0);
        }
        assert_eq!(p.bbr.mode(), Mode::ProbeRtt);
        assert!(out.cwnd <= CWND_MIN_TARGET);

        p.in_flight = Some(CWND_MIN_TARGET);

        let low_since = p.now;

        while p.bbr.mode() == Mode::ProbeRtt {
            assert!(p.now - low_since < Duration::from_secs(1));

            out = p.ack(1, 0);
        }

        let dwell = p.now - low_since;
        assert!(dwell > PROBE_RTT_DURATION);
        assert!(dwell < PROBE_RTT_DURATION + 2 * RTT);

        assert_eq!(p.bbr.mode(), Mode::ProbeBw);
        assert!(out.cwnd > CWND_MIN_TARGET);
        assert!(!out.mark_app_limited);
    }

    #[test]
    fn steady_rtt_refreshes_min_rtt() {
        let mut p = TestPath::new(&Config::new(), RTT);

        // Samples equal to the min keep the estimate fresh.
        for _ in 0..12_000 {
            p.ack(1, 0);

            assert_ne!(p.bbr.mode(), Mode::ProbeRtt);
        }

        assert!(p.elapsed() > MIN_RTT_WINDOW + Duration::from_secs(1));
        assert_eq!(p.bbr.min_rtt(), Some(RTT));
        assert_eq!(p.bbr.min_rtt_stamp, p.now);
    }

    #[test]
    fn drain_waits_for_queue() {
        let mut p = TestPath::new(&Config::new(), RTT);

        // Far more than one BDP (40 packets) in flight.
        p.in_flight = Some(200);

        while p.bbr.mode() == Mode::Startup {
            assert!(p.elapsed() < Duration::from_millis(500));

            p.ack(2, 0);
        }

        assert_eq!(p.bbr.mode(), Mode::Drain);
        assert!(p.bbr.full_bw_reached);
        assert_ne!(p.bbr.ssthresh, INFINITE_SSTHRESH);
        assert_eq!(p.bbr.snapshot().pacing_gain, DRAIN_GAIN);
        assert_eq!(p.bbr.snapshot().cwnd_gain, HIGH_GAIN);

        for _ in 0..100 {
            p.ack(2, 0);

            assert_eq!(p.bbr.mode(), Mode::Drain);
        }

        // Back to one BDP in flight.
        p.in_flight = None;
        p.ack(2, 0);

        assert_eq!(p.bbr.mode(), Mode::ProbeBw);
        assert_ne!(p.bbr.snapshot().pacing_gain, DRAIN_GAIN);
        assert_eq!(p.bbr.snapshot().cwnd_gain, CWND_GAIN);
    }

    #[test]
    fn huge_ack_saturates_cwnd() {
        let mut p = TestPath::new(&Config::new(), RTT);

        p.run(Duration::from_millis(200), 2, 0);

        p.conn.in_flight = u64::MAX - 1;

        let sample = Sample {
            delivered: 40,
            interval: RTT,
            rtt: Some(RTT),
            acked_sacked: u64::MAX,
            prior_delivered: p.conn.delivered,
            prior_in_flight: u64::MAX,
            ..Default::default()
        };

        let now = p.now + p.step;
        let out = p.bbr.on_ack(&sample, &p.conn, &p.limits, now);
        assert!(out.cwnd >= CWND_MIN_TARGET);

        // Entering recovery conserves packets: in flight plus acked.
        p.conn.ca_state = CaState::Recovery;

        let now = now + p.step;
        let out = p.bbr.on_ack(&sample, &p.conn, &p.limits, now);
        assert_eq!(out.cwnd, u64::MAX);
    }

    #[test]
    fn idle_restart_paces_at_estimate() {
        let mut p = TestPath::new(&Config::new(), RTT);

        p.run(Duration::from_millis(500), 2, 0);
        assert_eq!(p.bbr.mode(), Mode::ProbeBw);

        let out = p.bbr.on_event(Event::IdleRestart, &p.conn, &p.limits, p.now);

        let bw = p.bbr.bandwidth();
        assert_eq!(
            out.pacing_rate,
            bw.to_bytes_per_second(p.limits.mss, BBR_UNIT)
        );
        assert!(p.bbr.idle_restart);

        // Cleared by the first ACK delivering data.
        p.ack(2, 0);
        assert!(!p.bbr.idle_restart);
    }

    #[test]
    fn timeout_and_undo() {
        let mut p = TestPath::new(&Config::new(), RTT);

        p.run(Duration::from_millis(500), 2, 0);

        let cwnd = p.conn.cwnd;

        p.bbr.on_event(Event::EnterLoss, &p.conn, &p.limits, p.now);

        assert_eq!(p.bbr.prior_cwnd, cwnd);
        assert_eq!(p.bbr.prev_ca_state, CaState::Loss);
        assert_eq!(p.bbr.full_bw, Bandwidth::zero());
        assert!(p.bbr.round_start);

        p.bbr.full_bw_count = 2;

        p.bbr.on_event(Event::Undo, &p.conn, &p.limits, p.now);

        assert_eq!(p.bbr.full_bw_count, 0);
        assert!(!p.bbr.long_term.use_bw);
    }

    #[test]
    fn policer_detected_from_start() {
        let mut p = TestPath::new(&Config::new(), RTT);

        while !p.bbr.long_term.use_bw {
            assert!(p.elapsed() < Duration::from_secs(1));

            p.ack(1, 1);
        }

        // Two consistent 4-round intervals, after the first loss.
        assert!(p.elapsed() < Duration::from_millis(200));

        assert_eq!(p.bbr.bandwidth(), Bandwidth::from_packets_per_second(1000));
        assert_eq!(p.bbr.classification(), Classification::Unclassified);
    }

    #[test]
    fn rate_limit_caps_pacing_and_probes() {
        let config = Config::new();
        let mut p = rate_limited_path(&config);

        let s = p.bbr.snapshot();

        assert_eq!(s.upper_bound, UpperBound::Confirmed);
        assert!(!s.probe_active);
        assert_eq!(s.classification_code, 1);

        let detected_after = Duration::from_micros(s.detected_after_us.unwrap());
        assert!(detected_after > Duration::from_secs(4));
        assert!(detected_after < Duration::from_millis(4500));
        assert!(s.detected_bytes_acked.unwrap() > 4000 * p.limits.mss);

        let pre_loss = Bandwidth::from_scaled(s.pre_loss_goodput);
        let rate = Bandwidth::from_scaled(s.best_rate);

        assert_eq!(pre_loss, Bandwidth::from_packets_per_second(2000));
        assert!(rate >= Bandwidth::from_packets_per_second(1000));
        assert!(rate < pre_loss);

        let bound = rate.to_bytes_per_second(p.limits.mss, BBR_UNIT);
        let probe_bound =
            rate.to_bytes_per_second(p.limits.mss, BBR_UNIT * 24 / 20);

        let mut out = p.ack(1, 1);

        // The bound holds until the first probe.
        while !p.bbr.snapshot().probe_active {
            assert!(out.pacing_rate <= bound);
            assert!(p.elapsed() < Duration::from_secs(6));

            out = p.ack(1, 1);
        }

        // Probes start on the bandwidth probing phase.
        assert_eq!(p.bbr.mode(), Mode::ProbeBw);
        assert_eq!(p.bbr.cycle_index, 0);

        while p.bbr.snapshot().probe_active {
            assert!(out.pacing_rate <= probe_bound);
            assert!(p.elapsed() < Duration::from_secs(7));

            out = p.ack(1, 1);
        }

        // The limit did not move: the same bound is confirmed again.
        let s = p.bbr.snapshot();

        assert_eq!(s.upper_bound, UpperBound::Confirmed);
        assert_eq!(s.classification, Classification::RateLimited);
        assert_eq!(Bandwidth::from_scaled(s.best_rate), rate);
        assert!(out.pacing_rate <= bound);
    }

    #[test]
    fn detection_without_enforcement() {
        let mut config = Config::new();
        config.enable_enforcement(false);

        let mut p = rate_limited_path(&config);

        assert_eq!(p.bbr.snapshot().upper_bound, UpperBound::Confirmed);

        for _ in 0..1000 {
            let out = p.ack(1, 1);

            assert!(!p.bbr.snapshot().probe_active);

            // Pacing follows the model alone.
            assert_eq!(
                out.pacing_rate,
                p.bbr
                    .bandwidth()
                    .to_bytes_per_second(p.limits.mss, p.bbr.pacing_gain)
            );
        }

        assert_eq!(p.bbr.classification(), Classification::RateLimited);
    }

    #[rstest]
    #[case::receive_window(Exclusion::ReceiveWindow, 5)]
    #[case::timeout(Exclusion::Timeout, 7)]
    #[case::app_limited(Exclusion::AppLimited, 9)]
    fn exclusion_resets_verdict(#[case] cause: Exclusion, #[case] code: u8) {
        let mut config = Config::new();
        config.enable_rwnd_exclusion(true);
        config.enable_timeout_exclusion(true);
        config.enable_app_limited_exclusion(true);

        let mut p = rate_limited_path(&config);

        match cause {
            Exclusion::ReceiveWindow => {
                p.conn.rwnd_limited = true;
                p.ack(1, 1);
            },

            Exclusion::Timeout => {
                p.bbr.on_event(Event::EnterLoss, &p.conn, &p.limits, p.now);

                p.conn.ca_state = CaState::Loss;
                p.ack(1, 1);

                p.conn.ca_state = CaState::Open;
                p.ack(1, 1);
            },

            Exclusion::AppLimited => {
                p.app_limited = true;
                p.ack(1, 1);
            },
        }

        let s = p.bbr.snapshot();

        assert_eq!(s.classification_code, code);
        assert_eq!(s.upper_bound, UpperBound::Unset);
        assert!(!p.bbr.classifier.is_enforcing(&p.bbr.config));
    }

    #[rstest]
    fn same_seed_same_output(#[values(0, 1, 42)] seed: u64) {
        let run = || {
            let mut config = Config::new();
            config.set_cycle_seed(seed);

            let mut p = TestPath::new(&config, RTT);

            let mut outputs: Vec<Output> = (0..500).map(|_| p.ack(2, 0)).collect();
            outputs.extend((0..500).map(|_| p.ack(1, 1)));

            outputs
        };

        assert_eq!(run(), run());
    }

    struct Recorder(Rc<RefCell<Vec<Mode>>>);

    impl Observer for Recorder {
        fn on_update(&mut self, snapshot: &Snapshot) {
            self.0.borrow_mut().push(snapshot.mode);
        }
    }

    #[test]
    fn observer_sees_every_update() {
        let mut p = TestPath::new(&Config::new(), RTT);
        let seen = Rc::new(RefCell::new(Vec::new()));

        p.bbr.set_observer(Box::new(Recorder(seen.clone())));

        p.run(Duration::from_millis(100), 2, 0);
        p.bbr.on_event(Event::EnterRecovery, &p.conn, &p.limits, p.now);

        let seen = seen.borrow();

        assert_eq!(seen.len(), 101);
        assert_eq!(seen[0], Mode::Startup);
        assert_eq!(seen.last(), Some(&p.bbr.mode()));
    }

    #[test]
    fn log_observer() {
        let mut p = TestPath::new(&Config::new(), RTT);

        p.bbr.set_observer(Box::new(crate::LogObserver::new("test")));
        p.run(Duration::from_millis(10), 2, 0);

        assert!(format!("{:?}", p.bbr).starts_with("bbr={ mode=Startup"));
    }

    #[test]
    fn snapshot_serializes() {
        let p = TestPath::new(&Config::new(), RTT);

        let json = serde_json::to_value(p.bbr.snapshot()).unwrap();

        assert_eq!(json["mode"], "Startup");
        assert_eq!(json["classification"], "Unclassified");
        assert_eq!(json["classification_code"], 0);
        assert_eq!(json["upper_bound"], "Unset");
        assert_eq!(json["pacing_gain"], HIGH_GAIN);
        assert!(json["min_rtt_us"].is_null());
        assert!(json["detected_after_us"].is_null());
    }

    #[test]
    fn release_returns_history() {
        let mut config = Config::new();
        config.set_history(5000, 100).unwrap();

        let mut p = TestPath::new(&config, RTT);

        p.run(Duration::from_millis(300), 2, 0);

        let history = p.bbr.history().to_string();

        let report = p.bbr.release();
        let entries: Vec<&str> = report.history.split_terminator('-').collect();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], format!("{};0;0;0", 100 * 2 * 1448));
        assert_eq!(report.history, history);
        assert_eq!(report.snapshot.classification_code, 0);
    }
}
