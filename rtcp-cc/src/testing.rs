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

//! A deterministic path model to drive an engine in tests.
//!
//! The path acknowledges a caller-chosen number of packets every step,
//! regardless of the engine's output, and derives delivery rate samples the
//! way a transport would: over the last round trip.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use crate::Bbr;
use crate::Config;
use crate::Connection;
use crate::Limits;
use crate::Output;
use crate::Sample;

pub struct TestPath {
    pub bbr: Bbr,

    pub conn: Connection,

    pub limits: Limits,

    pub start: Instant,

    pub now: Instant,

    pub rtt: Duration,

    pub step: Duration,

    /// Delay added on top of `rtt` to the RTT samples, without changing
    /// when packets are delivered.
    pub queueing: Duration,

    /// Packets in flight reported to the engine. Defaults to the packets
    /// delivered over the last round trip.
    pub in_flight: Option<u64>,

    pub app_limited: bool,

    delivered_at: VecDeque<(Instant, u64)>,

    prior_delivered: u64,
}

impl TestPath {
    pub fn new(config: &Config, rtt: Duration) -> Self {
        let start = Instant::now();
        let limits = Limits::default();
        let conn = Connection {
            srtt: Some(rtt),
            ..Default::default()
        };

        let bbr = Bbr::new(config, &conn, &limits, start);

        TestPath {
            bbr,
            conn,
            limits,
            start,
            now: start,
            rtt,
            step: Duration::from_millis(1),
            queueing: Duration::ZERO,
            in_flight: None,
            app_limited: false,
            delivered_at: VecDeque::new(),
            prior_delivered: 0,
        }
    }

    /// Advances one step, acknowledging `delivered` packets and declaring
    /// `lost` packets lost.
    pub fn ack(&mut self, delivered: u64, lost: u64) -> Output {
        self.now += self.step;

        self.conn.delivered += delivered;
        self.conn.in_order_delivered += delivered;
        self.conn.bytes_acked += delivered * self.limits.mss;
        self.conn.lost += lost;

        self.delivered_at.push_back((self.now, self.conn.delivered));

        while let Some(&(t, d)) = self.delivered_at.front() {
            if self.now.saturating_duration_since(t) < self.rtt {
                break;
            }

            self.prior_delivered = d;
            self.delivered_at.pop_front();
        }

        let in_window = self.conn.delivered - self.prior_delivered;

        self.conn.in_flight = self.in_flight.unwrap_or(in_window);

        let sample = Sample {
            delivered: i64::try_from(in_window).unwrap(),
            interval: self.rtt,
            rtt: Some(self.rtt + self.queueing),
            losses: lost,
            acked_sacked: delivered,
            prior_delivered: self.prior_delivered,
            prior_in_flight: self.conn.in_flight,
            is_app_limited: self.app_limited,
            is_ack_delayed: false,
        };

        let out = self.bbr.on_ack(&sample, &self.conn, &self.limits, self.now);

        self.conn.cwnd = out.cwnd;

        out
    }

    /// Repeats the same step for `duration`, returning the last output.
    pub fn run(&mut self, duration: Duration, delivered: u64, lost: u64) -> Output {
        let end = self.now + duration;

        let mut out = self.ack(delivered, lost);

        while self.now < end {
            out = self.ack(delivered, lost);
        }

        out
    }

    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }
}
