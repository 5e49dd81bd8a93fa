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

use rand::SeedableRng;

pub(super) fn bbr_init(
    config: &Config, conn: &Connection, limits: &Limits, now: Instant,
) -> Bbr {
    let mut b = Bbr {
        config: config.clone(),
        mode: Mode::Startup,
        cwnd: conn.cwnd,
        pacing_rate: 0,
        ssthresh: INFINITE_SSTHRESH,
        min_rtt: conn.min_rtt,
        min_rtt_stamp: now,
        probe_rtt_done_stamp: None,
        probe_rtt_round_done: false,
        bw: Minmax::new(0, Bandwidth::zero()),
        round_count: 0,
        next_round_delivered: 0,
        round_start: false,
        prev_ca_state: CaState::Open,
        packet_conservation: false,
        idle_restart: false,
        long_term: LongTerm::new(conn, now),
        pacing_gain: BBR_UNIT,
        cwnd_gain: BBR_UNIT,
        full_bw_reached: false,
        full_bw_count: 0,
        full_bw: Bandwidth::zero(),
        cycle_index: 0,
        cycle_stamp: now,
        has_seen_rtt: false,
        prior_cwnd: 0,
        ack_aggregation: AckAggregation::new(now),
        rng: StdRng::seed_from_u64(config.cycle_seed),
        classifier: Classifier::new(config, conn, now),
        observer: None,
    };

    pacing::bbr_init_pacing_rate_from_rtt(&mut b, conn, limits);
    bbr_reset_startup_mode(&mut b);

    b
}

pub(super) fn bbr_reset_startup_mode(b: &mut Bbr) {
    b.mode = Mode::Startup;

    per_ack::bbr_update_gains(b);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_state() {
        let now = Instant::now();
        let conn = Connection::default();
        let limits = Limits::default();

        let b = Bbr::new(&Config::new(), &conn, &limits, now);

        assert_eq!(b.mode(), Mode::Startup);
        assert_eq!(b.pacing_gain, HIGH_GAIN);
        assert_eq!(b.cwnd_gain, HIGH_GAIN);
        assert_eq!(b.ssthresh, INFINITE_SSTHRESH);
        assert_eq!(b.bandwidth(), Bandwidth::zero());
        assert_eq!(b.min_rtt(), None);
        assert!(!b.has_seen_rtt);
        assert_eq!(b.classification(), Classification::Unclassified);

        // Without an RTT sample the initial window is assumed to be sent
        // over 1ms: 10 packets of 1448 bytes at high gain, less the margin.
        assert_eq!(b.pacing_rate(), 41_381_651);
    }

    #[test]
    fn init_pacing_from_srtt() {
        let now = Instant::now();
        let limits = Limits::default();
        let conn = Connection {
            srtt: Some(Duration::from_millis(10)),
            ..Default::default()
        };

        let b = Bbr::new(&Config::new(), &conn, &limits, now);

        assert!(b.has_seen_rtt);
        assert_eq!(b.pacing_rate(), 4_138_115);

        let limits = Limits {
            max_pacing_rate: 1_000_000,
            ..Default::default()
        };

        let b = Bbr::new(&Config::new(), &conn, &limits, now);
        assert_eq!(b.pacing_rate(), 1_000_000);
    }
}
