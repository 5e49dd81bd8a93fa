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

//! Inputs the transport hands to the engine.

use std::time::Duration;
use std::time::Instant;

/// A delivery rate sample, computed by the transport for one ACK.
///
/// All counts are in packets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    /// Packets delivered over `interval`. Negative when no sample could be
    /// taken.
    pub delivered: i64,

    /// Length of the sampling interval. Zero when no sample could be taken.
    pub interval: Duration,

    /// RTT measured by this ACK, if any.
    pub rtt: Option<Duration>,

    /// Packets newly marked lost by this ACK.
    pub losses: u64,

    /// Packets newly (selectively) acknowledged by this ACK.
    pub acked_sacked: u64,

    /// Connection-level delivered count when the acknowledged packet was
    /// sent.
    pub prior_delivered: u64,

    /// Packets in flight before this ACK was processed.
    pub prior_in_flight: u64,

    /// Whether the sample was taken while the sender was application
    /// limited.
    pub is_app_limited: bool,

    /// Whether the RTT of this sample may be inflated by a delayed ACK.
    pub is_ack_delayed: bool,
}

impl Sample {
    /// Whether the sample carries a usable delivery rate.
    pub fn is_valid(&self) -> bool {
        self.delivered >= 0 && self.interval.as_micros() > 0
    }
}

/// The loss recovery state of the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CaState {
    #[default]
    Open,
    Disorder,
    Cwr,
    Recovery,
    Loss,
}

/// Cumulative view of the sending side of a connection, taken when a sample
/// or an event is handed to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connection {
    /// Packets delivered so far, including selectively acknowledged ones.
    pub delivered: u64,

    /// Packets marked lost so far.
    pub lost: u64,

    /// Packets acknowledged in order so far.
    pub in_order_delivered: u64,

    /// Bytes acknowledged so far.
    pub bytes_acked: u64,

    /// Packets currently in flight.
    pub in_flight: u64,

    /// Congestion window currently applied by the transport, in packets.
    pub cwnd: u64,

    /// Smoothed RTT, if any sample was taken yet.
    pub srtt: Option<Duration>,

    /// Minimum RTT observed by the transport, if any.
    pub min_rtt: Option<Duration>,

    pub ca_state: CaState,

    /// Earliest departure time of the next queued transmission.
    pub earliest_departure: Option<Instant>,

    /// Whether the sender is currently limited by the receive window.
    pub rwnd_limited: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Connection {
            delivered: 0,
            lost: 0,
            in_order_delivered: 0,
            bytes_acked: 0,
            in_flight: 0,
            cwnd: INITIAL_WINDOW_PACKETS,
            srtt: None,
            min_rtt: None,
            ca_state: CaState::Open,
            earliest_departure: None,
            rwnd_limited: false,
        }
    }
}

/// Default initial congestion window, in packets.
pub const INITIAL_WINDOW_PACKETS: u64 = 10;

/// Default shift applied to the pacing rate when sizing bursts: one burst
/// per ~1ms of pacing.
const DEFAULT_PACING_SHIFT: u32 = 10;

/// Limits imposed by the transport on the engine's outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum segment size, in bytes.
    pub mss: u64,

    /// Maximum pacing rate, in bytes per second.
    pub max_pacing_rate: u64,

    /// Maximum congestion window, in packets.
    pub cwnd_clamp: u64,

    /// Window used before any RTT sample is available, in packets.
    pub initial_cwnd: u64,

    pub pacing_shift: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            mss: 1448,
            max_pacing_rate: u64::MAX,
            cwnd_clamp: u64::MAX,
            initial_cwnd: INITIAL_WINDOW_PACKETS,
            pacing_shift: DEFAULT_PACING_SHIFT,
        }
    }
}

/// Discrete notifications from the transport's loss recovery machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Fast recovery started.
    EnterRecovery,

    /// A retransmission timeout fired.
    EnterLoss,

    /// A recovery episode turned out to be spurious.
    Undo,

    /// Transmission restarts after an application-limited idle period.
    IdleRestart,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_validity() {
        let mut s = Sample {
            delivered: 10,
            interval: Duration::from_millis(1),
            ..Default::default()
        };
        assert!(s.is_valid());

        s.delivered = -1;
        assert!(!s.is_valid());

        s.delivered = 0;
        s.interval = Duration::from_nanos(500);
        assert!(!s.is_valid());

        assert!(!Sample::default().is_valid());
    }

    #[test]
    fn ca_state_order() {
        assert!(CaState::Open < CaState::Recovery);
        assert!(CaState::Cwr < CaState::Recovery);
        assert!(CaState::Loss > CaState::Recovery);
    }
}
