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

use super::Classifier;
use super::UpperBound;

use crate::sample::Connection;
use crate::Config;

impl Classifier {
    /// Runs the bound probing state machine for one ACK.
    ///
    /// A confirmed bound is relaxed every `probe_interval` rounds. If the
    /// fitted candidate then moves, the bound is lifted until the candidate
    /// holds still for `monitor_period` rounds, after which it is confirmed
    /// again at the new value.
    ///
    /// Returns `true` when a probe starts.
    pub fn probe(&mut self, config: &Config, conn: &Connection) -> bool {
        if !self.is_enforcing(config) {
            return false;
        }

        let candidate = self.candidate();

        if self.upper_bound != UpperBound::Confirmed || self.probe_active {
            if self.round_start {
                self.monitor_rounds += 1;

                if self.monitor_rounds >= config.monitor_period &&
                    candidate == self.memory
                {
                    trace!("bound confirmed at {:?}", candidate.rate);

                    self.upper_bound = UpperBound::Confirmed;
                    self.probe_active = false;
                    self.monitor_rounds = 0;
                }
            }

            if candidate != self.memory {
                trace!("bound lifted, candidate moved to {:?}", candidate.rate);

                self.upper_bound = UpperBound::Probing;
                self.probe_active = false;
                self.memory = candidate;
                self.monitor_rounds = 0;
                self.restart_round(conn.delivered);
            }

            return false;
        }

        if self.round_start {
            self.probe_rounds += 1;

            if self.probe_rounds >= config.probe_interval {
                trace!("probing above bound {:?}", candidate.rate);

                self.probe_active = true;
                self.memory = candidate;
                self.probe_rounds = 0;
                self.monitor_rounds = 0;

                return true;
            }
        }

        false
    }
}
