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

use std::fmt::Write;

/// Room kept free for one more entry.
const MAX_ENTRY_LEN: usize = 90;

/// Bounded text log of periodic classifier state.
///
/// Entries are `"{bytes_acked};{code};{burst};{rate}-"`. Once the buffer is
/// full further entries are dropped.
#[derive(Debug, Default)]
pub(crate) struct History {
    buf: Option<String>,
    capacity: usize,
    interval: u32,
    acks: u32,
}

impl History {
    /// Creates a history, or a disabled one if `capacity` is zero or the
    /// buffer cannot be allocated.
    pub fn new(capacity: usize, interval: u32) -> Self {
        let mut buf = String::new();

        if capacity == 0 || buf.try_reserve_exact(capacity).is_err() {
            return History::default();
        }

        History {
            buf: Some(buf),
            capacity,
            interval,
            acks: 0,
        }
    }

    /// Counts an ACK and appends an entry every `interval` ACKs.
    pub fn on_ack(&mut self, bytes_acked: u64, code: u8, burst: u64, rate: u64) {
        let Some(buf) = self.buf.as_mut() else {
            return;
        };

        self.acks += 1;

        if self.acks < self.interval {
            return;
        }

        self.acks = 0;

        if buf.len() + MAX_ENTRY_LEN >= self.capacity {
            return;
        }

        // Writing to a `String` cannot fail.
        let _ = write!(buf, "{bytes_acked};{code};{burst};{rate}-");
    }

    /// Restarts the ACK count, keeping recorded entries.
    pub fn rewind(&mut self) {
        self.acks = 0;
    }

    pub fn as_str(&self) -> &str {
        self.buf.as_deref().unwrap_or_default()
    }

    pub fn into_string(self) -> String {
        self.buf.unwrap_or_default()
    }
}
