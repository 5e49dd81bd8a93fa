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

use serde::Deserialize;

use crate::Error;
use crate::Result;

/// Default number of round trips between two probes of a confirmed bound.
const DEFAULT_PROBE_INTERVAL: u32 = 20;

/// Default probing fraction, in units of 1/20: 24/20 = 1.2x the bound.
const DEFAULT_PROBE_FRACTION: u32 = 24;

/// Default number of round trips a candidate must hold before the bound is
/// confirmed again.
const DEFAULT_MONITOR_PERIOD: u32 = 3;

/// Default size of the diagnostic history buffer, in bytes.
const DEFAULT_HISTORY_CAPACITY: usize = 5000;

/// Default number of ACKs between two history entries.
const DEFAULT_HISTORY_INTERVAL: u32 = 400;

/// Stores configuration shared between engine instances.
///
/// A `Config` is built once and copied into every [`Bbr`] created from it;
/// changing it afterwards has no effect on existing engines.
///
/// [`Bbr`]: crate::Bbr
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawConfig")]
pub struct Config {
    pub(crate) probe_interval: u32,

    pub(crate) probe_fraction: u32,

    pub(crate) monitor_period: u32,

    pub(crate) enforce: bool,

    pub(crate) use_goodput: bool,

    pub(crate) exclude_rwnd_limited: bool,

    pub(crate) exclude_timeout: bool,

    pub(crate) exclude_app_limited: bool,

    pub(crate) history_capacity: usize,

    pub(crate) history_interval: u32,

    pub(crate) cycle_seed: u64,
}

impl Config {
    /// Creates a config object with default values.
    pub fn new() -> Self {
        Config {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_fraction: DEFAULT_PROBE_FRACTION,
            monitor_period: DEFAULT_MONITOR_PERIOD,
            enforce: true,
            use_goodput: true,
            exclude_rwnd_limited: false,
            exclude_timeout: false,
            exclude_app_limited: false,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_interval: DEFAULT_HISTORY_INTERVAL,
            cycle_seed: 0,
        }
    }

    /// Sets the number of round trips between two probes of a confirmed
    /// rate-limit bound.
    ///
    /// The default value is `20`. Zero is rejected with
    /// [`Error::InvalidProbeInterval`].
    pub fn set_probe_interval(&mut self, rounds: u32) -> Result<()> {
        if rounds == 0 {
            return Err(Error::InvalidProbeInterval);
        }

        self.probe_interval = rounds;

        Ok(())
    }

    /// Sets how far a probe relaxes the bound, in units of 1/20.
    ///
    /// The default value is `24`, i.e. probes pace at 1.2x the bound.
    pub fn set_probe_fraction(&mut self, fraction: u32) -> Result<()> {
        if fraction == 0 {
            return Err(Error::InvalidProbeFraction);
        }

        self.probe_fraction = fraction;

        Ok(())
    }

    /// Sets the number of round trips a candidate must stay unchanged before
    /// the bound is confirmed again.
    ///
    /// The default value is `3`.
    pub fn set_monitor_period(&mut self, rounds: u32) -> Result<()> {
        if rounds == 0 {
            return Err(Error::InvalidMonitorPeriod);
        }

        self.monitor_period = rounds;

        Ok(())
    }

    /// Configures whether a detected rate limit caps the pacing rate.
    ///
    /// When disabled the classifier still runs, but only reports.
    ///
    /// The default value is `true`.
    pub fn enable_enforcement(&mut self, v: bool) {
        self.enforce = v;
    }

    /// Configures whether the classifier counts in-order acknowledged
    /// packets (goodput) instead of every delivered packet.
    ///
    /// The default value is `true`.
    pub fn enable_goodput(&mut self, v: bool) {
        self.use_goodput = v;
    }

    /// Configures whether receive-window-limited ACKs reset the classifier.
    ///
    /// The default value is `false`.
    pub fn enable_rwnd_exclusion(&mut self, v: bool) {
        self.exclude_rwnd_limited = v;
    }

    /// Configures whether leaving a retransmission timeout resets the
    /// classifier.
    ///
    /// The default value is `false`.
    pub fn enable_timeout_exclusion(&mut self, v: bool) {
        self.exclude_timeout = v;
    }

    /// Configures whether application-limited samples reset the classifier.
    ///
    /// The default value is `false`.
    pub fn enable_app_limited_exclusion(&mut self, v: bool) {
        self.exclude_app_limited = v;
    }

    /// Sets the diagnostic history buffer size in bytes and the number of
    /// ACKs between two entries.
    ///
    /// The default values are `5000` and `400`. A capacity of zero disables
    /// the history.
    pub fn set_history(&mut self, capacity: usize, interval: u32) -> Result<()> {
        if interval == 0 {
            return Err(Error::InvalidHistoryInterval);
        }

        self.history_capacity = capacity;
        self.history_interval = interval;

        Ok(())
    }

    /// Sets the seed used to pick the initial gain cycle phase.
    ///
    /// Engines built with the same seed and fed the same input produce the
    /// same output. Give each connection its own seed to desynchronize
    /// flows sharing a bottleneck.
    ///
    /// The default value is `0`.
    pub fn set_cycle_seed(&mut self, seed: u64) {
        self.cycle_seed = seed;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk representation of [`Config`]; every field is optional.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    probe_interval: u32,
    probe_fraction: u32,
    monitor_period: u32,
    enforce: bool,
    use_goodput: bool,
    exclude_rwnd_limited: bool,
    exclude_timeout: bool,
    exclude_app_limited: bool,
    history_capacity: usize,
    history_interval: u32,
    cycle_seed: u64,
}

impl Default for RawConfig {
    fn default() -> Self {
        let c = Config::new();

        RawConfig {
            probe_interval: c.probe_interval,
            probe_fraction: c.probe_fraction,
            monitor_period: c.monitor_period,
            enforce: c.enforce,
            use_goodput: c.use_goodput,
            exclude_rwnd_limited: c.exclude_rwnd_limited,
            exclude_timeout: c.exclude_timeout,
            exclude_app_limited: c.exclude_app_limited,
            history_capacity: c.history_capacity,
            history_interval: c.history_interval,
            cycle_seed: c.cycle_seed,
        }
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = Error;

    fn try_from(raw: RawConfig) -> Result<Self> {
        let mut config = Config::new();

        config.set_probe_interval(raw.probe_interval)?;
        config.set_probe_fraction(raw.probe_fraction)?;
        config.set_monitor_period(raw.monitor_period)?;
        config.set_history(raw.history_capacity, raw.history_interval)?;

        config.enable_enforcement(raw.enforce);
        config.enable_goodput(raw.use_goodput);
        config.enable_rwnd_exclusion(raw.exclude_rwnd_limited);
        config.enable_timeout_exclusion(raw.exclude_timeout);
        config.enable_app_limited_exclusion(raw.exclude_app_limited);
        config.set_cycle_seed(raw.cycle_seed);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new();

        assert_eq!(config.probe_interval, 20);
        assert_eq!(config.probe_fraction, 24);
        assert_eq!(config.monitor_period, 3);
        assert!(config.enforce);
        assert!(config.use_goodput);
        assert!(!config.exclude_rwnd_limited);
        assert!(!config.exclude_timeout);
        assert!(!config.exclude_app_limited);
        assert_eq!(config.history_capacity, 5000);
        assert_eq!(config.history_interval, 400);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn setters_reject_zero() {
        let mut config = Config::new();

        assert_eq!(config.set_probe_interval(0), Err(Error::InvalidProbeInterval));
        assert_eq!(config.set_probe_fraction(0), Err(Error::InvalidProbeFraction));
        assert_eq!(config.set_monitor_period(0), Err(Error::InvalidMonitorPeriod));
        assert_eq!(config.set_history(100, 0), Err(Error::InvalidHistoryInterval));

        // Rejected values leave the config untouched.
        assert_eq!(config, Config::new());

        assert_eq!(config.set_probe_interval(5), Ok(()));
        assert_eq!(config.set_history(0, 1), Ok(()));
        assert_eq!(config.probe_interval, 5);
        assert_eq!(config.history_capacity, 0);
    }

    #[test]
    fn deserialize_partial() {
        let config: Config = serde_json::from_str(
            r#"{ "probe_interval": 10, "enforce": false, "cycle_seed": 7 }"#,
        )
        .unwrap();

        assert_eq!(config.probe_interval, 10);
        assert!(!config.enforce);
        assert_eq!(config.cycle_seed, 7);
        assert_eq!(config.probe_fraction, 24);
        assert_eq!(config.monitor_period, 3);
    }

    #[test]
    fn deserialize_invalid() {
        let err = serde_json::from_str::<Config>(r#"{ "monitor_period": 0 }"#)
            .unwrap_err();
        assert!(err.to_string().contains("InvalidMonitorPeriod"));

        assert!(serde_json::from_str::<Config>(r#"{ "probe_per": 3 }"#).is_err());
    }
}
