// Copyright 2026 The Project Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Process-wide scheduling tunables.
//!
//! `schedMinGranularityTicks` and `defaultEpochLengthTicks` are written once
//! during boot and read without locking afterwards. [`Once`] enforces that
//! discipline: a second [`Once::init`] call panics rather than silently
//! overwriting a value a scheduler may already be using.

/// Default minimum granularity, in ticks, before allowing a preemption.
pub const DEFAULT_MIN_GRANULARITY_TICKS: u64 = 4;

/// Default epoch length, in ticks, when few threads are runnable.
pub const DEFAULT_EPOCH_LENGTH_TICKS: u64 = 20;

/// A cell that can be written exactly once and read freely afterwards.
pub struct Once<T> {
    inner: spin::Once<T>,
}

impl<T> Once<T> {
    pub const fn new() -> Self {
        Once {
            inner: spin::Once::new(),
        }
    }

    /// Initialises the cell. Panics if it has already been initialised.
    pub fn init(&self, f: impl FnOnce() -> T) {
        assert!(!self.inner.is_completed(), "tunable initialised twice");
        self.inner.call_once(f);
    }

    /// Reads the cell if it has been initialised, without panicking
    /// otherwise. The scheduler tunables are read far more often before boot
    /// has necessarily called [`Once::init`] than a hard-panic-on-unset
    /// `Deref` would tolerate, so callers that need a pre-boot default
    /// instead match on this directly (see [`sched_min_granularity_ticks`]).
    pub fn get(&self) -> Option<&T> {
        self.inner.get()
    }
}

/// The two globals `setSchedParameters` assigns at boot.
pub struct GlobalTunables {
    pub sched_min_granularity_ticks: u64,
    pub default_epoch_length_ticks: u64,
}

impl Default for GlobalTunables {
    fn default() -> Self {
        GlobalTunables {
            sched_min_granularity_ticks: DEFAULT_MIN_GRANULARITY_TICKS,
            default_epoch_length_ticks: DEFAULT_EPOCH_LENGTH_TICKS,
        }
    }
}

static TUNABLES: Once<GlobalTunables> = Once::new();

/// Sets the scheduling tunables. May only be called once, during boot.
pub fn set_sched_parameters(min_granularity_ticks: u64, epoch_length_ticks: u64) {
    TUNABLES.init(|| GlobalTunables {
        sched_min_granularity_ticks: min_granularity_ticks,
        default_epoch_length_ticks: epoch_length_ticks,
    });
}

/// Reads the current tunables, falling back to the defaults if
/// [`set_sched_parameters`] has not yet been called.
pub fn sched_min_granularity_ticks() -> u64 {
    TUNABLES
        .get()
        .map(|t| t.sched_min_granularity_ticks)
        .unwrap_or(DEFAULT_MIN_GRANULARITY_TICKS)
}

pub fn default_epoch_length_ticks() -> u64 {
    TUNABLES
        .get()
        .map(|t| t.default_epoch_length_ticks)
        .unwrap_or(DEFAULT_EPOCH_LENGTH_TICKS)
}

/// Parses a configuration blob containing two decimal integers separated by
/// any run of non-digit characters, e.g. `"min=4ms, epoch=20ms"`.
///
/// Returns `(first, second)` on success. Does not replicate the original
/// parser's double-advance bug on interleaved digit runs; this scans once
/// for the first two maximal digit runs and treats everything else as
/// separator.
pub fn parse_sched_params(blob: &str) -> Option<(u64, u64)> {
    let mut numbers = blob
        .as_bytes()
        .split(|b| !b.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .map(|run| core::str::from_utf8(run).ok()?.parse::<u64>().ok());

    let first = numbers.next()??;
    let second = numbers.next()??;
    Some((first, second))
}

/// Converts a millisecond value parsed from the config blob into ticks,
/// using a pre-calibrated ticks-per-millisecond factor. Calibrating that
/// factor (measuring the time source against a known interval) is the
/// boot-time caller's job, not the scheduler's.
pub fn ms_to_ticks(ms: u64, ticks_per_ms: u64) -> u64 {
    ms * ticks_per_ms
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn parses_two_integers_separated_by_text() {
        assert_eq!(parse_sched_params("min=4ms epoch=20ms"), Some((4, 20)));
    }

    #[test]
    fn parses_bare_separators() {
        assert_eq!(parse_sched_params("4,20"), Some((4, 20)));
        assert_eq!(parse_sched_params("4 20"), Some((4, 20)));
    }

    #[test]
    fn missing_second_number_fails() {
        assert_eq!(parse_sched_params("only 4 here"), None);
    }

    #[test]
    fn extra_numbers_are_ignored() {
        assert_eq!(parse_sched_params("4 20 999"), Some((4, 20)));
    }

    #[test]
    fn ms_to_ticks_scales_linearly() {
        assert_eq!(ms_to_ticks(4, 1_000), 4_000);
    }
}
