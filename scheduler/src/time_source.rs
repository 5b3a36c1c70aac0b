// Copyright 2026 The Project Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The monotonic clock [`PerCpuScheduler::preempt`] reads ticks from.

/// A monotonic tick counter. Wraparound is not handled; ticks are assumed to
/// fit in a `u64` for the lifetime of the system.
pub trait TimeSource {
    fn now_ticks(&self) -> u64;
}
