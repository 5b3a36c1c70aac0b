// Copyright 2026 The Project Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! A per-CPU fair-share thread scheduler.
//!
//! [`scheduler::PerCpuScheduler`] maintains a ready set of threads ordered by
//! accumulated virtual runtime, preempts the running thread on timer tick
//! under a load-scaled epoch/granularity policy, and hands the actual
//! register exchange off to [`switch`]. Everything the scheduler needs from
//! the surrounding kernel — the current-thread pointer, the clock, the
//! stack-switch shim itself — is gathered behind the [`runtime::SchedulerRuntime`]
//! trait, so the algorithm in this crate never depends on a concrete kernel.
//!
//! This crate covers only the scheduler. Thread creation, stack allocation,
//! address-space setup, and the rest of the kernel are out of scope; see
//! [`runtime`] for the seams where those layers plug in.

#![no_std]

extern crate alloc;

pub mod runtime;
pub mod scheduler;
pub mod switch;
pub mod thread;
pub mod time_source;
pub mod tunables;

pub use scheduler::PerCpuScheduler;
pub use thread::{Thread, ThreadId, ThreadState};
