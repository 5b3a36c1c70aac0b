// Copyright 2026 The Project Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The external collaborator interfaces the scheduler is built against.
//!
//! [`SchedulerRuntime`] gathers the handful of hooks a concrete kernel must
//! supply: the current-thread pointer, the memory context, the stack-switch
//! shim, and the wake/clock primitives. It is a trait object rather than a
//! set of free functions over CPU-local statics (compare
//! `cpu_local::current_thread()` in a single-process kernel) because this
//! crate's tests construct more than one scheduler in the same process.

use crate::scheduler::PerCpuScheduler;
use crate::thread::Thread;
use alloc::sync::Arc;

/// An opaque, runtime-defined memory context handle. The scheduler never
/// dereferences it; it only threads it through to [`SchedulerRuntime`]
/// calls.
pub type MemCtxRef = *const ();

/// A thread's entry point, called with up to three opaque arguments.
pub type EntryFn = extern "C" fn(*mut (), *mut (), *mut ());

/// Everything the scheduler needs from the surrounding kernel.
pub trait SchedulerRuntime: Sync {
    fn current_thread(&self) -> Arc<Thread>;
    fn set_current_thread(&self, thread: Arc<Thread>);

    /// The scheduler instance owning whichever CPU is executing right now.
    /// Distinct from a thread's `affinity`, which only records whichever
    /// scheduler *created* it: a thread migrated in via `resume` keeps its
    /// original `affinity` but is now running under a different scheduler,
    /// and it's this accessor — not `affinity` — that `resume`'s
    /// same-CPU fallback target must use.
    fn current_scheduler(&self) -> &'static PerCpuScheduler;

    fn memory_context(&self) -> MemCtxRef;
    fn default_memory_context(&self) -> MemCtxRef;

    /// Initialises a freshly allocated stack so that its first resumption
    /// calls `entry(arg1, arg2, arg3)`. Returns the adjusted stack pointer.
    fn stack_init(
        &self,
        sp: u64,
        ctx: MemCtxRef,
        entry: EntryFn,
        arg1: *mut (),
        arg2: *mut (),
        arg3: *mut (),
    ) -> u64;

    /// Performs the register exchange between `curr` and the thread whose
    /// stack pointer is `next_sp`. Returns the thread that was running on
    /// this CPU immediately before this resumption (which may differ from
    /// `curr` if a third thread ran in between).
    ///
    /// # Safety
    ///
    /// `curr_sp` must point at `curr`'s live stack-pointer cell, and
    /// `next_sp` must be a stack pointer previously produced by
    /// [`SchedulerRuntime::stack_init`] or saved by a prior call to this
    /// function.
    unsafe fn stack_switch(
        &self,
        curr: &Arc<Thread>,
        target: Option<&'static PerCpuScheduler>,
        curr_sp: *mut u64,
        next_sp: u64,
    ) -> Arc<Thread>;

    /// Runtime-side bookkeeping run immediately after a switch lands on the
    /// newly resumed thread's stack.
    fn post_resume(&self, first_entry: bool, prev: &Arc<Thread>, ctx: MemCtxRef);

    /// Pokes a CPU whose scheduler just transitioned from empty to
    /// non-empty, so it stops idling.
    fn wake_up(&self, scheduler: &'static PerCpuScheduler);

    fn time_source(&self) -> &dyn crate::time_source::TimeSource;
}
