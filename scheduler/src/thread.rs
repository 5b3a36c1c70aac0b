// Copyright 2026 The Project Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The thread handle the scheduler dispatches.
//!
//! This module only describes the fields the scheduler itself reads and
//! writes. Everything else about a thread (its stack allocation, its entry
//! point, cleanup on exit) belongs to the layer that creates threads and
//! hands them to [`crate::scheduler::PerCpuScheduler::enqueue`].

use crate::scheduler::PerCpuScheduler;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crossbeam_utils::atomic::AtomicCell;
use ordered_set::{Identity, Ranked};

/// The lowest priority value, reserved for the per-CPU idle thread.
pub const IDLE_PRIORITY: u32 = u32::MAX;

/// One past the highest priority a non-idle thread may request.
pub const MAX_PRIORITY: u32 = IDLE_PRIORITY;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

/// Uniquely identifies a [`Thread`] for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    fn next() -> Self {
        ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A thread's scheduling state, as tracked by the scheduler.
///
/// Transitions out of `Running` always go through [`PerCpuScheduler`]: the
/// thread layer itself only ever reads `state`, it never writes it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Blocked,
    Cancelled,
    Finishing,
}

/// A runnable unit of execution, as seen by the scheduler.
///
/// `stack_pointer` is mutated only by the stack-switch shim
/// ([`crate::switch::stack_switch`]), never by the scheduler's own code. It
/// is wrapped in an `UnsafeCell` because it is written from outside Rust's
/// aliasing rules (the assembly routine writes through the raw pointer
/// handed to it by [`PerCpuScheduler::switch_thread`]); `Thread` is
/// `unsafe impl Sync` on the understanding that a thread's stack pointer
/// is only ever touched by the one CPU it is currently scheduled on.
pub struct Thread {
    id: ThreadId,
    priority: u32,
    v_runtime: AtomicU64,
    affinity: &'static PerCpuScheduler,
    next_scheduler: UnsafeCell<Option<&'static PerCpuScheduler>>,
    state: AtomicCell<ThreadState>,
    new_thread_created: AtomicBool,
    stack_pointer: UnsafeCell<u64>,
}

unsafe impl Sync for Thread {}

impl Thread {
    /// Creates a new thread with the given priority and owning scheduler.
    ///
    /// `stack_pointer` should already have been initialised by
    /// [`crate::switch::stack_init`] before the thread is ever enqueued.
    pub fn new(priority: u32, affinity: &'static PerCpuScheduler, stack_pointer: u64) -> Self {
        assert!(priority < MAX_PRIORITY, "priority {} out of range", priority);
        Self::new_unchecked(priority, affinity, stack_pointer)
    }

    /// Builds the struct without the `priority < MAX_PRIORITY` precondition,
    /// since the idle thread's priority is exactly [`IDLE_PRIORITY`] (which
    /// equals [`MAX_PRIORITY`] by definition, the one slot regular threads
    /// may never request).
    fn new_unchecked(priority: u32, affinity: &'static PerCpuScheduler, stack_pointer: u64) -> Self {
        Thread {
            id: ThreadId::next(),
            priority,
            v_runtime: AtomicU64::new(0),
            affinity,
            next_scheduler: UnsafeCell::new(None),
            state: AtomicCell::new(ThreadState::Ready),
            new_thread_created: AtomicBool::new(false),
            stack_pointer: UnsafeCell::new(stack_pointer),
        }
    }

    /// Creates the per-CPU idle thread. Its priority is fixed at
    /// [`IDLE_PRIORITY`] and it is marked as already admitted, since the
    /// scheduler inserts it directly into the ready set during construction
    /// rather than through [`PerCpuScheduler::enqueue`].
    pub fn new_idle(affinity: &'static PerCpuScheduler, stack_pointer: u64) -> Self {
        let thread = Thread::new_unchecked(IDLE_PRIORITY, affinity, stack_pointer);
        thread.new_thread_created.store(true, Ordering::Relaxed);
        thread
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn v_runtime(&self) -> u64 {
        self.v_runtime.load(Ordering::Relaxed)
    }

    pub fn set_v_runtime(&self, value: u64) {
        self.v_runtime.store(value, Ordering::Relaxed);
    }

    pub fn add_v_runtime(&self, delta: u64) {
        self.v_runtime.fetch_add(delta, Ordering::Relaxed);
    }

    /// Renormalizes `vRuntime` downward, e.g. on suspension. Wraps on
    /// underflow rather than saturating at zero, matching the source's
    /// unsigned `mword` arithmetic: `minvRuntime` only ever increases after
    /// this thread's `vRuntime` was last set against it, so an underflow
    /// here is expected to push the thread to the back of the ready set
    /// (lowest dispatch priority), not the front.
    pub fn sub_v_runtime(&self, delta: u64) {
        self.v_runtime.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> &'static PerCpuScheduler {
        self.affinity
    }

    pub fn next_scheduler(&self) -> Option<&'static PerCpuScheduler> {
        unsafe { *self.next_scheduler.get() }
    }

    /// Sets the scheduler this thread will be re-enqueued on after its next
    /// switch. Only ever called by [`PerCpuScheduler::switch_thread`], while
    /// this thread is the one currently running on its CPU.
    pub fn set_next_scheduler(&self, scheduler: Option<&'static PerCpuScheduler>) {
        unsafe { *self.next_scheduler.get() = scheduler };
    }

    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state);
    }

    /// Whether this is the thread's very first admission to a ready set.
    /// Flipped permanently true by [`PerCpuScheduler::enqueue`] the first
    /// time it runs.
    pub fn is_newly_created(&self) -> bool {
        !self.new_thread_created.swap(true, Ordering::AcqRel)
    }

    /// Raw pointer to the stack-pointer cell, for passing to the
    /// stack-switch shim. Never dereferenced outside that boundary.
    pub fn stack_pointer_cell(&self) -> *mut u64 {
        self.stack_pointer.get()
    }

    pub fn stack_pointer(&self) -> u64 {
        unsafe { *self.stack_pointer.get() }
    }
}

impl Ranked for alloc::sync::Arc<Thread> {
    fn rank(&self) -> u64 {
        self.v_runtime()
    }
}

impl Identity for alloc::sync::Arc<Thread> {
    fn identity(&self) -> usize {
        alloc::sync::Arc::as_ptr(self) as usize
    }
}
