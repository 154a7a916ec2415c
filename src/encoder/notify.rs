// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Notify/wait gate of the encoder worker thread.
//!
//! The worker records the set of conditions it is waiting for (the *required* mask) and sleeps
//! until one of them is signaled. Producers and consumers signal conditions through
//! [`Notifier::notify`] whenever an operation may unblock a pipeline stage, so the worker never
//! polls its queues in a loop.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use bitflags::bitflags;

bitflags! {
    /// Conditions the worker may be waiting for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NotifyFlags: u32 {
        /// A frame was queued on the input port.
        const INPUT = 1 << 0;
        /// An output slot was freed by the client.
        const OUTPUT = 1 << 1;
        /// An in-flight task was retired.
        const TASK = 1 << 2;
        /// An external condition changed, eg. a buffer group became available.
        const EXTERNAL = 1 << 3;
        /// A control command is pending.
        const CONTROL = 1 << 16;
        /// A reset is pending.
        const RESET = 1 << 17;
        /// The worker shall exit.
        const STOP = 1 << 18;

        /// Bits only cleared by the control handler.
        const RESERVED = Self::CONTROL.bits() | Self::RESET.bits() | Self::STOP.bits();
    }
}

/// Counters of the gate, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Number of notifications received.
    pub notifications: u64,
    /// Number of times the worker went to sleep.
    pub waits: u64,
    /// Number of notifications that woke the worker up.
    pub wakeups: u64,
}

/// Required and outstanding condition masks.
#[derive(Debug)]
pub struct WaitState {
    required: NotifyFlags,
    outstanding: NotifyFlags,
    stats: GateStats,
}

impl Default for WaitState {
    fn default() -> Self {
        Self {
            required: NotifyFlags::empty(),
            outstanding: NotifyFlags::empty(),
            stats: Default::default(),
        }
    }
}

impl WaitState {
    /// Decides whether the worker must sleep while waiting for `required`.
    ///
    /// Returns false if a reserved notification is pending, if nothing is required or if one of
    /// the required conditions was signaled. The required mask is replaced with `required`. When
    /// the worker may proceed, all outstanding notifications except the reserved ones are
    /// consumed, since the worker re-examines every queue afterwards.
    pub fn should_block(&mut self, required: NotifyFlags) -> bool {
        self.required = required;

        let proceed = self.outstanding.intersects(NotifyFlags::RESERVED)
            || required.is_empty()
            || required.intersects(self.outstanding);

        if proceed {
            self.outstanding &= NotifyFlags::RESERVED;
        }

        !proceed
    }

    /// Records `flags` as outstanding. Returns true if the worker has to be woken up.
    pub fn signal(&mut self, flags: NotifyFlags) -> bool {
        self.outstanding |= flags;
        self.stats.notifications += 1;

        let wake = flags.intersects(NotifyFlags::RESERVED) || flags.intersects(self.required);
        if wake {
            self.stats.wakeups += 1;
        }

        wake
    }

    /// Clears the reserved `flags`, returning the ones that were set.
    pub fn take_reserved(&mut self, flags: NotifyFlags) -> NotifyFlags {
        let taken = self.outstanding & flags & NotifyFlags::RESERVED;
        self.outstanding.remove(taken);
        taken
    }

    pub fn outstanding(&self) -> NotifyFlags {
        self.outstanding
    }

    pub fn required(&self) -> NotifyFlags {
        self.required
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }
}

/// Anything that can be told that a condition changed.
pub trait Notifier: Send + Sync {
    fn notify(&self, flags: NotifyFlags);
}

/// State guarded by the gate lock: the wait masks plus the owner's own state `S`, so that
/// both are always mutated under the same lock.
pub struct GateState<S> {
    pub wait: WaitState,
    pub shared: S,
}

/// A mutex/condvar pair implementing the notify/wait protocol.
pub struct NotifyGate<S = ()> {
    state: Mutex<GateState<S>>,
    cond: Condvar,
}

impl<S: Default> Default for NotifyGate<S> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<S> NotifyGate<S> {
    pub fn new(shared: S) -> Self {
        Self {
            state: Mutex::new(GateState {
                wait: Default::default(),
                shared,
            }),
            cond: Condvar::new(),
        }
    }

    /// Locks the gate state.
    pub fn lock(&self) -> MutexGuard<'_, GateState<S>> {
        self.state.lock().unwrap()
    }

    /// Updates the owner's state and signals `flags` under a single lock acquisition.
    pub fn notify_with<R>(&self, flags: NotifyFlags, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.lock();
        let ret = f(&mut state.shared);
        if state.wait.signal(flags) {
            self.cond.notify_all();
        }
        ret
    }

    /// Blocks the calling thread until the gate lets it proceed with `required`. Returns the
    /// locked state so the caller can inspect pending requests atomically.
    pub fn wait(&self, required: NotifyFlags) -> MutexGuard<'_, GateState<S>> {
        let mut state = self.lock();
        if state.wait.should_block(required) {
            state.wait.stats.waits += 1;
            log::trace!("worker sleeping on {:?}", required);

            loop {
                state = self.cond.wait(state).unwrap();
                if !state.wait.should_block(required) {
                    break;
                }
            }

            log::trace!("worker woken up, outstanding {:?}", state.wait.outstanding);
        }

        state
    }

    pub fn stats(&self) -> GateStats {
        self.lock().wait.stats()
    }
}

impl<S: Send> Notifier for NotifyGate<S> {
    fn notify(&self, flags: NotifyFlags) {
        self.notify_with(flags, |_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn proceed_when_nothing_required() {
        let mut state = WaitState::default();
        assert!(!state.should_block(NotifyFlags::empty()));
    }

    #[test]
    fn block_until_required_signaled() {
        let mut state = WaitState::default();
        assert!(state.should_block(NotifyFlags::INPUT));

        // Unrelated notification does not wake the worker, and is not enough to proceed.
        assert!(!state.signal(NotifyFlags::OUTPUT));
        assert!(state.should_block(NotifyFlags::INPUT));

        assert!(state.signal(NotifyFlags::INPUT));
        assert!(!state.should_block(NotifyFlags::INPUT));

        // Both the required and the unrelated bit were consumed.
        assert_eq!(state.outstanding(), NotifyFlags::empty());
        assert!(state.should_block(NotifyFlags::INPUT | NotifyFlags::OUTPUT));
    }

    #[test]
    fn control_always_wakes() {
        let mut state = WaitState::default();
        assert!(state.should_block(NotifyFlags::OUTPUT));
        assert!(state.signal(NotifyFlags::CONTROL));
        assert!(!state.should_block(NotifyFlags::OUTPUT));

        // The control bit survives until the control handler takes it.
        assert_eq!(state.outstanding(), NotifyFlags::CONTROL);
        assert!(!state.should_block(NotifyFlags::OUTPUT));
        assert_eq!(
            state.take_reserved(NotifyFlags::CONTROL | NotifyFlags::RESET),
            NotifyFlags::CONTROL
        );
        assert!(state.should_block(NotifyFlags::OUTPUT));
    }

    #[test]
    fn take_reserved_ignores_plain_bits() {
        let mut state = WaitState::default();
        state.signal(NotifyFlags::INPUT | NotifyFlags::RESET);
        assert_eq!(state.take_reserved(NotifyFlags::all()), NotifyFlags::RESET);
        assert_eq!(state.outstanding(), NotifyFlags::INPUT);
    }

    #[test]
    fn gate_wakes_waiting_thread() {
        let gate = Arc::new(NotifyGate::<()>::default());

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let state = gate.wait(NotifyFlags::INPUT);
                state.wait.outstanding()
            })
        };

        // Give the waiter a chance to go to sleep first. The outcome is the same either way.
        thread::sleep(Duration::from_millis(20));
        gate.notify(NotifyFlags::OUTPUT);
        gate.notify(NotifyFlags::INPUT);

        assert_eq!(waiter.join().unwrap(), NotifyFlags::empty());

        let stats = gate.stats();
        assert_eq!(stats.notifications, 2);
        assert!(stats.wakeups <= 1);
    }
}
