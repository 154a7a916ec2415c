// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded thread-safe queues used to hand frames and packets between the client and the
//! encoder worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

use crate::encoder::notify::Notifier;
use crate::encoder::notify::NotifyFlags;

/// How long a port operation may wait for its condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTimeout {
    NonBlocking,
    Blocking,
    Timed(Duration),
}

impl PortTimeout {
    fn deadline(&self) -> Option<Instant> {
        match self {
            PortTimeout::Timed(duration) => Some(Instant::now() + *duration),
            _ => None,
        }
    }
}

/// Gate bits to signal when a port operation may unblock the worker.
pub struct PortListener {
    pub notifier: Arc<dyn Notifier>,
    /// Signaled after an item was enqueued.
    pub on_enqueue: NotifyFlags,
    /// Signaled after an item was dequeued or a reserved slot was released.
    pub on_dequeue: NotifyFlags,
}

struct PortState<T> {
    queue: VecDeque<T>,
    /// Number of slots promised to producers through [`PortSlot`].
    reserved: usize,
    closed: bool,
}

impl<T> PortState<T> {
    fn has_room(&self, capacity: usize) -> bool {
        self.queue.len() + self.reserved < capacity
    }
}

struct PortInner<T> {
    name: &'static str,
    capacity: usize,
    state: Mutex<PortState<T>>,
    cond: Condvar,
    listener: Option<PortListener>,
}

impl<T> PortInner<T> {
    fn lock(&self) -> MutexGuard<'_, PortState<T>> {
        self.state.lock().unwrap()
    }

    /// Waits on the condvar until `ready` holds, the port is closed or `timeout` expires.
    fn wait_until<'a>(
        &'a self,
        mut state: MutexGuard<'a, PortState<T>>,
        timeout: PortTimeout,
        ready: impl Fn(&PortState<T>) -> bool,
    ) -> (MutexGuard<'a, PortState<T>>, bool) {
        let deadline = timeout.deadline();

        while !ready(&state) && !state.closed {
            match (timeout, deadline) {
                (PortTimeout::NonBlocking, _) => break,
                (PortTimeout::Timed(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
                }
                _ => state = self.cond.wait(state).unwrap(),
            }
        }

        let ready = ready(&state);
        (state, ready)
    }

    fn signal(&self, flags: impl Fn(&PortListener) -> NotifyFlags) {
        self.cond.notify_all();
        if let Some(listener) = &self.listener {
            let flags = flags(listener);
            if !flags.is_empty() {
                listener.notifier.notify(flags);
            }
        }
    }
}

/// Bounded multi-producer multi-consumer queue.
pub struct Port<T> {
    inner: Arc<PortInner<T>>,
}

impl<T> Clone for Port<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Port<T> {
    pub fn new(name: &'static str, capacity: usize, listener: Option<PortListener>) -> Self {
        Self {
            inner: Arc::new(PortInner {
                name,
                capacity: capacity.max(1),
                state: Mutex::new(PortState {
                    queue: VecDeque::new(),
                    reserved: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
                listener,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Waits until an item can be dequeued. Returns false if none became available in time.
    pub fn poll(&self, timeout: PortTimeout) -> bool {
        let state = self.inner.lock();
        self.inner
            .wait_until(state, timeout, |s| !s.queue.is_empty())
            .1
    }

    /// Waits until an item can be enqueued. Returns false if no room became available in time.
    pub fn poll_room(&self, timeout: PortTimeout) -> bool {
        let capacity = self.inner.capacity;
        let state = self.inner.lock();
        self.inner
            .wait_until(state, timeout, |s| s.has_room(capacity))
            .1
    }

    /// Takes the oldest item without waiting.
    pub fn dequeue(&self) -> Option<T> {
        self.dequeue_timeout(PortTimeout::NonBlocking)
    }

    /// Takes the oldest item, waiting up to `timeout` for one to arrive.
    pub fn dequeue_timeout(&self, timeout: PortTimeout) -> Option<T> {
        let state = self.inner.lock();
        let (mut state, ready) = self
            .inner
            .wait_until(state, timeout, |s| !s.queue.is_empty());
        if !ready {
            return None;
        }

        let item = state.queue.pop_front();
        drop(state);

        self.inner.signal(|l| l.on_dequeue);
        item
    }

    /// Takes every queued item.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.inner.lock().queue.drain(..).collect();
        if !items.is_empty() {
            self.inner.signal(|l| l.on_dequeue);
        }
        items
    }

    /// Appends `item`, waiting up to `timeout` for room. The item is handed back if the port
    /// stayed full or got closed.
    pub fn enqueue(&self, item: T, timeout: PortTimeout) -> Result<(), T> {
        let capacity = self.inner.capacity;
        let state = self.inner.lock();
        let (mut state, ready) = self
            .inner
            .wait_until(state, timeout, |s| s.has_room(capacity));
        if !ready || state.closed {
            return Err(item);
        }

        state.queue.push_back(item);
        drop(state);

        self.inner.signal(|l| l.on_enqueue);
        Ok(())
    }

    /// Appends `item` regardless of the capacity. Used for answers that must never block, eg.
    /// when draining the encoder on reset.
    pub fn force_enqueue(&self, item: T) {
        self.inner.lock().queue.push_back(item);
        self.inner.signal(|l| l.on_enqueue);
    }

    /// Reserves room for one item without waiting. The returned slot is released if dropped
    /// unfilled.
    pub fn try_reserve(&self) -> Option<PortSlot<T>> {
        let mut state = self.inner.lock();
        if state.closed || !state.has_room(self.inner.capacity) {
            return None;
        }

        state.reserved += 1;
        Some(PortSlot {
            port: Some(Arc::clone(&self.inner)),
        })
    }

    /// Wakes every blocked caller. Later enqueues fail while dequeues keep returning what is
    /// left in the port.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Room for one item, reserved on a [`Port`].
pub struct PortSlot<T> {
    port: Option<Arc<PortInner<T>>>,
}

impl<T> PortSlot<T> {
    /// Enqueues `item` into the reserved room.
    pub fn fill(mut self, item: T) {
        if let Some(port) = self.port.take() {
            {
                let mut state = port.lock();
                state.reserved -= 1;
                state.queue.push_back(item);
            }
            port.signal(|l| l.on_enqueue);
        }
    }
}

impl<T> std::fmt::Debug for PortSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.port.as_ref().map(|p| p.name).unwrap_or("released");
        f.debug_struct("PortSlot").field("port", &name).finish()
    }
}

impl<T> Drop for PortSlot<T> {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            port.lock().reserved -= 1;
            port.signal(|l| l.on_dequeue);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct CountingNotifier {
        input: AtomicU32,
        output: AtomicU32,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, flags: NotifyFlags) {
            if flags.contains(NotifyFlags::INPUT) {
                self.input.fetch_add(1, Ordering::SeqCst);
            }
            if flags.contains(NotifyFlags::OUTPUT) {
                self.output.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn fifo_and_capacity() {
        let port = Port::new("test", 2, None);
        assert!(port.enqueue(1, PortTimeout::NonBlocking).is_ok());
        assert!(port.enqueue(2, PortTimeout::NonBlocking).is_ok());
        assert_eq!(port.enqueue(3, PortTimeout::NonBlocking), Err(3));
        assert!(!port.poll_room(PortTimeout::Timed(Duration::from_millis(5))));

        assert_eq!(port.dequeue(), Some(1));
        assert_eq!(port.dequeue(), Some(2));
        assert_eq!(port.dequeue(), None);
        assert!(!port.poll(PortTimeout::Timed(Duration::from_millis(5))));
    }

    #[test]
    fn reserved_slots_count_against_capacity() {
        let port = Port::new("test", 2, None);
        let slot = port.try_reserve().unwrap();
        let other = port.try_reserve().unwrap();
        assert!(port.try_reserve().is_none());

        // Releasing a slot without filling it returns the room.
        drop(other);
        assert!(port.try_reserve().is_some());

        slot.fill(7);
        assert_eq!(port.len(), 1);
        assert_eq!(port.dequeue(), Some(7));
    }

    #[test]
    fn force_enqueue_ignores_capacity() {
        let port = Port::new("test", 1, None);
        port.force_enqueue(1);
        port.force_enqueue(2);
        assert_eq!(port.drain(), vec![1, 2]);
    }

    #[test]
    fn listener_is_signaled() {
        let notifier = Arc::new(CountingNotifier::default());
        let port = Port::new(
            "test",
            4,
            Some(PortListener {
                notifier: notifier.clone(),
                on_enqueue: NotifyFlags::INPUT,
                on_dequeue: NotifyFlags::OUTPUT,
            }),
        );

        port.enqueue(1u8, PortTimeout::NonBlocking).unwrap();
        port.try_reserve().unwrap().fill(2);
        assert_eq!(notifier.input.load(Ordering::SeqCst), 2);

        port.dequeue().unwrap();
        assert_eq!(notifier.output.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_dequeue_wakes_on_enqueue() {
        let port = Port::new("test", 1, None);

        let consumer = {
            let port = port.clone();
            thread::spawn(move || port.dequeue_timeout(PortTimeout::Blocking))
        };

        port.enqueue(42u32, PortTimeout::Blocking).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn close_unblocks_consumer() {
        let port: Port<u32> = Port::new("test", 1, None);

        let consumer = {
            let port = port.clone();
            thread::spawn(move || port.dequeue_timeout(PortTimeout::Blocking))
        };

        port.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(port.enqueue(1, PortTimeout::Blocking), Err(1));
    }
}
