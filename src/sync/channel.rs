//! Bounded multi-producer, single-consumer ring buffer.
//!
//! The buffer keeps two cursor pairs. `tail_reserved` / `head_reserved` hand out
//! slots to writers and the reader; `tail_committed` / `head_committed` only
//! advance once the write (or read) of a slot is finished. A writer that reserved
//! slot `n` waits until `tail_committed == n` before writing, so items become
//! visible to the receiver strictly in commit order.
//!
//! The two highest bits of the committed cursors carry state:
//!
//! - `DISCONNECTED` is set on both committed cursors when either side goes away.
//!   Waiters already block on those atomics, so one load tells them both how far
//!   the other side got and whether the channel is still alive.
//! - `TURN_AROUND` is what a cursor grows into after `VALUE_MASK` increments. The
//!   receiver clears it from all four cursors once it consumes a slot carrying it.
//!   Capacity is a power of two no larger than `MAX_CAPACITY`, so slot indices are
//!   unaffected by either bit.
//!
//! Blocking waits use a mutex/condvar pair per committed cursor. The waiter
//! re-checks the atomic under the mutex and the notifier takes the mutex before
//! signalling, so a change can never slip between the check and the sleep.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

const DISCONNECTED: usize = 1 << (usize::BITS - 1);
const TURN_AROUND: usize = DISCONNECTED >> 1;
const VALUE_MASK: usize = !(DISCONNECTED | TURN_AROUND);

/// Largest capacity accepted by [`channel`]. Requests above it are rejected
/// rather than rounded.
pub const MAX_CAPACITY: usize = 1 << 28;

/// Bytes of buffer used when the caller asks for capacity 0.
const DEFAULT_BUFFER_BYTES: usize = 0xffff;

/// Error returned by [`channel`] when the requested capacity cannot be served.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel capacity {requested} exceeds the maximum of {max}", max = MAX_CAPACITY)]
    CapacityTooLarge { requested: usize },
}

/// Returned by [`Sender::send`] when the receiver is gone. Carries the unsent item.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending on a disconnected channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// Distance from `from` to `to`, ignoring the turn-around marker. Any
/// disconnected cursor on the `from` side makes the result huge.
fn distance(to: usize, from: usize) -> usize {
    to.wrapping_sub(from) & !TURN_AROUND
}

/// A committed cursor that threads can block on until it changes.
struct WaitCursor {
    value: AtomicUsize,
    lock: Mutex<()>,
    changed: Condvar,
}

impl WaitCursor {
    fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    fn load(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    /// Blocks until the cursor no longer holds `current` (or a spurious wake).
    fn wait(&self, current: usize) {
        let mut guard = self.lock.lock();
        if self.value.load(Ordering::SeqCst) == current {
            self.changed.wait(&mut guard);
        }
    }

    fn notify_all(&self) {
        drop(self.lock.lock());
        self.changed.notify_all();
    }
}

struct Shared<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    head_reserved: AtomicUsize,
    head_committed: WaitCursor,
    tail_reserved: AtomicUsize,
    tail_committed: WaitCursor,
    senders: AtomicUsize,
    receivers: AtomicUsize,
}

// SAFETY: a slot is touched by exactly one thread at a time. A writer owns the
// slot it reserved until it bumps `tail_committed`; the single reader only reads
// slots below `tail_committed` and releases them by bumping `head_committed`.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            slots,
            capacity,
            head_reserved: AtomicUsize::new(0),
            head_committed: WaitCursor::new(),
            tail_reserved: AtomicUsize::new(0),
            tail_committed: WaitCursor::new(),
            senders: AtomicUsize::new(0),
            receivers: AtomicUsize::new(0),
        }
    }

    fn slot(&self, cursor: usize) -> *mut MaybeUninit<T> {
        self.slots[cursor & (self.capacity - 1)].get()
    }

    fn disconnect_and_notify(&self) {
        self.head_committed
            .value
            .fetch_or(DISCONNECTED, Ordering::SeqCst);
        self.tail_committed
            .value
            .fetch_or(DISCONNECTED, Ordering::SeqCst);
        self.head_committed.notify_all();
        self.tail_committed.notify_all();
    }

    /// Waits until every writer that reserved a slot before `slot` has committed.
    /// Returns false if the channel disconnected meanwhile.
    fn wait_for_earlier_writers(&self, slot: usize) -> bool {
        let mut tail = self.tail_committed.load();
        while distance(slot, tail) > 0 {
            if tail & DISCONNECTED != 0 {
                return false;
            }
            self.tail_committed.wait(tail);
            tail = self.tail_committed.load();
        }
        true
    }

    /// # Safety
    /// The caller reserved `slot`, the slot is free and all earlier reservations
    /// have committed.
    unsafe fn commit_write(&self, slot: usize, value: T) {
        unsafe { (*self.slot(slot)).write(value) };
        self.tail_committed.value.fetch_add(1, Ordering::SeqCst);
        self.tail_committed.notify_all();
    }

    /// # Safety
    /// The caller is the receiver, reserved `slot`, and `slot` is committed.
    unsafe fn commit_read(&self, slot: usize) -> T {
        let value = unsafe { (*self.slot(slot)).assume_init_read() };
        self.head_committed.value.fetch_add(1, Ordering::SeqCst);
        self.head_committed.notify_all();

        if slot & TURN_AROUND != 0 {
            // Transparent to waiters: distances are computed without this bit.
            self.head_reserved.fetch_and(!TURN_AROUND, Ordering::SeqCst);
            self.head_committed
                .value
                .fetch_and(!TURN_AROUND, Ordering::SeqCst);
            self.tail_reserved.fetch_and(!TURN_AROUND, Ordering::SeqCst);
            self.tail_committed
                .value
                .fetch_and(!TURN_AROUND, Ordering::SeqCst);
        }
        value
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let head = *self.head_committed.value.get_mut() & !DISCONNECTED;
        let tail = *self.tail_committed.value.get_mut() & !DISCONNECTED;
        let remaining = tail.wrapping_sub(head) & VALUE_MASK;
        for i in 0..remaining {
            // SAFETY: slots in [head, tail) hold committed, unread items.
            unsafe { (*self.slot(head.wrapping_add(i))).assume_init_drop() };
        }
    }
}

/// Creates a bounded channel.
///
/// A `capacity` of 0 picks a default sized to roughly 64 KiB of items. The
/// actual capacity is rounded up to the next power of two.
pub fn channel<T>(capacity: usize) -> Result<(Sender<T>, Receiver<T>), ChannelError> {
    let requested = if capacity == 0 {
        (DEFAULT_BUFFER_BYTES / std::mem::size_of::<T>().max(1)).max(1)
    } else {
        capacity
    };
    if requested > MAX_CAPACITY {
        return Err(ChannelError::CapacityTooLarge { requested });
    }
    let capacity = requested.next_power_of_two();

    let shared = Arc::new(Shared::new(capacity));
    shared.senders.store(1, Ordering::SeqCst);
    shared.receivers.store(1, Ordering::SeqCst);
    Ok((
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    ))
}

/// Sending half. Cloning adds a producer.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Sends `value`, blocking while the buffer is full or while an earlier
    /// reservation has not been committed yet.
    ///
    /// Fails, handing the value back, if the receiver is gone.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let shared = &*self.shared;
        let slot = shared.tail_reserved.fetch_add(1, Ordering::SeqCst);

        let mut head = shared.head_committed.load();
        while distance(slot, head) >= shared.capacity {
            if head & DISCONNECTED != 0 {
                shared.tail_reserved.fetch_sub(1, Ordering::SeqCst);
                return Err(SendError(value));
            }
            shared.head_committed.wait(head);
            head = shared.head_committed.load();
        }

        if !shared.wait_for_earlier_writers(slot) {
            shared.tail_reserved.fetch_sub(1, Ordering::SeqCst);
            return Err(SendError(value));
        }
        // SAFETY: slot reserved above, free per the head check, and in turn.
        unsafe { shared.commit_write(slot, value) };
        Ok(())
    }

    /// Sends `value` only if a slot is free right now; otherwise returns it.
    ///
    /// Once a slot is acquired this may still wait for earlier reservations to
    /// commit.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        let shared = &*self.shared;
        let mut slot = shared.tail_reserved.load(Ordering::SeqCst);
        loop {
            if distance(slot, shared.head_committed.load()) >= shared.capacity {
                return Err(value);
            }
            match shared.tail_reserved.compare_exchange_weak(
                slot,
                slot.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => slot = current,
            }
        }

        if !shared.wait_for_earlier_writers(slot) {
            shared.tail_reserved.fetch_sub(1, Ordering::SeqCst);
            return Err(value);
        }
        // SAFETY: slot acquired by the CAS above and free per the head check.
        unsafe { shared.commit_write(slot, value) };
        Ok(())
    }

    /// True once the receiver has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.shared.receivers.load(Ordering::SeqCst) == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.disconnect_and_notify();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

/// Receiving half. There is exactly one per channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Blocks until an item is committed. Returns `None` once every sender is
    /// gone and the buffer has been drained.
    pub fn recv(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let slot = shared.head_reserved.fetch_add(1, Ordering::SeqCst);

        let mut tail = shared.tail_committed.load();
        while tail & !DISCONNECTED <= slot {
            if tail & DISCONNECTED != 0 {
                shared.head_reserved.fetch_sub(1, Ordering::SeqCst);
                return None;
            }
            shared.tail_committed.wait(tail);
            tail = shared.tail_committed.load();
        }
        // SAFETY: we are the only receiver and `slot` is below the committed tail.
        Some(unsafe { shared.commit_read(slot) })
    }

    /// Takes the next committed item if there is one. Does not tell "empty"
    /// apart from "disconnected"; see [`Receiver::is_disconnected`].
    pub fn try_recv(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let mut slot = shared.head_reserved.load(Ordering::SeqCst);
        loop {
            if shared.tail_committed.load() & !DISCONNECTED <= slot {
                return None;
            }
            match shared.head_reserved.compare_exchange_weak(
                slot,
                slot.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => slot = current,
            }
        }
        // SAFETY: as in `recv`.
        Some(unsafe { shared.commit_read(slot) })
    }

    /// True once every sender has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.shared.senders.load(Ordering::SeqCst) == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Iterator for Receiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.shared.receivers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.disconnect_and_notify();
        }
        // Destroy whatever was committed but never read. Writes still in flight
        // are cleaned up when the last sender releases the buffer.
        while self.try_recv().is_some() {}
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}
