//! Queued spinlocks.
//!
//! Under heavy contention a plain spinlock makes every waiter hammer the
//! same cache line and hands the lock to whichever compare-exchange wins.
//! A queued lock forms the waiters into a list: the lock word is the queue
//! tail, each waiter spins only on its own node's owner flag, and release
//! hands the lock to the oldest waiter. Acquisition order is therefore
//! first-come-first-served.
//!
//! Two surfaces are provided. The numbered locks are a fixed table of
//! global locks whose queue nodes live in each processor's control region.
//! The in-stack form carries the node inside a caller-allocated handle, for
//! locks that do not warrant a table slot.

use core::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::irql::{Irql, DISPATCH_LEVEL, PASSIVE_LEVEL};
use crate::pcr::Pcr;

/// Waiter is queued and spinning.
const LOCK_QUEUE_WAIT: usize = 1;
/// Node owns the lock.
const LOCK_QUEUE_OWNER: usize = 2;
const LOCK_QUEUE_FLAG_MASK: usize = LOCK_QUEUE_WAIT | LOCK_QUEUE_OWNER;

/// Per-acquisition queue node. Node addresses carry flags in the low bits,
/// hence the 8-byte alignment.
#[repr(C, align(8))]
pub struct LockQueue {
    /// Address of the lock word being waited on, plus WAIT/OWNER flags.
    lock: AtomicUsize,
    /// Next waiter in the queue, or 0.
    next: AtomicUsize,
}

impl LockQueue {
    pub const fn new() -> Self {
        Self {
            lock: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for LockQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued spinlock. The word is 0 when free, otherwise the address of the
/// tail queue node.
#[repr(C, align(8))]
pub struct QueuedSpinLock {
    tail: AtomicUsize,
}

impl QueuedSpinLock {
    pub const fn new() -> Self {
        Self {
            tail: AtomicUsize::new(0),
        }
    }

    /// Whether the lock is held or has waiters.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.tail.load(Ordering::Relaxed) != 0
    }
}

impl Default for QueuedSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifiers of the global numbered queued spinlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LockQueueNumber {
    Dispatcher = 0,
    ContextSwap,
    Pfn,
    SystemSpace,
    Vacb,
    Master,
    NonPagedPool,
    IoCancel,
}

/// Number of numbered queued spinlocks.
pub const LOCK_QUEUE_COUNT: usize = 8;

static NUMBERED_LOCKS: [QueuedSpinLock; LOCK_QUEUE_COUNT] =
    [const { QueuedSpinLock::new() }; LOCK_QUEUE_COUNT];

/// Enqueue `node` on `lock` and spin until ownership is granted.
///
/// # Safety
///
/// `node` must stay valid and unused by any other acquisition until the
/// matching [`release_queued`].
unsafe fn acquire_queued(lock: &QueuedSpinLock, node: &LockQueue) {
    node.lock
        .store(&lock.tail as *const AtomicUsize as usize, Ordering::Relaxed);
    node.next.store(0, Ordering::Relaxed);

    let node_ptr = node as *const LockQueue as usize;
    let old_tail = lock.tail.swap(node_ptr | LOCK_QUEUE_WAIT, Ordering::AcqRel);

    if old_tail == 0 {
        // Lock was free; the swap made this node the owner.
        node.lock.fetch_or(LOCK_QUEUE_OWNER, Ordering::Relaxed);
    } else {
        // Link behind the previous tail, then spin on our own node until
        // the releasing owner grants us the lock.
        let previous = &*((old_tail & !LOCK_QUEUE_FLAG_MASK) as *const LockQueue);
        previous.next.store(node_ptr, Ordering::Release);
        while node.lock.load(Ordering::Acquire) & LOCK_QUEUE_OWNER == 0 {
            core::hint::spin_loop();
        }
    }

    fence(Ordering::Acquire);
}

/// Release a lock held through `node`, granting it to the next waiter.
///
/// # Safety
///
/// The caller must own `lock` through `node`.
unsafe fn release_queued(lock: &QueuedSpinLock, node: &LockQueue) {
    fence(Ordering::Release);

    let node_ptr = node as *const LockQueue as usize;
    let mut next = node.next.load(Ordering::Acquire);

    if next == 0 {
        // No waiter visible. If the tail is still this node, the lock can
        // be dropped outright.
        if lock
            .tail
            .compare_exchange(
                node_ptr | LOCK_QUEUE_WAIT,
                0,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            node.lock.store(0, Ordering::Relaxed);
            return;
        }
        // A waiter swapped the tail but has not linked itself yet.
        loop {
            next = node.next.load(Ordering::Acquire);
            if next != 0 {
                break;
            }
            core::hint::spin_loop();
        }
    }

    let successor = &*(next as *const LockQueue);
    successor.lock.fetch_or(LOCK_QUEUE_OWNER, Ordering::Release);
    node.lock.store(0, Ordering::Relaxed);
    node.next.store(0, Ordering::Relaxed);
}

/// Acquire a numbered queued spinlock, raising IRQL to DISPATCH_LEVEL.
///
/// # Safety
///
/// `pcr` must be the calling processor's control region, and this lock
/// number must not already be held through it.
pub unsafe fn acquire_queued_spinlock(pcr: &Pcr, number: LockQueueNumber) -> Irql {
    let old_irql = pcr.raise_irql(DISPATCH_LEVEL);
    acquire_queued(&NUMBERED_LOCKS[number as usize], pcr.lock_queue(number));
    old_irql
}

/// Release a numbered queued spinlock and lower IRQL.
///
/// # Safety
///
/// The lock must be held through `pcr`; `old_irql` is the value the
/// matching acquire returned.
pub unsafe fn release_queued_spinlock(pcr: &Pcr, number: LockQueueNumber, old_irql: Irql) {
    release_queued(&NUMBERED_LOCKS[number as usize], pcr.lock_queue(number));
    pcr.lower_irql(old_irql);
}

/// Acquire a numbered queued spinlock without changing IRQL. The caller is
/// already at DISPATCH_LEVEL.
///
/// # Safety
///
/// As [`acquire_queued_spinlock`].
pub unsafe fn acquire_queued_spinlock_at_dpc_level(pcr: &Pcr, number: LockQueueNumber) {
    acquire_queued(&NUMBERED_LOCKS[number as usize], pcr.lock_queue(number));
}

/// Release a numbered queued spinlock, staying at DISPATCH_LEVEL.
///
/// # Safety
///
/// As [`release_queued_spinlock`].
pub unsafe fn release_queued_spinlock_from_dpc_level(pcr: &Pcr, number: LockQueueNumber) {
    release_queued(&NUMBERED_LOCKS[number as usize], pcr.lock_queue(number));
}

/// Single attempt at a numbered queued spinlock. On failure the IRQL is
/// restored before returning, leaving no elevation behind.
///
/// # Safety
///
/// As [`acquire_queued_spinlock`].
pub unsafe fn try_acquire_queued_spinlock(
    pcr: &Pcr,
    number: LockQueueNumber,
    old_irql: &mut Irql,
) -> bool {
    *old_irql = pcr.raise_irql(DISPATCH_LEVEL);

    let lock = &NUMBERED_LOCKS[number as usize];
    let node = pcr.lock_queue(number);
    node.lock
        .store(&lock.tail as *const AtomicUsize as usize, Ordering::Relaxed);
    node.next.store(0, Ordering::Relaxed);

    let node_ptr = node as *const LockQueue as usize;
    if lock
        .tail
        .compare_exchange(0, node_ptr | LOCK_QUEUE_WAIT, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        node.lock.fetch_or(LOCK_QUEUE_OWNER, Ordering::Relaxed);
        true
    } else {
        pcr.lower_irql(*old_irql);
        false
    }
}

/// In-stack handle for a queued spinlock acquisition: the queue node plus
/// the saved IRQL, allocated by the caller.
#[repr(C)]
pub struct LockQueueHandle {
    queue: LockQueue,
    old_irql: Irql,
}

impl LockQueueHandle {
    pub const fn new() -> Self {
        Self {
            queue: LockQueue::new(),
            old_irql: PASSIVE_LEVEL,
        }
    }
}

impl Default for LockQueueHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Acquire `lock` through an in-stack handle, raising IRQL to
/// DISPATCH_LEVEL.
///
/// # Safety
///
/// `pcr` must be the calling processor's control region and `handle` must
/// remain valid until released.
pub unsafe fn acquire_in_stack_queued_spinlock(
    pcr: &Pcr,
    lock: &QueuedSpinLock,
    handle: &mut LockQueueHandle,
) {
    handle.old_irql = pcr.raise_irql(DISPATCH_LEVEL);
    acquire_queued(lock, &handle.queue);
}

/// Release a lock acquired with [`acquire_in_stack_queued_spinlock`].
///
/// # Safety
///
/// The lock must be held through `handle`.
pub unsafe fn release_in_stack_queued_spinlock(
    pcr: &Pcr,
    lock: &QueuedSpinLock,
    handle: &mut LockQueueHandle,
) {
    release_queued(lock, &handle.queue);
    pcr.lower_irql(handle.old_irql);
}

/// In-stack acquire without an IRQL change; the caller is already at
/// DISPATCH_LEVEL.
///
/// # Safety
///
/// As [`acquire_in_stack_queued_spinlock`].
pub unsafe fn acquire_in_stack_queued_spinlock_at_dpc_level(
    lock: &QueuedSpinLock,
    handle: &mut LockQueueHandle,
) {
    handle.old_irql = DISPATCH_LEVEL;
    acquire_queued(lock, &handle.queue);
}

/// In-stack release staying at DISPATCH_LEVEL.
///
/// # Safety
///
/// The lock must be held through `handle`.
pub unsafe fn release_in_stack_queued_spinlock_from_dpc_level(
    lock: &QueuedSpinLock,
    handle: &mut LockQueueHandle,
) {
    release_queued(lock, &handle.queue);
}
