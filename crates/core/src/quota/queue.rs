//! [`QuotaQueue`]: arena-backed priority queue admission control.
//!
//! Waiters live in a `Vec` arena addressed by [`QuotaHandle`] so the
//! [`std::collections::BinaryHeap`] never needs to remove an arbitrary
//! element — something it cannot do in better than O(n). A cancelled or
//! already-granted waiter is instead marked dead in its arena slot and
//! discarded lazily the next time [`Inner::assign`] pops it off the heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use buildsched_error::{Result, SchedError};

use crate::item::{RequestClass, SchedItem};

/// Opaque handle to a waiter in a [`QuotaQueue`]'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuotaHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Waiting,
    Granted,
    /// Cancelled before a grant, or returned after one; either way the
    /// slot no longer participates in admission and its cost (if any) has
    /// already been reconciled against `used`.
    Dead,
}

#[derive(Debug)]
struct Slot {
    cost: u64,
    state: SlotState,
}

/// Sortable snapshot of a waiter's priority, stored directly in the heap
/// entry so comparisons never need to re-borrow the arena.
#[derive(Debug, Clone, Copy)]
struct WaitKey {
    class: RequestClass,
    release_branch: bool,
    sort_time: DateTime<Utc>,
    seq: u64,
}

impl WaitKey {
    fn from_item(item: &SchedItem, seq: u64) -> Self {
        Self {
            class: item.class,
            release_branch: item.class == RequestClass::Automated && item.is_release_branch(),
            sort_time: item.sort_time(),
            seq,
        }
    }

    /// Mirrors [`SchedItem::precedes`], with `seq` breaking ties in the
    /// same direction as the class's FIFO/LIFO discipline so insertion
    /// order is a stable tiebreaker.
    fn precedes(&self, other: &Self) -> bool {
        if self.class != other.class {
            return self.class < other.class;
        }
        if self.class == RequestClass::Automated && self.release_branch != other.release_branch {
            return self.release_branch;
        }
        if self.class == RequestClass::Batch {
            return (self.sort_time, self.seq) > (other.sort_time, other.seq);
        }
        (self.sort_time, self.seq) < (other.sort_time, other.seq)
    }
}

#[derive(Debug)]
struct HeapEntry {
    handle: QuotaHandle,
    key: WaitKey,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// A max-heap orders "greatest" first, so the most important waiter
    /// (the one `precedes` says should go first) must compare `Greater`.
    fn cmp(&self, other: &Self) -> Ordering {
        if self.key.precedes(&other.key) {
            Ordering::Greater
        } else if other.key.precedes(&self.key) {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }
}

/// One waiter's priority-relevant fields, for the ordered waiter list in a
/// [`QuotaStats`] snapshot (§4.1 `Stats`: "ordered list of waiters").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterSnapshot {
    /// Priority class.
    pub class: RequestClass,
    /// `true` if this is an `automated`-class item on a release branch.
    pub release_branch: bool,
    /// FIFO/LIFO tiebreaker timestamp ([`SchedItem::sort_time`]).
    pub sort_time: DateTime<Utc>,
    /// Units of capacity this waiter is asking for.
    pub cost: u64,
}

/// Point-in-time usage snapshot (§4.1, status reporting).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStats {
    /// Configured capacity.
    pub limit: u64,
    /// Capacity held by grants this queue issued.
    pub used: u64,
    /// Capacity consumed outside this queue's bookkeeping (e.g. VMs created
    /// by another controller instance sharing the same project quota).
    pub untracked_used: u64,
    /// Waiters still blocked on admission.
    pub waiting: usize,
    /// Waiting waiters in grant order (the order [`Inner::assign`] would pop
    /// them in), most-important first (§4.1 `Stats`, §9 "implementers must
    /// take the queue's mutex, copy values, sort outside the lock").
    pub waiters: Vec<WaiterSnapshot>,
}

impl QuotaStats {
    /// Capacity neither granted nor accounted for externally.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.limit
            .saturating_sub(self.used)
            .saturating_sub(self.untracked_used)
    }
}

struct Inner {
    limit: u64,
    used: u64,
    untracked_used: u64,
    heap: BinaryHeap<HeapEntry>,
    arena: Vec<Slot>,
    next_seq: u64,
}

impl Inner {
    /// Grant waiters off the top of the heap while capacity allows,
    /// skipping (and dropping) any slot that is no longer `Waiting`. Must
    /// run after every mutation that can change who's eligible: enqueue,
    /// return, or a limit/used update.
    fn assign(&mut self) {
        while let Some(top) = self.heap.peek() {
            let slot = &self.arena[top.handle.0];
            if slot.state != SlotState::Waiting {
                self.heap.pop();
                continue;
            }
            let available = self
                .limit
                .saturating_sub(self.used)
                .saturating_sub(self.untracked_used);
            if slot.cost > available {
                break;
            }
            let entry = self.heap.pop().expect("peeked");
            let slot = &mut self.arena[entry.handle.0];
            slot.state = SlotState::Granted;
            self.used += slot.cost;
        }
    }

    fn waiting_count(&self) -> usize {
        self.arena.iter().filter(|s| s.state == SlotState::Waiting).count()
    }
}

/// Admission control for one countable resource dimension (§3, §4.1).
///
/// All mutation happens under a single `parking_lot::Mutex` held only for
/// the duration of the in-memory heap/arena update; nothing under the lock
/// ever awaits, so it cannot deadlock against the async waiters blocked in
/// [`QuotaQueue::wait`].
pub struct QuotaQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl QuotaQueue {
    /// Construct a queue with the given initial limit and nothing used.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                limit,
                used: 0,
                untracked_used: 0,
                heap: BinaryHeap::new(),
                arena: Vec::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Register a waiter for `cost` units of capacity. Returns a handle to
    /// pass to [`QuotaQueue::wait`] and [`QuotaQueue::release`].
    ///
    /// A request whose `cost` exceeds `limit` entirely (even with nothing
    /// else outstanding) still enqueues — § 4.1 leaves starvation-by-
    /// misconfiguration to the operator raising the limit, not to this
    /// queue refusing the request.
    pub fn enqueue(&self, item: &SchedItem, cost: u64) -> QuotaHandle {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let handle = QuotaHandle(inner.arena.len());
        inner.arena.push(Slot {
            cost,
            state: SlotState::Waiting,
        });
        let key = WaitKey::from_item(item, seq);
        inner.heap.push(HeapEntry { handle, key });
        inner.assign();
        drop(inner);
        self.notify.notify_waiters();
        handle
    }

    /// Block until `handle` is granted, or `cancel` fires first.
    ///
    /// Uses the "create the `notified()` future, then check state" order
    /// so a grant or cancellation that lands between the check and the
    /// `.await` is never missed: `Notify` buffers at most one permit per
    /// waiter but remembers that a `notify_waiters()` happened after the
    /// future was created, so no wakeup is lost even though nothing is
    /// buffered indefinitely.
    pub async fn wait(&self, handle: QuotaHandle, cancel: &CancellationToken) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            if let Some(state) = self.inner.lock().arena.get(handle.0).map(|s| s.state) {
                match state {
                    SlotState::Granted => return Ok(()),
                    SlotState::Dead => return Err(SchedError::cancelled()),
                    SlotState::Waiting => {}
                }
            }

            tokio::select! {
                () = notified => {}
                () = cancel.cancelled() => {
                    self.cancel(handle);
                    return Err(SchedError::cancelled());
                }
            }
        }
    }

    /// Give back capacity held by a granted waiter, or drop a waiter that
    /// never got one. Idempotent: calling it twice on the same handle only
    /// reclaims capacity once.
    pub fn release(&self, handle: QuotaHandle) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.arena.get_mut(handle.0) {
            if slot.state == SlotState::Granted {
                inner.used = inner.used.saturating_sub(slot.cost);
            }
            slot.state = SlotState::Dead;
        }
        inner.assign();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Cancel a waiter that has not yet been granted. A no-op if it
    /// already was — the caller is expected to `release` in that case
    /// instead, and this queue does not return capacity twice either way.
    fn cancel(&self, handle: QuotaHandle) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.arena.get_mut(handle.0) {
            if slot.state == SlotState::Waiting {
                slot.state = SlotState::Dead;
            }
        }
        inner.assign();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Raise or lower the configured limit. Lowering it below `used` is
    /// legal; it just blocks new admissions until enough capacity is
    /// returned.
    pub fn update_limit(&self, limit: u64) {
        let mut inner = self.inner.lock();
        inner.limit = limit;
        inner.assign();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Force `used` to a caller-supplied value, overriding the sum this
    /// queue would otherwise maintain from its own grants (§4.1
    /// `UpdateUsed`). The reverse pool uses this to reconcile `used`
    /// against the live in-use worker count after every registration,
    /// grab, and release, rather than relying on grant/release bookkeeping.
    pub fn update_used(&self, used: u64) {
        let mut inner = self.inner.lock();
        inner.used = used;
        inner.assign();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Record capacity consumed outside this queue's own grants (§4.5:
    /// stray VMs discovered by the reaper still count against quota until
    /// cleaned up).
    pub fn update_untracked_used(&self, untracked_used: u64) {
        let mut inner = self.inner.lock();
        inner.untracked_used = untracked_used;
        inner.assign();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Current usage snapshot, including waiters in grant order.
    ///
    /// Takes the mutex only long enough to copy scalars and the heap's
    /// `(key, cost)` pairs out; the sort that turns those pairs into grant
    /// order happens after the lock is dropped.
    pub fn stats(&self) -> QuotaStats {
        let inner = self.inner.lock();
        let limit = inner.limit;
        let used = inner.used;
        let untracked_used = inner.untracked_used;
        let mut waiters: Vec<(WaitKey, u64)> = inner
            .heap
            .iter()
            .filter_map(|entry| {
                let slot = &inner.arena[entry.handle.0];
                (slot.state == SlotState::Waiting).then_some((entry.key, slot.cost))
            })
            .collect();
        drop(inner);

        waiters.sort_by(|(a, _), (b, _)| {
            if a.precedes(b) {
                Ordering::Less
            } else if b.precedes(a) {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        });

        QuotaStats {
            limit,
            used,
            untracked_used,
            waiting: waiters.len(),
            waiters: waiters
                .into_iter()
                .map(|(key, cost)| WaiterSnapshot {
                    class: key.class,
                    release_branch: key.release_branch,
                    sort_time: key.sort_time,
                    cost,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::SchedItem;
    use std::time::Duration;

    fn item(class: RequestClass, branch: &str) -> SchedItem {
        SchedItem::new("linux-amd64", class, branch)
    }

    #[tokio::test]
    async fn single_waiter_under_limit_is_granted_immediately() {
        let q = QuotaQueue::new(4);
        let handle = q.enqueue(&item(RequestClass::Batch, "main"), 2);
        let cancel = CancellationToken::new();
        q.wait(handle, &cancel).await.unwrap();
        assert_eq!(q.stats().used, 2);
    }

    #[tokio::test]
    async fn interactive_waiter_is_admitted_before_earlier_batch_waiter() {
        let q = QuotaQueue::new(4);
        let batch = q.enqueue(&item(RequestClass::Batch, "main"), 4);
        let cancel = CancellationToken::new();
        q.wait(batch, &cancel).await.unwrap();
        assert_eq!(q.stats().used, 4);

        // Queue is full; a gomote request and a second batch request both
        // wait, but gomote (Interactive) must be granted first once
        // capacity frees up.
        let gomote = q.enqueue(&item(RequestClass::Interactive, "main"), 2);
        let batch2 = q.enqueue(&item(RequestClass::Batch, "main"), 2);

        q.release(batch);
        assert_eq!(q.stats().used, 2);

        q.wait(gomote, &cancel).await.unwrap();
        assert_eq!(q.stats().used, 4);
        assert_eq!(q.stats().waiting, 1);

        q.release(gomote);
        q.wait(batch2, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn batch_waiters_are_admitted_lifo() {
        let q = QuotaQueue::new(2);
        let first = q.enqueue(&item(RequestClass::Batch, "main"), 2);
        let cancel = CancellationToken::new();
        q.wait(first, &cancel).await.unwrap();

        let second = q.enqueue(&item(RequestClass::Batch, "main"), 2);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let third = q.enqueue(&item(RequestClass::Batch, "main"), 2);

        q.release(first);
        // third arrived after second; LIFO means third is admitted first.
        q.wait(third, &cancel).await.unwrap();
        assert_eq!(q.stats().waiting, 1);
        q.release(third);
        q.wait(second, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_releases_nothing_because_nothing_was_granted() {
        let q = QuotaQueue::new(1);
        let holder = q.enqueue(&item(RequestClass::Batch, "main"), 1);
        let cancel_token = CancellationToken::new();
        q.wait(holder, &cancel_token).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = q.enqueue(&item(RequestClass::Batch, "main"), 1);
        waiter_cancel.cancel();
        let err = q.wait(waiter, &waiter_cancel).await.unwrap_err();
        assert!(err.is_cancelled());

        // used is unaffected by the cancellation: the waiter never held capacity.
        assert_eq!(q.stats().used, 1);
        q.release(holder);
        assert_eq!(q.stats().used, 0);
    }

    #[tokio::test]
    async fn release_of_unfulfilled_waiter_is_a_safe_noop() {
        let q = QuotaQueue::new(1);
        let a = q.enqueue(&item(RequestClass::Batch, "main"), 1);
        let cancel = CancellationToken::new();
        q.wait(a, &cancel).await.unwrap();

        let b = q.enqueue(&item(RequestClass::Batch, "main"), 1);
        q.release(b); // never granted
        assert_eq!(q.stats().used, 1);
        assert_eq!(q.stats().waiting, 0);
    }

    #[tokio::test]
    async fn update_limit_admits_waiters_once_capacity_grows() {
        let q = QuotaQueue::new(0);
        let handle = q.enqueue(&item(RequestClass::Batch, "main"), 1);
        let cancel = CancellationToken::new();
        q.update_limit(1);
        q.wait(handle, &cancel).await.unwrap();
    }

    #[test]
    fn stats_reports_waiters_in_grant_order() {
        let q = QuotaQueue::new(0);
        let batch = q.enqueue(&item(RequestClass::Batch, "main"), 1);
        let _ = batch;
        q.enqueue(&item(RequestClass::Urgent, "main"), 1);
        q.enqueue(&item(RequestClass::Interactive, "main"), 1);

        let stats = q.stats();
        pretty_assertions::assert_eq!(stats.waiting, 3);
        let classes: Vec<RequestClass> = stats.waiters.iter().map(|w| w.class).collect();
        pretty_assertions::assert_eq!(
            classes,
            vec![RequestClass::Urgent, RequestClass::Interactive, RequestClass::Batch],
        );
    }

    #[rstest::rstest]
    #[case(RequestClass::Urgent, RequestClass::Batch, true)]
    #[case(RequestClass::Interactive, RequestClass::Urgent, false)]
    #[case(RequestClass::Automated, RequestClass::Automated, false)]
    fn wait_key_precedes_orders_by_class(
        #[case] a: RequestClass,
        #[case] b: RequestClass,
        #[case] expected: bool,
    ) {
        let key_a = WaitKey {
            class: a,
            release_branch: false,
            sort_time: DateTime::<Utc>::UNIX_EPOCH,
            seq: 0,
        };
        let key_b = WaitKey {
            class: b,
            release_branch: false,
            sort_time: DateTime::<Utc>::UNIX_EPOCH,
            seq: if a == b { 0 } else { 1 },
        };
        assert_eq!(key_a.precedes(&key_b), expected);
    }
}
