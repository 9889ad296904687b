//! Process-global memory admission controller (spec §4.G).
//!
//! `register_allocation` is the only blocking operation in the core apart from I/O (spec §5).
//! A `tokio::sync::Semaphore` can't grant "some `actual` in `[min, max]`" directly, so this is
//! a small intrusive FIFO waiter queue guarded by a `Mutex`, with one `tokio::sync::Notify` per
//! waiter — the same `tokio::sync` toolkit the teacher reaches for (`mpsc`, `CancellationToken`)
//! rather than raw OS threads or condvars.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nexus_core::{NexusError, NexusResult};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Waiter {
    id: u64,
    min: usize,
    max: usize,
    notify: Arc<Notify>,
    granted: Mutex<Option<usize>>,
}

struct TrackerState {
    ceiling: u64,
    outstanding: u64,
    queue: VecDeque<Arc<Waiter>>,
}

/// Process-wide admission controller over a fixed byte budget (spec §4.G, §9 "only two
/// legitimate process-wide singletons" — this is one of them; the catalog tree is the other).
pub struct MemoryTracker {
    state: Mutex<TrackerState>,
    next_waiter_id: AtomicU64,
}

/// A scoped reservation against the tracker's ceiling. Releases its `actual` byte count back
/// to the tracker when dropped, from any exit path (normal return, early `?`, or cancellation).
pub struct TrackerGrant {
    tracker: Arc<MemoryTracker>,
    actual: usize,
}

impl TrackerGrant {
    pub fn actual(&self) -> usize {
        self.actual
    }
}

impl Drop for TrackerGrant {
    fn drop(&mut self) {
        self.tracker.release(self.actual);
    }
}

impl MemoryTracker {
    pub fn new(ceiling_bytes: u64) -> Arc<Self> {
        Arc::new(MemoryTracker {
            state: Mutex::new(TrackerState {
                ceiling: ceiling_bytes,
                outstanding: 0,
                queue: VecDeque::new(),
            }),
            next_waiter_id: AtomicU64::new(0),
        })
    }

    pub fn ceiling(&self) -> u64 {
        self.state.lock().unwrap().ceiling
    }

    pub fn outstanding(&self) -> u64 {
        self.state.lock().unwrap().outstanding
    }

    /// Block until `actual` bytes in `[min, max]` can be granted without exceeding the
    /// ceiling, honoring FIFO order among waiters. Cancelling `token` removes the waiter from
    /// the queue without side effects and returns `NexusError::Cancelled`. Takes `self` by
    /// value (an owned `Arc`) so the returned grant can carry its own reference back to the
    /// tracker for release on drop; callers holding a shared `Arc<MemoryTracker>` pass a clone.
    pub async fn register_allocation(
        self: Arc<Self>,
        min: usize,
        max: usize,
        token: &CancellationToken,
    ) -> NexusResult<TrackerGrant> {
        if min > max {
            return Err(NexusError::Internal(format!(
                "memory tracker allocation request has min {min} > max {max}"
            )));
        }

        let waiter = Arc::new(Waiter {
            id: self.next_waiter_id.fetch_add(1, Ordering::SeqCst),
            min,
            max,
            notify: Arc::new(Notify::new()),
            granted: Mutex::new(None),
        });

        {
            let mut state = self.state.lock().unwrap();
            state.queue.push_back(waiter.clone());
            try_serve_queue(&mut state);
        }

        loop {
            if let Some(actual) = *waiter.granted.lock().unwrap() {
                debug!(actual, min, max, "memory tracker granted allocation");
                return Ok(TrackerGrant {
                    tracker: self.clone(),
                    actual,
                });
            }
            tokio::select! {
                _ = waiter.notify.notified() => {}
                _ = token.cancelled() => {
                    let mut state = self.state.lock().unwrap();
                    // If the waiter was already granted concurrently with cancellation, honor
                    // the grant rather than leaking it: drain and release immediately.
                    if let Some(actual) = waiter.granted.lock().unwrap().take() {
                        state.outstanding = state.outstanding.saturating_sub(actual as u64);
                        try_serve_queue(&mut state);
                        return Err(NexusError::Cancelled);
                    }
                    state.queue.retain(|w| w.id != waiter.id);
                    return Err(NexusError::Cancelled);
                }
            }
        }
    }

    fn release(&self, actual: usize) {
        let mut state = self.state.lock().unwrap();
        state.outstanding = state.outstanding.saturating_sub(actual as u64);
        try_serve_queue(&mut state);
    }
}

/// Serve waiters from the front of the queue while the ceiling allows it. A waiter is granted
/// `min(max, remaining_budget)` provided that is at least `min`; otherwise it keeps waiting and
/// blocks anyone behind it (true FIFO, per spec §4.G "Grants are FIFO with bounded waiting").
fn try_serve_queue(state: &mut TrackerState) {
    while let Some(front) = state.queue.front() {
        let remaining = state.ceiling.saturating_sub(state.outstanding);
        if remaining < front.min as u64 {
            break;
        }
        let actual = front.max.min(remaining as usize);
        *front.granted.lock().unwrap() = Some(actual);
        state.outstanding += actual as u64;
        front.notify.notify_one();
        state.queue.pop_front();
    }
    if let Some(front) = state.queue.front() {
        if front.min as u64 > state.ceiling {
            warn!(
                min = front.min,
                ceiling = state.ceiling,
                "memory tracker waiter requests more than the configured ceiling; it will never be served"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_within_ceiling() {
        let tracker = MemoryTracker::new(1000);
        let token = CancellationToken::new();
        let grant = tracker.clone().register_allocation(100, 200, &token).await.unwrap();
        assert!(grant.actual() <= 200 && grant.actual() >= 100);
        assert_eq!(tracker.outstanding(), grant.actual() as u64);
    }

    #[tokio::test]
    async fn release_frees_budget_for_next_waiter() {
        let tracker = MemoryTracker::new(100);
        let token = CancellationToken::new();
        let grant = tracker.clone().register_allocation(100, 100, &token).await.unwrap();
        assert_eq!(tracker.outstanding(), 100);
        drop(grant);
        assert_eq!(tracker.outstanding(), 0);
        let grant2 = tracker.clone().register_allocation(50, 100, &token).await.unwrap();
        assert_eq!(grant2.actual(), 100);
    }

    #[tokio::test]
    async fn fifo_order_among_waiters() {
        let tracker = MemoryTracker::new(100);
        let token = CancellationToken::new();
        let first = tracker.clone().register_allocation(100, 100, &token).await.unwrap();

        let tracker2 = tracker.clone();
        let token2 = token.clone();
        let second_waiter = tokio::spawn(async move {
            tracker2.register_allocation(50, 50, &token2).await
        });

        // Give the second waiter a chance to enqueue before the first grant releases.
        tokio::task::yield_now().await;
        drop(first);

        let second = second_waiter.await.unwrap().unwrap();
        assert_eq!(second.actual(), 50);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_side_effects() {
        let tracker = MemoryTracker::new(100);
        let token = CancellationToken::new();
        let _holder = tracker.clone().register_allocation(100, 100, &token).await.unwrap();

        let tracker2 = tracker.clone();
        let waiter_token = CancellationToken::new();
        let waiter_token2 = waiter_token.clone();
        let waiting = tokio::spawn(async move {
            tracker2.register_allocation(50, 50, &waiter_token2).await
        });
        tokio::task::yield_now().await;
        waiter_token.cancel();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(NexusError::Cancelled)));
        assert_eq!(tracker.outstanding(), 100);
    }

    #[tokio::test]
    async fn sum_of_outstanding_never_exceeds_ceiling() {
        let tracker = MemoryTracker::new(300);
        let token = CancellationToken::new();
        let a = tracker.clone().register_allocation(100, 100, &token).await.unwrap();
        let b = tracker.clone().register_allocation(100, 100, &token).await.unwrap();
        let c = tracker.clone().register_allocation(100, 100, &token).await.unwrap();
        assert_eq!(tracker.outstanding(), 300);
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(tracker.outstanding(), 0);
    }
}
