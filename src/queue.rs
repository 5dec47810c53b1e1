//! A bounded, single-producer-multiple-consumer (in practice: single
//! reader) delivery queue with an explicit drop-oldest overflow policy.
//!
//! `tokio::sync::mpsc` can't implement drop-oldest from the producer side
//! (a `Sender` can't see into or pop from the channel), so the per-endpoint
//! queue is a `Mutex<VecDeque<_>>` plus a `Notify`, giving the Relay's
//! receive task direct control over eviction (spec §9: queue overflow
//! policy resolved as drop-oldest in SPEC_FULL.md §4.2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::relay::Delivery;

const OPEN: u8 = 0;
const CLOSED_STOPPED: u8 = 1;
const CLOSED_DRAINED: u8 = 2;

/// Why a queue stopped accepting/yielding deliveries: an explicit
/// `Relay::stop`/`EtherConn::close` (`Stopped`), or the Relay's receive
/// task dying because the underlying transport errored (`Drained`) —
/// spec §4.3 names both `Closed` and `QueueDrained` as distinct terminal
/// read errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Stopped,
    Drained,
}

pub struct DeliveryQueue {
    inner: Mutex<VecDeque<Delivery>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicU8,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicU8::new(OPEN),
        }
    }

    /// Pushes a delivery, dropping the oldest pending entry first if the
    /// queue is already at capacity. Returns `true` if an entry was
    /// evicted, so the caller can feed a `frames_dropped_queue_full`
    /// counter (spec §4.2 debug counters).
    pub fn push(&self, delivery: Delivery) -> bool {
        if self.closed.load(Ordering::Acquire) != OPEN {
            return false;
        }
        let evicted = {
            let mut q = self.inner.lock().expect("queue lock poisoned");
            let evicted = q.len() >= self.capacity;
            if evicted {
                q.pop_front();
            }
            q.push_back(delivery);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Pops the next delivery, waiting until one arrives, the queue is
    /// closed, or `deadline` elapses.
    pub async fn pop(&self, deadline: Option<Instant>) -> PopResult {
        loop {
            if let Some(delivery) = self.inner.lock().expect("queue lock poisoned").pop_front() {
                return PopResult::Delivery(delivery);
            }
            match self.closed.load(Ordering::Acquire) {
                CLOSED_STOPPED => return PopResult::Closed(CloseReason::Stopped),
                CLOSED_DRAINED => return PopResult::Closed(CloseReason::Drained),
                _ => {}
            }

            let notified = self.notify.notified();
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, notified).await {
                    Ok(()) => continue,
                    Err(_) => return PopResult::Timeout,
                },
                None => {
                    notified.await;
                    continue;
                }
            }
        }
    }

    /// Marks the queue drained; any blocked or future `pop` observes
    /// `reason` (spec §4.2 `Stop`, §4.3 `Close`). Idempotent — the first
    /// reason to be set wins.
    pub fn close(&self, reason: CloseReason) {
        let code = match reason {
            CloseReason::Stopped => CLOSED_STOPPED,
            CloseReason::Drained => CLOSED_DRAINED,
        };
        let _ = self
            .closed
            .compare_exchange(OPEN, code, Ordering::AcqRel, Ordering::Acquire);
        self.notify.notify_waiters();
    }
}

pub enum PopResult {
    Delivery(Delivery),
    Timeout,
    Closed(CloseReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MacAddress;

    fn delivery(tag: u8) -> Delivery {
        Delivery {
            src_mac: MacAddress::new([0x14, 0x11, 0x11, 0x11, 0x11, tag]),
            dst_mac: MacAddress::new([0x14, 0x11, 0x11, 0x11, 0x11, tag]),
            ether_type: 0x0800,
            payload: vec![tag],
        }
    }

    #[tokio::test]
    async fn pop_returns_pushed_delivery_fifo() {
        let q = DeliveryQueue::new(4);
        q.push(delivery(1));
        q.push(delivery(2));
        match q.pop(None).await {
            PopResult::Delivery(d) => assert_eq!(d.payload, vec![1]),
            _ => panic!("expected a delivery"),
        }
        match q.pop(None).await {
            PopResult::Delivery(d) => assert_eq!(d.payload, vec![2]),
            _ => panic!("expected a delivery"),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let q = DeliveryQueue::new(2);
        q.push(delivery(1));
        q.push(delivery(2));
        q.push(delivery(3)); // evicts 1
        match q.pop(None).await {
            PopResult::Delivery(d) => assert_eq!(d.payload, vec![2]),
            _ => panic!("expected a delivery"),
        }
        match q.pop(None).await {
            PopResult::Delivery(d) => assert_eq!(d.payload, vec![3]),
            _ => panic!("expected a delivery"),
        }
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let q = DeliveryQueue::new(2);
        let deadline = Instant::now() + std::time::Duration::from_millis(20);
        assert!(matches!(q.pop(Some(deadline)).await, PopResult::Timeout));
    }

    #[tokio::test]
    async fn close_stopped_is_observed_by_pop() {
        let q = DeliveryQueue::new(2);
        q.close(CloseReason::Stopped);
        assert!(matches!(
            q.pop(None).await,
            PopResult::Closed(CloseReason::Stopped)
        ));
    }

    #[tokio::test]
    async fn close_drained_is_observed_by_pop() {
        let q = DeliveryQueue::new(2);
        q.close(CloseReason::Drained);
        assert!(matches!(
            q.pop(None).await,
            PopResult::Closed(CloseReason::Drained)
        ));
    }

    #[tokio::test]
    async fn push_after_close_is_dropped() {
        let q = DeliveryQueue::new(2);
        q.close(CloseReason::Stopped);
        q.push(delivery(1));
        assert!(matches!(
            q.pop(None).await,
            PopResult::Closed(CloseReason::Stopped)
        ));
    }

    #[tokio::test]
    async fn pending_items_are_drained_before_close_is_reported() {
        let q = DeliveryQueue::new(2);
        q.push(delivery(1));
        q.close(CloseReason::Drained);
        match q.pop(None).await {
            PopResult::Delivery(d) => assert_eq!(d.payload, vec![1]),
            _ => panic!("expected the pending delivery first"),
        }
        assert!(matches!(
            q.pop(None).await,
            PopResult::Closed(CloseReason::Drained)
        ));
    }
}
