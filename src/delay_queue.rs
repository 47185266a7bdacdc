//! The product-index delay queue that drives retransmission aging.
//!
//! [crate::VcmtpSender::send_product] pushes the index of every multicast
//! product together with its retransmission lifetime; the timer task blocks
//! in [ProductIndexDelayQueue::pop] and receives each index once its
//! lifetime has passed. Disabling the queue is the timer's shutdown signal.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::SendError;

struct QueueEntry {
    wake: Instant,
    /// Push order, breaking ties between identical wake instants.
    seq: u64,
    prodindex: u32,
}

impl Ord for QueueEntry {
    // inverted so that the BinaryHeap surfaces the earliest wake instant
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake
            .cmp(&self.wake)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake == other.wake && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    disabled: bool,
}

pub struct ProductIndexDelayQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ProductIndexDelayQueue {
    pub fn new() -> ProductIndexDelayQueue {
        ProductIndexDelayQueue {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                disabled: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Schedules `prodindex` to become poppable once `delay` has passed.
    /// Pushes after [disable] are dropped.
    pub fn push(&self, prodindex: u32, delay: Duration) {
        {
            let mut state = self.state.lock();
            if state.disabled {
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(QueueEntry {
                wake: Instant::now() + delay,
                seq,
                prodindex,
            });
        }
        self.notify.notify_one();
    }

    /// Blocks until the earliest scheduled entry is due, then removes and
    /// returns its product index. Fails with [SendError::QueueDisabled] once
    /// [disable] has been called.
    pub async fn pop(&self) -> Result<u32, SendError> {
        loop {
            let next_wake = {
                let mut state = self.state.lock();
                if state.disabled {
                    return Err(SendError::QueueDisabled);
                }
                match state.heap.peek() {
                    Some(entry) if entry.wake <= Instant::now() => {
                        let entry = state
                            .heap
                            .pop()
                            .expect("peeked heap entry disappeared under the lock");
                        return Ok(entry.prodindex);
                    }
                    Some(entry) => Some(entry.wake),
                    None => None,
                }
            };

            // A push of an earlier entry or a disable interrupts the wait;
            // both store a wakeup permit, so a notification between the
            // check above and the await below is not lost.
            match next_wake {
                Some(wake) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Wakes every blocked popper; it and all subsequent [pop] calls fail
    /// with [SendError::QueueDisabled].
    pub fn disable(&self) {
        self.state.lock().disabled = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
