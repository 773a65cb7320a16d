use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use super::matching::SubscriberMatch;
use super::Subscriber;

/// Result of waiting on a subscriber.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// The subscriber fired.
    Matched(Arc<SubscriberMatch>),
    /// The timeout elapsed first.
    Timeout,
    /// The subscriber was stopped (or had already fired once).
    Aborted,
}

impl WaitOutcome {
    #[must_use]
    pub const fn is_matched(&self) -> bool {
        matches!(self, Self::Matched(_))
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// The match, if any.
    #[must_use]
    pub fn into_match(self) -> Option<Arc<SubscriberMatch>> {
        match self {
            Self::Matched(m) => Some(m),
            Self::Timeout | Self::Aborted => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Match(Arc<SubscriberMatch>),
    Stop,
}

/// One waiter queue registered on a subscriber.
///
/// The slot keeps its own receiver so a full queue can drop its oldest item.
#[derive(Debug)]
pub(crate) struct WaiterSlot {
    pub(crate) id: u64,
    tx: Sender<Delivery>,
    rx: Receiver<Delivery>,
}

impl WaiterSlot {
    /// `capacity == 0` means unbounded.
    pub(crate) fn new(id: u64, capacity: usize) -> Self {
        let (tx, rx) = if capacity == 0 { unbounded() } else { bounded(capacity) };
        Self { id, tx, rx }
    }

    pub(crate) fn receiver(&self) -> Receiver<Delivery> {
        self.rx.clone()
    }

    /// Enqueues `item`, discarding the oldest queued item when full.
    pub(crate) fn push(&self, item: Delivery) {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(back)) => {
                    let _ = self.rx.try_recv();
                    item = back;
                }
            }
        }
    }
}

/// A persistent queue of matches from one subscriber.
///
/// Dropping the stream deregisters it.
#[derive(Debug)]
pub struct MatchStream {
    subscriber: Subscriber,
    slot_id: u64,
    rx: Receiver<Delivery>,
    closed: AtomicBool,
}

impl MatchStream {
    pub(crate) fn new(subscriber: Subscriber, slot_id: u64, rx: Receiver<Delivery>) -> Self {
        Self {
            subscriber,
            slot_id,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    /// The subscriber feeding this stream.
    #[must_use]
    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    /// Blocks until the next match or until the subscriber stops.
    pub fn recv(&self) -> WaitOutcome {
        match self.rx.recv() {
            Ok(d) => Self::outcome(d),
            Err(_) => WaitOutcome::Aborted,
        }
    }

    /// Waits up to `timeout`; `None` blocks indefinitely.
    pub fn recv_timeout(&self, timeout: Option<Duration>) -> WaitOutcome {
        let Some(timeout) = timeout else {
            return self.recv();
        };
        match self.rx.recv_timeout(timeout) {
            Ok(d) => Self::outcome(d),
            Err(RecvTimeoutError::Timeout) => WaitOutcome::Timeout,
            Err(RecvTimeoutError::Disconnected) => WaitOutcome::Aborted,
        }
    }

    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<WaitOutcome> {
        match self.rx.try_recv() {
            Ok(d) => Some(Self::outcome(d)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(WaitOutcome::Aborted),
        }
    }

    /// Deregisters the stream. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.subscriber.remove_waiter(self.slot_id);
    }

    fn outcome(delivery: Delivery) -> WaitOutcome {
        match delivery {
            Delivery::Match(m) => WaitOutcome::Matched(m),
            Delivery::Stop => WaitOutcome::Aborted,
        }
    }
}

impl Drop for MatchStream {
    fn drop(&mut self) {
        self.close();
    }
}
