use super::error::StreamResult;
use parking_lot::Mutex;
use std::future::poll_fn;
use std::task::{Poll, Waker};

/// Single-assignment result cell backing the `closed` terminal futures.
///
/// The cell settles at most once: the first `settle` wins and every later
/// attempt is ignored. Observers that attach after settlement still receive
/// the already-decided outcome.
#[derive(Debug)]
pub struct CompletionCell {
    slot: Mutex<Slot>,
}

#[derive(Debug)]
struct Slot {
    result: Option<StreamResult<()>>,
    wakers: Vec<Waker>,
}

impl CompletionCell {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                result: None,
                wakers: Vec::new(),
            }),
        }
    }

    /// A cell that is already settled with `result`.
    pub fn settled(result: StreamResult<()>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                result: Some(result),
                wakers: Vec::new(),
            }),
        }
    }

    /// Settle the cell, waking every waiter. Returns `false` if the cell was
    /// already settled, in which case `result` is discarded.
    pub fn settle(&self, result: StreamResult<()>) -> bool {
        let mut slot = self.slot.lock();
        if slot.result.is_some() {
            return false;
        }
        slot.result = Some(result);
        for waker in slot.wakers.drain(..) {
            waker.wake();
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.slot.lock().result.is_some()
    }

    /// Wait until the cell settles; resolves immediately once it has.
    pub async fn wait(&self) -> StreamResult<()> {
        poll_fn(|cx| {
            let mut slot = self.slot.lock();
            if let Some(result) = &slot.result {
                return Poll::Ready(result.clone());
            }
            if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                slot.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        })
        .await
    }
}

impl Default for CompletionCell {
    fn default() -> Self {
        Self::new()
    }
}
