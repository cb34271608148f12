use foldhash::fast::RandomState;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::oneshot;

use crate::{
    Payload, Receiver,
    error::{Error, Result},
};

type Slot = oneshot::Sender<Result<Payload>>;

#[derive(Default)]
struct Pending {
    calls: HashMap<u64, Slot, RandomState>,
    next_seq: u64,
    closed: Option<Error>,
}

/// Outcome of handing a response to the [`Waiter`].
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// A caller was waiting and got the result.
    Delivered,
    /// The seq was issued but its caller already gave up.
    Late,
    /// The seq was never issued on this connection.
    Unknown,
}

/// Pending-call table for one connection.
///
/// Seqs are handed out in increasing order starting at zero and are never
/// reused. Every entry is completed at most once: by [`Waiter::post`], by
/// [`Waiter::terminate`], or removed when its [`Receiver`] is dropped.
#[derive(Default)]
pub struct Waiter {
    pending: Mutex<Pending>,
}

/// RAII guard that forgets a pending call whose caller stopped waiting.
pub struct WaiterCleaner<'a> {
    waiter: &'a Waiter,
    seq: u64,
}

impl Drop for WaiterCleaner<'_> {
    fn drop(&mut self) {
        self.waiter.remove(self.seq);
    }
}

impl Waiter {
    /// Allocates the next seq and registers a pending call for it.
    ///
    /// # Errors
    ///
    /// Fails once the table has been terminated, so no call can be left
    /// waiting on a dead connection.
    pub fn alloc(&self) -> Result<(u64, Receiver<'_>)> {
        let mut pending = self.lock();
        if let Some(err) = &pending.closed {
            return Err(err.clone());
        }

        let seq = pending.next_seq;
        pending.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        pending.calls.insert(seq, tx);
        Ok((
            seq,
            Receiver::new(rx, WaiterCleaner { waiter: self, seq }),
        ))
    }

    /// Completes the pending call for `seq` with `result`.
    pub fn post(&self, seq: u64, result: Result<Payload>) -> Delivery {
        let mut pending = self.lock();
        if let Some(tx) = pending.calls.remove(&seq) {
            drop(pending);
            let _ = tx.send(result);
            Delivery::Delivered
        } else if seq < pending.next_seq {
            Delivery::Late
        } else {
            Delivery::Unknown
        }
    }

    /// Fails every pending call with `err` and refuses new ones.
    pub fn terminate(&self, err: Error) {
        let calls = {
            let mut pending = self.lock();
            if pending.closed.is_none() {
                pending.closed = Some(err.clone());
            }
            std::mem::take(&mut pending.calls)
        };
        for (_, tx) in calls {
            let _ = tx.send(Err(err.clone()));
        }
    }

    pub fn contains_seq(&self, seq: u64) -> bool {
        self.lock().calls.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn remove(&self, seq: u64) {
        self.lock().calls.remove(&seq);
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter").field("pending", &self.len()).finish()
    }
}
