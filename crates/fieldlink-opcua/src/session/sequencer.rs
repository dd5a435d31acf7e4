// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Transaction id allocation and ordered dispatch.
//!
//! Requests may be built concurrently, but their chunks must reach the wire
//! in transaction id order so that sequence numbers and request ids grow
//! together. [`TransactionSequencer::submit`] queues a dispatch callback
//! until every lower id has been dispatched or skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::TransactionError;

type Dispatch = Box<dyn FnOnce() + Send>;

struct Inner {
    /// Next id handed out by `next_transaction_id`.
    next_id: u32,
    /// Id whose callback runs next.
    active_id: u32,
    /// Ids allocated but not yet dispatched or skipped.
    allocated: BTreeSet<u32>,
    queue: BTreeMap<u32, Dispatch>,
    skipped: BTreeSet<u32>,
    /// A thread is currently running callbacks.
    dispatching: bool,
}

/// Allocates transaction ids and runs dispatch callbacks in id order.
pub struct TransactionSequencer {
    max_id: u32,
    inner: Mutex<Inner>,
}

impl TransactionSequencer {
    /// Creates a sequencer whose ids run from 1 to `max_id` and then wrap.
    pub fn new(max_id: u32) -> Self {
        Self {
            max_id: max_id.max(1),
            inner: Mutex::new(Inner {
                next_id: 1,
                active_id: 1,
                allocated: BTreeSet::new(),
                queue: BTreeMap::new(),
                skipped: BTreeSet::new(),
                dispatching: false,
            }),
        }
    }

    fn successor(&self, id: u32) -> u32 {
        if id >= self.max_id {
            1
        } else {
            id + 1
        }
    }

    /// Hands out the next id. Never returns 0.
    pub fn next_transaction_id(&self) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id = self.successor(id);
        inner.allocated.insert(id);
        id
    }

    /// Queues `on_send` for `transaction_id` and runs every callback that is
    /// now in order.
    ///
    /// Callbacks run outside the lock, one at a time, in id order. When
    /// dispatching advances the active id to one that was never allocated
    /// while later entries wait, `OutOfOrderTransactionMissing` is returned;
    /// the waiting entries stay queued. An entry queued ahead of an active id
    /// that has not moved yet is not an error.
    pub fn submit<F>(&self, transaction_id: u32, on_send: F) -> Result<(), TransactionError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.inner.lock();
            if inner.queue.contains_key(&transaction_id) || transaction_id == 0 {
                return Err(TransactionError::Duplicate { transaction_id });
            }
            if transaction_id != inner.active_id {
                trace!(
                    transaction_id,
                    active_id = inner.active_id,
                    "Transaction queued until earlier ids dispatch"
                );
            }
            inner.queue.insert(transaction_id, Box::new(on_send));
            if inner.dispatching {
                return Ok(());
            }
            inner.dispatching = true;
        }
        self.drain()
    }

    /// Abandons an allocated id so later ids are not blocked.
    pub fn skip(&self, transaction_id: u32) -> Result<(), TransactionError> {
        {
            let mut inner = self.inner.lock();
            inner.queue.remove(&transaction_id);
            inner.skipped.insert(transaction_id);
            if inner.dispatching {
                return Ok(());
            }
            inner.dispatching = true;
        }
        self.drain()
    }

    fn drain(&self) -> Result<(), TransactionError> {
        let mut advanced = false;
        loop {
            let ready = {
                let mut inner = self.inner.lock();
                let mut ready = Vec::new();
                loop {
                    let active = inner.active_id;
                    if let Some(dispatch) = inner.queue.remove(&active) {
                        ready.push(dispatch);
                    } else if !inner.skipped.remove(&active) {
                        break;
                    }
                    inner.allocated.remove(&active);
                    inner.active_id = self.successor(active);
                    advanced = true;
                }

                if ready.is_empty() {
                    inner.dispatching = false;
                    let expected = inner.active_id;
                    let never_allocated = expected == inner.next_id && !inner.allocated.contains(&expected);
                    if advanced && !inner.queue.is_empty() && never_allocated {
                        let queued = inner.queue.len();
                        warn!(expected, queued, "Queued transactions wait on an unallocated id");
                        return Err(TransactionError::OutOfOrderTransactionMissing { expected, queued });
                    }
                    return Ok(());
                }
                ready
            };

            for dispatch in ready {
                dispatch();
            }
        }
    }

    /// Id that dispatches next.
    pub fn active_id(&self) -> u32 {
        self.inner.lock().active_id
    }

    /// Number of callbacks waiting for an earlier id.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Drops queued callbacks and restarts ids at 1.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.next_id = 1;
        inner.active_id = 1;
        inner.allocated.clear();
        inner.queue.clear();
        inner.skipped.clear();
    }
}

impl Default for TransactionSequencer {
    fn default() -> Self {
        Self::new(u32::MAX)
    }
}

impl fmt::Debug for TransactionSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TransactionSequencer")
            .field("max_id", &self.max_id)
            .field("next_id", &inner.next_id)
            .field("active_id", &inner.active_id)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = log.clone();
        let make = move |id: u32| {
            let log = handle.clone();
            Box::new(move || log.lock().push(id)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[test]
    fn test_out_of_order_submit_dispatches_in_order() {
        let sequencer = TransactionSequencer::default();
        let ids: Vec<u32> = (0..3).map(|_| sequencer.next_transaction_id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let (log, make) = recorder();
        sequencer.submit(3, make(3)).unwrap();
        sequencer.submit(1, make(1)).unwrap();
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(sequencer.queued(), 1);

        sequencer.submit(2, make(2)).unwrap();
        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert_eq!(sequencer.queued(), 0);
        assert_eq!(sequencer.active_id(), 4);
    }

    #[test]
    fn test_id_wraps_to_one() {
        let sequencer = TransactionSequencer::new(3);
        let ids: Vec<u32> = (0..7).map(|_| sequencer.next_transaction_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 2, 3, 1]);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn test_dispatch_across_wrap() {
        let sequencer = TransactionSequencer::new(2);
        let (log, make) = recorder();
        for _ in 0..2 {
            let id = sequencer.next_transaction_id();
            sequencer.submit(id, make(id)).unwrap();
        }
        let id = sequencer.next_transaction_id();
        assert_eq!(id, 1);
        sequencer.submit(id, make(10)).unwrap();
        assert_eq!(*log.lock(), vec![1, 2, 10]);
    }

    #[test]
    fn test_skip_unblocks_later_ids() {
        let sequencer = TransactionSequencer::default();
        let first = sequencer.next_transaction_id();
        let second = sequencer.next_transaction_id();
        let (log, make) = recorder();

        sequencer.submit(second, make(second)).unwrap();
        assert!(log.lock().is_empty());
        sequencer.skip(first).unwrap();
        assert_eq!(*log.lock(), vec![second]);
    }

    #[test]
    fn test_missing_transaction_reported() {
        let sequencer = TransactionSequencer::default();
        let (log, make) = recorder();

        // nothing has dispatched yet, so 5 just waits
        sequencer.submit(5, make(5)).unwrap();
        assert_eq!(sequencer.queued(), 1);

        let first = sequencer.next_transaction_id();
        let err = sequencer.submit(first, make(first)).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::OutOfOrderTransactionMissing {
                expected: 2,
                queued: 1
            }
        ));
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(sequencer.active_id(), 2);
        assert_eq!(sequencer.queued(), 1);
    }

    #[test]
    fn test_waiting_on_allocated_id_is_not_missing() {
        let sequencer = TransactionSequencer::default();
        let ids: Vec<u32> = (0..3).map(|_| sequencer.next_transaction_id()).collect();
        let (log, make) = recorder();

        sequencer.submit(ids[2], make(ids[2])).unwrap();
        sequencer.submit(ids[0], make(ids[0])).unwrap();
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(sequencer.queued(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let sequencer = TransactionSequencer::default();
        sequencer.next_transaction_id();
        sequencer.next_transaction_id();
        let (_log, make) = recorder();
        sequencer.submit(2, make(2)).unwrap();
        assert!(matches!(
            sequencer.submit(2, make(2)),
            Err(TransactionError::Duplicate { transaction_id: 2 })
        ));
    }

    #[test]
    fn test_concurrent_submitters_keep_order() {
        let sequencer = Arc::new(TransactionSequencer::default());
        let ids: Vec<u32> = (0..64).map(|_| sequencer.next_transaction_id()).collect();
        let (log, make) = recorder();
        let make = Arc::new(make);

        let handles: Vec<_> = ids
            .into_iter()
            .rev()
            .map(|id| {
                let sequencer = sequencer.clone();
                let make = make.clone();
                std::thread::spawn(move || sequencer.submit(id, make(id)).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let log = log.lock();
        assert_eq!(*log, (1..=64).collect::<Vec<_>>());
    }
}
