//! Suspend and resume write dispatch around ownership transitions.
//!
//! Every write passes through a [WriteQueue] on its way to the store. While writes are
//! running, the queue counts them as in progress until their completion has been delivered.
//! [WriteQueue::suspend_writes] stops new writes from being dispatched and blocks until every
//! in-progress write has been delivered. Writes submitted while suspended keep their place in
//! the per-object delivery order but are held back from the store until
//! [WriteQueue::resume_writes].
//!
//! Suspension is how a caller quiesces the image before changing exclusive-lock ownership:
//!
//! ```text
//! suspend_writes() -> release_lock() / acquire_lock() -> resume_writes()
//! ```
//!
//! `suspend_writes` must not be called while holding the ownership lock or the coordination
//! lock: in-progress writes need both to be delivered.

use std::{
    collections::VecDeque,
    mem,
    sync::{Condvar, Mutex},
};
use tracing::debug;

/// Submits a write to the store (or journal).
pub(crate) type Dispatch = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    suspended: bool,
    in_progress: usize,
    queued: VecDeque<Dispatch>,
}

/// Gate between accepted writes and the store.
#[derive(Default)]
pub struct WriteQueue {
    inner: Mutex<Inner>,
    drained: Condvar,
}

impl WriteQueue {
    /// Dispatch a write now, or hold it if writes are suspended.
    pub(crate) fn submit(&self, dispatch: Dispatch) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.suspended {
                inner.queued.push_back(dispatch);
                debug!(queued = inner.queued.len(), "writes suspended, holding write");
                return;
            }
            inner.in_progress += 1;
        }
        dispatch();
    }

    /// Record that an in-progress write has been delivered.
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.in_progress > 0, "write finished without being dispatched");
        inner.in_progress -= 1;
        if inner.in_progress == 0 {
            self.drained.notify_all();
        }
    }

    /// Stop dispatching writes and wait for every in-progress write to be delivered.
    pub fn suspend_writes(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.suspended = true;
        debug!(in_progress = inner.in_progress, "suspending writes");
        while inner.in_progress > 0 {
            inner = self.drained.wait(inner).unwrap();
        }
        debug!("writes suspended");
    }

    /// Resume dispatching writes, starting with those held while suspended (in submission
    /// order).
    pub fn resume_writes(&self) {
        let queued = {
            let mut inner = self.inner.lock().unwrap();
            inner.suspended = false;
            let queued = mem::take(&mut inner.queued);
            inner.in_progress += queued.len();
            queued
        };
        debug!(released = queued.len(), "resuming writes");
        for dispatch in queued {
            dispatch();
        }
    }

    /// Returns true if writes are suspended.
    pub fn writes_suspended(&self) -> bool {
        self.inner.lock().unwrap().suspended
    }

    /// Returns true if no write is in progress or held.
    pub fn writes_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.in_progress == 0 && inner.queued.is_empty()
    }

    /// Number of dispatched writes not yet delivered.
    pub fn in_progress_writes(&self) -> usize {
        self.inner.lock().unwrap().in_progress
    }

    /// Number of writes held while suspended.
    pub fn queued_writes(&self) -> usize {
        self.inner.lock().unwrap().queued.len()
    }
}
