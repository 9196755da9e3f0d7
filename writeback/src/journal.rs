//! Gate writes on a write-ahead journal.
//!
//! A write tagged with a non-zero journal transaction id (tid) moves through three states:
//!
//! ```text
//! Pending --(event safe, r >= 0)--> Dispatched --(write finished, r)--> Committed(r)
//!    |                                                                        ^
//!    +--------------------------(event safe, r < 0)---------------------------+
//! ```
//!
//! The write is not sent to the store until the journal reports its event safe. Once the
//! outcome is known (either the write finished or the journal failed), the extents the write
//! covered are recorded against the tid, and only then is the write's ordered completion
//! invoked. A write whose journal event fails never reaches the store.

use crate::{
    completion::{Callback, Completion},
    image::Image,
    layout::Extent,
    metrics::Metrics,
    ordering::OrderedWrite,
    store::WriteOp,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The journal an image records its I/O events in.
pub trait Journal: Send + Sync + 'static {
    /// Complete `on_safe` once event `tid` is durable (or failed).
    ///
    /// `on_safe` must not be invoked from within this call: callers hold the image-ownership
    /// lock while registering.
    fn flush_event(&self, tid: u64, on_safe: Callback);

    /// Record that `length` bytes at image `offset` of event `tid` were applied with result `r`.
    fn commit_io_event_extent(&self, tid: u64, offset: u64, length: u64, r: i32);
}

/// Record `extents` of event `tid` as applied with result `r`.
pub(crate) fn commit_extents(
    journal: &dyn Journal,
    metrics: &Metrics,
    extents: &[Extent],
    tid: u64,
    r: i32,
) {
    for &(offset, length) in extents {
        journal.commit_io_event_extent(tid, offset, length, r);
        metrics.journal_extents.inc();
    }
}

enum State {
    Pending,
    Dispatched,
}

/// A write waiting on (or dispatched after) its journal event.
pub(crate) struct JournaledWrite<C> {
    image: Arc<Image>,
    metrics: Arc<Metrics>,
    op: WriteOp,
    extents: Vec<Extent>,
    journal_tid: u64,
    state: State,
    req_comp: OrderedWrite<C>,
}

impl<C: Send + 'static> JournaledWrite<C> {
    /// Gate `op` on event `journal_tid`. `extents` are the image extents `op` covers.
    pub(crate) fn new(
        image: Arc<Image>,
        metrics: Arc<Metrics>,
        op: WriteOp,
        extents: Vec<Extent>,
        journal_tid: u64,
        req_comp: OrderedWrite<C>,
    ) -> Self {
        debug!(
            oid = %op.oid,
            tid = journal_tid,
            "delaying write until journal event safe"
        );
        Self {
            image,
            metrics,
            op,
            extents,
            journal_tid,
            state: State::Pending,
            req_comp,
        }
    }

    /// Register with `journal`, waiting for the event to become safe.
    pub(crate) fn register(self, journal: &dyn Journal) {
        let tid = self.journal_tid;
        journal.flush_event(tid, Completion::Journaled(self).into());
    }

    pub(crate) fn complete(self, r: i32) {
        match self.state {
            State::Pending if r >= 0 => self.send_request(),
            State::Pending => {
                warn!(
                    oid = %self.op.oid,
                    tid = self.journal_tid,
                    r,
                    "journal event failed, skipping write"
                );
                self.commit(r);
            }
            State::Dispatched => self.commit(r),
        }
    }

    fn send_request(mut self) {
        debug!(
            oid = %self.op.oid,
            tid = self.journal_tid,
            "journal event safe, sending write"
        );
        let image = self.image.clone();
        let owner = image.owner_read();
        assert!(
            owner.is_lock_owner(),
            "journaled write dispatched without exclusive lock"
        );

        self.state = State::Dispatched;
        let op = self.op.clone();
        image.store().aio_write(op, Completion::Journaled(self).into());
    }

    fn commit(self, r: i32) {
        trace!(
            oid = %self.op.oid,
            tid = self.journal_tid,
            r,
            "write committed, updating journal commit position"
        );
        if let Some(journal) = self.image.journal() {
            commit_extents(
                journal.as_ref(),
                &self.metrics,
                &self.extents,
                self.journal_tid,
                r,
            );
        }
        self.req_comp.complete(r);
    }
}
