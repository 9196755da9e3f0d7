//! Deliver write completions in submission order, per object.
//!
//! Every write is tracked by a result slot appended to its object's queue before the write
//! is dispatched, so queue order is submission order. The store may finish writes in any
//! order: a finished write is only marked done. Delivery always starts at the head of the
//! queue and stops at the first write that is not yet done, so a write that finishes early is
//! held until every write submitted before it (to the same object) has been delivered.
//!
//! Writes to different objects never wait on each other, and an object's queue is removed as
//! soon as it is empty.

use crate::{completion::OnComplete, metrics::Metrics};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tracing::trace;

/// A write awaiting delivery.
struct WriteResult<C> {
    tid: u64,
    done: bool,
    ret: i32,
    on_commit: OnComplete<C>,
}

/// State guarded by the coordination lock.
pub struct State<C> {
    /// The caller's cache state.
    pub cache: C,

    writes: HashMap<String, VecDeque<WriteResult<C>>>,
    tid: u64,
}

impl<C> State<C> {
    pub(crate) fn new(cache: C) -> Self {
        Self {
            cache,
            writes: HashMap::new(),
            tid: 0,
        }
    }

    /// Number of objects with writes awaiting delivery.
    pub fn tracked_objects(&self) -> usize {
        self.writes.len()
    }

    /// Number of writes to `oid` awaiting delivery.
    pub fn pending_writes(&self, oid: &str) -> usize {
        self.writes.get(oid).map_or(0, VecDeque::len)
    }

    /// Append a write to the queue of `oid`, returning its (monotonically increasing) id.
    pub(crate) fn track(&mut self, oid: &str, on_commit: OnComplete<C>) -> u64 {
        self.tid += 1;
        let tid = self.tid;
        self.writes
            .entry(oid.to_string())
            .or_default()
            .push_back(WriteResult {
                tid,
                done: false,
                ret: 0,
                on_commit,
            });
        trace!(oid, tid, "write will wait for result");
        tid
    }

    /// Mark write `tid` to `oid` done with result `r`.
    pub(crate) fn finish(&mut self, oid: &str, tid: u64, r: i32) {
        let results = self
            .writes
            .get_mut(oid)
            .unwrap_or_else(|| panic!("no writes tracked for {oid}"));
        let index = results
            .binary_search_by_key(&tid, |result| result.tid)
            .unwrap_or_else(|_| panic!("write {tid} not tracked for {oid}"));
        let result = &mut results[index];
        assert!(!result.done, "write {tid} to {oid} completed twice");
        result.done = true;
        result.ret = r;
    }

    /// Deliver the longest prefix of done writes queued for `oid`.
    pub(crate) fn complete_writes(&mut self, oid: &str, metrics: &Metrics) {
        let Some(results) = self.writes.get_mut(oid) else {
            return;
        };
        let ready = results.iter().take_while(|result| result.done).count();
        let finished: Vec<_> = results.drain(..ready).collect();
        if results.is_empty() {
            self.writes.remove(oid);
        }
        metrics.tracked_objects.set(self.writes.len() as i64);

        for result in finished {
            trace!(oid, tid = result.tid, r = result.ret, "completing write");
            metrics.writes_completed.inc();
            if result.ret < 0 {
                metrics.writes_failed.inc();
            }
            (result.on_commit)(&mut self.cache, result.ret);
        }
    }
}

/// Completion of a tracked write: marks it done and drains its object's queue.
pub(crate) struct OrderedWrite<C> {
    state: Arc<Mutex<State<C>>>,
    metrics: Arc<Metrics>,
    oid: String,
    tid: u64,
}

impl<C> OrderedWrite<C> {
    pub(crate) fn new(
        state: Arc<Mutex<State<C>>>,
        metrics: Arc<Metrics>,
        oid: String,
        tid: u64,
    ) -> Self {
        Self {
            state,
            metrics,
            oid,
            tid,
        }
    }

    pub(crate) fn complete(self, r: i32) {
        trace!(oid = %self.oid, tid = self.tid, r, "ordered write completing");
        let mut state = self.state.lock().unwrap();
        state.finish(&self.oid, self.tid, r);
        state.complete_writes(&self.oid, &self.metrics);
    }
}
