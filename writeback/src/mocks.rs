//! Collaborators that complete only when a test tells them to.

use crate::{
    completion::{AioCompletion, Bridge, Callback},
    image::{self, Image},
    layout::Layout,
    store::{ReadOp, WriteOp},
    Error,
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

pub const OBJECT_SIZE: u64 = 4 * 1024 * 1024;

pub fn config() -> image::Config {
    image::Config {
        id: "test".into(),
        object_prefix: "rbd_data.test".into(),
        layout: Layout::unstriped(OBJECT_SIZE).unwrap(),
        features: 0,
        extra_read_flags: 0,
        balance_snap_reads: false,
        localize_snap_reads: false,
    }
}

pub fn image(cfg: image::Config) -> Image {
    image_with_store(cfg, Arc::new(Store::default()))
}

pub fn image_with_store(cfg: image::Config, store: Arc<Store>) -> Image {
    Image::new(cfg, store)
}

/// Native completion token handed out by [Store].
pub struct Completion {
    ret: i32,
}

impl AioCompletion for Completion {
    fn return_value(&self) -> i32 {
        self.ret
    }
}

/// An operation submitted to [Store].
#[derive(Clone, Debug)]
pub enum Op {
    Read {
        op: ReadOp,
        flags: u32,
    },
    Write(WriteOp),
    UpdateFlags {
        oid: String,
        snap_id: u64,
        flags: u64,
        mask: u64,
    },
}

/// A store that holds every operation until the test completes it.
#[derive(Default)]
pub struct Store {
    submitted: Mutex<Vec<Op>>,
    in_flight: Mutex<Vec<(Op, Bridge)>>,
}

impl Store {
    fn submit(&self, op: Op, bridge: Bridge) {
        self.submitted.lock().unwrap().push(op.clone());
        self.in_flight.lock().unwrap().push((op, bridge));
    }

    /// Every operation ever submitted, in submission order.
    pub fn submitted(&self) -> Vec<Op> {
        self.submitted.lock().unwrap().clone()
    }

    /// Number of operations not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Remove the `index`-th in-flight operation (in submission order).
    pub fn take(&self, index: usize) -> (Op, Bridge) {
        self.in_flight.lock().unwrap().remove(index)
    }

    /// Complete the `index`-th in-flight operation with `r`.
    pub fn complete_at(&self, index: usize, r: i32) {
        let (_, bridge) = self.take(index);
        bridge.complete(&Completion { ret: r });
    }

    /// Complete the oldest in-flight operation with `r`.
    pub fn complete_next(&self, r: i32) {
        self.complete_at(0, r);
    }
}

impl crate::store::Store for Store {
    fn aio_read(&self, op: ReadOp, flags: u32, bridge: Bridge) -> Result<(), Error> {
        self.submit(Op::Read { op, flags }, bridge);
        Ok(())
    }

    fn aio_write(&self, op: WriteOp, bridge: Bridge) {
        self.submit(Op::Write(op), bridge);
    }

    fn aio_update_flags(
        &self,
        oid: &str,
        snap_id: u64,
        flags: u64,
        mask: u64,
        bridge: Bridge,
    ) -> Result<(), Error> {
        self.submit(
            Op::UpdateFlags {
                oid: oid.to_string(),
                snap_id,
                flags,
                mask,
            },
            bridge,
        );
        Ok(())
    }
}

/// A journal whose events become safe only when the test says so.
#[derive(Default)]
pub struct Journal {
    waiting: Mutex<Vec<(u64, Callback)>>,
    commits: Mutex<Vec<(u64, u64, u64, i32)>>,
}

impl Journal {
    /// Complete every waiter registered for `tid` with `r`.
    pub fn safe(&self, tid: u64, r: i32) {
        let ready: Vec<_> = {
            let mut waiting = self.waiting.lock().unwrap();
            let (ready, rest): (Vec<_>, Vec<_>) = waiting.drain(..).partition(|(t, _)| *t == tid);
            *waiting = rest;
            ready
        };
        assert!(!ready.is_empty(), "no waiters for tid {tid}");
        for (_, callback) in ready {
            callback.complete(r);
        }
    }

    /// Number of registered waiters.
    pub fn waiting(&self) -> usize {
        self.waiting.lock().unwrap().len()
    }

    /// Every `(tid, offset, length, r)` recorded so far.
    pub fn commits(&self) -> Vec<(u64, u64, u64, i32)> {
        self.commits.lock().unwrap().clone()
    }
}

impl crate::journal::Journal for Journal {
    fn flush_event(&self, tid: u64, on_safe: Callback) {
        self.waiting.lock().unwrap().push((tid, on_safe));
    }

    fn commit_io_event_extent(&self, tid: u64, offset: u64, length: u64, r: i32) {
        self.commits.lock().unwrap().push((tid, offset, length, r));
    }
}

/// An object map backed by a set of existing object numbers.
#[derive(Default)]
pub struct ObjectMap {
    objects: Mutex<HashSet<u64>>,
}

impl ObjectMap {
    pub fn insert(&self, object_no: u64) {
        self.objects.lock().unwrap().insert(object_no);
    }
}

impl crate::object_map::ObjectMap for ObjectMap {
    fn object_may_exist(&self, object_no: u64) -> bool {
        self.objects.lock().unwrap().contains(&object_no)
    }
}
