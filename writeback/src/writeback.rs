use crate::{
    completion::{Callback, Completion, OnComplete},
    dispatcher::Dispatcher,
    image::{Image, OwnerGuard},
    journal::{commit_extents, JournaledWrite},
    layout::{object_no, prune_parent_extents},
    metrics::Metrics,
    object_map::InvalidateRequest,
    ordering::{OrderedWrite, State},
    queue::{Dispatch, WriteQueue},
    read::ReadCompletion,
    request::Request,
    store::{Locator, ReadBuf, ReadOp, SnapContext, WriteOp},
    Error,
};
use bytes::Bytes;
use prometheus_client::registry::Registry;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};
use tracing::{debug, trace, warn};

/// Configuration for [Writeback].
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the dispatcher thread and prefix of all registered metrics.
    pub name: String,
}

/// A read of one backing object.
#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub oid: String,
    pub object_no: u64,
    pub locator: Locator,
    pub offset: u64,
    pub length: u64,
    pub snap_id: u64,
    pub trunc_size: u64,
    pub trunc_seq: u32,
    pub op_flags: u32,
}

/// A write to one backing object.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    pub oid: String,
    pub locator: Locator,
    pub offset: u64,
    pub snapc: SnapContext,
    pub data: Bytes,
    pub mtime: SystemTime,
    pub trunc_size: u64,
    pub trunc_seq: u32,

    /// Journal transaction the write belongs to (0 if the write is not journaled).
    pub journal_tid: u64,
}

/// Issues object I/O for an image and delivers its completions in order.
///
/// `C` is the cache state of the layer above. It lives behind the coordination lock and is
/// handed to every read and write completion.
pub struct Writeback<C> {
    image: Arc<Image>,
    state: Arc<Mutex<State<C>>>,
    metrics: Arc<Metrics>,
    queue: Arc<WriteQueue>,
    dispatcher: Dispatcher,
}

impl<C: Send + 'static> Writeback<C> {
    /// Create a new writeback layer for `image`, registering its metrics in `registry`.
    pub fn new(
        cfg: Config,
        image: Arc<Image>,
        cache: C,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let metrics = Arc::new(Metrics::new(registry.sub_registry_with_prefix(&cfg.name)));
        let dispatcher = Dispatcher::new(&cfg.name)?;
        Ok(Self {
            image,
            state: Arc::new(Mutex::new(State::new(cache))),
            metrics,
            queue: Arc::new(WriteQueue::default()),
            dispatcher,
        })
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    /// Take the coordination lock.
    ///
    /// Must not be held while taking the ownership lock. Completions are delivered under this
    /// lock, so it must also not be held while calling [Writeback::write] (or any operation
    /// whose completion may be delivered on the calling thread, such as completing a store
    /// operation inline): `std::sync::Mutex` is not reentrant and the thread would deadlock.
    pub fn lock(&self) -> MutexGuard<'_, State<C>> {
        self.state.lock().unwrap()
    }

    /// The gate every write passes through on its way to the store.
    ///
    /// Suspend writes (see [WriteQueue::suspend_writes]) before changing exclusive-lock
    /// ownership. Writes still held when the [Writeback] is dropped are never dispatched.
    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    /// Take the ownership lock of the image in shared mode.
    pub fn get_client_lock(&self) -> OwnerGuard<'_> {
        self.image.owner_read()
    }

    /// Release a guard returned by [Writeback::get_client_lock].
    pub fn put_client_lock(&self, owner: OwnerGuard<'_>) {
        assert!(
            owner.is_for(&self.image),
            "released another image's ownership lock"
        );
        drop(owner);
    }

    /// Read part of an object into `buf`.
    ///
    /// `on_finish` is always invoked off the calling thread, with `-ENOENT` if the object is
    /// known not to exist.
    pub fn read(&self, request: ReadRequest, buf: ReadBuf, on_finish: OnComplete<C>) {
        trace!(
            oid = %request.oid,
            offset = request.offset,
            length = request.length,
            snap_id = request.snap_id,
            "read"
        );
        self.metrics.reads.inc();
        let completion = Completion::Read(ReadCompletion::new(
            self.image.clone(),
            self.state.clone(),
            on_finish,
        ));

        if !self.image.object_may_exist(request.object_no) {
            debug!(oid = %request.oid, "object does not exist, skipping read");
            self.metrics.reads_skipped.inc();
            self.dispatcher.queue(completion.into(), -libc::ENOENT);
            return;
        }

        let flags = self.image.read_flags(request.snap_id);
        let oid = request.oid.clone();
        let op = ReadOp {
            oid: request.oid,
            locator: request.locator,
            offset: request.offset,
            length: request.length,
            op_flags: request.op_flags,
            trunc_size: request.trunc_size,
            trunc_seq: request.trunc_seq,
            buf,
        };
        if let Err(err) = self.image.store().aio_read(op, flags, completion.into()) {
            panic!("store rejected read of {oid}: {err}");
        }
    }

    /// Write to an object, returning the id the write is tracked under.
    ///
    /// `on_commit` is invoked only after every earlier write to the same object has been
    /// delivered. A write with a non-zero `journal_tid` is not sent to the store until its
    /// journal event is safe. While writes are suspended the write is tracked (and its id
    /// returned) but not dispatched until they resume.
    ///
    /// Fails, without tracking anything, if `oid` is not an object of this image or the write
    /// does not fit within the object.
    pub fn write(
        &self,
        owner: &OwnerGuard<'_>,
        request: WriteRequest,
        on_commit: OnComplete<C>,
    ) -> Result<u64, Error> {
        assert!(
            owner.is_for(&self.image),
            "write submitted under another image's ownership lock"
        );
        let object_no = object_no(&self.image.config().object_prefix, &request.oid)?;
        let extents = self.image.layout().extent_to_file(
            object_no,
            request.offset,
            request.data.len() as u64,
        )?;
        let journal = match request.journal_tid {
            0 => None,
            tid => Some(self.image.journal().cloned().unwrap_or_else(|| {
                panic!("write tagged with journal tid {tid} but no journal attached")
            })),
        };
        debug_assert!(request.snapc.is_valid(), "invalid snapshot context");

        let queue = self.queue.clone();
        let on_commit: OnComplete<C> = Box::new(move |cache: &mut C, r| {
            on_commit(cache, r);
            queue.finish();
        });

        // Queue position must be taken before the write can possibly finish
        let tid = {
            let mut state = self.state.lock().unwrap();
            let tid = state.track(&request.oid, on_commit);
            self.metrics
                .tracked_objects
                .set(state.tracked_objects() as i64);
            tid
        };
        self.metrics.writes.inc();
        debug!(
            oid = %request.oid,
            tid,
            offset = request.offset,
            length = request.data.len() as u64,
            journal_tid = request.journal_tid,
            "write"
        );

        let req_comp = OrderedWrite::new(
            self.state.clone(),
            self.metrics.clone(),
            request.oid.clone(),
            tid,
        );
        let op = WriteOp {
            oid: request.oid,
            object_no,
            locator: request.locator,
            offset: request.offset,
            data: request.data,
            snapc: request.snapc,
            mtime: request.mtime,
            trunc_size: request.trunc_size,
            trunc_seq: request.trunc_seq,
        };
        let dispatch: Dispatch = match journal {
            Some(journal) => {
                self.metrics.writes_journaled.inc();
                let write = JournaledWrite::new(
                    self.image.clone(),
                    self.metrics.clone(),
                    op,
                    extents,
                    request.journal_tid,
                    req_comp,
                );
                Box::new(move || write.register(journal.as_ref()))
            }
            None => {
                let image = self.image.clone();
                Box::new(move || {
                    image
                        .store()
                        .aio_write(op, Completion::Ordered(req_comp).into())
                })
            }
        };
        self.queue.submit(dispatch);
        Ok(tid)
    }

    /// Record `length` bytes at `offset` of `oid` as committed for `journal_tid` without
    /// writing anything.
    pub fn overwrite_extent(
        &self,
        owner: &OwnerGuard<'_>,
        oid: &str,
        offset: u64,
        length: u64,
        journal_tid: u64,
    ) -> Result<(), Error> {
        assert!(
            owner.is_for(&self.image),
            "overwrite recorded under another image's ownership lock"
        );
        let object_no = object_no(&self.image.config().object_prefix, oid)?;
        let extents = self
            .image
            .layout()
            .extent_to_file(object_no, offset, length)?;
        let journal = self
            .image
            .journal()
            .unwrap_or_else(|| panic!("overwrite of {oid} recorded without a journal"));
        assert_ne!(journal_tid, 0, "overwrite of {oid} recorded without a tid");

        trace!(oid, offset, length, tid = journal_tid, "recording overwrite");
        commit_extents(journal.as_ref(), &self.metrics, &extents, journal_tid, 0);
        Ok(())
    }

    /// Returns true if writing to `oid` may first require copying data up from the parent.
    ///
    /// The decision covers the whole object (not just the requested range) and is made for
    /// the revision the image is currently open at.
    pub fn may_copy_on_write(
        &self,
        oid: &str,
        read_offset: u64,
        read_length: u64,
        snap_id: u64,
    ) -> Result<bool, Error> {
        let object_no = object_no(&self.image.config().object_prefix, oid)?;
        let overlap = {
            let snaps = self.image.snaps();
            let parent = self.image.parent();
            snaps
                .parent_overlap(parent.as_ref(), snaps.snap_id())
                .unwrap_or(0)
        };

        let layout = self.image.layout();
        let mut extents = layout.extent_to_file(object_no, 0, layout.object_size())?;
        let overlap = prune_parent_extents(&mut extents, overlap);
        let cow = overlap > 0;
        debug!(
            oid,
            read_offset, read_length, snap_id, overlap, cow, "checked copy-on-write"
        );
        Ok(cow)
    }

    /// Mark the object map of `snap_id` invalid.
    ///
    /// `on_finish` always receives 0.
    pub fn invalidate_object_map(
        &self,
        owner: &OwnerGuard<'_>,
        snap_id: u64,
        force: bool,
        on_finish: Callback,
    ) {
        Request::new(
            self.image.clone(),
            self.dispatcher.mailbox(),
            InvalidateRequest::new(snap_id, force),
            on_finish,
        )
        .send(owner);
    }
}

impl<C> Drop for Writeback<C> {
    fn drop(&mut self) {
        let held = self.queue.queued_writes();
        if held > 0 {
            warn!(held, "dropping writes held while suspended");
        }
    }
}
