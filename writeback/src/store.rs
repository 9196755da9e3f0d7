//! Operations submitted to the object store backing an image.
//!
//! The store is consumed only as "submit an operation, receive a result code on completion".
//! Each submission carries a [Bridge] that the store completes (exactly once) with its native
//! completion token.

use crate::{completion::Bridge, Error};
use bytes::Bytes;
use std::{
    sync::{Arc, Mutex},
    time::SystemTime,
};

/// Flags controlling where reads are served from.
pub mod flags {
    /// No special handling.
    pub const NOFLAG: u32 = 0;
    /// Spread reads across replicas.
    pub const BALANCE_READS: u32 = 0x1;
    /// Serve reads from the closest replica.
    pub const LOCALIZE_READS: u32 = 0x2;
    /// Order reads with respect to in-flight writes.
    pub const ORDER_READS_WRITES: u32 = 0x4;
    /// Bypass any store-side cache.
    pub const IGNORE_CACHE: u32 = 0x8;
}

/// Buffer a read places its data in.
pub type ReadBuf = Arc<Mutex<Vec<u8>>>;

/// Placement hint for an object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Locator {
    pub pool: i64,
    pub namespace: String,
}

/// The snapshots a write must preserve data for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapContext {
    /// The most recent snapshot sequence number.
    pub seq: u64,
    /// Existing snapshots, newest first.
    pub snaps: Vec<u64>,
}

impl SnapContext {
    /// Returns true if `snaps` is sorted newest first and bounded by `seq`.
    pub fn is_valid(&self) -> bool {
        if self.snaps.first().is_some_and(|&newest| newest > self.seq) {
            return false;
        }
        self.snaps.windows(2).all(|pair| pair[0] > pair[1])
    }
}

/// Read `length` bytes at `offset` of an object into `buf`.
#[derive(Clone, Debug)]
pub struct ReadOp {
    pub oid: String,
    pub locator: Locator,
    pub offset: u64,
    pub length: u64,
    pub op_flags: u32,
    pub trunc_size: u64,
    pub trunc_seq: u32,
    pub buf: ReadBuf,
}

/// Write `data` at `offset` of an object.
#[derive(Clone, Debug)]
pub struct WriteOp {
    pub oid: String,
    pub object_no: u64,
    pub locator: Locator,
    pub offset: u64,
    pub data: Bytes,
    pub snapc: SnapContext,
    pub mtime: SystemTime,
    pub trunc_size: u64,
    pub trunc_seq: u32,
}

/// An object store that completes operations asynchronously (and in any order).
pub trait Store: Send + Sync + 'static {
    /// Submit a read. `flags` are the read-consistency flags (see [flags]).
    ///
    /// An error means the operation could not be queued locally. I/O errors are reported
    /// through `bridge`.
    fn aio_read(&self, op: ReadOp, flags: u32, bridge: Bridge) -> Result<(), Error>;

    /// Submit a write. I/O errors are reported through `bridge`.
    fn aio_write(&self, op: WriteOp, bridge: Bridge);

    /// Set the bits of `flags` selected by `mask` on the image header object `oid` for
    /// `snap_id`.
    fn aio_update_flags(
        &self,
        oid: &str,
        snap_id: u64,
        flags: u64,
        mask: u64,
        bridge: Bridge,
    ) -> Result<(), Error>;
}
