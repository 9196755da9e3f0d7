//! Order and journal-gate writes between a block image and the object store backing it.
//!
//! Every image-level I/O is translated into one or more operations against the backing
//! objects of an image. [Writeback] issues those operations, delivers completions back to
//! the caller under the correct locks, and enforces two guarantees the object store does not
//! provide on its own:
//!
//! * **Per-object ordering**: completions for writes to the same object are delivered in the
//!   order the writes were submitted, even when the store finishes them out of order.
//! * **Write-ahead journaling**: a write tagged with a journal transaction id is not sent to
//!   the store until the journal reports the transaction safe, and the applied extents are
//!   recorded back into the journal once the write finishes.
//!
//! # Completions
//!
//! All outcomes are reported through single-shot completions carrying a signed result code
//! (negative values are `errno` codes, non-negative values indicate success). There is no
//! secondary error channel: a failed write still completes in its FIFO position and does not
//! hold back writes queued behind it.
//!
//! # Locking
//!
//! Two locks are involved whenever a completion is delivered:
//!
//! * the image-ownership lock ([image::OwnerGuard]), a reader/writer lock that excludes
//!   exclusive-lock transitions, and
//! * the coordination lock guarding [ordering::State], which also protects the caller's
//!   cache state `C`.
//!
//! Wherever both are needed they are taken in that order and released in reverse.
//!
//! Ownership transitions should be bracketed by [queue::WriteQueue::suspend_writes] and
//! [queue::WriteQueue::resume_writes] so no write is in flight while ownership changes.
//!
//! # Status
//!
//! `commonware-writeback` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use thiserror::Error;

pub mod completion;
pub mod dispatcher;
pub mod image;
pub mod journal;
pub mod layout;
mod metrics;
pub mod object_map;
pub mod ordering;
pub mod queue;
mod read;
pub mod request;
pub mod store;
mod writeback;
pub use writeback::{Config, ReadRequest, WriteRequest, Writeback};

#[cfg(test)]
mod mocks;

/// Snapshot id of the live (head) revision of an image.
pub const HEAD_SNAP: u64 = u64::MAX - 1;

/// Errors that can occur when interacting with the writeback layer.
///
/// These are returned synchronously, before any operation is submitted. Outcomes of submitted
/// operations are reported through completion result codes instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid object name: {0}")]
    InvalidObjectName(String),
    #[error("invalid layout: {0}")]
    InvalidLayout(&'static str),
    #[error("range out of bounds of object {0}: offset={1} length={2}")]
    OutOfRange(u64, u64, u64),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(u64),
    #[error("operation rejected by store: {0}")]
    Rejected(i32),
    #[error("unable to spawn dispatcher: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Error {
    /// Map the error onto the (negative) result code a completion would carry.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidObjectName(_) | Error::InvalidLayout(_) | Error::OutOfRange(..) => {
                -libc::EINVAL
            }
            Error::SnapshotNotFound(_) => -libc::ENOENT,
            Error::Rejected(r) => *r,
            Error::Spawn(err) => -err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
