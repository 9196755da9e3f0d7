//! State of an open image shared by every operation against it.
//!
//! [Image] bundles the collaborators an image's I/O needs (object store, optional object map,
//! optional journal) with the locks guarding its mutable metadata:
//!
//! * `owner_lock` guards exclusive-lock [Ownership]. Shared holders ([OwnerGuard]) exclude
//!   ownership transitions.
//! * `snap_lock` guards [Snapshots] (the open snapshot, per-snapshot flags, and the parent
//!   overlap recorded with each snapshot).
//! * `parent_lock` guards the live [Parent] link of a cloned image.
//!
//! When more than one is needed they are taken in the order listed.

use crate::{
    journal::Journal,
    layout::Layout,
    object_map::ObjectMap,
    store::{flags, Store},
    Error, HEAD_SNAP,
};
use std::{
    collections::BTreeMap,
    ops::Deref,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::debug;

/// Optional image features.
pub mod features {
    pub const EXCLUSIVE_LOCK: u64 = 1 << 2;
    pub const OBJECT_MAP: u64 = 1 << 3;
    pub const FAST_DIFF: u64 = 1 << 4;
}

/// Per-revision image flags.
pub mod image_flags {
    /// The object map of the revision can no longer be trusted.
    pub const OBJECT_MAP_INVALID: u64 = 1 << 0;
    /// The fast-diff state of the revision can no longer be trusted.
    pub const FAST_DIFF_INVALID: u64 = 1 << 1;
}

/// Configuration for an [Image].
#[derive(Clone, Debug)]
pub struct Config {
    /// Unique id of the image (names its header object).
    pub id: String,

    /// Prefix shared by the names of all backing objects.
    pub object_prefix: String,

    /// How the image is striped over its backing objects.
    pub layout: Layout,

    /// Enabled [features].
    pub features: u64,

    /// Read flags applied to every read.
    pub extra_read_flags: u32,

    /// Spread snapshot reads across replicas.
    pub balance_snap_reads: bool,

    /// Serve snapshot reads from the closest replica (ignored if `balance_snap_reads` is set).
    pub localize_snap_reads: bool,
}

/// Exclusive-lock ownership of an image.
#[derive(Debug, Default)]
pub struct Ownership {
    lock_owner: bool,
}

impl Ownership {
    /// Returns true if this client holds the image's exclusive lock.
    pub fn is_lock_owner(&self) -> bool {
        self.lock_owner
    }
}

/// Shared hold on the ownership lock of an [Image].
///
/// Operations that mutate backing objects take a reference to one of these as proof that no
/// ownership transition can happen while they run.
pub struct OwnerGuard<'a> {
    image: &'a Image,
    guard: RwLockReadGuard<'a, Ownership>,
}

impl OwnerGuard<'_> {
    /// Returns true if this guard holds the ownership lock of `image`.
    pub fn is_for(&self, image: &Image) -> bool {
        std::ptr::eq(self.image, image)
    }
}

impl Deref for OwnerGuard<'_> {
    type Target = Ownership;

    fn deref(&self) -> &Ownership {
        &self.guard
    }
}

/// Link from a cloned image to its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parent {
    /// Number of bytes at the start of the image still backed by the parent.
    pub overlap: u64,
}

/// Metadata recorded for a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapInfo {
    /// Parent overlap at the time the snapshot was taken (none if the image had no parent).
    pub parent_overlap: Option<u64>,
    /// [image_flags] of the snapshot.
    pub flags: u64,
}

/// Snapshot metadata of an image.
#[derive(Debug)]
pub struct Snapshots {
    snap_id: u64,
    head_flags: u64,
    snaps: BTreeMap<u64, SnapInfo>,
}

impl Default for Snapshots {
    fn default() -> Self {
        Self {
            snap_id: HEAD_SNAP,
            head_flags: 0,
            snaps: BTreeMap::new(),
        }
    }
}

impl Snapshots {
    /// The revision the image is open at ([HEAD_SNAP] for the live image).
    pub fn snap_id(&self) -> u64 {
        self.snap_id
    }

    /// Open the image at `snap_id`.
    pub fn set_snap(&mut self, snap_id: u64) -> Result<(), Error> {
        if snap_id != HEAD_SNAP && !self.snaps.contains_key(&snap_id) {
            return Err(Error::SnapshotNotFound(snap_id));
        }
        self.snap_id = snap_id;
        Ok(())
    }

    /// Record a snapshot.
    pub fn add(&mut self, snap_id: u64, info: SnapInfo) {
        self.snaps.insert(snap_id, info);
    }

    /// Forget a snapshot.
    pub fn remove(&mut self, snap_id: u64) -> Option<SnapInfo> {
        self.snaps.remove(&snap_id)
    }

    /// The [image_flags] of `snap_id`.
    pub fn flags(&self, snap_id: u64) -> Result<u64, Error> {
        if snap_id == HEAD_SNAP {
            return Ok(self.head_flags);
        }
        self.snaps
            .get(&snap_id)
            .map(|info| info.flags)
            .ok_or(Error::SnapshotNotFound(snap_id))
    }

    /// Returns true if any bit of `flags` is set for the open revision.
    pub fn test_flags(&self, flags: u64) -> Result<bool, Error> {
        Ok(self.flags(self.snap_id)? & flags != 0)
    }

    /// Set (`enabled`) or clear the bits of `flags` on `snap_id`.
    pub fn update_flags(&mut self, snap_id: u64, flags: u64, enabled: bool) -> Result<(), Error> {
        let current = if snap_id == HEAD_SNAP {
            &mut self.head_flags
        } else {
            &mut self
                .snaps
                .get_mut(&snap_id)
                .ok_or(Error::SnapshotNotFound(snap_id))?
                .flags
        };
        if enabled {
            *current |= flags;
        } else {
            *current &= !flags;
        }
        Ok(())
    }

    /// Bytes of the image still backed by the parent as of `snap_id`.
    ///
    /// Returns `None` if the revision has no parent or the snapshot is unknown.
    pub fn parent_overlap(&self, parent: Option<&Parent>, snap_id: u64) -> Option<u64> {
        if snap_id == HEAD_SNAP {
            return parent.map(|parent| parent.overlap);
        }
        self.snaps.get(&snap_id)?.parent_overlap
    }
}

/// An open image.
pub struct Image {
    cfg: Config,

    owner_lock: RwLock<Ownership>,
    snap_lock: RwLock<Snapshots>,
    parent_lock: RwLock<Option<Parent>>,

    store: Arc<dyn Store>,
    object_map: Option<Arc<dyn ObjectMap>>,
    journal: Option<Arc<dyn Journal>>,
}

impl Image {
    /// Open an image at its head revision, backed by `store`.
    pub fn new(cfg: Config, store: Arc<dyn Store>) -> Self {
        Self {
            cfg,
            owner_lock: RwLock::new(Ownership::default()),
            snap_lock: RwLock::new(Snapshots::default()),
            parent_lock: RwLock::new(None),
            store,
            object_map: None,
            journal: None,
        }
    }

    /// Consult `object_map` before reading objects.
    pub fn with_object_map(mut self, object_map: Arc<dyn ObjectMap>) -> Self {
        self.object_map = Some(object_map);
        self
    }

    /// Gate journaled writes on `journal`.
    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Link the image to a parent.
    pub fn with_parent(self, parent: Parent) -> Self {
        *self.parent_lock.write().unwrap() = Some(parent);
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn layout(&self) -> &Layout {
        &self.cfg.layout
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn journal(&self) -> Option<&Arc<dyn Journal>> {
        self.journal.as_ref()
    }

    /// Name of the object holding the image header.
    pub fn header_oid(&self) -> String {
        format!("rbd_header.{}", self.cfg.id)
    }

    /// Returns true if every feature in `features` is enabled.
    pub fn test_features(&self, features: u64) -> bool {
        self.cfg.features & features == features
    }

    /// Take the ownership lock in shared mode.
    pub fn owner_read(&self) -> OwnerGuard<'_> {
        OwnerGuard {
            image: self,
            guard: self.owner_lock.read().unwrap(),
        }
    }

    /// Take ownership of the image's exclusive lock.
    pub fn acquire_lock(&self) {
        let mut ownership = self.owner_lock.write().unwrap();
        ownership.lock_owner = true;
        debug!(image = %self.cfg.id, "acquired exclusive lock");
    }

    /// Give up ownership of the image's exclusive lock.
    pub fn release_lock(&self) {
        let mut ownership = self.owner_lock.write().unwrap();
        ownership.lock_owner = false;
        debug!(image = %self.cfg.id, "released exclusive lock");
    }

    /// Take the snapshot lock in shared mode.
    pub fn snaps(&self) -> RwLockReadGuard<'_, Snapshots> {
        self.snap_lock.read().unwrap()
    }

    /// Take the snapshot lock in exclusive mode.
    pub fn snaps_mut(&self) -> RwLockWriteGuard<'_, Snapshots> {
        self.snap_lock.write().unwrap()
    }

    /// Take the parent lock in shared mode.
    pub fn parent(&self) -> RwLockReadGuard<'_, Option<Parent>> {
        self.parent_lock.read().unwrap()
    }

    /// Take the parent lock in exclusive mode.
    pub fn parent_mut(&self) -> RwLockWriteGuard<'_, Option<Parent>> {
        self.parent_lock.write().unwrap()
    }

    /// Read-consistency flags for a read of `snap_id`.
    pub fn read_flags(&self, snap_id: u64) -> u32 {
        let read_flags = flags::NOFLAG | self.cfg.extra_read_flags;
        if snap_id == HEAD_SNAP {
            return read_flags;
        }
        if self.cfg.balance_snap_reads {
            read_flags | flags::BALANCE_READS
        } else if self.cfg.localize_snap_reads {
            read_flags | flags::LOCALIZE_READS
        } else {
            read_flags
        }
    }

    /// Returns false only if the object map proves `object_no` does not exist.
    pub fn object_may_exist(&self, object_no: u64) -> bool {
        let Some(object_map) = &self.object_map else {
            return true;
        };

        // An invalid (or unreadable) map can't rule anything out
        let snaps = self.snaps();
        match snaps.test_flags(image_flags::OBJECT_MAP_INVALID) {
            Ok(false) => object_map.object_may_exist(object_no),
            Ok(true) | Err(_) => true,
        }
    }
}
