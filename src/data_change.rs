//! Per-file accumulator of pending byte-range and metadata mutations.

use std::fmt;

use crate::data_region::DataRegion;
use crate::error::FsResult;

/// Everything queued against a single file between journalling and replay.
///
/// The region set is kept pairwise non-overlapping, non-adjacent and sorted
/// by start offset; `add` folds a new region into the set, coalescing
/// transitively with every mergeable member. The metadata scalars record
/// the most recent value the host set while disconnected.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DataChange {
    regions: Vec<DataRegion>,
    ctime: Option<i64>,
    mtime: Option<i64>,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    symlink_target: Option<String>,
    length: Option<u64>,
}

impl fmt::Debug for DataChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChange")
            .field("regions", &self.regions)
            .field("mode", &self.mode)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("length", &self.length)
            .finish()
    }
}

impl DataChange {
    pub fn new() -> DataChange {
        DataChange::default()
    }

    /// Fold a new byte range into the set.
    ///
    /// The incoming region is merged with every member it touches; merging
    /// can bridge previously separate members, so the fold repeats until
    /// nothing else coalesces.
    pub fn add(&mut self, start: u64, end: u64, bytes: Vec<u8>) -> FsResult<()> {
        let mut merged = DataRegion::new(start, end, bytes)?;

        let mut kept = Vec::with_capacity(self.regions.len() + 1);
        for existing in self.regions.drain(..) {
            if existing.can_merge(&merged).is_some() {
                merged = existing.merge_with(&merged)?;
            } else {
                kept.push(existing);
            }
        }

        let at = kept.partition_point(|r: &DataRegion| r.start() < merged.start());
        kept.insert(at, merged);
        self.regions = kept;
        Ok(())
    }

    pub fn regions(&self) -> &[DataRegion] {
        &self.regions
    }

    /// Drop queued data past `new_len` and remember the resulting length.
    ///
    /// Regions wholly beyond the cut vanish; a straddling region is clipped
    /// to `[start, new_len)`.
    pub fn truncate(&mut self, new_len: u64) {
        self.regions = self.regions.iter().filter_map(|r| r.clipped_to(new_len)).collect();
        self.length = Some(new_len);
    }

    pub fn set_ctime(&mut self, ctime: i64) {
        self.ctime = Some(ctime);
    }

    pub fn set_mtime(&mut self, mtime: i64) {
        self.mtime = Some(mtime);
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = Some(mode);
    }

    pub fn set_owner(&mut self, uid: u32, gid: u32) {
        self.uid = Some(uid);
        self.gid = Some(gid);
    }

    pub fn set_symlink_target(&mut self, target: String) {
        self.symlink_target = Some(target);
    }

    pub fn ctime(&self) -> Option<i64> {
        self.ctime
    }

    pub fn mtime(&self) -> Option<i64> {
        self.mtime
    }

    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    pub fn gid(&self) -> Option<u32> {
        self.gid
    }

    pub fn symlink_target(&self) -> Option<&str> {
        self.symlink_target.as_deref()
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    #[doc(hidden)]
    pub fn from_parts(
        regions: Vec<DataRegion>,
        ctime: Option<i64>,
        mtime: Option<i64>,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        symlink_target: Option<String>,
        length: Option<u64>,
    ) -> DataChange {
        DataChange { regions, ctime, mtime, mode, uid, gid, symlink_target, length }
    }
}
