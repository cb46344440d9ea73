//! Contiguous byte-range mutations and their merge algebra.

use std::fmt;

use crate::error::{FsError, FsResult};

/// How one region lines up against another, from the incoming region's
/// point of view. Anything but `None` means the two can fold into a single
/// contiguous region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergeKind {
    /// Identical interval.
    Perfect,
    /// Incoming sits strictly inside this region.
    Inner,
    /// Incoming covers this region entirely.
    Outer,
    /// Incoming ends exactly where this region starts.
    AdjacentLeft,
    /// Incoming starts exactly where this region ends.
    AdjacentRight,
    /// Incoming overlaps this region's left edge.
    OverlapLeft,
    /// Incoming overlaps this region's right edge.
    OverlapRight,
}

/// A half-open `[start, end)` run of bytes within a file.
#[derive(Clone, PartialEq, Eq)]
pub struct DataRegion {
    start: u64,
    end: u64,
    bytes: Vec<u8>,
}

impl fmt::Debug for DataRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataRegion[{}:{}] ({} bytes)", self.start, self.end, self.bytes.len())
    }
}

impl DataRegion {
    /// Build a region, validating that the interval is non-empty and the
    /// byte count matches it.
    pub fn new(start: u64, end: u64, bytes: Vec<u8>) -> FsResult<DataRegion> {
        if end <= start {
            return Err(FsError::InvalidArgument);
        }
        if bytes.len() as u64 != end - start {
            return Err(FsError::InvalidArgument);
        }
        Ok(DataRegion { start, end, bytes })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        false // an empty interval cannot be constructed
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Classify how `incoming` relates to this region, or `None` when the
    /// two neither overlap nor touch.
    pub fn can_merge(&self, incoming: &DataRegion) -> Option<MergeKind> {
        if incoming.start == self.start && incoming.end == self.end {
            Some(MergeKind::Perfect)
        } else if incoming.start <= self.start && incoming.end >= self.end {
            Some(MergeKind::Outer)
        } else if incoming.start > self.start && incoming.end < self.end {
            Some(MergeKind::Inner)
        } else if incoming.end == self.start {
            Some(MergeKind::AdjacentLeft)
        } else if incoming.start == self.end {
            Some(MergeKind::AdjacentRight)
        } else if incoming.start < self.start && incoming.end > self.start {
            Some(MergeKind::OverlapLeft)
        } else if incoming.start < self.end && incoming.end > self.end {
            Some(MergeKind::OverlapRight)
        } else {
            None
        }
    }

    /// Fold `incoming` into this region, producing one contiguous region.
    ///
    /// Wherever the two intervals both cover a byte the incoming operand's
    /// bytes win: the journal records writes in arrival order, so the later
    /// write is the truth.
    pub fn merge_with(&self, incoming: &DataRegion) -> FsResult<DataRegion> {
        let kind = self.can_merge(incoming).ok_or(FsError::InvalidArgument)?;

        let region = match kind {
            MergeKind::Perfect | MergeKind::Outer => incoming.clone(),
            MergeKind::Inner => {
                let head = (incoming.start - self.start) as usize;
                let tail = (incoming.end - self.start) as usize;
                let mut bytes = Vec::with_capacity(self.bytes.len());
                bytes.extend_from_slice(&self.bytes[..head]);
                bytes.extend_from_slice(&incoming.bytes);
                bytes.extend_from_slice(&self.bytes[tail..]);
                DataRegion { start: self.start, end: self.end, bytes }
            }
            MergeKind::AdjacentLeft | MergeKind::OverlapLeft => {
                let tail = (incoming.end - self.start) as usize;
                let mut bytes = incoming.bytes.clone();
                bytes.extend_from_slice(&self.bytes[tail..]);
                DataRegion { start: incoming.start, end: self.end, bytes }
            }
            MergeKind::AdjacentRight | MergeKind::OverlapRight => {
                let head = (incoming.start - self.start) as usize;
                let mut bytes = Vec::with_capacity(head + incoming.bytes.len());
                bytes.extend_from_slice(&self.bytes[..head]);
                bytes.extend_from_slice(&incoming.bytes);
                DataRegion { start: self.start, end: incoming.end, bytes }
            }
        };

        debug_assert_eq!(region.bytes.len() as u64, region.end - region.start);
        Ok(region)
    }

    /// Clip the region to end at `limit`. Returns `None` when nothing of it
    /// survives.
    pub fn clipped_to(&self, limit: u64) -> Option<DataRegion> {
        if self.start >= limit {
            None
        } else if self.end <= limit {
            Some(self.clone())
        } else {
            let keep = (limit - self.start) as usize;
            Some(DataRegion {
                start: self.start,
                end: limit,
                bytes: self.bytes[..keep].to_vec(),
            })
        }
    }
}
