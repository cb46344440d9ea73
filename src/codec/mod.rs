//! Versioned binary encoding for the durable state files.
//!
//! Both `sync.log` and `permissions.ovr` share the same envelope: a 4-byte
//! magic, a format version and a role tag, followed by role-specific
//! records built out of the primitives in [`primitive`]. The format is
//! self-contained so the journal survives process restarts and upgrades
//! that keep the version number.

pub mod primitive;

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive as _, ToPrimitive as _};

use crate::data_change::DataChange;
use crate::data_region::DataRegion;
use crate::perms_overlay::FilePerms;
use crate::sync_item::SyncItem;
use crate::types::FileKind;

/// Envelope magic: `TSUM`.
pub const MAGIC: [u8; 4] = *b"TSUM";

/// Current format version.
pub const VERSION: u32 = 1;

/// Decoding errors.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    BadMagic,
    UnsupportedVersion(u32),
    WrongRole,
    TagMismatch,
    ElemTooLarge,
    BadString,
    BadRegion,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "i/o error: {err}"),
            Error::BadMagic => write!(f, "bad magic"),
            Error::UnsupportedVersion(v) => write!(f, "unsupported format version {v}"),
            Error::WrongRole => write!(f, "file role does not match expectation"),
            Error::TagMismatch => write!(f, "unknown tag value"),
            Error::ElemTooLarge => write!(f, "element length exceeds limit"),
            Error::BadString => write!(f, "malformed string"),
            Error::BadRegion => write!(f, "malformed data region"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a state file holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Role {
    SyncLog = 1,
    PermsOverlay = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
enum ItemTag {
    New = 1,
    Link = 2,
    Unlink = 3,
    Change = 4,
    Rename = 5,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
enum KindTag {
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Socket = 4,
    Fifo = 5,
    CharDevice = 6,
    BlockDevice = 7,
}

fn put_envelope(dst: &mut impl Write, role: Role) -> Result<()> {
    dst.write_all(&MAGIC).map_err(Error::Io)?;
    primitive::put_u32(dst, VERSION)?;
    primitive::put_u8(dst, role.to_u8().unwrap_or(0))
}

fn envelope(src: &mut impl Read, expected: Role) -> Result<()> {
    let mut magic = [0u8; 4];
    src.read_exact(&mut magic).map_err(Error::Io)?;
    if magic != MAGIC {
        return Err(Error::BadMagic);
    }
    let version = primitive::u32(src)?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let role = Role::from_u8(primitive::u8(src)?).ok_or(Error::TagMismatch)?;
    if role != expected {
        return Err(Error::WrongRole);
    }
    Ok(())
}

fn put_kind(dst: &mut impl Write, kind: FileKind) -> Result<()> {
    match kind {
        FileKind::Regular => primitive::put_u8(dst, KindTag::Regular as u8),
        FileKind::Directory => primitive::put_u8(dst, KindTag::Directory as u8),
        FileKind::Symlink => primitive::put_u8(dst, KindTag::Symlink as u8),
        FileKind::Socket => primitive::put_u8(dst, KindTag::Socket as u8),
        FileKind::Fifo => primitive::put_u8(dst, KindTag::Fifo as u8),
        FileKind::CharDevice { major, minor } => {
            primitive::put_u8(dst, KindTag::CharDevice as u8)?;
            primitive::put_u32(dst, major)?;
            primitive::put_u32(dst, minor)
        }
        FileKind::BlockDevice { major, minor } => {
            primitive::put_u8(dst, KindTag::BlockDevice as u8)?;
            primitive::put_u32(dst, major)?;
            primitive::put_u32(dst, minor)
        }
    }
}

fn kind(src: &mut impl Read) -> Result<FileKind> {
    let tag = KindTag::from_u8(primitive::u8(src)?).ok_or(Error::TagMismatch)?;
    Ok(match tag {
        KindTag::Regular => FileKind::Regular,
        KindTag::Directory => FileKind::Directory,
        KindTag::Symlink => FileKind::Symlink,
        KindTag::Socket => FileKind::Socket,
        KindTag::Fifo => FileKind::Fifo,
        KindTag::CharDevice => {
            let major = primitive::u32(src)?;
            let minor = primitive::u32(src)?;
            FileKind::CharDevice { major, minor }
        }
        KindTag::BlockDevice => {
            let major = primitive::u32(src)?;
            let minor = primitive::u32(src)?;
            FileKind::BlockDevice { major, minor }
        }
    })
}

fn put_item(dst: &mut impl Write, item: &SyncItem) -> Result<()> {
    match item {
        SyncItem::New { kind, path } => {
            primitive::put_u8(dst, ItemTag::New as u8)?;
            put_kind(dst, *kind)?;
            primitive::put_path(dst, path)
        }
        SyncItem::Link { inode, path } => {
            primitive::put_u8(dst, ItemTag::Link as u8)?;
            primitive::put_u64(dst, *inode)?;
            primitive::put_path(dst, path)
        }
        SyncItem::Unlink { kind, path } => {
            primitive::put_u8(dst, ItemTag::Unlink as u8)?;
            put_kind(dst, *kind)?;
            primitive::put_path(dst, path)
        }
        SyncItem::Change { path, inode } => {
            primitive::put_u8(dst, ItemTag::Change as u8)?;
            primitive::put_path(dst, path)?;
            primitive::put_u64(dst, *inode)
        }
        SyncItem::Rename { inode, old_path, new_path } => {
            primitive::put_u8(dst, ItemTag::Rename as u8)?;
            primitive::put_u64(dst, *inode)?;
            primitive::put_path(dst, old_path)?;
            primitive::put_path(dst, new_path)
        }
    }
}

fn item(src: &mut impl Read) -> Result<SyncItem> {
    let tag = ItemTag::from_u8(primitive::u8(src)?).ok_or(Error::TagMismatch)?;
    Ok(match tag {
        ItemTag::New => {
            let kind = kind(src)?;
            let path = primitive::path(src)?;
            SyncItem::New { kind, path }
        }
        ItemTag::Link => {
            let inode = primitive::u64(src)?;
            let path = primitive::path(src)?;
            SyncItem::Link { inode, path }
        }
        ItemTag::Unlink => {
            let kind = kind(src)?;
            let path = primitive::path(src)?;
            SyncItem::Unlink { kind, path }
        }
        ItemTag::Change => {
            let path = primitive::path(src)?;
            let inode = primitive::u64(src)?;
            SyncItem::Change { path, inode }
        }
        ItemTag::Rename => {
            let inode = primitive::u64(src)?;
            let old_path = primitive::path(src)?;
            let new_path = primitive::path(src)?;
            SyncItem::Rename { inode, old_path, new_path }
        }
    })
}

fn put_change(dst: &mut impl Write, change: &DataChange) -> Result<()> {
    primitive::put_u32(dst, change.regions().len() as u32)?;
    for region in change.regions() {
        primitive::put_u64(dst, region.start())?;
        primitive::put_u64(dst, region.end())?;
        primitive::put_bytes(dst, region.bytes())?;
    }
    primitive::put_option(dst, change.ctime().as_ref(), |d, v| primitive::put_i64(d, *v))?;
    primitive::put_option(dst, change.mtime().as_ref(), |d, v| primitive::put_i64(d, *v))?;
    primitive::put_option(dst, change.mode().as_ref(), |d, v| primitive::put_u32(d, *v))?;
    primitive::put_option(dst, change.uid().as_ref(), |d, v| primitive::put_u32(d, *v))?;
    primitive::put_option(dst, change.gid().as_ref(), |d, v| primitive::put_u32(d, *v))?;
    primitive::put_option(dst, change.symlink_target().as_ref(), |d, v| {
        primitive::put_string(d, v)
    })?;
    primitive::put_option(dst, change.length().as_ref(), |d, v| primitive::put_u64(d, *v))
}

fn change(src: &mut impl Read) -> Result<DataChange> {
    let count = primitive::u32(src)? as usize;
    let mut regions = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let start = primitive::u64(src)?;
        let end = primitive::u64(src)?;
        let bytes = primitive::bytes(src)?;
        regions.push(DataRegion::new(start, end, bytes).map_err(|_| Error::BadRegion)?);
    }
    let ctime = primitive::option(src, primitive::i64)?;
    let mtime = primitive::option(src, primitive::i64)?;
    let mode = primitive::option(src, primitive::u32)?;
    let uid = primitive::option(src, primitive::u32)?;
    let gid = primitive::option(src, primitive::u32)?;
    let symlink_target = primitive::option(src, primitive::string)?;
    let length = primitive::option(src, primitive::u64)?;
    Ok(DataChange::from_parts(regions, ctime, mtime, mode, uid, gid, symlink_target, length))
}

/// Serialize the journal queue and its change map.
pub fn encode_log(
    queue: &VecDeque<SyncItem>,
    changes: &HashMap<u64, DataChange>,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    put_envelope(&mut buf, Role::SyncLog)?;
    primitive::put_u32(&mut buf, queue.len() as u32)?;
    for entry in queue {
        put_item(&mut buf, entry)?;
    }
    primitive::put_u32(&mut buf, changes.len() as u32)?;
    let mut inodes: Vec<&u64> = changes.keys().collect();
    inodes.sort();
    for inode in inodes {
        primitive::put_u64(&mut buf, *inode)?;
        put_change(&mut buf, &changes[inode])?;
    }
    Ok(buf)
}

/// Decode a journal file produced by [`encode_log`].
pub fn decode_log(data: &[u8]) -> Result<(VecDeque<SyncItem>, HashMap<u64, DataChange>)> {
    let mut src = Cursor::new(data);
    envelope(&mut src, Role::SyncLog)?;
    let queue_len = primitive::u32(&mut src)? as usize;
    let mut queue = VecDeque::with_capacity(queue_len.min(4096));
    for _ in 0..queue_len {
        queue.push_back(item(&mut src)?);
    }
    let map_len = primitive::u32(&mut src)? as usize;
    let mut changes = HashMap::with_capacity(map_len.min(4096));
    for _ in 0..map_len {
        let inode = primitive::u64(&mut src)?;
        changes.insert(inode, change(&mut src)?);
    }
    Ok((queue, changes))
}

/// Serialize the permissions overlay.
pub fn encode_overlay(overlay: &HashMap<u64, FilePerms>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    put_envelope(&mut buf, Role::PermsOverlay)?;
    primitive::put_u32(&mut buf, overlay.len() as u32)?;
    let mut inodes: Vec<&u64> = overlay.keys().collect();
    inodes.sort();
    for inode in inodes {
        let perms = &overlay[inode];
        primitive::put_u64(&mut buf, *inode)?;
        primitive::put_u32(&mut buf, perms.uid)?;
        primitive::put_u32(&mut buf, perms.gid)?;
        primitive::put_u32(&mut buf, perms.mode)?;
    }
    Ok(buf)
}

/// Decode an overlay file produced by [`encode_overlay`].
pub fn decode_overlay(data: &[u8]) -> Result<HashMap<u64, FilePerms>> {
    let mut src = Cursor::new(data);
    envelope(&mut src, Role::PermsOverlay)?;
    let len = primitive::u32(&mut src)? as usize;
    let mut overlay = HashMap::with_capacity(len.min(4096));
    for _ in 0..len {
        let inode = primitive::u64(&mut src)?;
        let uid = primitive::u32(&mut src)?;
        let gid = primitive::u32(&mut src)?;
        let mode = primitive::u32(&mut src)?;
        overlay.insert(inode, FilePerms { uid, gid, mode });
    }
    Ok(overlay)
}
