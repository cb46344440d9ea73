//! Conflict artifacts.
//!
//! When replay finds the upstream diverged underneath a queued mutation,
//! the local side of the divergence is written out as a human-readable
//! change-set record in the conflict directory instead of being discarded.
//! Artifacts are append-only: repeated conflicts on the same path stack
//! further change sets into the same file, joined into one `changesets`
//! list. The artifact itself enters the journal so it propagates upstream
//! like any other new file.

use std::fmt::Write as _;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::context::{CoreContext, Layout};
use crate::error::{map_io_error, FsResult};
use crate::types::{FileKind, S_IFDIR, S_IFREG};

/// One recorded divergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    Patch { start: u64, end: u64, data: Vec<u8> },
    Truncate { pos: u64 },
    Rename { new_name: String },
    Unlink,
    Link { new_name: String },
}

/// A group of records stamped with the moment the conflict was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    timestamp: u64,
    subject: String,
    changes: Vec<ChangeRecord>,
}

impl ChangeSet {
    pub fn new(subject: &Path) -> ChangeSet {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        ChangeSet { timestamp, subject: subject.display().to_string(), changes: Vec::new() }
    }

    pub fn push(&mut self, record: ChangeRecord) {
        self.changes.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Render the artifact block: preamble comment, the set, and the
    /// postamble joining it onto the running `changesets` list.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "# --- conflict recorded at {} for {} ---",
            self.timestamp, self.subject
        );
        let _ = writeln!(out, "set = ChangeSet({})", self.timestamp);
        for record in &self.changes {
            match record {
                ChangeRecord::Patch { start, end, data } => {
                    let _ = writeln!(
                        out,
                        "set.addChange(type_=\"patch\", start={}, end={}, data={})",
                        start,
                        end,
                        bytes_literal(data)
                    );
                }
                ChangeRecord::Truncate { pos } => {
                    let _ = writeln!(out, "set.addChange(type_=\"truncate\", pos={pos})");
                }
                ChangeRecord::Rename { new_name } => {
                    let _ = writeln!(
                        out,
                        "set.addChange(type_=\"rename\", newname={})",
                        string_literal(new_name)
                    );
                }
                ChangeRecord::Unlink => {
                    let _ = writeln!(out, "set.addChange(type_=\"unlink\")");
                }
                ChangeRecord::Link { new_name } => {
                    let _ = writeln!(
                        out,
                        "set.addChange(type_=\"link\", newname={})",
                        string_literal(new_name)
                    );
                }
            }
        }
        let _ = writeln!(out, "changesets = changesets + [set]");
        out.push('\n');
        out
    }
}

/// Render bytes as a literal: printable ASCII stays, the rest escapes.
fn bytes_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b\"");
    for &byte in data {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(byte as char),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            other => {
                let _ = write!(out, "\\x{other:02x}");
            }
        }
    }
    out.push('"');
    out
}

fn string_literal(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Write a change set into the conflict directory, creating the directory
/// and the artifact on first use and journalling both so they reach the
/// upstream.
pub async fn materialize(ctx: &CoreContext, conflicted: &Path, set: ChangeSet) -> FsResult<()> {
    info!(path = %conflicted.display(), "materializing conflict");

    let conflict_dir = ctx.layout.conflict_dir.clone();
    let dir_cpath = ctx.layout.cache_path_of(&conflict_dir);
    if tokio::fs::symlink_metadata(&dir_cpath).await.is_err() {
        ctx.cache.make_dir(&conflict_dir, 0o755).await?;
        ctx.overlay.set(&dir_cpath, 0, 0, S_IFDIR | 0o755)?;
        ctx.sync_log.add_new(FileKind::Directory, &conflict_dir);
    }

    let artifact = conflict_dir.join(Layout::conflict_slug(conflicted));
    let artifact_cpath = ctx.layout.cache_path_of(&artifact);
    let existed = tokio::fs::symlink_metadata(&artifact_cpath).await.is_ok();

    if !existed {
        ctx.cache.make_special(&artifact).await?;
        ctx.overlay.set(&artifact_cpath, 0, 0, S_IFREG | 0o644)?;
        ctx.sync_log.add_new(FileKind::Regular, &artifact);
    }

    let old_len = ctx.cache.cache_size(&artifact).await.unwrap_or(0);
    let rendered = set.render();
    {
        let _guard = ctx.cache.lock(&artifact).await;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&artifact_cpath)
            .await
            .map_err(map_io_error)?;
        file.write_all(rendered.as_bytes()).await.map_err(map_io_error)?;
        file.flush().await.map_err(map_io_error)?;
    }
    ctx.cache.invalidate_stat(&artifact);

    // An artifact that already replayed upstream journals its growth the
    // way any write does; a zero pre-image matches the bytes past the old
    // end on both sides.
    if existed && !ctx.sync_log.is_new_file(&artifact) {
        let new_len = old_len + rendered.len() as u64;
        let inode = ctx.cache.cache_inode(&artifact).await?;
        if let Err(err) = ctx.sync_log.add_change(
            &artifact,
            inode,
            old_len,
            new_len,
            vec![0; rendered.len()],
        ) {
            warn!("unable to journal conflict artifact growth: {err:?}");
        }
    }

    Ok(())
}
