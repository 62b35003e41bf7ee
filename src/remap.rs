//! Re-owning of files still owned by the image's baked-in identity.

use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::AtFlags;
use nix::unistd::{Gid, Uid};

use crate::log_sink::LogSink;
use crate::parse_mounts::MountTable;
use crate::utils::nix_retry;
use crate::walk::{walk, Visit, WalkDecision};
use crate::{sink_info, sink_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ownership {
    pub uid: Uid,
    pub gid: Gid,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
        }
    }
}

/// Changes the owner of a path itself, never of what a symlink points to.
pub trait Chown {
    fn lchown(&mut self, path: &Path, to: Ownership) -> Result<(), Errno>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemChown;

impl Chown for SystemChown {
    fn lchown(&mut self, path: &Path, to: Ownership) -> Result<(), Errno> {
        nix_retry!(nix::unistd::fchownat(
            None,
            path,
            Some(to.uid),
            Some(to.gid),
            AtFlags::AT_SYMLINK_NOFOLLOW,
        ))
    }
}

/// What to do with one entry, given where it lives and who owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Chown,
    Leave,
    /// On another filesystem mounted below the walked root.
    Boundary,
}

pub fn classify(entry_mount: &Path, root_mount: &Path, owner: Ownership, from: Ownership) -> EntryAction {
    if entry_mount != root_mount {
        EntryAction::Boundary
    } else if owner == from {
        EntryAction::Chown
    } else {
        EntryAction::Leave
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapReport {
    pub visited: usize,
    pub changed: usize,
    pub failed: usize,
    pub uninspectable: usize,
    pub boundaries: usize,
    pub missing_roots: usize,
}

/// Re-own every entry under `roots` owned by exactly `from` to `to`, staying on the filesystem
/// each root lives on. Per-entry failures are logged and counted, never fatal.
pub fn remap_ownership<C: Chown>(
    roots: &[PathBuf],
    from: Ownership,
    to: Ownership,
    mounts: &MountTable,
    chown: &mut C,
    sink: &dyn LogSink,
) -> RemapReport {
    let mut report = RemapReport::default();
    for root in roots {
        if let Err(e) = std::fs::metadata(root) {
            sink_warn!(sink, "error accessing path {}: {e}", root.display());
            report.missing_roots += 1;
            continue;
        }
        let root = std::path::absolute(root).unwrap_or_else(|_| root.clone());
        let root_mount = mounts.find_mount_point(&root);

        sink_info!(sink, "recursively searching path {}", root.display());
        walk(&root, |visit| {
            visit_entry(visit, &root_mount, from, to, mounts, chown, sink, &mut report)
        });
    }
    report
}

#[allow(clippy::too_many_arguments)]
fn visit_entry<C: Chown>(
    visit: Visit<'_>,
    root_mount: &Path,
    from: Ownership,
    to: Ownership,
    mounts: &MountTable,
    chown: &mut C,
    sink: &dyn LogSink,
    report: &mut RemapReport,
) -> WalkDecision {
    report.visited += 1;
    let meta = match visit.metadata {
        Ok(meta) => meta,
        Err(e) => {
            sink_warn!(sink, "error when visiting {}: {e}", visit.path.display());
            report.uninspectable += 1;
            return WalkDecision::Continue;
        }
    };
    let owner = Ownership::new(meta.uid(), meta.gid());
    let entry_mount = mounts.find_mount_point(visit.path);

    match classify(&entry_mount, root_mount, owner, from) {
        EntryAction::Boundary => {
            if owner == from {
                sink_info!(sink, "skipping mounted path {}", visit.path.display());
            }
            report.boundaries += 1;
            WalkDecision::SkipSubtree
        }
        EntryAction::Chown => {
            sink_info!(sink, "chown {}", visit.path.display());
            match chown.lchown(visit.path, to) {
                Ok(()) => report.changed += 1,
                Err(e) => {
                    sink_warn!(sink, "error changing owner of {}: {e}", visit.path.display());
                    report.failed += 1;
                }
            }
            WalkDecision::Recurse
        }
        EntryAction::Leave => WalkDecision::Recurse,
    }
}
