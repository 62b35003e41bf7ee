//! Depth-first traversal that hands every entry to a visitor and lets it prune subtrees.
//!
//! Symlinks are never followed, the root included.

use std::fs::Metadata;
use std::path::Path;

use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkDecision {
    /// Entry handled; children of a directory are visited next.
    Recurse,
    /// Children of this directory are not visited.
    SkipSubtree,
    /// Nothing could be done with this entry; move on.
    Continue,
}

/// An entry as seen by the visitor. `metadata` is the `lstat` of `path`, or why it could not be
/// obtained.
pub struct Visit<'a> {
    pub path: &'a Path,
    pub depth: usize,
    pub metadata: Result<Metadata, walkdir::Error>,
}

pub fn walk<F>(root: impl AsRef<Path>, mut visitor: F)
where
    F: FnMut(Visit<'_>) -> WalkDecision,
{
    let root = root.as_ref();
    let mut it = WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false)
        .into_iter();
    while let Some(next) = it.next() {
        let (decision, is_dir) = match next {
            Ok(entry) => {
                let is_dir = entry.file_type().is_dir();
                let decision = visitor(Visit {
                    path: entry.path(),
                    depth: entry.depth(),
                    metadata: entry.metadata(),
                });
                (decision, is_dir)
            }
            Err(err) => {
                let path = err.path().unwrap_or(root).to_owned();
                let depth = err.depth();
                let decision = visitor(Visit {
                    path: &path,
                    depth,
                    metadata: Err(err),
                });
                (decision, false)
            }
        };
        if decision == WalkDecision::SkipSubtree && is_dir {
            it.skip_current_dir();
        }
    }
}
