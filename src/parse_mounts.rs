use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use bstr::{BStr, BString, ByteSlice};

use crate::utils::path_from_bytes;

#[derive(Debug, thiserror::Error)]
#[error("can't read mount table {}: {source}", path.display())]
pub struct MountTableError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Mount points of the live system, lexically canonicalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    points: HashSet<PathBuf>,
}

/// This function takes a string, and returns the same string but with every \XXX converted from
/// octal to the corresponding byte.
///
/// A backslash that does not start a valid octal escape is kept as is.
fn unescape(s: impl AsRef<BStr>) -> BString {
    fn unescape_inner(s: &BStr) -> BString {
        let s = s.as_bytes();
        let mut out = BString::new(Vec::with_capacity(s.len()));
        let mut i = 0;
        while i < s.len() {
            let c = s[i];
            if c == b'\\' {
                let escape = s.get(i + 1..i + 4).and_then(|w| <[u8; 3]>::try_from(w).ok());
                if let Some(cs @ [a, b, d]) = escape {
                    if cs.iter().all(|c| (b'0'..=b'7').contains(c)) && a <= b'3' {
                        out.push(((a - b'0') << 6) | ((b - b'0') << 3) | (d - b'0'));
                        i += 4;
                        continue;
                    }
                }
            }
            out.push(c);
            i += 1;
        }
        out
    }

    unescape_inner(s.as_ref())
}

/// Lexical canonicalization: drops `.` and empty components, resolves `..` against the preceding
/// component and never touches the filesystem. `..` at the root stays at the root.
pub fn clean_path(path: impl AsRef<Path>) -> PathBuf {
    fn clean_path_inner(path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        let mut depth = 0usize;
        for comp in path.components() {
            match comp {
                Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir if depth > 0 => {
                    out.pop();
                    depth -= 1;
                }
                Component::ParentDir if out.has_root() => {}
                Component::ParentDir => out.push(".."),
                Component::Normal(name) => {
                    out.push(name);
                    depth += 1;
                }
            }
        }
        if out.as_os_str().is_empty() {
            out.push(".");
        }
        out
    }

    clean_path_inner(path.as_ref())
}

impl MountTable {
    pub fn from_points<I, P>(points: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            points: points.into_iter().map(clean_path).collect(),
        }
    }

    /// Parse `/proc/mounts` formatted content: `device mountpoint type options dump fsck`.
    /// Lines with fewer than two fields are ignored.
    pub fn parse(content: &[u8]) -> Self {
        let points = content
            .lines()
            .filter_map(|line| {
                let mut words = line.fields();
                let _device = words.next()?;
                let mountpoint = words.next()?;
                Some(clean_path(path_from_bytes(unescape(mountpoint))))
            })
            .collect();
        Self { points }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, MountTableError> {
        let path = path.as_ref();
        std::fs::read(path)
            .map(|content| Self::parse(&content))
            .map_err(|source| MountTableError {
                path: path.to_owned(),
                source,
            })
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.points.contains(&clean_path(path))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Nearest ancestor of `path` (itself included) that is a mount point. The filesystem root is
    /// always a mount point, even when the table does not list it.
    pub fn find_mount_point(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = clean_path(path);
        let mut current: &Path = &path;
        loop {
            if self.points.contains(current) {
                return current.to_owned();
            }
            match current.parent() {
                Some(parent) if parent != current => current = parent,
                _ => return PathBuf::from("/"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_octal_sequences() {
        assert_eq!(unescape(r"/mnt/my\040disk"), "/mnt/my disk");
        assert_eq!(unescape(r"tab\011here"), "tab\there");
        assert_eq!(unescape(r"back\134slash"), r"back\slash");
        assert_eq!(unescape(r"trailing\04"), r"trailing\04");
        assert_eq!(unescape(r"not\999octal"), r"not\999octal");
    }

    #[test]
    fn clean_resolves_dots_and_slashes() {
        assert_eq!(clean_path("/a/b/../c/./"), PathBuf::from("/a/c"));
        assert_eq!(clean_path("//a///b"), PathBuf::from("/a/b"));
        assert_eq!(clean_path("/.."), PathBuf::from("/"));
        assert_eq!(clean_path("/../x"), PathBuf::from("/x"));
        assert_eq!(clean_path("a/../.."), PathBuf::from(".."));
        assert_eq!(clean_path(""), PathBuf::from("."));
    }

    #[test]
    fn parse_proc_mounts() {
        let table = MountTable::parse(
            b"overlay / overlay rw,relatime 0 0\n\
              proc /proc proc rw,nosuid 0 0\n\
              /dev/sda1 /home/app/my\\040project ext4 rw 0 0\n\
              tmpfs /tmp/ tmpfs rw 0 0\n\
              garbage\n\
              \n",
        );
        assert_eq!(table.len(), 4);
        assert!(table.contains("/home/app/my project"));
        assert!(table.contains("/tmp"));
        assert!(table.contains("/proc/"));
    }

    #[test]
    fn nearest_ancestor_wins() {
        let table = MountTable::from_points(["/", "/home", "/home/app/data"]);
        assert_eq!(
            table.find_mount_point("/home/app/data/x/y"),
            PathBuf::from("/home/app/data")
        );
        assert_eq!(table.find_mount_point("/home/app/datafile"), PathBuf::from("/home"));
        assert_eq!(table.find_mount_point("/home/app/data"), PathBuf::from("/home/app/data"));
        assert_eq!(table.find_mount_point("/home/app/data/../f"), PathBuf::from("/home"));
        assert_eq!(table.find_mount_point("/usr/bin"), PathBuf::from("/"));
    }

    #[test]
    fn root_is_implicit_and_lookup_terminates() {
        let table = MountTable::default();
        assert_eq!(table.find_mount_point("/a/b/c"), PathBuf::from("/"));
        assert_eq!(table.find_mount_point("/"), PathBuf::from("/"));
        assert_eq!(table.find_mount_point("relative/path"), PathBuf::from("/"));
    }

    #[test]
    fn read_missing_table_fails() {
        assert!(MountTable::read("/nonexistent/idshift/mounts").is_err());
    }
}
