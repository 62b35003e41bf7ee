use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStringExt as _;
use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

pub(crate) use macros::nix_retry;
mod macros {
    macro_rules! nix_retry {
        ($e:expr) => {
            loop {
                let result = $e;
                if !matches!(
                    &result,
                    ::core::result::Result::Err(::nix::errno::Errno::EINTR)
                ) {
                    break result;
                }
            }
        };
    }

    pub(crate) use nix_retry;
}

pub fn write_to_fd_rust(fd: BorrowedFd<'_>, mut content: &[u8]) -> Result<(), Errno> {
    while !content.is_empty() {
        let res = nix_retry!(nix::unistd::write(fd, content))?;
        if res == 0 {
            return Err(Errno::ENOSPC);
        }
        content = &content[res..];
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ReplaceFileError {
    #[error("can't stat {}: {source}", path.display())]
    Stat { path: PathBuf, source: io::Error },
    #[error("can't create {}: {source}", path.display())]
    Create { path: PathBuf, source: Errno },
    #[error("can't write {}: {source}", path.display())]
    Write { path: PathBuf, source: Errno },
    #[error("can't copy owner and mode onto {}: {source}", path.display())]
    Attributes { path: PathBuf, source: io::Error },
    #[error("can't sync {}: {source}", path.display())]
    Sync { path: PathBuf, source: io::Error },
    #[error("can't rename {} to {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Name of the scratch file used while replacing `path`. It lives in the same directory so the
/// final rename never crosses a filesystem.
fn scratch_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or(path.as_os_str()));
    name.push(".idshift-new");
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Replace the content of `path` with `content` without ever exposing a truncated file.
///
/// The new content goes to a sibling file which receives the original's mode and ownership, is
/// synced, then renamed over the original. On error the original is left untouched.
pub fn replace_file_atomic(path: impl AsRef<Path>, content: &[u8]) -> Result<(), ReplaceFileError> {
    fn replace_file_atomic_inner(path: &Path, content: &[u8]) -> Result<(), ReplaceFileError> {
        let meta = std::fs::metadata(path).map_err(|source| ReplaceFileError::Stat {
            path: path.to_owned(),
            source,
        })?;
        let scratch = scratch_path(path);
        // leftover from a run that was killed mid-write
        let _ = nix::unistd::unlink(&scratch);

        let file = nix_retry!(nix::fcntl::open(
            &scratch,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
            Mode::from_bits_truncate(0o600),
        ))
        .map(|fd| File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
        .map_err(|source| ReplaceFileError::Create {
            path: scratch.clone(),
            source,
        })?;

        let res = (|| {
            write_to_fd_rust(file.as_fd(), content).map_err(|source| ReplaceFileError::Write {
                path: scratch.clone(),
                source,
            })?;
            std::os::unix::fs::fchown(&file, Some(meta.uid()), Some(meta.gid()))
                .and_then(|()| file.set_permissions(meta.permissions()))
                .map_err(|source| ReplaceFileError::Attributes {
                    path: scratch.clone(),
                    source,
                })?;
            file.sync_all().map_err(|source| ReplaceFileError::Sync {
                path: scratch.clone(),
                source,
            })?;
            std::fs::rename(&scratch, path).map_err(|source| ReplaceFileError::Rename {
                from: scratch.clone(),
                to: path.to_owned(),
                source,
            })
        })();
        if res.is_err() {
            let _ = nix::unistd::unlink(&scratch);
        }
        res
    }

    replace_file_atomic_inner(path.as_ref(), content)
}

/// Byte-exact conversion, since database fields and mount points need not be UTF-8.
pub fn path_from_bytes(bytes: impl Into<Vec<u8>>) -> PathBuf {
    PathBuf::from(OsString::from_vec(bytes.into()))
}
