//! Lookups and in-place id rewrites over the colon-delimited user and group databases.
//!
//! Every function comes in two layers: a pure one over the raw file content and one reading the
//! file at a given path. Lines that are too short for the requested columns are skipped by
//! lookups and copied through untouched by rewrites.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use bstr::{BString, ByteSlice};

use crate::utils::{replace_file_atomic, ReplaceFileError};

/// `name:password:uid:gid:comment:home:shell`
pub mod passwd {
    pub const NAME: usize = 0;
    pub const UID: usize = 2;
    pub const GID: usize = 3;
    pub const HOME: usize = 5;
}

/// `name:password:gid:member,member`
pub mod group {
    pub const NAME: usize = 0;
    pub const GID: usize = 2;
    pub const MEMBERS: usize = 3;
}

const NAME_FIELD: usize = 0;
/// Both databases keep the numeric id in the third column.
const ID_FIELD: usize = 2;
const FIELD_DELIMITER: u8 = b':';
const MEMBER_DELIMITER: u8 = b',';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    User,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub kind: IdentityKind,
    pub name: String,
    pub numeric_id: u32,
}

/// One side of an id substitution. Both ends are always known together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdChange {
    pub old: u32,
    pub new: u32,
}

impl IdChange {
    /// [`None`] when nothing would change.
    pub fn between(old: u32, new: u32) -> Option<Self> {
        (old != new).then_some(Self { old, new })
    }
}

/// Which fields of which lines [`rewrite_ids`] substitutes.
///
/// The primary change applies to the line named `target_name` whose `id_field` holds the old id.
/// The secondary change applies to every line whose `secondary_field` holds its old id, whatever
/// the name.
#[derive(Debug, Clone)]
pub struct Rewrite<'a> {
    pub target_name: &'a str,
    pub primary: Option<IdChange>,
    pub id_field: usize,
    pub secondary: Option<IdChange>,
    pub secondary_field: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityDbError {
    #[error("can't read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("can't update {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: ReplaceFileError,
    },
    #[error("{}: field {field} of the entry for '{key}' is not a numeric id: {value:?}", path.display())]
    NotAnId {
        path: PathBuf,
        key: String,
        field: usize,
        value: BString,
    },
}

fn fields(line: &[u8]) -> Vec<&[u8]> {
    line.split_str(&[FIELD_DELIMITER]).collect()
}

fn strip_terminator(line: &[u8]) -> (&[u8], &[u8]) {
    let body = line
        .strip_suffix(b"\n")
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .unwrap_or(line);
    (body, &line[body.len()..])
}

fn parse_id(value: &[u8]) -> Option<u32> {
    value.to_str().ok()?.parse().ok()
}

/// Value of `return_field` on the first line whose `search_field` equals `search` exactly.
pub fn search_content(
    content: &[u8],
    search_field: usize,
    search: &[u8],
    return_field: usize,
) -> Option<BString> {
    content.lines().find_map(|line| {
        let cols = fields(line);
        if cols.len() <= search_field.max(return_field) {
            return None;
        }
        (cols[search_field] == search).then(|| BString::from(cols[return_field]))
    })
}

fn read(path: &Path) -> Result<Vec<u8>, IdentityDbError> {
    std::fs::read(path).map_err(|source| IdentityDbError::Read {
        path: path.to_owned(),
        source,
    })
}

pub fn search(
    path: impl AsRef<Path>,
    search_field: usize,
    search: &[u8],
    return_field: usize,
) -> Result<Option<BString>, IdentityDbError> {
    let content = read(path.as_ref())?;
    Ok(search_content(&content, search_field, search, return_field))
}

/// Numeric id (third column) of the entry called `name`.
///
/// An absent name is `Ok(None)`; a present name with an unparsable id is an error.
pub fn find_numeric_id(
    path: impl AsRef<Path>,
    name: &str,
) -> Result<Option<u32>, IdentityDbError> {
    find_named_id(path, name, ID_FIELD)
}

/// Numeric column `field` of the entry called `name`, e.g. the primary group of a user.
pub fn find_named_id(
    path: impl AsRef<Path>,
    name: &str,
    field: usize,
) -> Result<Option<u32>, IdentityDbError> {
    fn find_named_id_inner(
        path: &Path,
        name: &str,
        field: usize,
    ) -> Result<Option<u32>, IdentityDbError> {
        let Some(value) = search(path, NAME_FIELD, name.as_bytes(), field)? else {
            return Ok(None);
        };
        parse_id(&value)
            .map(Some)
            .ok_or_else(|| IdentityDbError::NotAnId {
                path: path.to_owned(),
                key: name.to_owned(),
                field,
                value,
            })
    }
    find_named_id_inner(path.as_ref(), name, field)
}

/// Name of the first entry whose id column holds `numeric_id`.
pub fn find_name(
    path: impl AsRef<Path>,
    numeric_id: u32,
) -> Result<Option<String>, IdentityDbError> {
    let id = numeric_id.to_string();
    Ok(search(path, ID_FIELD, id.as_bytes(), NAME_FIELD)?
        .map(|name| name.to_str_lossy().into_owned()))
}

/// Arbitrary column (home directory, primary group, ...) of the entry with id `numeric_id`.
pub fn find_auxiliary_field(
    path: impl AsRef<Path>,
    numeric_id: u32,
    field: usize,
) -> Result<Option<BString>, IdentityDbError> {
    let id = numeric_id.to_string();
    search(path, ID_FIELD, id.as_bytes(), field)
}

fn rewrite_line(line: &[u8], rewrite: &Rewrite<'_>) -> Option<BString> {
    let (body, terminator) = strip_terminator(line);
    let primary = rewrite
        .primary
        .map(|c| (c.old.to_string(), c.new.to_string()));
    let secondary = rewrite
        .secondary
        .map(|c| (c.old.to_string(), c.new.to_string()));

    let mut cols = fields(body);
    let mut changed = false;

    if let Some((old, new)) = &primary {
        if cols.len() > rewrite.id_field
            && cols[NAME_FIELD] == rewrite.target_name.as_bytes()
            && cols[rewrite.id_field] == old.as_bytes()
        {
            cols[rewrite.id_field] = new.as_bytes();
            changed = true;
        }
    }
    if let Some((old, new)) = &secondary {
        if cols.len() > rewrite.secondary_field && cols[rewrite.secondary_field] == old.as_bytes() {
            cols[rewrite.secondary_field] = new.as_bytes();
            changed = true;
        }
    }

    if !changed {
        return None;
    }
    let mut out = BString::from(cols.join(&FIELD_DELIMITER));
    out.extend_from_slice(terminator);
    Some(out)
}

/// Apply `rewrite` to every line of `content`. Line count, line order and every other field are
/// preserved byte for byte.
pub fn rewrite_content(content: &[u8], rewrite: &Rewrite<'_>) -> BString {
    let mut out = BString::new(Vec::with_capacity(content.len() + 16));
    for line in content.lines_with_terminator() {
        match rewrite_line(line, rewrite) {
            Some(new_line) => out.extend_from_slice(&new_line),
            None => out.extend_from_slice(line),
        }
    }
    out
}

/// Rewrite the database at `path` in place. The file is replaced atomically and left alone when
/// the rewrite changes nothing.
pub fn rewrite_ids(path: impl AsRef<Path>, rewrite: &Rewrite<'_>) -> Result<(), IdentityDbError> {
    fn rewrite_ids_inner(path: &Path, rewrite: &Rewrite<'_>) -> Result<(), IdentityDbError> {
        let content = read(path)?;
        let updated = rewrite_content(&content, rewrite);
        if updated.as_slice() == content.as_slice() {
            return Ok(());
        }
        write(path, &updated)
    }

    rewrite_ids_inner(path.as_ref(), rewrite)
}

/// Put back a previously read content, used to undo a rewrite.
pub fn restore(path: impl AsRef<Path>, content: &[u8]) -> Result<(), IdentityDbError> {
    write(path.as_ref(), content)
}

pub fn snapshot(path: impl AsRef<Path>) -> Result<Vec<u8>, IdentityDbError> {
    read(path.as_ref())
}

fn write(path: &Path, content: &[u8]) -> Result<(), IdentityDbError> {
    replace_file_atomic(path, content).map_err(|source| IdentityDbError::Write {
        path: path.to_owned(),
        source,
    })
}

/// Ids of the groups whose member list names `user`. Lines with an unparsable id are skipped.
pub fn group_membership_content(content: &[u8], user: &str) -> BTreeSet<u32> {
    content
        .lines()
        .filter_map(|line| {
            let cols = fields(line);
            if cols.len() <= group::MEMBERS {
                return None;
            }
            let is_member = cols[group::MEMBERS]
                .split_str(&[MEMBER_DELIMITER])
                .any(|member| member == user.as_bytes());
            if is_member {
                parse_id(cols[group::GID])
            } else {
                None
            }
        })
        .collect()
}

pub fn list_group_membership(
    path: impl AsRef<Path>,
    user: &str,
) -> Result<BTreeSet<u32>, IdentityDbError> {
    let content = read(path.as_ref())?;
    Ok(group_membership_content(&content, user))
}

impl IdentityKind {
    /// Name of the numeric id column, as the operator knows it.
    pub fn id_label(self) -> &'static str {
        match self {
            IdentityKind::User => "UID",
            IdentityKind::Group => "GID",
        }
    }
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IdentityKind::User => "user",
            IdentityKind::Group => "group",
        })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}' ({})", self.kind, self.name, self.numeric_id)
    }
}
