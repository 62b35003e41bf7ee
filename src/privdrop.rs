//! Irreversible de-escalation from setuid-root to the invoking identity.

use std::collections::BTreeSet;

use nix::errno::Errno;
use nix::unistd::{Gid, Uid};

pub const NOT_ROOT_GUIDANCE: &str = "idshift is not running as root, ensure that the following criteria are met:
        - idshift binary is owned by root: 'chown root:root /path/to/idshift'
        - idshift binary has the setuid bit: 'chmod u+s /path/to/idshift'
        - NoNewPrivileges is disabled in container security profile
        - volume containing idshift binary does not have the 'nosuid' mount option";

/// Process credential operations. The system implementation goes straight to the kernel; tests
/// substitute their own.
pub trait Credentials {
    fn real_uid(&self) -> Uid;
    fn real_gid(&self) -> Gid;
    fn effective_uid(&self) -> Uid;
    fn supplementary_groups(&self) -> Result<Vec<Gid>, Errno>;
    fn set_supplementary_groups(&mut self, groups: &[Gid]) -> Result<(), Errno>;
    /// Real, effective and saved group id.
    fn set_all_gids(&mut self, gid: Gid) -> Result<(), Errno>;
    /// Real, effective and saved user id.
    fn set_all_uids(&mut self, uid: Uid) -> Result<(), Errno>;
    fn try_set_effective_uid(&mut self, uid: Uid) -> Result<(), Errno>;
    fn try_set_effective_gid(&mut self, gid: Gid) -> Result<(), Errno>;
    /// Whether any capability is still permitted.
    fn has_permitted_capabilities(&self) -> Result<bool, caps::errors::CapsError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCredentials;

impl Credentials for ProcessCredentials {
    fn real_uid(&self) -> Uid {
        nix::unistd::getuid()
    }

    fn real_gid(&self) -> Gid {
        nix::unistd::getgid()
    }

    fn effective_uid(&self) -> Uid {
        nix::unistd::geteuid()
    }

    fn supplementary_groups(&self) -> Result<Vec<Gid>, Errno> {
        nix::unistd::getgroups()
    }

    fn set_supplementary_groups(&mut self, groups: &[Gid]) -> Result<(), Errno> {
        nix::unistd::setgroups(groups)
    }

    fn set_all_gids(&mut self, gid: Gid) -> Result<(), Errno> {
        nix::unistd::setresgid(gid, gid, gid)
    }

    fn set_all_uids(&mut self, uid: Uid) -> Result<(), Errno> {
        nix::unistd::setresuid(uid, uid, uid)
    }

    fn try_set_effective_uid(&mut self, uid: Uid) -> Result<(), Errno> {
        nix::unistd::seteuid(uid)
    }

    fn try_set_effective_gid(&mut self, gid: Gid) -> Result<(), Errno> {
        nix::unistd::setegid(gid)
    }

    fn has_permitted_capabilities(&self) -> Result<bool, caps::errors::CapsError> {
        Ok(!caps::read(None, caps::CapSet::Permitted)?.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PrivDropError {
    #[error("{guidance}\n(effective uid is {euid})", guidance = NOT_ROOT_GUIDANCE)]
    NotSuperuser { euid: Uid },
    #[error("can't read supplementary groups: {0}")]
    ReadGroups(Errno),
    #[error("can't set supplementary groups to {groups:?}: {source}")]
    SetGroups { groups: Vec<Gid>, source: Errno },
    #[error("unable to drop root gid to {gid}: {source}")]
    SetGid { gid: Gid, source: Errno },
    #[error("unable to drop root uid to {uid}: {source}")]
    SetUid { uid: Uid, source: Errno },
    #[error("privileges are not irreversibly dropped: {0}")]
    Reversible(&'static str),
    #[error("can't read capabilities: {0}")]
    Caps(#[from] caps::errors::CapsError),
}

pub fn require_superuser(creds: &impl Credentials) -> Result<(), PrivDropError> {
    let euid = creds.effective_uid();
    if euid.is_root() {
        Ok(())
    } else {
        Err(PrivDropError::NotSuperuser { euid })
    }
}

/// Final credentials of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeDrop {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

/// Supplementary groups after the drop: inherited ones, the primary group and every group listing
/// the user as a member, minus the group id that was renumbered away. Sorted and deduplicated.
pub fn target_groups(
    inherited: &[Gid],
    primary: Option<Gid>,
    member_of: &BTreeSet<u32>,
    retired: Option<Gid>,
) -> Vec<Gid> {
    let mut all: BTreeSet<u32> = inherited.iter().map(|g| g.as_raw()).collect();
    all.extend(primary.map(Gid::as_raw));
    all.extend(member_of.iter().copied());
    if let Some(retired) = retired {
        all.remove(&retired.as_raw());
    }
    all.into_iter().map(Gid::from_raw).collect()
}

/// Groups first, then gid, then uid: once the uid is gone so is the right to change the others.
pub fn drop_privileges(
    creds: &mut impl Credentials,
    target: &PrivilegeDrop,
) -> Result<(), PrivDropError> {
    creds
        .set_supplementary_groups(&target.groups)
        .map_err(|source| PrivDropError::SetGroups {
            groups: target.groups.clone(),
            source,
        })?;
    creds
        .set_all_gids(target.gid)
        .map_err(|source| PrivDropError::SetGid {
            gid: target.gid,
            source,
        })?;
    creds
        .set_all_uids(target.uid)
        .map_err(|source| PrivDropError::SetUid {
            uid: target.uid,
            source,
        })?;
    verify_irreversible(creds, target)
}

/// Regaining root must fail. A root target uid can always take gid 0 back, so there is nothing
/// to verify for it; a root target gid skips only the gid probe.
pub fn verify_irreversible(
    creds: &mut impl Credentials,
    target: &PrivilegeDrop,
) -> Result<(), PrivDropError> {
    if target.uid.is_root() {
        return Ok(());
    }
    if creds.try_set_effective_uid(Uid::from_raw(0)).is_ok() {
        return Err(PrivDropError::Reversible("effective uid 0 can be regained"));
    }
    if creds.has_permitted_capabilities()? {
        return Err(PrivDropError::Reversible("capabilities are still permitted"));
    }
    let root_gid = Gid::from_raw(0);
    if target.gid != root_gid && creds.try_set_effective_gid(root_gid).is_ok() {
        return Err(PrivDropError::Reversible("effective gid 0 can be regained"));
    }
    Ok(())
}
