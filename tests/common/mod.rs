//! Scratch system for driving the controller end to end without root.

use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use idshift::config::{Config, SystemPaths};
use idshift::privdrop::Credentials;
use idshift::remap::{Chown, Ownership};
use nix::errno::Errno;
use nix::unistd::{Gid, Uid};
use tempfile::TempDir;

/// Distance between the image's ids and the ids the process is started with.
pub const RUNTIME_OFFSET: u32 = 4242;

/// Temporary databases, mount table, marker location and a tree owned by the container identity.
///
/// The container identity is whoever owns the temporary files, so the walk finds them without
/// needing privileges.
pub struct Fixture {
    pub dir: TempDir,
    pub paths: SystemPaths,
    pub tree: PathBuf,
    pub container: Ownership,
    pub runtime: Ownership,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("src")).unwrap();
        std::fs::write(tree.join("src/main.rs"), b"fn main() {}\n").unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::create_dir_all(dir.path().join("run")).unwrap();

        let meta = std::fs::metadata(&tree).unwrap();
        let container = Ownership::new(meta.uid(), meta.gid());
        let runtime = Ownership::new(meta.uid() + RUNTIME_OFFSET, meta.gid() + RUNTIME_OFFSET);

        let paths = SystemPaths {
            passwd: dir.path().join("etc/passwd"),
            group: dir.path().join("etc/group"),
            mounts: dir.path().join("mounts"),
            marker: dir.path().join("run/idshift.ran"),
            config_dir: dir.path().join("etc/idshift"),
        };
        let fixture = Self {
            dir,
            paths,
            tree,
            container,
            runtime,
        };

        let (cu, cg) = (fixture.container.uid, fixture.container.gid);
        std::fs::write(
            &fixture.paths.passwd,
            format!(
                "app:x:{cu}:{cg}:App:/home/app:/bin/sh\n\
                 nobody:x:{}:{}:nobody:/:/usr/sbin/nologin\n",
                cu.as_raw() + 9000,
                cg.as_raw() + 9000,
            ),
        )
        .unwrap();
        std::fs::write(
            &fixture.paths.group,
            format!(
                "app:x:{cg}:\n\
                 audio:x:{}:app,nobody\n\
                 nogroup:x:{}:\n",
                fixture.audio_gid().as_raw(),
                cg.as_raw() + 9000,
            ),
        )
        .unwrap();
        fixture.set_mounts(&[Path::new("/")]);
        fixture
    }

    /// Supplementary group listing `app` as a member.
    pub fn audio_gid(&self) -> Gid {
        Gid::from_raw(self.container.gid.as_raw() + 7000)
    }

    pub fn config(&self) -> Config {
        Config {
            user: "app".into(),
            group: "app".into(),
            paths: vec![self.tree.clone()],
            inherit_groups: true,
        }
    }

    pub fn set_mounts(&self, points: &[&Path]) {
        let table: String = points
            .iter()
            .map(|p| format!("none {} tmpfs rw 0 0\n", p.display().to_string().replace(' ', "\\040")))
            .collect();
        std::fs::write(&self.paths.mounts, table).unwrap();
    }

    pub fn append_passwd(&self, line: &str) {
        append(&self.paths.passwd, line);
    }

    pub fn append_group(&self, line: &str) {
        append(&self.paths.group, line);
    }

    pub fn passwd(&self) -> String {
        std::fs::read_to_string(&self.paths.passwd).unwrap()
    }

    pub fn group(&self) -> String {
        std::fs::read_to_string(&self.paths.group).unwrap()
    }

    /// Executable script at `bin/name`, for process replacement tests.
    pub fn executable(&self, name: &str) -> PathBuf {
        let bin = self.dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

fn append(path: &Path, line: &str) {
    let mut content = std::fs::read_to_string(path).unwrap();
    content.push_str(line);
    content.push('\n');
    std::fs::write(path, content).unwrap();
}

/// Setuid-root process as the kernel would see it: only an effective uid of 0 may change ids.
#[derive(Debug, Clone)]
pub struct FakeCredentials {
    pub ruid: Uid,
    pub euid: Uid,
    pub suid: Uid,
    pub rgid: Gid,
    pub egid: Gid,
    pub groups: Vec<Gid>,
    pub calls: Vec<&'static str>,
    /// Effective root stays reachable after the drop.
    pub leaks_root: bool,
}

impl FakeCredentials {
    pub fn setuid_root(runtime: Ownership) -> Self {
        Self {
            ruid: runtime.uid,
            euid: Uid::from_raw(0),
            suid: Uid::from_raw(0),
            rgid: runtime.gid,
            egid: runtime.gid,
            groups: vec![runtime.gid],
            calls: Vec::new(),
            leaks_root: false,
        }
    }

    pub fn unprivileged(runtime: Ownership) -> Self {
        Self {
            euid: runtime.uid,
            suid: runtime.uid,
            ..Self::setuid_root(runtime)
        }
    }
}

impl Credentials for FakeCredentials {
    fn real_uid(&self) -> Uid {
        self.ruid
    }

    fn real_gid(&self) -> Gid {
        self.rgid
    }

    fn effective_uid(&self) -> Uid {
        self.euid
    }

    fn supplementary_groups(&self) -> Result<Vec<Gid>, Errno> {
        Ok(self.groups.clone())
    }

    fn set_supplementary_groups(&mut self, groups: &[Gid]) -> Result<(), Errno> {
        self.calls.push("setgroups");
        if !self.euid.is_root() {
            return Err(Errno::EPERM);
        }
        self.groups = groups.to_vec();
        Ok(())
    }

    fn set_all_gids(&mut self, gid: Gid) -> Result<(), Errno> {
        self.calls.push("setresgid");
        if !self.euid.is_root() {
            return Err(Errno::EPERM);
        }
        self.rgid = gid;
        self.egid = gid;
        Ok(())
    }

    fn set_all_uids(&mut self, uid: Uid) -> Result<(), Errno> {
        self.calls.push("setresuid");
        if !self.euid.is_root() {
            return Err(Errno::EPERM);
        }
        self.ruid = uid;
        self.euid = uid;
        if !self.leaks_root {
            self.suid = uid;
        }
        Ok(())
    }

    fn try_set_effective_uid(&mut self, uid: Uid) -> Result<(), Errno> {
        if self.euid.is_root() || uid == self.ruid || uid == self.suid {
            self.euid = uid;
            Ok(())
        } else {
            Err(Errno::EPERM)
        }
    }

    fn try_set_effective_gid(&mut self, gid: Gid) -> Result<(), Errno> {
        if self.euid.is_root() || gid == self.rgid {
            self.egid = gid;
            Ok(())
        } else {
            Err(Errno::EPERM)
        }
    }

    fn has_permitted_capabilities(&self) -> Result<bool, caps::errors::CapsError> {
        Ok(self.euid.is_root())
    }
}

/// Remembers every ownership change instead of performing it.
#[derive(Debug, Default)]
pub struct RecordingChown {
    pub calls: Vec<(PathBuf, Ownership)>,
}

impl RecordingChown {
    pub fn changed(&self, path: &Path) -> bool {
        self.calls.iter().any(|(p, _)| p == path)
    }
}

impl Chown for RecordingChown {
    fn lchown(&mut self, path: &Path, to: Ownership) -> Result<(), Errno> {
        self.calls.push((path.to_owned(), to));
        Ok(())
    }
}
