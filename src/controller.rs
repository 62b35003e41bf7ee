//! One-shot transition of a container's baked-in identity to the identity it was started with.
//!
//! [`Controller::run`] walks through the phases below and hands back a [`ProcessOutcome`]; the
//! caller performs the final exit or exec.
//!
//! ```text
//! Fresh -> Evaluating -> {NoChangeNeeded | RewritingIdentities} -> Rewalking -> MarkedDone
//!       -> Dropping -> {Exited | Execd}
//! ```
//!
//! With the run-once marker present, `Fresh` goes straight to `Dropping`.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;

use bstr::ByteSlice;
use nix::unistd::{Gid, Uid};

use crate::config::{Config, SystemPaths};
use crate::identity_db::{
    self, group, passwd, IdChange, Identity, IdentityDbError, IdentityKind, Rewrite,
};
use crate::log_sink::LogSink;
use crate::marker::{MarkerError, RunOnceMarker};
use crate::parse_mounts::{MountTable, MountTableError};
use crate::privdrop::{self, Credentials, PrivDropError, PrivilegeDrop};
use crate::remap::{remap_ownership, Chown, Ownership, RemapReport};
use crate::{sink_info, sink_warn};

const HOME_VAR: &str = "HOME";
const PATH_VAR: &str = "PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    Evaluating,
    NoChangeNeeded,
    RewritingIdentities,
    Rewalking,
    MarkedDone,
    Dropping,
    Exited,
    /// Process image replacement handed over to the caller.
    Execd,
}

/// Outcome of comparing the runtime id against the database on one axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisDecision {
    /// Nothing is registered under the runtime id: renumber the container identity.
    Remap,
    /// The runtime id already belongs to the container identity.
    AlreadyMatches,
    /// The runtime id belongs to another identity, which is left alone.
    Collides { existing: String },
}

pub fn decide_axis(existing: Option<&str>, container_name: &str) -> AxisDecision {
    match existing {
        None => AxisDecision::Remap,
        Some(name) if name == container_name => AxisDecision::AlreadyMatches,
        Some(name) => AxisDecision::Collides {
            existing: name.to_owned(),
        },
    }
}

impl AxisDecision {
    pub fn needs_ownership_walk(&self) -> bool {
        !matches!(self, AxisDecision::AlreadyMatches)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub user: Identity,
    pub group: Identity,
    pub runtime: Ownership,
    /// Database change on the user axis, if any.
    pub uid: Option<IdChange>,
    /// Database change on the group axis, if any.
    pub gid: Option<IdChange>,
    pub needs_ownership_walk: bool,
}

impl TransitionPlan {
    pub fn changes_databases(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct Steps: u32 {
        const REWRITE_PASSWD = 0b000001;
        const REWRITE_GROUP = 0b000010;
        const REMAP_OWNERSHIP = 0b000100;
        const MARK = 0b001000;
        const ADOPT_HOME = 0b010000;
        const DROP = 0b100000;
    }
}

/// What a run did, for the caller and for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReport {
    pub phases: Vec<Phase>,
    pub steps: Steps,
    /// Absent when the marker short-circuited the run.
    pub plan: Option<TransitionPlan>,
    pub remap: Option<RemapReport>,
    pub privileges: Option<PrivilegeDrop>,
}

impl TransitionReport {
    fn new() -> Self {
        Self {
            phases: vec![Phase::Fresh],
            steps: Steps::empty(),
            plan: None,
            remap: None,
            privileges: None,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phases.push(phase);
    }
}

/// Arguments and environment the process was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program to replace this process with, followed by its arguments. Empty to just exit.
    pub command: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    /// Base for relative command paths.
    pub cwd: PathBuf,
}

impl Invocation {
    pub fn from_process(command: Vec<OsString>) -> io::Result<Self> {
        Ok(Self {
            command,
            env: std::env::vars_os().collect(),
            cwd: std::env::current_dir()?,
        })
    }

    pub fn var(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        let key = key.as_ref();
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    pub fn set_var(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.env.push((key, value)),
        }
    }
}

/// Terminal action, performed by the caller once the controller is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exit {
        status: u8,
        /// Shell assignment to print on standard output.
        export: Option<String>,
    },
    Replace {
        program: PathBuf,
        args: Vec<OsString>,
        env: Vec<(OsString, OsString)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub outcome: ProcessOutcome,
    pub report: TransitionReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    Configuration,
    Io,
    Privilege,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error(transparent)]
    Privilege(#[from] PrivDropError),
    #[error("{kind} '{name}' does not exist")]
    UnknownIdentity { kind: IdentityKind, name: String },
    #[error(transparent)]
    Database(#[from] IdentityDbError),
    #[error(transparent)]
    Mounts(#[from] MountTableError),
    #[error(transparent)]
    Marker(#[from] MarkerError),
    #[error("can't find executable '{}': {source}", program.to_string_lossy())]
    CommandNotFound {
        program: OsString,
        source: which::Error,
    },
}

impl TransitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransitionError::Privilege(PrivDropError::NotSuperuser { .. }) => ErrorKind::Precondition,
            TransitionError::Privilege(_) => ErrorKind::Privilege,
            TransitionError::UnknownIdentity { .. } | TransitionError::CommandNotFound { .. } => {
                ErrorKind::Configuration
            }
            TransitionError::Database(_) | TransitionError::Mounts(_) => ErrorKind::Io,
            TransitionError::Marker(_) => ErrorKind::Precondition,
        }
    }
}

/// `export HOME="..."`, safe to `eval` in a POSIX shell.
pub fn export_line(key: &str, value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    format!("export {key}=\"{quoted}\"")
}

pub struct Controller<'a, C: Credentials, O: Chown> {
    config: &'a Config,
    paths: &'a SystemPaths,
    credentials: &'a mut C,
    chown: &'a mut O,
    sink: &'a dyn LogSink,
}

impl<'a, C: Credentials, O: Chown> Controller<'a, C, O> {
    pub fn new(
        config: &'a Config,
        paths: &'a SystemPaths,
        credentials: &'a mut C,
        chown: &'a mut O,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            config,
            paths,
            credentials,
            chown,
            sink,
        }
    }

    pub fn run(&mut self, mut invocation: Invocation) -> Result<Transition, TransitionError> {
        let mut report = TransitionReport::new();
        privdrop::require_superuser(&*self.credentials)?;

        let runtime = Ownership {
            uid: self.credentials.real_uid(),
            gid: self.credentials.real_gid(),
        };
        let marker = RunOnceMarker::new(&self.paths.marker);
        let mut export = None;

        if marker.is_present() {
            sink_info!(
                self.sink,
                "already ran on this system; will not attempt to change UID/GID"
            );
        } else {
            report.enter(Phase::Evaluating);
            let plan = self.evaluate(runtime)?;

            if plan.changes_databases() {
                report.enter(Phase::RewritingIdentities);
                self.rewrite_identities(&plan, &mut report)?;
            } else {
                report.enter(Phase::NoChangeNeeded);
            }

            if plan.needs_ownership_walk {
                report.enter(Phase::Rewalking);
                let mounts = MountTable::read(&self.paths.mounts)?;
                let from = Ownership::new(plan.user.numeric_id, plan.group.numeric_id);
                report.remap = Some(remap_ownership(
                    &self.config.paths,
                    from,
                    runtime,
                    &mounts,
                    &mut *self.chown,
                    self.sink,
                ));
                report.steps |= Steps::REMAP_OWNERSHIP;
            }

            marker.mark()?;
            report.steps |= Steps::MARK;
            report.enter(Phase::MarkedDone);

            if let Some(home) = self.adopt_home(runtime.uid, &mut invocation) {
                report.steps |= Steps::ADOPT_HOME;
                export = home;
            }
            report.plan = Some(plan);
        }

        report.enter(Phase::Dropping);
        let program = match invocation.command.first() {
            Some(program) => Some(self.resolve_command(program, &invocation)?),
            None => None,
        };
        let retired = report
            .plan
            .as_ref()
            .and_then(|plan| plan.gid)
            .map(|change| Gid::from_raw(change.old));
        let target = self.privilege_target(runtime, retired)?;
        privdrop::drop_privileges(&mut *self.credentials, &target)?;
        report.steps |= Steps::DROP;
        report.privileges = Some(target);

        let outcome = match program {
            Some(program) => {
                report.enter(Phase::Execd);
                ProcessOutcome::Replace {
                    program,
                    args: invocation.command,
                    env: invocation.env,
                }
            }
            None => {
                report.enter(Phase::Exited);
                ProcessOutcome::Exit { status: 0, export }
            }
        };
        Ok(Transition { outcome, report })
    }

    fn resolve_identity(
        &self,
        kind: IdentityKind,
        name: &str,
    ) -> Result<Identity, TransitionError> {
        let db = match kind {
            IdentityKind::User => &self.paths.passwd,
            IdentityKind::Group => &self.paths.group,
        };
        let numeric_id = identity_db::find_numeric_id(db, name)?.ok_or_else(|| {
            TransitionError::UnknownIdentity {
                kind,
                name: name.to_owned(),
            }
        })?;
        Ok(Identity {
            kind,
            name: name.to_owned(),
            numeric_id,
        })
    }

    fn decide(&self, container: &Identity, runtime_id: u32) -> Result<AxisDecision, TransitionError> {
        let db = match container.kind {
            IdentityKind::User => &self.paths.passwd,
            IdentityKind::Group => &self.paths.group,
        };
        let existing = identity_db::find_name(db, runtime_id)?;
        let decision = decide_axis(existing.as_deref(), &container.name);
        let label = container.kind.id_label();
        match &decision {
            AxisDecision::Remap => sink_info!(
                self.sink,
                "updating {} '{}' to {label} '{runtime_id}'",
                container.kind,
                container.name
            ),
            AxisDecision::AlreadyMatches => sink_info!(
                self.sink,
                "runtime {label} '{runtime_id}' already matches container {} '{}' {label}",
                container.kind,
                container.name
            ),
            AxisDecision::Collides { existing } => sink_info!(
                self.sink,
                "runtime {label} '{runtime_id}' matches existing {} '{existing}'; not changing {label}",
                container.kind
            ),
        }
        Ok(decision)
    }

    fn evaluate(&self, runtime: Ownership) -> Result<TransitionPlan, TransitionError> {
        let user = self.resolve_identity(IdentityKind::User, &self.config.user)?;
        let group = self.resolve_identity(IdentityKind::Group, &self.config.group)?;

        let uid_axis = self.decide(&user, runtime.uid.as_raw())?;
        let gid_axis = self.decide(&group, runtime.gid.as_raw())?;

        let change = |axis: &AxisDecision, old: u32, new: u32| match axis {
            AxisDecision::Remap => IdChange::between(old, new),
            _ => None,
        };
        Ok(TransitionPlan {
            uid: change(&uid_axis, user.numeric_id, runtime.uid.as_raw()),
            gid: change(&gid_axis, group.numeric_id, runtime.gid.as_raw()),
            needs_ownership_walk: uid_axis.needs_ownership_walk() || gid_axis.needs_ownership_walk(),
            user,
            group,
            runtime,
        })
    }

    /// User database first, then group database. A failed group rewrite puts the user database
    /// back so the two never disagree on the group id.
    fn rewrite_identities(
        &self,
        plan: &TransitionPlan,
        report: &mut TransitionReport,
    ) -> Result<(), TransitionError> {
        let passwd_before = identity_db::snapshot(&self.paths.passwd)?;
        identity_db::rewrite_ids(
            &self.paths.passwd,
            &Rewrite {
                target_name: &plan.user.name,
                primary: plan.uid,
                id_field: passwd::UID,
                secondary: plan.gid,
                secondary_field: passwd::GID,
            },
        )?;
        report.steps |= Steps::REWRITE_PASSWD;

        if plan.gid.is_none() {
            return Ok(());
        }
        let rewritten = identity_db::rewrite_ids(
            &self.paths.group,
            &Rewrite {
                target_name: &plan.group.name,
                primary: plan.gid,
                id_field: group::GID,
                secondary: None,
                secondary_field: group::GID,
            },
        );
        if let Err(e) = rewritten {
            if let Err(restore) = identity_db::restore(&self.paths.passwd, &passwd_before) {
                sink_warn!(self.sink, "could not roll back the user database: {restore}");
            }
            return Err(e.into());
        }
        report.steps |= Steps::REWRITE_GROUP;
        Ok(())
    }

    /// Replace a placeholder `HOME=/` with the runtime user's home directory. Returns the line to
    /// print when there is no command to hand the environment to.
    fn adopt_home(&self, uid: Uid, invocation: &mut Invocation) -> Option<Option<String>> {
        if invocation.var(HOME_VAR) != Some(OsStr::new("/")) {
            return None;
        }
        let home = match identity_db::find_auxiliary_field(&self.paths.passwd, uid.as_raw(), passwd::HOME) {
            Ok(Some(home)) => home,
            Ok(None) => return None,
            Err(e) => {
                sink_warn!(self.sink, "can't look up home directory: {e}");
                return None;
            }
        };
        if home.is_empty() || home == "/" {
            return None;
        }
        let home = home.to_str_lossy().into_owned();
        if invocation.command.is_empty() {
            Some(Some(export_line(HOME_VAR, &home)))
        } else {
            invocation.set_var(HOME_VAR, &home);
            Some(None)
        }
    }

    fn resolve_command(
        &self,
        program: &OsStr,
        invocation: &Invocation,
    ) -> Result<PathBuf, TransitionError> {
        which::which_in(program, invocation.var(PATH_VAR), &invocation.cwd).map_err(|source| {
            TransitionError::CommandNotFound {
                program: program.to_owned(),
                source,
            }
        })
    }

    /// Final credentials: the runtime ids plus the supplementary groups the container user should
    /// carry.
    fn privilege_target(
        &self,
        runtime: Ownership,
        retired: Option<Gid>,
    ) -> Result<PrivilegeDrop, TransitionError> {
        let inherited = if self.config.inherit_groups {
            self.credentials
                .supplementary_groups()
                .map_err(PrivDropError::ReadGroups)?
        } else {
            Vec::new()
        };
        let primary = identity_db::find_named_id(&self.paths.passwd, &self.config.user, passwd::GID)?
            .map(Gid::from_raw);
        if primary.is_none() {
            sink_warn!(
                self.sink,
                "user '{}' has no primary group in {}",
                self.config.user,
                self.paths.passwd.display()
            );
        }
        let member_of = identity_db::list_group_membership(&self.paths.group, &self.config.user)?;
        Ok(PrivilegeDrop {
            uid: runtime.uid,
            gid: runtime.gid,
            groups: privdrop::target_groups(&inherited, primary, &member_of, retired),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn axis_decisions() {
        assert_eq!(decide_axis(None, "app"), AxisDecision::Remap);
        assert_eq!(decide_axis(Some("app"), "app"), AxisDecision::AlreadyMatches);
        assert_eq!(
            decide_axis(Some("other"), "app"),
            AxisDecision::Collides {
                existing: "other".into()
            }
        );
        assert!(AxisDecision::Remap.needs_ownership_walk());
        assert!(!AxisDecision::AlreadyMatches.needs_ownership_walk());
        assert!(decide_axis(Some("other"), "app").needs_ownership_walk());
    }

    #[test]
    fn export_line_is_shell_safe() {
        assert_eq!(export_line("HOME", "/home/app"), r#"export HOME="/home/app""#);
        assert_eq!(
            export_line("HOME", r#"/home/"a" $b `c` \d"#),
            r#"export HOME="/home/\"a\" \$b \`c\` \\d""#
        );
    }

    #[test]
    fn invocation_env_update_replaces_in_place() {
        let mut invocation = Invocation {
            command: vec![],
            env: vec![("HOME".into(), "/".into()), ("PATH".into(), "/bin".into())],
            cwd: PathBuf::from("/"),
        };
        invocation.set_var("HOME", "/home/app");
        invocation.set_var("LANG", "C");
        assert_eq!(invocation.var("HOME"), Some(OsStr::new("/home/app")));
        assert_eq!(invocation.env.len(), 3);
        assert_eq!(invocation.env[0].0, "HOME");
    }

    #[test]
    #[serial]
    fn invocation_captures_process_environment() {
        std::env::set_var("IDSHIFT_INVOCATION_TEST", "1");
        let invocation = Invocation::from_process(vec!["true".into()]).unwrap();
        assert_eq!(
            invocation.var("IDSHIFT_INVOCATION_TEST"),
            Some(OsStr::new("1"))
        );
        assert_eq!(invocation.cwd, std::env::current_dir().unwrap());
        std::env::remove_var("IDSHIFT_INVOCATION_TEST");
    }

    #[test]
    fn error_taxonomy() {
        let not_root = TransitionError::Privilege(PrivDropError::NotSuperuser {
            euid: Uid::from_raw(1000),
        });
        assert_eq!(not_root.kind(), ErrorKind::Precondition);
        let unknown = TransitionError::UnknownIdentity {
            kind: IdentityKind::Group,
            name: "app".into(),
        };
        assert_eq!(unknown.kind(), ErrorKind::Configuration);
        assert_eq!(unknown.to_string(), "group 'app' does not exist");
        let setuid = TransitionError::Privilege(PrivDropError::SetUid {
            uid: Uid::from_raw(1500),
            source: nix::errno::Errno::EPERM,
        });
        assert_eq!(setuid.kind(), ErrorKind::Privilege);
    }

    #[test]
    fn plan_without_changes() {
        let plan = TransitionPlan {
            user: Identity {
                kind: IdentityKind::User,
                name: "app".into(),
                numeric_id: 1000,
            },
            group: Identity {
                kind: IdentityKind::Group,
                name: "app".into(),
                numeric_id: 1000,
            },
            runtime: Ownership::new(1000, 1000),
            uid: None,
            gid: None,
            needs_ownership_walk: false,
        };
        assert!(!plan.changes_databases());
    }
}
