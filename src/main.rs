use std::ffi::{CString, NulError, OsString};
use std::io::Write as _;
use std::os::unix::ffi::OsStrExt as _;
use std::process::ExitCode;

use clap::Parser;
use idshift::config::{Config, ConfigError, SystemPaths};
use idshift::controller::{Controller, Invocation, ProcessOutcome, TransitionError};
use idshift::log_sink::{FacadeSink, LogSink};
use idshift::privdrop::ProcessCredentials;
use idshift::remap::SystemChown;
use idshift::sink_info;
use nix::errno::Errno;

#[macro_use]
extern crate log;

#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Only print warnings and errors
    #[arg(short, long)]
    quiet: bool,
    /// Command to run as the runtime user, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("couldn't assert that the process is single threaded")]
    NotSingleThreaded,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("can't read the process environment: {0}")]
    Environment(std::io::Error),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("argument or environment entry contains a NUL byte: {0}")]
    Nul(#[from] NulError),
    #[error("exec failed: {0}")]
    Exec(Errno),
}

/// Fixed at info: `RUST_LOG` is not consulted, so fatal errors always reach the operator.
fn logger() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(log::LevelFilter::Info)
        .format(|buf, record| writeln!(buf, "idshift: {}", record.args()));
    builder
}

fn warn_development_use(sink: &impl LogSink) {
    sink_info!(
        sink,
        "idshift should only ever be used on development systems. DO NOT USE IN PRODUCTION"
    );
}

fn cstring(bytes: &[u8]) -> Result<CString, NulError> {
    CString::new(bytes.to_vec())
}

fn perform(outcome: ProcessOutcome) -> Result<ExitCode, Error> {
    match outcome {
        ProcessOutcome::Exit { status, export } => {
            if let Some(line) = export {
                println!("{line}");
            }
            Ok(ExitCode::from(status))
        }
        ProcessOutcome::Replace { program, args, env } => {
            let program = cstring(program.as_os_str().as_bytes())?;
            let args = args
                .iter()
                .map(|a| cstring(a.as_bytes()))
                .collect::<Result<Vec<_>, _>>()?;
            let env = env
                .iter()
                .map(|(k, v)| {
                    let mut entry = k.as_bytes().to_vec();
                    entry.push(b'=');
                    entry.extend_from_slice(v.as_bytes());
                    CString::new(entry)
                })
                .collect::<Result<Vec<_>, _>>()?;
            match nix::unistd::execve(&program, &args, &env) {
                Ok(never) => match never {},
                Err(e) => Err(Error::Exec(e)),
            }
        }
    }
}

fn run(args: Args) -> Result<ExitCode, Error> {
    // Credential changes apply to the calling thread only.
    if num_threads::is_single_threaded() != Some(true) {
        return Err(Error::NotSingleThreaded);
    }

    let sink = FacadeSink::new(args.quiet);
    warn_development_use(&sink);

    let paths = SystemPaths::default();
    let (config, _) = Config::discover(&paths.config_dir, &sink)?;

    let invocation = Invocation::from_process(args.command).map_err(Error::Environment)?;
    let mut credentials = ProcessCredentials;
    let mut chown = SystemChown;
    let transition =
        Controller::new(&config, &paths, &mut credentials, &mut chown, &sink).run(invocation)?;
    perform(transition.outcome)
}

fn main() -> ExitCode {
    logger().init();
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
