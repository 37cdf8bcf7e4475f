#![ doc = include_str!( concat!( env!( "CARGO_MANIFEST_DIR" ), "/", "README.md" ) ) ]
#![deny(missing_docs)]
use core::fmt;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};

pub use log::LevelFilter;

/// Password side-channel for ssh askpass
pub mod askpass;
/// Completion callbacks and result aggregation
pub mod callbacks;
mod command;
/// Host target parsing
pub mod hosts;
/// I/O readiness multiplexing
pub mod iomap;
/// The task scheduler
pub mod manager;
/// A single remote operation
pub mod task;
/// Background spill-file writer
pub mod writer;

pub use callbacks::{Callbacks, DefaultCallbacks};
pub use hosts::HostSpec;
pub use manager::Manager;
pub use task::Task;

use callbacks::OutputBuilder;

/// Default maximum number of tasks running in parallel
pub const DEFAULT_PARALLELISM: usize = 32;
/// Default per-task timeout (zero means no timeout)
pub const DEFAULT_TIMEOUT: Duration = Duration::ZERO;

/// The crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// The crate error type.
///
/// Per-host faults are never reported here; they are data in the per-host
/// result map ([`HostError`]).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The run was interrupted by the user
    #[error("interrupted")]
    Interrupted,
    /// Fatal infrastructure failure, the run could not proceed
    #[error("fatal error: {0}")]
    Fatal(String),
    /// Invalid data received / parameters provided
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// Standard I/O errors
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
    /// OS interface errors
    #[error("System error: {0}")]
    Sys(#[from] nix::errno::Errno),
}

impl Error {
    /// Creates new invalid data error
    pub fn invalid_data<S: fmt::Display>(msg: S) -> Self {
        Error::InvalidData(msg.to_string())
    }
    /// Creates new fatal error
    pub fn fatal<S: fmt::Display>(msg: S) -> Self {
        Error::Fatal(msg.to_string())
    }
}

/// Per-host outcome map returned by [`call`], [`copy`] and [`slurp`]
pub type HostResults = HashMap<String, std::result::Result<HostOutput, HostError>>;

/// Successful per-host outcome.
///
/// Captured stdout/stderr are opaque byte sequences; decoding is up to the
/// caller. When spill directories are configured the per-host file paths are
/// carried alongside (and the buffers are empty unless `inline` was also
/// set).
#[derive(Debug, Clone)]
pub struct HostOutput {
    /// Child exit status (negative means "terminated by signal N")
    pub exit_status: i32,
    /// Captured stdout
    pub stdout: Vec<u8>,
    /// Captured stderr
    pub stderr: Vec<u8>,
    /// Stdout spill file, when `outdir` is configured
    pub outfile: Option<PathBuf>,
    /// Stderr spill file, when `errdir` is configured
    pub errfile: Option<PathBuf>,
    /// Local download path (slurp only)
    pub localpath: Option<PathBuf>,
}

/// Returned instead of a result for a host when processing failed
#[derive(Debug, Clone)]
pub struct HostError {
    /// Comma-joined failure tags
    pub message: String,
    /// Captured stderr, when available
    pub stderr: Vec<u8>,
    /// Child exit status, when the child ran at all
    pub exit_status: Option<i32>,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stderr.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(
                f,
                "{}, Error output: {}",
                self.message,
                String::from_utf8_lossy(&self.stderr)
            )
        }
    }
}

impl std::error::Error for HostError {}

/// Common options for [`call`], [`copy`] and [`slurp`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Max number of tasks running in parallel
    pub limit: usize,
    /// Per-task timeout; zero disables timeouts
    pub timeout: Duration,
    /// Serve a password to the children over the askpass side-channel
    pub askpass: bool,
    /// Askpass password; prompted for on the controlling terminal when unset
    #[serde(skip)]
    pub password: Option<Vec<u8>>,
    /// Write stdout to a file per host in this directory
    pub outdir: Option<PathBuf>,
    /// Write stderr to a file per host in this directory
    pub errdir: Option<PathBuf>,
    /// Extra `-o` options passed to ssh/scp
    pub ssh_options: Vec<String>,
    /// Extra arguments passed to ssh/scp
    pub ssh_extra: Vec<String>,
    /// Warning and diagnostic messages
    pub verbose: bool,
    /// Silence progress output
    pub quiet: bool,
    /// Print remote stdout as it is received, prefixed with the host name
    pub print_out: bool,
    /// Keep stdout and stderr in memory buffers
    pub inline: bool,
    /// Keep stdout in a memory buffer
    pub inline_stdout: bool,
    /// Bytes fed to each task's stdin
    #[serde(skip)]
    pub input_stream: Option<Vec<u8>>,
    /// User to connect as, unless overridden per host
    pub default_user: Option<String>,
    /// Copy recursively (copy and slurp only)
    pub recursive: bool,
    /// Local base directory to download to (slurp only)
    pub localdir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PARALLELISM,
            timeout: DEFAULT_TIMEOUT,
            askpass: false,
            password: None,
            outdir: None,
            errdir: None,
            ssh_options: Vec::new(),
            ssh_extra: Vec::new(),
            verbose: false,
            quiet: false,
            print_out: false,
            inline: true,
            inline_stdout: false,
            input_stream: None,
            default_user: None,
            recursive: true,
            localdir: None,
        }
    }
}

fn expand_hosts<I, H>(hosts: I, opts: &Options) -> Vec<HostSpec>
where
    I: IntoIterator<Item = H>,
    H: Into<HostSpec>,
{
    hosts
        .into_iter()
        .map(|h| h.into().or_user(opts.default_user.as_deref()))
        .collect()
}

fn prepare_spill_dirs(opts: &Options) -> Result<()> {
    for dir in [&opts.outdir, &opts.errdir].into_iter().flatten() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Executes `cmdline` on a set of hosts, collecting the output.
///
/// Returns one entry per distinct host: the exit status with the captured
/// output, or a [`HostError`] describing what went wrong on that host.
pub fn call<I, H>(hosts: I, cmdline: &str, opts: &Options) -> Result<HostResults>
where
    I: IntoIterator<Item = H>,
    H: Into<HostSpec>,
{
    prepare_spill_dirs(opts)?;
    let mut manager = Manager::new(opts);
    for host in expand_hosts(hosts, opts) {
        let cmd = command::build_call(&host, cmdline, opts);
        manager.add_task(Task::new(host, cmd, opts));
    }
    manager.run(&mut OutputBuilder::new())
}

/// Copies the local path `src` to `dst` on a set of hosts
pub fn copy<I, H>(hosts: I, src: &str, dst: &str, opts: &Options) -> Result<HostResults>
where
    I: IntoIterator<Item = H>,
    H: Into<HostSpec>,
{
    prepare_spill_dirs(opts)?;
    let mut manager = Manager::new(opts);
    for host in expand_hosts(hosts, opts) {
        let cmd = command::build_copy(&host, src, dst, opts);
        manager.add_task(Task::new(host, cmd, opts));
    }
    manager.run(&mut OutputBuilder::new())
}

/// Copies the remote path `src` from a set of hosts to
/// `<localdir?>/<host>/<dst>` locally.
///
/// `dst` must be a relative path; an absolute path is a usage error reported
/// before any task is started.
pub fn slurp<I, H>(hosts: I, src: &str, dst: &str, opts: &Options) -> Result<HostResults>
where
    I: IntoIterator<Item = H>,
    H: Into<HostSpec>,
{
    if Path::new(dst).is_absolute() {
        return Err(Error::invalid_data(
            "slurp: destination must be a relative path",
        ));
    }
    let hosts = expand_hosts(hosts, opts);
    let localpaths = make_local_dirs(&hosts, dst, opts)?;
    prepare_spill_dirs(opts)?;
    let mut manager = Manager::new(opts);
    for host in hosts {
        let localpath = &localpaths[host.host()];
        let cmd = command::build_slurp(&host, src, localpath, opts);
        manager.add_task(Task::new(host, cmd, opts));
    }
    manager.run(&mut OutputBuilder::with_localpaths(localpaths))
}

fn make_local_dirs(
    hosts: &[HostSpec],
    dst: &str,
    opts: &Options,
) -> Result<HashMap<String, PathBuf>> {
    let mut localpaths = HashMap::new();
    for host in hosts {
        let dirname = match &opts.localdir {
            Some(localdir) => localdir.join(host.host()),
            None => PathBuf::from(host.host()),
        };
        fs::create_dir_all(&dirname)?;
        localpaths.insert(host.host().to_owned(), dirname.join(dst));
    }
    Ok(localpaths)
}

/// Returns true if started in production mode (as a systemd unit)
pub fn is_production() -> bool {
    env::var("INVOCATION_ID").map_or(false, |v| !v.is_empty())
}

/// Configures stdout logger with the given filter. If started in production
/// mode, does not log timestamps
pub fn configure_logger(filter: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stdout);
    builder.filter_level(filter);
    if is_production() {
        builder.format(|buf, record| writeln!(buf, "{} {}", record.level(), record.args()));
    }
    builder.init();
}

/// Prelude module
pub mod prelude {
    pub use crate::callbacks::{Callbacks, DefaultCallbacks};
    pub use crate::hosts::HostSpec;
    pub use crate::manager::Manager;
    pub use crate::task::Task;
    pub use crate::{call, copy, slurp, Options};
    pub use std::time::Duration;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_slurp_rejects_absolute_destination() {
        let result = slurp(["h1"], "/etc/hosts", "/abs/path", &Options::default());
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_expand_hosts_applies_default_user() {
        let opts = Options {
            default_user: Some("deploy".to_owned()),
            ..Options::default()
        };
        let hosts = expand_hosts(["h1", "admin@h2"], &opts);
        assert_eq!(hosts[0].user(), Some("deploy"));
        assert_eq!(hosts[1].user(), Some("admin"));
    }

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.limit, DEFAULT_PARALLELISM);
        assert!(opts.timeout.is_zero());
        assert!(opts.inline);
        assert!(opts.recursive);
        assert!(!opts.askpass);
    }

    #[test]
    fn test_host_error_display() {
        let err = HostError {
            message: "Timed out, Killed by signal 9".to_owned(),
            stderr: b"broken\n".to_vec(),
            exit_status: Some(-9),
        };
        assert_eq!(
            err.to_string(),
            "Timed out, Killed by signal 9, Error output: broken\n"
        );
    }
}
