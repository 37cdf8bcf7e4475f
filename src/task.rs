//! A single remote operation: one child process, its three pipes and its
//! termination state machine.

use std::env;
use std::io::{self, Read as _, Write as _};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use bma_ts::Monotonic;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::askpass::{ASKPASS_SOCKET_ENV, ASKPASS_VERBOSE_ENV};
use crate::hosts::HostSpec;
use crate::iomap::{IoMap, Token};
use crate::writer::{Writer, WriterHandle};
use crate::{Options, Result};

/// Environment variable carrying the task sequence number to the child
pub const NODENUM_ENV: &str = "PARALLAX_NODENUM";
/// Environment variable carrying the target host name to the child
pub const HOST_ENV: &str = "PARALLAX_HOST";

// ssh consults SSH_ASKPASS only when DISPLAY is non-empty and no terminal is
// attached, so DISPLAY gets a throwaway value when unset.
const DISPLAY_SENTINEL: &str = "parallax-gibberish";

/// Pipe I/O chunk size
const CHUNK_SIZE: usize = 1 << 16;

/// Identifies one of the three standard pipes of a task's child
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskPipe {
    /// Child standard input (write side)
    Stdin,
    /// Child standard output (read side)
    Stdout,
    /// Child standard error (read side)
    Stderr,
}

/// Task lifecycle state; transitions are monotonic
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TaskState {
    /// Queued, not started yet
    #[default]
    Pending,
    /// Child spawned, pipes open or child not reaped
    Running,
    /// Completed (exit status recorded or failure captured)
    Done,
    /// Cancelled before it ever ran
    Cancelled,
}

/// Starts a child process and manages its input and output.
///
/// Upon completion [`Task::exit_status`] holds the exit code of the process
/// (negative values mean "terminated by signal N"). Any failure appends a
/// short tag to [`Task::failures`]; a task with a non-empty failure list is
/// reported as failed regardless of its exit status.
pub struct Task {
    host: String,
    pretty_host: String,
    cmd: Vec<String>,
    state: TaskState,
    child: Option<Child>,
    started_at: Option<Monotonic>,
    killed: bool,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    input: Option<Vec<u8>>,
    written: usize,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    outfile: Option<PathBuf>,
    errfile: Option<PathBuf>,
    writer: Option<WriterHandle>,
    exit_status: Option<i32>,
    failures: Vec<String>,
    verbose: bool,
    quiet: bool,
    print_out: bool,
    inline: bool,
    inline_stdout: bool,
}

impl Task {
    /// Creates a task for the given target and argv, taking the I/O and
    /// verbosity flags from `opts`
    pub fn new(host: HostSpec, cmd: Vec<String>, opts: &Options) -> Self {
        let pretty_host = host.display_name(opts.default_user.as_deref());
        Self {
            host: host.host().to_owned(),
            pretty_host,
            cmd,
            state: TaskState::Pending,
            child: None,
            started_at: None,
            killed: false,
            stdin: None,
            stdout: None,
            stderr: None,
            input: opts.input_stream.clone(),
            written: 0,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            outfile: None,
            errfile: None,
            writer: None,
            exit_status: None,
            failures: Vec::new(),
            verbose: opts.verbose,
            quiet: opts.quiet,
            print_out: opts.print_out,
            inline: opts.inline,
            inline_stdout: opts.inline || opts.inline_stdout,
        }
    }

    /// Target host name
    pub fn host(&self) -> &str {
        &self.host
    }
    /// Display form of the target (`user@host:port`)
    pub fn pretty_host(&self) -> &str {
        &self.pretty_host
    }
    /// Lifecycle state
    pub fn state(&self) -> TaskState {
        self.state
    }
    /// True once the task is done or cancelled
    pub fn is_finished(&self) -> bool {
        matches!(self.state, TaskState::Done | TaskState::Cancelled)
    }
    /// Exit status of the child; `None` until reaped (or when the task never
    /// ran). Negative values mean "terminated by signal N".
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }
    /// Ordered failure tags
    pub fn failures(&self) -> &[String] {
        &self.failures
    }
    /// Captured stdout (empty unless `inline`/`inline_stdout` is set)
    pub fn output_buffer(&self) -> &[u8] {
        &self.stdout_buf
    }
    /// Captured stderr (empty unless `inline` is set)
    pub fn error_buffer(&self) -> &[u8] {
        &self.stderr_buf
    }
    /// Spill file for stdout, when an output directory is configured
    pub fn outfile(&self) -> Option<&Path> {
        self.outfile.as_deref()
    }
    /// Spill file for stderr, when an error directory is configured
    pub fn errfile(&self) -> Option<&Path> {
        self.errfile.as_deref()
    }
    /// True when progress output is suppressed for this task
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Spawns the child in its own session and registers the pipes.
    ///
    /// A spawn failure is captured as a per-host failure and completes the
    /// task; an error is returned only for multiplexer registration
    /// problems, which are fatal for the run.
    pub(crate) fn start(
        &mut self,
        id: usize,
        nodenum: usize,
        iomap: &mut dyn IoMap,
        writer: Option<&mut Writer>,
        askpass_socket: Option<&Path>,
        askpass_helper: Option<&Path>,
    ) -> Result<()> {
        if let Some(writer) = writer {
            let (outfile, errfile) = writer.open_files(&self.pretty_host);
            self.outfile = outfile;
            self.errfile = errfile;
            self.writer = Some(writer.handle());
        }
        let Some(program) = self.cmd.first() else {
            self.failures.push("I/O exception: empty command".to_owned());
            self.state = TaskState::Done;
            return Ok(());
        };
        let mut cmd = Command::new(program);
        cmd.args(&self.cmd[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(NODENUM_ENV, nodenum.to_string())
            .env(HOST_ENV, &self.host);
        if let Some(helper) = askpass_helper {
            cmd.env("SSH_ASKPASS", helper);
        }
        if let Some(socket) = askpass_socket {
            cmd.env(ASKPASS_SOCKET_ENV, socket);
        }
        if self.verbose {
            cmd.env(ASKPASS_VERBOSE_ENV, "1");
        }
        if env::var_os("DISPLAY").is_none() {
            cmd.env("DISPLAY", DISPLAY_SENTINEL);
        }
        // SAFETY: setsid is async-signal-safe per POSIX; the child becomes a
        // session and process-group leader so the whole tree can be killed.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.failures.push(format!("I/O exception: {}", e));
                self.state = TaskState::Done;
                return Ok(());
            }
        };
        self.state = TaskState::Running;
        self.started_at = Some(Monotonic::now());
        if self.input.is_some() {
            if let Some(stdin) = child.stdin.take() {
                set_nonblocking(stdin.as_raw_fd())?;
                iomap.register_write(
                    stdin.as_raw_fd(),
                    Token {
                        task: id,
                        pipe: TaskPipe::Stdin,
                    },
                )?;
                self.stdin = Some(stdin);
            }
        } else {
            drop(child.stdin.take());
        }
        if let Some(stdout) = child.stdout.take() {
            set_nonblocking(stdout.as_raw_fd())?;
            iomap.register_read(
                stdout.as_raw_fd(),
                Token {
                    task: id,
                    pipe: TaskPipe::Stdout,
                },
            )?;
            self.stdout = Some(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            set_nonblocking(stderr.as_raw_fd())?;
            iomap.register_read(
                stderr.as_raw_fd(),
                Token {
                    task: id,
                    pipe: TaskPipe::Stderr,
                },
            )?;
            self.stderr = Some(stderr);
        }
        self.child = Some(child);
        Ok(())
    }

    /// Checks whether the task is still running, reaping the child once all
    /// pipes are closed. Records the exit status and the matching failure
    /// tag on completion.
    pub(crate) fn running(&mut self) -> bool {
        if self.stdin.is_some() || self.stdout.is_some() || self.stderr.is_some() {
            return true;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let exit = status
                    .code()
                    .unwrap_or_else(|| -status.signal().unwrap_or(0));
                self.record_exit(exit);
                if exit > 0 {
                    self.failures
                        .push(format!("Exited with error code {}", exit));
                } else if exit < 0 && !self.killed {
                    self.failures.push(format!("Killed by signal {}", -exit));
                }
                self.child = None;
                self.state = TaskState::Done;
                false
            }
            Ok(None) => {
                if self.killed {
                    // The kill has not been observed by the OS yet; report
                    // what waiting would eventually return.
                    self.record_exit(-(Signal::SIGKILL as i32));
                    self.state = TaskState::Done;
                    return false;
                }
                true
            }
            Err(e) => {
                self.failures.push(format!("I/O exception: {}", e));
                self.child = None;
                self.state = TaskState::Done;
                false
            }
        }
    }

    /// Time since the child was started
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .as_ref()
            .map_or(Duration::ZERO, Monotonic::elapsed)
    }

    /// Kills the process group and registers a timeout failure
    pub fn timedout(&mut self) {
        self.kill();
        self.add_failure_once("Timed out");
    }

    /// Kills the process group and registers an interrupt failure
    pub fn interrupted(&mut self) {
        self.kill();
        self.add_failure_once("Interrupted");
    }

    /// Marks a task that has not started as cancelled
    pub fn cancel(&mut self) {
        self.failures.push("Cancelled".to_owned());
        self.state = TaskState::Cancelled;
    }

    // One SIGKILL to the whole process group, idempotent.
    fn kill(&mut self) {
        if self.killed {
            return;
        }
        if let Some(child) = &self.child {
            #[allow(clippy::cast_possible_wrap)]
            let pgid = Pid::from_raw(child.id() as i32);
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                // kill failing means the group is already gone
                debug!(%e, host = %self.host, "kill failed, assuming the process is dead");
            }
        }
        self.killed = true;
    }

    fn add_failure_once(&mut self, tag: &str) {
        if !self.failures.iter().any(|f| f == tag) {
            self.failures.push(tag.to_owned());
        }
    }

    fn record_exit(&mut self, exit: i32) {
        if self.exit_status.is_none() {
            self.exit_status = Some(exit);
        }
    }

    /// Dispatches a readiness event for one of the task's pipes
    pub(crate) fn handle_event(&mut self, pipe: TaskPipe, iomap: &mut dyn IoMap) {
        match pipe {
            TaskPipe::Stdin => self.handle_stdin(iomap),
            TaskPipe::Stdout => self.handle_stdout(iomap),
            TaskPipe::Stderr => self.handle_stderr(iomap),
        }
    }

    fn handle_stdin(&mut self, iomap: &mut dyn IoMap) {
        if self.stdin.is_none() {
            return;
        }
        let total = self.input.as_ref().map_or(0, Vec::len);
        if self.written >= total {
            self.close_stdin(iomap);
            return;
        }
        let end = (self.written + CHUNK_SIZE).min(total);
        let result = match (self.input.as_ref(), self.stdin.as_mut()) {
            (Some(input), Some(stdin)) => stdin.write(&input[self.written..end]),
            _ => return,
        };
        match result {
            Ok(n) => self.written += n,
            Err(e) if retryable(&e) => {}
            Err(e) => {
                self.close_stdin(iomap);
                self.log_failure(&e, TaskPipe::Stdin);
            }
        }
    }

    fn handle_stdout(&mut self, iomap: &mut dyn IoMap) {
        let Some(stdout) = self.stdout.as_mut() else {
            return;
        };
        let mut chunk = vec![0u8; CHUNK_SIZE];
        match stdout.read(&mut chunk) {
            Ok(0) => self.close_stdout(iomap),
            Ok(n) => {
                let data = &chunk[..n];
                if self.inline_stdout {
                    if self.quiet {
                        self.stdout_buf.extend_from_slice(self.host.as_bytes());
                        self.stdout_buf.extend_from_slice(b": ");
                    }
                    self.stdout_buf.extend_from_slice(data);
                }
                if let (Some(writer), Some(outfile)) = (&self.writer, &self.outfile) {
                    writer.write(outfile, data);
                }
                if self.print_out {
                    print_lines(&self.host, data);
                }
            }
            Err(e) if retryable(&e) => {}
            Err(e) => {
                self.close_stdout(iomap);
                self.log_failure(&e, TaskPipe::Stdout);
            }
        }
    }

    fn handle_stderr(&mut self, iomap: &mut dyn IoMap) {
        let Some(stderr) = self.stderr.as_mut() else {
            return;
        };
        let mut chunk = vec![0u8; CHUNK_SIZE];
        match stderr.read(&mut chunk) {
            Ok(0) => self.close_stderr(iomap),
            Ok(n) => {
                if self.inline {
                    self.stderr_buf.extend_from_slice(&chunk[..n]);
                }
                if let (Some(writer), Some(errfile)) = (&self.writer, &self.errfile) {
                    writer.write(errfile, &chunk[..n]);
                }
            }
            Err(e) if retryable(&e) => {}
            Err(e) => {
                self.close_stderr(iomap);
                self.log_failure(&e, TaskPipe::Stderr);
            }
        }
    }

    fn close_stdin(&mut self, iomap: &mut dyn IoMap) {
        if let Some(stdin) = self.stdin.take() {
            let _ = iomap.unregister(stdin.as_raw_fd());
        }
    }

    fn close_stdout(&mut self, iomap: &mut dyn IoMap) {
        if let Some(stdout) = self.stdout.take() {
            let _ = iomap.unregister(stdout.as_raw_fd());
            if let (Some(writer), Some(outfile)) = (&self.writer, &self.outfile) {
                writer.close(outfile);
            }
        }
    }

    fn close_stderr(&mut self, iomap: &mut dyn IoMap) {
        if let Some(stderr) = self.stderr.take() {
            let _ = iomap.unregister(stderr.as_raw_fd());
            if let (Some(writer), Some(errfile)) = (&self.writer, &self.errfile) {
                writer.close(errfile);
            }
        }
    }

    /// Unregisters and closes any pipe that is still open
    pub(crate) fn teardown(&mut self, iomap: &mut dyn IoMap) {
        self.close_stdin(iomap);
        self.close_stdout(iomap);
        self.close_stderr(iomap);
    }

    fn log_failure(&mut self, err: &io::Error, pipe: TaskPipe) {
        let tag = if self.verbose {
            format!("I/O exception: {} ({:?})", err, pipe)
        } else {
            format!("I/O exception: {}", err)
        };
        self.failures.push(tag);
    }
}

fn retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn print_lines(host: &str, data: &[u8]) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    for line in data.split(|b| *b == b'\n') {
        let _ = writeln!(out, "{}: {}", host, String::from_utf8_lossy(line));
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::iomap::PollIoMap;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    fn drain(task: &mut Task, iomap: &mut PollIoMap) {
        let start = Instant::now();
        let mut events = Vec::new();
        while task.running() {
            assert!(start.elapsed() < Duration::from_secs(10), "task stuck");
            events.clear();
            iomap
                .poll(Duration::from_millis(100), &mut events)
                .unwrap();
            for ev in &events {
                task.handle_event(ev.token.pipe, iomap);
            }
        }
    }

    #[test]
    fn test_capture_and_exit_status() {
        let mut iomap = PollIoMap::new();
        let opts = Options::default();
        let mut task = Task::new(HostSpec::new("h1"), sh("echo out; echo err >&2"), &opts);
        task.start(0, 0, &mut iomap, None, None, None).unwrap();
        drain(&mut task, &mut iomap);
        assert_eq!(task.exit_status(), Some(0));
        assert!(task.failures().is_empty());
        assert_eq!(task.output_buffer(), b"out\n");
        assert_eq!(task.error_buffer(), b"err\n");
        assert_eq!(task.state(), TaskState::Done);
        assert!(iomap.is_empty());
    }

    #[test]
    fn test_nonzero_exit() {
        let mut iomap = PollIoMap::new();
        let mut task = Task::new(HostSpec::new("h1"), sh("exit 3"), &Options::default());
        task.start(0, 0, &mut iomap, None, None, None).unwrap();
        drain(&mut task, &mut iomap);
        assert_eq!(task.exit_status(), Some(3));
        assert_eq!(task.failures(), &["Exited with error code 3".to_owned()]);
    }

    #[test]
    fn test_stdin_payload() {
        let mut iomap = PollIoMap::new();
        let opts = Options {
            input_stream: Some(b"payload".to_vec()),
            ..Options::default()
        };
        let mut task = Task::new(HostSpec::new("h1"), sh("cat"), &opts);
        task.start(0, 0, &mut iomap, None, None, None).unwrap();
        drain(&mut task, &mut iomap);
        assert_eq!(task.exit_status(), Some(0));
        assert_eq!(task.output_buffer(), b"payload");
    }

    #[test]
    fn test_kill_is_idempotent_with_both_tags() {
        let mut iomap = PollIoMap::new();
        let mut task = Task::new(HostSpec::new("h1"), sh("sleep 30"), &Options::default());
        task.start(0, 0, &mut iomap, None, None, None).unwrap();
        assert!(task.running());
        task.timedout();
        task.interrupted();
        task.timedout();
        assert_eq!(
            task.failures(),
            &["Timed out".to_owned(), "Interrupted".to_owned()]
        );
        drain(&mut task, &mut iomap);
        assert_eq!(task.exit_status(), Some(-9));
    }

    #[test]
    fn test_cancel() {
        let mut task = Task::new(HostSpec::new("h1"), sh("echo hi"), &Options::default());
        task.cancel();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(task.is_finished());
        assert_eq!(task.failures(), &["Cancelled".to_owned()]);
        assert_eq!(task.exit_status(), None);
    }

    #[test]
    fn test_spawn_failure_is_per_host() {
        let mut iomap = PollIoMap::new();
        let mut task = Task::new(
            HostSpec::new("h1"),
            vec!["/nonexistent/parallax-test-binary".to_owned()],
            &Options::default(),
        );
        task.start(0, 0, &mut iomap, None, None, None).unwrap();
        assert!(!task.running());
        assert_eq!(task.state(), TaskState::Done);
        assert!(task.failures()[0].starts_with("I/O exception:"));
        assert!(iomap.is_empty());
    }
}
