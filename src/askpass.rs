//! Password side-channel for ssh.
//!
//! `ssh` cannot be handed a password on the command line; it can however be
//! pointed at an askpass program via `SSH_ASKPASS`. The [`PasswordServer`]
//! listens on a private unix socket and hands the in-memory password to the
//! `parallax-askpass` helper, which the child ssh launches whenever it needs
//! one. Host-key confirmations and other yes/no questions are rejected by
//! the helper so the run never hangs on them.

use std::env;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd as _;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tempfile::TempDir;
use termios::{tcsetattr, Termios, ECHO, TCSANOW};
use tracing::{error, warn};
use which::which;

use crate::{Error, Result};

/// Environment variable naming the askpass socket for the helper
pub const ASKPASS_SOCKET_ENV: &str = "PARALLAX_ASKPASS_SOCKET";
/// Environment variable enabling helper diagnostics
pub const ASKPASS_VERBOSE_ENV: &str = "PARALLAX_ASKPASS_VERBOSE";

const HELPER_NAME: &str = "parallax-askpass";
const HELPER_PATHS: &[&str] = &[
    "/usr/bin/parallax-askpass",
    "/usr/libexec/parallax/parallax-askpass",
    "/usr/local/libexec/parallax/parallax-askpass",
    "/usr/lib/parallax/parallax-askpass",
    "/usr/local/lib/parallax/parallax-askpass",
];

/// Local-only endpoint serving the password to askpass helper invocations.
///
/// Each accepted connection receives the password once and is closed. The
/// lifecycle is bound to one [`Manager`](crate::Manager) run.
pub struct PasswordServer {
    // keeps the 0700 socket directory alive
    _dir: TempDir,
    path: PathBuf,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PasswordServer {
    /// Binds the socket and starts the accept-loop thread.
    ///
    /// Failure here is fatal for the whole run, not a per-host error.
    pub fn start(password: Vec<u8>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("parallax-")
            .tempdir()
            .map_err(|e| Error::fatal(format!("askpass socket dir: {}", e)))?;
        fs::set_permissions(dir.path(), Permissions::from_mode(0o700))
            .map_err(|e| Error::fatal(format!("askpass socket dir permissions: {}", e)))?;
        let path = dir.path().join("askpass.sock");
        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::fatal(format!("bind {}: {}", path.display(), e)))?;
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("pax-askpass".to_owned())
            .spawn(move || accept_loop(&listener, &password, &worker_stop))
            .map_err(|e| Error::fatal(format!("askpass server thread: {}", e)))?;
        Ok(Self {
            _dir: dir,
            path,
            stop,
            worker: Some(worker),
        })
    }
    /// Socket path, exported to children as `PARALLAX_ASKPASS_SOCKET`
    pub fn address(&self) -> &Path {
        &self.path
    }
    /// Stops the accept loop and joins the thread
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }
    fn stop_and_join(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        // wake the accept loop
        let _ = UnixStream::connect(&self.path);
        if worker.join().is_err() {
            error!("askpass server thread panicked");
        }
    }
}

impl Drop for PasswordServer {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn accept_loop(listener: &UnixListener, password: &[u8], stop: &AtomicBool) {
    loop {
        match listener.accept() {
            Ok((mut stream, _)) => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = stream.write_all(password) {
                    warn!(%e, "askpass client went away");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(%e, "askpass accept failed");
                return;
            }
        }
    }
}

/// Locates the askpass helper executable for `SSH_ASKPASS`.
///
/// Looks next to the current executable first, then in the well-known
/// install locations, then on `$PATH`. Resolved once per manager.
pub fn helper_path() -> Option<PathBuf> {
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(HELPER_NAME);
            if is_executable(&sibling) {
                return Some(sibling);
            }
        }
    }
    for path in HELPER_PATHS {
        let path = Path::new(path);
        if is_executable(path) {
            return Some(path.to_owned());
        }
    }
    which(HELPER_NAME).ok()
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Returns true for prompts the helper is allowed to answer.
///
/// ssh may also ask yes/no questions (host keys, agent confirmation); only
/// an actual password prompt gets the password.
pub fn is_password_prompt(prompt: &str) -> bool {
    prompt.trim().to_lowercase().ends_with("password:")
}

/// Implementation of the `parallax-askpass` helper binary.
///
/// Validates the prompt received from ssh, fetches the password from the
/// socket named by `PARALLAX_ASKPASS_SOCKET` and prints it. Returns the
/// process exit code.
pub fn client_main(args: &[String]) -> i32 {
    let verbose = env::var_os(ASKPASS_VERBOSE_ENV).is_some();
    let Some(prompt) = args.first() else {
        eprintln!("Error: parallax-askpass called without a prompt.");
        return 1;
    };
    if verbose {
        eprintln!("parallax-askpass received prompt: \"{}\"", prompt);
    }
    if !is_password_prompt(prompt) {
        eprintln!("{}", prompt);
        return 1;
    }
    let Some(address) = env::var_os(ASKPASS_SOCKET_ENV) else {
        eprintln!(
            "parallax error: SSH requested a password. Please create SSH keys \
             or use the askpass option to provide one."
        );
        return 1;
    };
    let mut stream = match UnixStream::connect(&address) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Couldn't connect to {}: {}.", address.to_string_lossy(), e);
            return 2;
        }
    };
    let mut password = Vec::new();
    if stream.read_to_end(&mut password).is_err() {
        eprintln!("Socket error.");
        return 3;
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if out.write_all(&password).and_then(|()| writeln!(out)).is_err() {
        return 3;
    }
    0
}

/// Reads a password from the controlling terminal with echo disabled
pub fn read_password(prompt: &str) -> Result<Vec<u8>> {
    let mut tty = OpenOptions::new().read(true).write(true).open("/dev/tty")?;
    let fd = tty.as_raw_fd();
    let saved = Termios::from_fd(fd)?;
    let mut silent = saved;
    silent.c_lflag &= !ECHO;
    tcsetattr(fd, TCSANOW, &silent)?;
    tty.write_all(prompt.as_bytes())?;
    tty.flush()?;
    let mut line = String::new();
    let read = BufReader::new(&tty).read_line(&mut line);
    tcsetattr(fd, TCSANOW, &saved)?;
    tty.write_all(b"\n")?;
    read?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line.into_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prompt_validation() {
        assert!(is_password_prompt("Password:"));
        assert!(is_password_prompt("admin@node1's password: "));
        assert!(is_password_prompt("  PASSWORD:  "));
        assert!(!is_password_prompt(
            "Are you sure you want to continue connecting (yes/no)?"
        ));
        assert!(!is_password_prompt(""));
    }

    #[test]
    fn test_serves_password_once_per_connection() {
        let server = PasswordServer::start(b"hunter2".to_vec()).unwrap();
        for _ in 0..3 {
            let mut stream = UnixStream::connect(server.address()).unwrap();
            let mut got = Vec::new();
            stream.read_to_end(&mut got).unwrap();
            assert_eq!(got, b"hunter2");
        }
        server.shutdown();
    }

    #[test]
    fn test_shutdown_joins() {
        let server = PasswordServer::start(b"pw".to_vec()).unwrap();
        let path = server.address().to_owned();
        server.shutdown();
        assert!(UnixStream::connect(&path).is_err());
    }
}
