//! The scheduler: executes queued tasks concurrently with bounded
//! parallelism, driving the I/O multiplexer and the timeout state machine.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::SIGINT;
use tracing::warn;

use crate::askpass::{self, PasswordServer};
use crate::callbacks::Callbacks;
use crate::iomap::{make_iomap, IoEvent, IoMap};
use crate::task::Task;
use crate::writer::Writer;
use crate::{Error, Options, Result};

/// Executes tasks concurrently.
///
/// Tasks are added with [`Manager::add_task`] and executed in parallel with
/// [`Manager::run`], which drives a single-threaded readiness loop: start up
/// to `limit` tasks, poll for pipe events, reap finished tasks, kill
/// timed-out ones. All task state is owned and mutated here; the only other
/// threads are the spill writer and the askpass accept loop.
pub struct Manager {
    limit: usize,
    timeout: Duration,
    askpass: bool,
    password: Option<Vec<u8>>,
    outdir: Option<PathBuf>,
    errdir: Option<PathBuf>,
    iomap: Box<dyn IoMap>,
    tasks: Vec<Task>,
    pending: VecDeque<usize>,
    running: Vec<usize>,
    done: Vec<usize>,
    taskcount: usize,
    writer: Option<Writer>,
    pass_server: Option<PasswordServer>,
    askpass_helper: Option<PathBuf>,
    events: Vec<IoEvent>,
}

impl Manager {
    /// Creates a manager configured from `opts`
    pub fn new(opts: &Options) -> Self {
        Self {
            limit: opts.limit.max(1),
            timeout: opts.timeout,
            askpass: opts.askpass,
            password: opts.password.clone(),
            outdir: opts.outdir.clone(),
            errdir: opts.errdir.clone(),
            iomap: make_iomap(),
            tasks: Vec::new(),
            pending: VecDeque::new(),
            running: Vec::new(),
            done: Vec::new(),
            taskcount: 0,
            writer: None,
            pass_server: None,
            askpass_helper: askpass::helper_path(),
            events: Vec::new(),
        }
    }

    /// Adds a task to be processed with [`Manager::run`]
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
        self.pending.push_back(self.tasks.len() - 1);
    }

    /// All submitted tasks, in submission order
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Completed tasks, in completion order
    pub fn done_tasks(&self) -> impl Iterator<Item = &Task> {
        self.done.iter().map(|&id| &self.tasks[id])
    }

    /// Output spill directory, if configured
    pub fn outdir(&self) -> Option<&Path> {
        self.outdir.as_deref()
    }

    /// Error spill directory, if configured
    pub fn errdir(&self) -> Option<&Path> {
        self.errdir.as_deref()
    }

    /// Processes all queued tasks and returns whatever `callbacks.result`
    /// produces.
    ///
    /// Returns [`Error::Interrupted`] when the user interrupts the run (all
    /// tasks are still reported through `callbacks.finished` first) and
    /// [`Error::Fatal`] when the run could not start at all. Per-host
    /// failures never surface here; they are data in the callback results.
    pub fn run<C: Callbacks>(&mut self, callbacks: &mut C) -> Result<C::Output> {
        if self.outdir.is_some() || self.errdir.is_some() {
            self.writer = Some(Writer::start(self.outdir.clone(), self.errdir.clone())?);
        }
        let result = self.start_askpass().and_then(|()| {
            let interrupted = Arc::new(AtomicBool::new(false));
            let sig = signal_hook::flag::register(SIGINT, Arc::clone(&interrupted))?;
            let result = self.run_loop(callbacks, &interrupted);
            signal_hook::low_level::unregister(sig);
            result
        });
        if let Some(writer) = self.writer.take() {
            writer.shutdown();
        }
        if let Some(server) = self.pass_server.take() {
            server.shutdown();
        }
        result
    }

    fn start_askpass(&mut self) -> Result<()> {
        if !self.askpass {
            return Ok(());
        }
        if self.askpass_helper.is_none() {
            warn!(
                "the parallax-askpass helper was not found; \
                 password prompts will not work"
            );
        }
        let password = match self.password.take() {
            Some(password) => password,
            None => askpass::read_password("Password: ")
                .map_err(|e| Error::fatal(format!("cannot read password: {}", e)))?,
        };
        self.pass_server = Some(PasswordServer::start(password)?);
        Ok(())
    }

    fn run_loop<C: Callbacks>(
        &mut self,
        callbacks: &mut C,
        interrupted: &AtomicBool,
    ) -> Result<C::Output> {
        self.update_tasks(callbacks)?;
        let mut wait = None;
        while !self.pending.is_empty() || !self.running.is_empty() {
            if interrupted.load(Ordering::Relaxed) {
                self.interrupted(callbacks);
                return Err(Error::Interrupted);
            }
            // subsecond timeout accuracy is traded for efficiency
            let timeout = match wait {
                Some(wait) if wait > Duration::from_secs(1) => wait,
                _ => Duration::from_secs(1),
            };
            self.poll_events(timeout)?;
            self.update_tasks(callbacks)?;
            wait = self.check_timeout();
        }
        Ok(callbacks.result(self))
    }

    fn poll_events(&mut self, timeout: Duration) -> Result<()> {
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        let polled = self.iomap.poll(timeout, &mut events);
        for event in &events {
            let task = &mut self.tasks[event.token.task];
            task.handle_event(event.token.pipe, self.iomap.as_mut());
        }
        self.events = events;
        polled
    }

    /// Reaps finished tasks and starts as many new ones as allowed
    fn update_tasks<C: Callbacks>(&mut self, callbacks: &mut C) -> Result<()> {
        loop {
            self.start_tasks_once()?;
            if self.reap_tasks(callbacks) == 0 {
                return Ok(());
            }
        }
    }

    fn start_tasks_once(&mut self) -> Result<()> {
        while !self.pending.is_empty() && self.running.len() < self.limit {
            let Some(id) = self.pending.pop_front() else {
                break;
            };
            self.running.push(id);
            debug_assert!(self.running.len() <= self.limit);
            let nodenum = self.taskcount;
            self.taskcount += 1;
            let task = &mut self.tasks[id];
            task.start(
                id,
                nodenum,
                self.iomap.as_mut(),
                self.writer.as_mut(),
                self.pass_server.as_ref().map(PasswordServer::address),
                self.askpass_helper.as_deref(),
            )?;
        }
        Ok(())
    }

    fn reap_tasks<C: Callbacks>(&mut self, callbacks: &mut C) -> usize {
        let ids = std::mem::take(&mut self.running);
        let mut still_running = Vec::with_capacity(ids.len());
        let mut finished = 0;
        for id in ids {
            if self.tasks[id].running() {
                still_running.push(id);
            } else {
                self.finish(id, callbacks);
                finished += 1;
            }
        }
        self.running = still_running;
        finished
    }

    /// Kills timed-out tasks and returns the smallest time left
    fn check_timeout(&mut self) -> Option<Duration> {
        if self.timeout.is_zero() {
            return None;
        }
        let mut min_left: Option<Duration> = None;
        for id in self.running.clone() {
            let task = &mut self.tasks[id];
            let elapsed = task.elapsed();
            if elapsed >= self.timeout {
                task.timedout();
                continue;
            }
            let left = self.timeout - elapsed;
            min_left = Some(min_left.map_or(left, |m| m.min(left)));
        }
        Some(min_left.unwrap_or(Duration::ZERO))
    }

    /// Cleans up after a user interrupt: running tasks are killed and
    /// reported, pending tasks cancelled and reported
    fn interrupted<C: Callbacks>(&mut self, callbacks: &mut C) {
        for id in std::mem::take(&mut self.running) {
            let task = &mut self.tasks[id];
            task.interrupted();
            task.teardown(self.iomap.as_mut());
            let _ = task.running();
            self.finish(id, callbacks);
        }
        for id in std::mem::take(&mut self.pending) {
            self.tasks[id].cancel();
            self.finish(id, callbacks);
        }
    }

    fn finish<C: Callbacks>(&mut self, id: usize, callbacks: &mut C) {
        self.done.push(id);
        callbacks.finished(&self.tasks[id], self.done.len());
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::time::Instant;

    use super::*;
    use crate::callbacks::OutputBuilder;
    use crate::hosts::HostSpec;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }

    fn quiet_opts() -> Options {
        Options {
            quiet: true,
            ..Options::default()
        }
    }

    #[test]
    fn test_trivial_success() {
        let opts = quiet_opts();
        let mut manager = Manager::new(&opts);
        manager.add_task(Task::new(HostSpec::new("h1"), sh("echo hi"), &opts));
        let results = manager.run(&mut OutputBuilder::new()).unwrap();
        let output = results["h1"].as_ref().unwrap();
        assert_eq!(output.exit_status, 0);
        assert_eq!(output.stdout, b"hi\n");
        assert!(output.stderr.is_empty());
        assert_eq!(manager.done_tasks().count(), 1);
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        let opts = quiet_opts();
        let mut manager = Manager::new(&opts);
        manager.add_task(Task::new(HostSpec::new("h1"), sh("false"), &opts));
        let results = manager.run(&mut OutputBuilder::new()).unwrap();
        let err = results["h1"].as_ref().unwrap_err();
        assert!(err.message.contains("Exited with error code 1"));
        assert_eq!(err.exit_status, Some(1));
    }

    #[test]
    fn test_completeness() {
        let opts = quiet_opts();
        let mut manager = Manager::new(&opts);
        for host in ["h1", "h2", "h3", "h4", "h5"] {
            manager.add_task(Task::new(HostSpec::new(host), sh("echo ok"), &opts));
        }
        let results = manager.run(&mut OutputBuilder::new()).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results
            .values()
            .all(|r| r.as_ref().unwrap().exit_status == 0));
    }

    #[test]
    fn test_finished_order_is_strictly_increasing() {
        struct Counter {
            seen: Vec<usize>,
        }
        impl Callbacks for Counter {
            type Output = ();
            fn finished(&mut self, _task: &Task, n: usize) {
                self.seen.push(n);
            }
            fn result(&mut self, _manager: &Manager) {}
        }
        let opts = quiet_opts();
        let mut manager = Manager::new(&opts);
        for i in 0..4 {
            manager.add_task(Task::new(
                HostSpec::new(format!("h{}", i)),
                sh("echo done"),
                &opts,
            ));
        }
        let mut counter = Counter { seen: Vec::new() };
        manager.run(&mut counter).unwrap();
        assert_eq!(counter.seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_bounded_parallelism() {
        let opts = Options {
            limit: 2,
            ..quiet_opts()
        };
        let mut manager = Manager::new(&opts);
        for i in 0..6 {
            manager.add_task(Task::new(
                HostSpec::new(format!("h{}", i)),
                sh("sleep 0.3"),
                &opts,
            ));
        }
        let start = Instant::now();
        let results = manager.run(&mut OutputBuilder::new()).unwrap();
        // 6 tasks of 0.3 s with two lanes cannot finish in under 0.9 s
        assert!(start.elapsed() >= Duration::from_millis(900));
        assert!(start.elapsed() < Duration::from_secs(8));
        assert_eq!(results.len(), 6);
        assert!(results.values().all(|r| r.is_ok()));
    }

    #[test]
    fn test_timeout_enforcement() {
        let opts = Options {
            timeout: Duration::from_secs(1),
            ..quiet_opts()
        };
        let mut manager = Manager::new(&opts);
        manager.add_task(Task::new(HostSpec::new("h1"), sh("sleep 30"), &opts));
        let start = Instant::now();
        let results = manager.run(&mut OutputBuilder::new()).unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));
        let err = results["h1"].as_ref().unwrap_err();
        assert!(err.message.contains("Timed out"));
        assert_eq!(err.exit_status, Some(-9));
    }

    #[test]
    fn test_stdin_piping() {
        let opts = Options {
            input_stream: Some(b"payload".to_vec()),
            ..quiet_opts()
        };
        let mut manager = Manager::new(&opts);
        manager.add_task(Task::new(HostSpec::new("h1"), sh("cat"), &opts));
        let results = manager.run(&mut OutputBuilder::new()).unwrap();
        let output = results["h1"].as_ref().unwrap();
        assert_eq!(output.exit_status, 0);
        assert_eq!(output.stdout, b"payload");
    }

    #[test]
    fn test_spill_equals_inline() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options {
            outdir: Some(dir.path().join("out")),
            errdir: Some(dir.path().join("err")),
            ..quiet_opts()
        };
        fs::create_dir_all(opts.outdir.as_ref().unwrap()).unwrap();
        fs::create_dir_all(opts.errdir.as_ref().unwrap()).unwrap();
        let mut manager = Manager::new(&opts);
        manager.add_task(Task::new(
            HostSpec::new("h1"),
            sh("echo spilled; echo err >&2"),
            &opts,
        ));
        let results = manager.run(&mut OutputBuilder::new()).unwrap();
        let output = results["h1"].as_ref().unwrap();
        let outfile = output.outfile.as_ref().unwrap();
        let errfile = output.errfile.as_ref().unwrap();
        assert_eq!(fs::read(outfile).unwrap(), output.stdout);
        assert_eq!(fs::read(errfile).unwrap(), output.stderr);
        assert_eq!(output.stdout, b"spilled\n");
    }
}
