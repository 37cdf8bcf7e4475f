//! Completion callbacks: progress reporting and result aggregation.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;

use colored::Colorize as _;

use crate::manager::Manager;
use crate::task::Task;
use crate::{HostError, HostOutput, HostResults};

/// Completion hooks supplied to [`Manager::run`](crate::Manager::run).
///
/// `finished` is called exactly once per task in completion order; `result`
/// is called once at the end of the run and its return value becomes the
/// manager's return value. Callbacks may read any task attribute but must
/// not mutate manager state.
pub trait Callbacks {
    /// Value produced by [`Callbacks::result`]
    type Output;
    /// Called when a task completes; `n` is the 1-based completion index
    fn finished(&mut self, task: &Task, n: usize);
    /// Called when all tasks have completed
    fn result(&mut self, manager: &Manager) -> Self::Output;
}

/// Prints a colorized status line per completed task, echoes captured
/// buffers, and yields the exit statuses in submission order
#[derive(Default)]
pub struct DefaultCallbacks;

impl Callbacks for DefaultCallbacks {
    type Output = Vec<Option<i32>>;

    fn finished(&mut self, task: &Task, n: usize) {
        let tstamp = chrono::Local::now().format("%H:%M:%S");
        if !task.is_quiet() {
            let progress = format!("[{}]", n).cyan();
            if task.failures().is_empty() {
                println!(
                    "{} {} {} {}",
                    progress,
                    tstamp,
                    "[SUCCESS]".green().bold(),
                    task.pretty_host()
                );
            } else {
                println!(
                    "{} {} {} {} {}",
                    progress,
                    tstamp,
                    "[FAILURE]".red().bold(),
                    task.pretty_host(),
                    task.failures().join(", ").red().bold()
                );
            }
        }
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        if !task.output_buffer().is_empty() {
            let _ = out.write_all(task.output_buffer());
        }
        if !task.error_buffer().is_empty() {
            let _ = write!(out, "{}", "Stderr: ".red());
            let _ = out.write_all(task.error_buffer());
        }
        let _ = out.flush();
    }

    fn result(&mut self, manager: &Manager) -> Self::Output {
        manager
            .tasks()
            .iter()
            .filter(|task| task.is_finished())
            .map(Task::exit_status)
            .collect()
    }
}

/// Aggregates per-host results for the `call`/`copy`/`slurp` surface
#[derive(Default)]
pub(crate) struct OutputBuilder {
    localpaths: Option<HashMap<String, PathBuf>>,
}

impl OutputBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }
    /// Builder for `slurp`, which also reports the local download path
    pub(crate) fn with_localpaths(localpaths: HashMap<String, PathBuf>) -> Self {
        Self {
            localpaths: Some(localpaths),
        }
    }
}

impl Callbacks for OutputBuilder {
    type Output = HostResults;

    fn finished(&mut self, _task: &Task, _n: usize) {}

    fn result(&mut self, manager: &Manager) -> Self::Output {
        let mut ret = HashMap::new();
        for task in manager.done_tasks() {
            let entry = if task.failures().is_empty() {
                Ok(HostOutput {
                    exit_status: task.exit_status().unwrap_or(0),
                    stdout: task.output_buffer().to_vec(),
                    stderr: task.error_buffer().to_vec(),
                    outfile: task.outfile().map(ToOwned::to_owned),
                    errfile: task.errfile().map(ToOwned::to_owned),
                    localpath: self
                        .localpaths
                        .as_ref()
                        .and_then(|m| m.get(task.host()).cloned()),
                })
            } else {
                Err(HostError {
                    message: task.failures().join(", "),
                    stderr: task.error_buffer().to_vec(),
                    exit_status: task.exit_status(),
                })
            };
            ret.insert(task.host().to_owned(), entry);
        }
        ret
    }
}
