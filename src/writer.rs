//! Background file-output service.
//!
//! Writes to ordinary files cannot reliably be made non-blocking, so all
//! spill-file output goes through a single worker thread consuming a queue.
//! The orchestrator never blocks on file I/O.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::Result;

enum Request {
    Open(PathBuf),
    Write(PathBuf, Vec<u8>),
    Close(PathBuf),
    Quit,
}

/// Unbounded request queue; enqueueing never blocks
struct Queue {
    items: Mutex<VecDeque<Request>>,
    cv: Condvar,
}

impl Queue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }
    fn push(&self, req: Request) {
        self.items.lock().push_back(req);
        self.cv.notify_one();
    }
    fn pop(&self) -> Request {
        let mut items = self.items.lock();
        loop {
            if let Some(req) = items.pop_front() {
                return req;
            }
            self.cv.wait(&mut items);
        }
    }
}

/// Enqueue-side capability handed to tasks
#[derive(Clone)]
pub struct WriterHandle {
    queue: Arc<Queue>,
}

impl WriterHandle {
    /// Appends a chunk to the given spill file
    pub fn write(&self, file: &Path, data: &[u8]) {
        self.queue
            .push(Request::Write(file.to_owned(), data.to_vec()));
    }
    /// Closes the given spill file
    pub fn close(&self, file: &Path) {
        self.queue.push(Request::Close(file.to_owned()));
    }
}

/// Background writer service for per-host output files
pub struct Writer {
    queue: Arc<Queue>,
    worker: Option<JoinHandle<()>>,
    outdir: Option<PathBuf>,
    errdir: Option<PathBuf>,
    host_counts: HashMap<String, usize>,
}

impl Writer {
    /// Starts the worker thread
    pub fn start(outdir: Option<PathBuf>, errdir: Option<PathBuf>) -> Result<Self> {
        let queue = Arc::new(Queue::new());
        let worker_queue = Arc::clone(&queue);
        let worker = thread::Builder::new()
            .name("pax-writer".to_owned())
            .spawn(move || worker_loop(&worker_queue))?;
        Ok(Self {
            queue,
            worker: Some(worker),
            outdir,
            errdir,
            host_counts: HashMap::new(),
        })
    }
    /// Returns an enqueue-side handle for tasks
    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            queue: Arc::clone(&self.queue),
        }
    }
    /// Allocates and opens the spill files for one task.
    ///
    /// Repeated calls for the same host get `host.1`, `host.2`, ... names.
    /// Either returned filename may be absent when the matching directory is
    /// not configured; the filenames are the handles for later
    /// [`WriterHandle::write`] / [`WriterHandle::close`] calls.
    pub fn open_files(&mut self, host: &str) -> (Option<PathBuf>, Option<PathBuf>) {
        let count = self.host_counts.entry(host.to_owned()).or_insert(0);
        let filename = if *count == 0 {
            host.to_owned()
        } else {
            format!("{}.{}", host, count)
        };
        *count += 1;
        let mut open = |dir: &Option<PathBuf>| {
            let file = dir.as_ref().map(|d| d.join(&filename));
            if let Some(file) = &file {
                self.queue.push(Request::Open(file.clone()));
            }
            file
        };
        let outfile = open(&self.outdir);
        let errfile = open(&self.errdir);
        (outfile, errfile)
    }
    /// Requests worker termination without waiting for it
    pub fn signal_quit(&self) {
        self.queue.push(Request::Quit);
    }
    /// Terminates the worker and waits until it has drained the queue
    pub fn shutdown(mut self) {
        self.signal_quit();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("writer worker panicked");
            }
        }
    }
}

fn worker_loop(queue: &Queue) {
    let mut files: HashMap<PathBuf, File> = HashMap::new();
    loop {
        match queue.pop() {
            Request::Quit => return,
            Request::Open(path) => match File::create(&path) {
                Ok(file) => {
                    files.insert(path, file);
                }
                Err(e) => error!(%e, path = %path.display(), "cannot open output file"),
            },
            Request::Write(path, data) => {
                if let Some(file) = files.get_mut(&path) {
                    if let Err(e) = file.write_all(&data).and_then(|()| file.flush()) {
                        error!(%e, path = %path.display(), "output file write failed");
                        files.remove(&path);
                    }
                }
            }
            Request::Close(path) => {
                files.remove(&path);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;

    #[test]
    fn test_spill_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let outdir = dir.path().join("out");
        let errdir = dir.path().join("err");
        fs::create_dir_all(&outdir).unwrap();
        fs::create_dir_all(&errdir).unwrap();
        let mut writer = Writer::start(Some(outdir.clone()), Some(errdir.clone())).unwrap();
        let handle = writer.handle();

        let (outfile, errfile) = writer.open_files("node1");
        let outfile = outfile.unwrap();
        let errfile = errfile.unwrap();
        assert_eq!(outfile, outdir.join("node1"));

        handle.write(&outfile, b"hello ");
        handle.write(&outfile, b"world\n");
        handle.write(&errfile, b"oops\n");
        handle.close(&outfile);
        handle.close(&errfile);

        // second task for the same host gets a suffixed name
        let (outfile2, _) = writer.open_files("node1");
        assert_eq!(outfile2.unwrap(), outdir.join("node1.1"));

        writer.shutdown();
        assert_eq!(fs::read(&outfile).unwrap(), b"hello world\n");
        assert_eq!(fs::read(&errfile).unwrap(), b"oops\n");
    }

    #[test]
    fn test_errdir_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Writer::start(None, Some(dir.path().to_owned())).unwrap();
        let (outfile, errfile) = writer.open_files("node1");
        assert!(outfile.is_none());
        assert!(errfile.is_some());
        writer.shutdown();
    }
}
