//! Bounded worker pool with error aggregation.
//!
//! A fixed set of workers consumes items of one work type from a bounded
//! channel (capacity = worker count, so submitters block when the pool is
//! saturated). Workers record errors into a shared sink and keep going; a
//! worker panic is converted into an error rather than tearing the pool
//! down. Typical usage mirrors a wait group:
//!
//! ```
//! use fsmirror::WorkPool;
//!
//! let pool = WorkPool::new(4, |_worker, n: u64| {
//!     // process one unit of work
//!     let _ = n;
//!     Ok(())
//! });
//! for n in 0..32u64 {
//!     pool.submit(n);
//! }
//! pool.wait().unwrap();
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::error::{Error, Result};

/// Number of workers to use when the caller passes 0.
pub(crate) fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A bounded pool of `N` workers processing items of type `W`.
///
/// No ordering is guaranteed between items. Each worker receives a stable
/// index in `0..N`, useful for sharding state across workers.
pub struct WorkPool<W> {
    tx: Option<Sender<W>>,
    workers: Vec<JoinHandle<()>>,
    errs: Arc<Mutex<Vec<Error>>>,
}

impl<W: Send + 'static> WorkPool<W> {
    /// Create a pool of `nworkers` workers (0 means one per logical CPU),
    /// each invoking `work(worker_index, item)` per submitted item.
    pub fn new<F>(nworkers: usize, work: F) -> WorkPool<W>
    where
        F: Fn(usize, W) -> Result<()> + Send + Sync + 'static,
    {
        let n = if nworkers == 0 {
            default_concurrency()
        } else {
            nworkers
        };

        let (tx, rx) = bounded::<W>(n);
        let errs = Arc::new(Mutex::new(Vec::new()));
        let work = Arc::new(work);

        let mut workers = Vec::with_capacity(n);
        for i in 0..n {
            let rx = rx.clone();
            let errs = errs.clone();
            let work = work.clone();
            let h = std::thread::Builder::new()
                .name(format!("fsmirror-worker-{i}"))
                .spawn(move || {
                    for w in rx.iter() {
                        match catch_unwind(AssertUnwindSafe(|| work(i, w))) {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => errs.lock().expect("error sink").push(e),
                            Err(p) => errs
                                .lock()
                                .expect("error sink")
                                .push(Error::Panic(panic_message(&p))),
                        }
                    }
                })
                .expect("spawn worker thread");
            workers.push(h);
        }

        WorkPool {
            tx: Some(tx),
            workers,
            errs,
        }
    }

    /// Submit one unit of work. Blocks while the backlog equals the worker
    /// count.
    ///
    /// Panics if the pool has been closed.
    pub fn submit(&self, w: W) {
        let tx = self.tx.as_ref().expect("workpool: submit after close");
        tx.send(w).expect("workpool: workers gone");
    }

    /// Record an error without going through a worker (for submitters that
    /// hit failures while producing work).
    pub fn error(&self, e: Error) {
        self.errs.lock().expect("error sink").push(e);
    }

    /// Signal end-of-submission.
    ///
    /// Panics if called twice.
    pub fn close(&mut self) {
        if self.tx.take().is_none() {
            panic!("workpool: already closed");
        }
    }

    /// Close (if still open), drain all workers and return the joined set
    /// of recorded errors. An empty set means success.
    pub fn wait(mut self) -> Result<()> {
        self.tx.take();
        for h in self.workers.drain(..) {
            let _ = h.join();
        }
        let errs = std::mem::take(&mut *self.errs.lock().expect("error sink"));
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::aggregate(errs))
        }
    }
}

fn panic_message(p: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
