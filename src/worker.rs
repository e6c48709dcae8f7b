//! Per-device worker pool.
//!
//! A single-producer queue with `nr_threads` consumers. One consumer keeps
//! completions in submission order; more consumers trade ordering for
//! parallelism. Dropping the pool closes the queue and lets the consumers
//! drain and exit on their own.

use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::error::{Error, Result};

pub(crate) type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct WorkerPool {
    tx: Option<Sender<Job>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(label: &str, nr_threads: usize) -> Result<WorkerPool> {
        debug_assert!(nr_threads > 0);
        let (tx, rx) = unbounded::<Job>();
        let mut threads = Vec::with_capacity(nr_threads);
        for i in 0..nr_threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-w{}", label, i))
                .spawn(move || worker_loop(rx))
                .map_err(|_| Error::Io)?;
            threads.push(handle);
        }
        Ok(WorkerPool {
            tx: Some(tx),
            threads,
        })
    }

    pub(crate) fn submit(&self, job: Job) {
        if let Some(tx) = &self.tx {
            // The receivers live until the pool drops, so this cannot fail.
            let _ = tx.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        // A consumer finishing the last task may drop the final device
        // reference and land here; it must not join itself.
        let me = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        job();
    }
    debug!("worker {} draining", thread::current().name().unwrap_or("?"));
}
