use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named pool of worker threads fed by one channel. Dropping the pool
/// closes the channel and joins every worker, so in-flight jobs drain first.
pub(crate) struct WorkPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkPool {
    pub fn new(name: &str, threads: usize) -> WorkPool {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("couldn't spawn worker")
            })
            .collect();
        WorkPool { tx: Some(tx), workers }
    }

    pub fn spawn(&self, job: Job) {
        if let Some(tx) = self.tx.as_ref() {
            // Send fails only during teardown, when workers are gone anyway.
            let _ = tx.send(job);
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}
