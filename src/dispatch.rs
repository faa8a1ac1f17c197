//! Per-key serialized dispatch of decoded frames
//!
//! Frame processing runs off the transport read path, but frames belonging
//! to one session must never be reordered: each key gets its own worker
//! thread draining a channel in arrival order. Different keys proceed
//! independently. A worker retires itself once its queue drains, so the
//! worker map tracks only keys with frames in flight.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, SendError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::message::SessionKey;

type Job = Box<dyn FnOnce() + Send + 'static>;
type WorkerMap = Arc<Mutex<HashMap<SessionKey, Worker>>>;

struct Worker {
    tx: Sender<Job>,
    handle: JoinHandle<()>,
    // Jobs queued but not yet finished; incremented and decremented under
    // the map lock so the worker's retire decision cannot race a send.
    pending: usize,
}

#[derive(Default)]
pub struct KeyedDispatcher {
    workers: WorkerMap,
}

impl KeyedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` behind any earlier jobs for the same key.
    pub fn dispatch(&self, key: SessionKey, job: impl FnOnce() + Send + 'static) {
        let mut workers = self.workers.lock();
        let mut job: Job = Box::new(job);
        loop {
            let worker = workers
                .entry(key)
                .or_insert_with(|| spawn_worker(Arc::clone(&self.workers), key));
            worker.pending += 1;
            match worker.tx.send(job) {
                Ok(()) => return,
                // The worker died mid-queue (a job panicked); replace it and
                // requeue the returned job rather than losing it.
                Err(SendError(returned)) => {
                    job = returned;
                    workers.remove(&key);
                }
            }
        }
    }

    /// Drain all workers: close their queues and join the threads.
    pub fn shutdown(&self) {
        let workers: Vec<Worker> = {
            let mut map = self.workers.lock();
            map.drain().map(|(_, w)| w).collect()
        };
        for worker in workers {
            drop(worker.tx);
            let _ = worker.handle.join();
        }
    }

    /// Number of live worker queues.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}

fn spawn_worker(workers: WorkerMap, key: SessionKey) -> Worker {
    let (tx, rx) = mpsc::channel::<Job>();
    let handle = std::thread::spawn(move || {
        while let Ok(job) = rx.recv() {
            job();
            let mut map = workers.lock();
            match map.get_mut(&key) {
                Some(worker) => {
                    worker.pending -= 1;
                    if worker.pending == 0 {
                        // Queue drained; retire. Dropping our own handle here
                        // just detaches the thread while it unwinds.
                        map.remove(&key);
                        break;
                    }
                }
                // shutdown drained the map and now owns this queue; keep
                // working until it closes the channel
                None => {}
            }
        }
    });
    Worker {
        tx,
        handle,
        pending: 0,
    }
}

impl Drop for KeyedDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
