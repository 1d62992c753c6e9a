//! Worker pool for blocking transfers
//!
//! Every submitted request becomes a job in a table shared with the workers.
//! A worker takes the request out of the job slot before running it, so a
//! request can be cancelled for as long as it is still queued.
//!
//! The pool starts with `min_workers` threads and spawns one more whenever
//! more jobs are outstanding than there are workers, up to `max_workers`.
//! Past the cap, requests wait in the queue until a worker frees up.

use super::{Completion, CompletionSink, Rejected, SubmitRequest, TransferId};
use crate::lock;
use protocol::{TransferStatus, UsbError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Runs one request against a device handle; returns the status and bytes moved
pub type Executor<H> =
    Arc<dyn Fn(&H, &mut SubmitRequest) -> (TransferStatus, usize) + Send + Sync>;

struct Queued<H> {
    request: SubmitRequest,
    sink: CompletionSink,
    handle: Arc<H>,
}

/// A request travelling to a worker; emptied by whoever gets to it first
struct Job<H> {
    id: TransferId,
    slot: Mutex<Option<Queued<H>>>,
}

struct Shared<H> {
    jobs: Mutex<HashMap<TransferId, Arc<Job<H>>>>,
    stopping: AtomicBool,
    execute: Executor<H>,
}

pub struct WorkerPool<H> {
    name: &'static str,
    shared: Arc<Shared<H>>,
    job_tx: async_channel::Sender<Arc<Job<H>>>,
    job_rx: async_channel::Receiver<Arc<Job<H>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
}

impl<H: Send + Sync + 'static> WorkerPool<H> {
    /// Start `min_workers` threads named `<name>-<n>`
    pub fn new(
        name: &'static str,
        min_workers: usize,
        max_workers: usize,
        execute: Executor<H>,
    ) -> Result<Self, UsbError> {
        let (job_tx, job_rx) = async_channel::unbounded();
        let min_workers = min_workers.max(1);
        let pool = Self {
            name,
            shared: Arc::new(Shared {
                jobs: Mutex::new(HashMap::new()),
                stopping: AtomicBool::new(false),
                execute,
            }),
            job_tx,
            job_rx,
            workers: Mutex::new(Vec::with_capacity(min_workers)),
            max_workers: max_workers.max(min_workers),
        };
        {
            let mut workers = lock(&pool.workers);
            for _ in 0..min_workers {
                pool.spawn_worker(&mut workers)?;
            }
        }
        Ok(pool)
    }

    fn spawn_worker(&self, workers: &mut Vec<JoinHandle<()>>) -> Result<(), UsbError> {
        let rx = self.job_rx.clone();
        let shared = self.shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, workers.len()))
            .spawn(move || run_worker(rx, shared))
            .map_err(|e| {
                warn!("Failed to spawn {} thread: {}", self.name, e);
                UsbError::NoMem
            })?;
        workers.push(worker);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Jobs queued or running
    pub fn outstanding(&self) -> usize {
        lock(&self.shared.jobs).len()
    }

    /// Queue `request` for a worker; `handle` stays alive until it completes
    pub fn submit(
        &self,
        request: SubmitRequest,
        sink: CompletionSink,
        handle: Arc<H>,
    ) -> Result<(), Rejected> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(Rejected::new(UsbError::Other, request));
        }

        let id = request.id;
        let job = Arc::new(Job {
            id,
            slot: Mutex::new(Some(Queued {
                request,
                sink,
                handle,
            })),
        });
        let outstanding = {
            let mut jobs = lock(&self.shared.jobs);
            jobs.insert(id, job.clone());
            jobs.len()
        };

        if self.job_tx.try_send(job.clone()).is_err() {
            lock(&self.shared.jobs).remove(&id);
            let queued = lock(&job.slot).take();
            return match queued {
                Some(queued) => Err(Rejected::new(UsbError::Other, queued.request)),
                // Taken by a concurrent cancel; its completion is already queued
                None => Ok(()),
            };
        }

        self.grow(outstanding);
        Ok(())
    }

    /// Add a worker when every existing one may be busy
    fn grow(&self, outstanding: usize) {
        let mut workers = lock(&self.workers);
        if outstanding <= workers.len()
            || workers.len() >= self.max_workers
            || self.shared.stopping.load(Ordering::Acquire)
        {
            return;
        }
        if self.spawn_worker(&mut workers).is_ok() {
            debug!("{} pool grew to {} workers", self.name, workers.len());
        }
    }

    /// Cancel a request that has not reached a worker yet
    ///
    /// A request already running is left to finish on its own timeout.
    pub fn cancel(&self, id: TransferId) -> Result<(), UsbError> {
        let Some(job) = lock(&self.shared.jobs).get(&id).cloned() else {
            return Err(UsbError::NotFound);
        };
        let queued = lock(&job.slot).take();
        match queued {
            Some(queued) => {
                lock(&self.shared.jobs).remove(&id);
                complete(queued, TransferStatus::Cancelled, 0);
            }
            None => debug!("Transfer {} already running, cannot cancel", id),
        }
        Ok(())
    }

    /// Cancel every still queued request accepted by `filter`
    pub fn cancel_queued(&self, filter: impl Fn(&SubmitRequest) -> bool) -> usize {
        let jobs: Vec<Arc<Job<H>>> = lock(&self.shared.jobs).values().cloned().collect();
        let mut cancelled = 0;
        for job in jobs {
            let queued = {
                let mut slot = lock(&job.slot);
                if slot.as_ref().is_some_and(|q| filter(&q.request)) {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some(queued) = queued {
                lock(&self.shared.jobs).remove(&job.id);
                complete(queued, TransferStatus::Cancelled, 0);
                cancelled += 1;
            }
        }
        cancelled
    }
}

impl<H> WorkerPool<H> {
    /// Stop accepting requests and join the workers
    ///
    /// Requests still queued complete as cancelled. Returns how many workers
    /// were joined.
    pub fn shutdown(&self) -> usize {
        self.shared.stopping.store(true, Ordering::Release);
        self.job_tx.close();

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let joined = workers.len();
        for worker in workers {
            if worker.join().is_err() {
                warn!("{} thread panicked", self.name);
            }
        }
        joined
    }
}

impl<H> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn complete<H>(queued: Queued<H>, status: TransferStatus, actual_length: usize) {
    let mut completion: Completion = queued.request.into_completion(status);
    completion.actual_length = actual_length;
    queued.sink.complete(completion);
}

fn run_worker<H>(rx: async_channel::Receiver<Arc<Job<H>>>, shared: Arc<Shared<H>>) {
    while let Ok(job) = rx.recv_blocking() {
        let Some(mut queued) = lock(&job.slot).take() else {
            // Cancelled while queued
            continue;
        };

        let (status, actual_length) = if shared.stopping.load(Ordering::Acquire) {
            (TransferStatus::Cancelled, 0)
        } else {
            (shared.execute)(queued.handle.as_ref(), &mut queued.request)
        };

        lock(&shared.jobs).remove(&job.id);
        trace!("Transfer {} finished: {}", job.id, status);
        complete(queued, status, actual_length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawHandle;
    use crate::events::CompletionQueue;
    use protocol::TransferType;
    use std::sync::Condvar;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Stand-in device that holds every transfer until opened
    #[derive(Default)]
    struct Gate {
        /// (open, transfers started)
        state: Mutex<(bool, usize)>,
        changed: Condvar,
    }

    impl Gate {
        fn pass(&self) {
            let mut state = self.state.lock().unwrap();
            state.1 += 1;
            self.changed.notify_all();
            while !state.0 {
                state = self.changed.wait(state).unwrap();
            }
        }

        fn open(&self) {
            self.state.lock().unwrap().0 = true;
            self.changed.notify_all();
        }

        fn wait_started(&self, count: usize) {
            let state = self.state.lock().unwrap();
            let (state, result) = self
                .changed
                .wait_timeout_while(state, Duration::from_secs(2), |s| s.1 < count)
                .unwrap();
            assert!(!result.timed_out(), "only {} transfers started", state.1);
        }
    }

    fn gated_pool(min: usize, max: usize) -> WorkerPool<Gate> {
        WorkerPool::new(
            "test-worker",
            min,
            max,
            Arc::new(|gate: &Gate, request: &mut SubmitRequest| {
                gate.pass();
                (TransferStatus::Completed, request.length)
            }),
        )
        .unwrap()
    }

    fn request(id: u64, handle: u64) -> SubmitRequest {
        SubmitRequest {
            id: TransferId(id),
            handle: RawHandle(handle),
            kind: TransferType::Bulk,
            endpoint: 0x81,
            buffer: vec![0; 8],
            length: 8,
            iso_packet_lengths: Vec::new(),
            timeout: Duration::from_secs(1),
        }
    }

    fn collect(queue: &CompletionQueue, count: usize) -> Vec<(u64, TransferStatus, usize)> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut done = Vec::new();
        while done.len() < count && Instant::now() < deadline {
            done.extend(
                queue
                    .wait(Duration::from_millis(50))
                    .0
                    .into_iter()
                    .map(|c| (c.id.0, c.status, c.actual_length)),
            );
        }
        done.sort_by_key(|c| c.0);
        done
    }

    #[test]
    fn test_pool_grows_while_workers_are_busy() {
        let pool = gated_pool(1, 4);
        let gate = Arc::new(Gate::default());
        let queue = Arc::new(CompletionQueue::new());

        for id in 1..=3 {
            pool.submit(request(id, 1), CompletionSink::new(queue.clone()), gate.clone())
                .unwrap();
        }
        gate.wait_started(3);
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.outstanding(), 3);

        gate.open();
        assert_eq!(
            collect(&queue, 3),
            vec![
                (1, TransferStatus::Completed, 8),
                (2, TransferStatus::Completed, 8),
                (3, TransferStatus::Completed, 8),
            ]
        );
        assert_eq!(pool.outstanding(), 0);
        pool.shutdown();
    }

    #[test]
    fn test_pool_growth_is_capped() {
        let pool = gated_pool(1, 2);
        let gate = Arc::new(Gate::default());
        let queue = Arc::new(CompletionQueue::new());

        for id in 1..=3 {
            pool.submit(request(id, 1), CompletionSink::new(queue.clone()), gate.clone())
                .unwrap();
        }
        gate.wait_started(2);
        assert_eq!(pool.worker_count(), pool.max_workers());

        // Third request is still queued behind the two running ones
        assert_eq!(pool.cancel(TransferId(3)), Ok(()));
        assert_eq!(collect(&queue, 1), vec![(3, TransferStatus::Cancelled, 0)]);

        // Running requests cannot be pulled back
        assert_eq!(pool.cancel(TransferId(1)), Ok(()));
        assert_eq!(pool.cancel(TransferId(99)), Err(UsbError::NotFound));
        assert!(queue.is_empty());

        gate.open();
        assert_eq!(
            collect(&queue, 2),
            vec![
                (1, TransferStatus::Completed, 8),
                (2, TransferStatus::Completed, 8),
            ]
        );
        pool.shutdown();
    }

    #[test]
    fn test_cancel_queued_by_handle() {
        let pool = gated_pool(1, 1);
        let gate = Arc::new(Gate::default());
        let queue = Arc::new(CompletionQueue::new());

        pool.submit(request(1, 1), CompletionSink::new(queue.clone()), gate.clone())
            .unwrap();
        pool.submit(request(2, 1), CompletionSink::new(queue.clone()), gate.clone())
            .unwrap();
        pool.submit(request(3, 2), CompletionSink::new(queue.clone()), gate.clone())
            .unwrap();
        gate.wait_started(1);

        assert_eq!(pool.cancel_queued(|r| r.handle == RawHandle(1)), 1);
        assert_eq!(pool.outstanding(), 2);

        gate.open();
        assert_eq!(
            collect(&queue, 3),
            vec![
                (1, TransferStatus::Completed, 8),
                (2, TransferStatus::Cancelled, 0),
                (3, TransferStatus::Completed, 8),
            ]
        );
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_queued_and_rejects_new() {
        let pool = gated_pool(1, 1);
        let gate = Arc::new(Gate::default());
        let queue = Arc::new(CompletionQueue::new());

        pool.submit(request(1, 1), CompletionSink::new(queue.clone()), gate.clone())
            .unwrap();
        pool.submit(request(2, 1), CompletionSink::new(queue.clone()), gate.clone())
            .unwrap();
        gate.wait_started(1);

        let opener = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                gate.open();
            })
        };
        assert_eq!(pool.shutdown(), 1);
        opener.join().unwrap();

        assert_eq!(
            collect(&queue, 2),
            vec![
                (1, TransferStatus::Completed, 8),
                (2, TransferStatus::Cancelled, 0),
            ]
        );
        assert_eq!(pool.worker_count(), 0);

        let Err(rejected) =
            pool.submit(request(3, 1), CompletionSink::new(queue.clone()), gate.clone())
        else {
            panic!("submit after shutdown was accepted");
        };
        assert_eq!(rejected.error, UsbError::Other);
        assert_eq!(rejected.buffer.len(), 8);
    }
}
