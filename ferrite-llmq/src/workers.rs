//! Worker threads: a delay scheduler and a bounded BLS worker pool.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{LlmqError, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct ScheduledTask {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest runs first
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<ScheduledTask>>,
    cv: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// Single-threaded scheduler for delayed and immediate work, in the
/// shape of the node's serial scheduler thread.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        let worker = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("llmq-sched".into())
            .spawn(move || Self::run(worker))
            .expect("failed to spawn scheduler thread");
        Scheduler { inner, handle: Mutex::new(Some(handle)) }
    }

    pub fn schedule_in<F: FnOnce() + Send + 'static>(&self, delay: Duration, task: F) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.inner.queue.lock().unwrap();
        queue.push(ScheduledTask { at: Instant::now() + delay, seq, task: Box::new(task) });
        self.inner.cv.notify_one();
    }

    fn run(inner: Arc<SchedulerInner>) {
        let mut queue = inner.queue.lock().unwrap();
        loop {
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let now = Instant::now();
            if let Some(head) = queue.peek() {
                if head.at <= now {
                    let task = queue.pop().expect("peeked entry exists").task;
                    drop(queue);
                    task();
                    queue = inner.queue.lock().unwrap();
                    continue;
                }
                let wait = head.at - now;
                let (guard, _) = inner.cv.wait_timeout(queue, wait).unwrap();
                queue = guard;
            } else {
                queue = inner.cv.wait(queue).unwrap();
            }
        }
    }

    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.cv.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!("scheduler stopped, {} tasks dropped", self.inner.queue.lock().unwrap().len());
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bounded pool of worker threads for BLS pairing checks. The queue
/// is bounded; `execute` blocks when it is full, which is the
/// back-pressure point that keeps one session from starving others.
pub struct WorkerPool {
    sender: Mutex<Option<SyncSender<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize, queue_cap: usize) -> Self {
        assert!(threads > 0);
        let (sender, receiver) = mpsc::sync_channel::<Task>(queue_cap);
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver: Arc<Mutex<Receiver<Task>>> = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || loop {
                    let task = {
                        let guard = receiver.lock().unwrap();
                        guard.recv()
                    };
                    match task {
                        Ok(task) => task(),
                        Err(_) => return,
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        WorkerPool { sender: Mutex::new(Some(sender)), handles: Mutex::new(handles) }
    }

    /// Number of threads for BLS work on this machine.
    pub fn default_thread_count() -> usize {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(8)
    }

    /// Enqueue a task, blocking while the queue is full.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, task: F) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(LlmqError::ShuttingDown)?;
        sender.send(Box::new(task)).map_err(|_| LlmqError::ShuttingDown)
    }

    /// Enqueue a task unless the queue is full.
    pub fn try_execute<F: FnOnce() + Send + 'static>(&self, task: F) -> Result<bool> {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(LlmqError::ShuttingDown)?;
        match sender.try_send(Box::new(task)) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(LlmqError::ShuttingDown),
        }
    }

    pub fn stop(&self) {
        self.sender.lock().unwrap().take();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
