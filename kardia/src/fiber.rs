use crate::logging;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

/// A fixed set of worker threads draining a multi-producer job queue.
/// Jobs are plain closures; a job pushed with a `Counter` decrements the
/// counter when it completes, which is how the tick fiber awaits a fanout.
pub struct TaskPool {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    spawned: AtomicUsize,
    running: AtomicBool,
    log: logging::Logger,
}

impl TaskPool {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(name: &str, log: L) -> TaskPool {
        let (tx, rx) = unbounded();

        TaskPool {
            tx,
            rx,
            workers: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            log: logging::child(log).new(logging::o!("pool" => name.to_string())),
        }
    }

    /// Spawns `threads` workers. Must be called exactly once.
    pub fn start(&self, threads: u16) {
        if self.running.swap(true, Ordering::SeqCst) {
            panic!("Task pool started twice");
        }

        logging::debug!(self.log, "starting task pool"; "threads" => threads);
        self.spawned.store(threads as usize, Ordering::SeqCst);

        let mut workers = self.workers.lock().expect("Worker registry poisoned");
        for _ in 0..threads {
            let rx = self.rx.clone();
            workers.push(thread::spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Run(job) => job(),
                        Message::Stop => break,
                    }
                }
            }));
        }
    }

    /// Queue a job for execution on the pool.
    #[inline]
    pub fn push<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.tx
            .send(Message::Run(Box::new(job)))
            .expect("Task pool queue closed");
    }

    /// Queue a job that decrements `counter` on completion.
    #[inline]
    pub fn push_with<F: FnOnce() + Send + 'static>(&self, job: F, counter: &Counter) {
        counter.add(1);
        let counter = counter.clone();
        self.push(move || {
            job();
            counter.done();
        });
    }

    /// Wait for `counter` to reach zero, executing queued jobs while
    /// waiting. Keeps a small pool from deadlocking when the waiter itself
    /// occupies a worker thread.
    pub fn wait(&self, counter: &Counter) {
        while !counter.is_zero() {
            match self.rx.try_recv() {
                Ok(Message::Run(job)) => job(),
                Ok(Message::Stop) => {
                    // Not ours to consume; put it back and fall through to
                    // a blocking wait.
                    let _ = self.tx.send(Message::Stop);
                    counter.wait();
                    return;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    counter.wait_timeout(Duration::from_millis(1));
                }
            }
        }
    }

    /// Signal every worker to exit once the queue ahead of the signal is
    /// drained. Safe to call from a worker job.
    pub fn end(&self) {
        let spawned = self.spawned.load(Ordering::SeqCst);

        logging::debug!(self.log, "ending task pool"; "workers" => spawned);
        for _ in 0..spawned {
            let _ = self.tx.send(Message::Stop);
        }
    }

    /// Join all worker threads. The handles are taken out before joining so
    /// a still-running job can call `end` without contending on the
    /// registry.
    pub fn join(&self) {
        let handles: Vec<thread::JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("Worker registry poisoned");
            workers.drain(..).collect()
        };

        for handle in handles {
            handle.join().expect("Task pool worker panicked");
        }
    }
}

/// Completion counter for job fanouts: `reset`, push jobs with
/// `TaskPool::push_with`, then `wait`.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

struct CounterInner {
    count: Mutex<u64>,
    zero: Condvar,
}

impl Counter {
    pub fn new() -> Counter {
        Counter {
            inner: Arc::new(CounterInner {
                count: Mutex::new(0),
                zero: Condvar::new(),
            }),
        }
    }

    #[inline]
    pub fn reset(&self) {
        *self.inner.count.lock().expect("Counter poisoned") = 0;
    }

    #[inline]
    pub fn add(&self, n: u64) {
        *self.inner.count.lock().expect("Counter poisoned") += n;
    }

    #[inline]
    pub fn done(&self) {
        let mut count = self.inner.count.lock().expect("Counter poisoned");
        *count = count.checked_sub(1).expect("Counter went negative");
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self.inner.count.lock().expect("Counter poisoned") == 0
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock().expect("Counter poisoned");
        while *count != 0 {
            count = self.inner.zero.wait(count).expect("Counter poisoned");
        }
    }

    fn wait_timeout(&self, timeout: Duration) {
        let count = self.inner.count.lock().expect("Counter poisoned");
        if *count != 0 {
            let _ = self.inner.zero.wait_timeout(count, timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_push_executes() {
        let pool = TaskPool::new("test", None);
        pool.start(2);

        let counter = Counter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        counter.reset();
        for _ in 0..32 {
            let hits = hits.clone();
            pool.push_with(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }, &counter);
        }
        counter.wait();

        assert_eq!(hits.load(Ordering::SeqCst), 32);

        pool.end();
        pool.join();
    }

    #[test]
    fn test_wait_helps_from_worker() {
        // A single-threaded pool: the outer job fans out and waits, and the
        // fanned-out jobs can only run if the waiter drains the queue.
        let pool = Arc::new(TaskPool::new("test", None));
        pool.start(1);

        let outer = Counter::new();
        let inner_pool = pool.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_hits = hits.clone();

        pool.push_with(move || {
            let inner = Counter::new();
            for _ in 0..8 {
                let hits = inner_hits.clone();
                inner_pool.push_with(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }, &inner);
            }
            inner_pool.wait(&inner);
        }, &outer);

        outer.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 8);

        pool.end();
        pool.join();
    }

    #[test]
    fn test_end_join_terminates() {
        let pool = TaskPool::new("test", None);
        pool.start(4);
        pool.end();
        pool.join();
    }
}
