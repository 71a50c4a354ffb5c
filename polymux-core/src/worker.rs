//! Bounded-concurrency executor for blocking work.
//!
//! The pool owns a fixed set of slot threads. A bounded channel pre-filled
//! with every slot index is both the free list and the counting semaphore:
//! taking an index acquires a slot, handing it back releases it. A slot is
//! handed back only after its task and continuation have returned, so it is
//! never reassigned while busy.
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use async_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, warn};

use crate::{AnyError, AnyResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum WorkerPoolError {
    #[error("worker pool capacity must be positive")]
    ZeroCapacity,
    #[error("worker pool is shut down")]
    Closed,
    #[error("failed to spawn worker slot: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
#[error("task panicked: {0}")]
pub struct TaskPanic(pub String);

struct Slot {
    jobs: Sender<Job>,
}

pub struct WorkerPool {
    slots: Vec<Slot>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    busy: Arc<AtomicUsize>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Result<Self, WorkerPoolError> {
        if capacity == 0 {
            return Err(WorkerPoolError::ZeroCapacity);
        }
        let (free_tx, free_rx) = async_channel::bounded(capacity);
        let mut slots = Vec::with_capacity(capacity);
        let mut threads = Vec::with_capacity(capacity);
        for slot_id in 0..capacity {
            let (jobs, inbox) = async_channel::bounded::<Job>(1);
            let handle = std::thread::Builder::new()
                .name(format!("polymux-pool-{slot_id}"))
                .spawn(move || {
                    while let Ok(job) = inbox.recv_blocking() {
                        job();
                    }
                    debug!("worker slot {slot_id} exit");
                })?;
            free_tx
                .try_send(slot_id)
                .map_err(|_| WorkerPoolError::Closed)?;
            slots.push(Slot { jobs });
            threads.push(handle);
        }
        Ok(Self {
            slots,
            free_tx,
            free_rx,
            busy: Arc::new(AtomicUsize::new(0)),
            threads,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently running a task.
    #[inline]
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Runs `task(input)` on a free slot, blocking the caller until one is
    /// available. Exactly one of `on_success` / `on_failure` is invoked on the
    /// slot thread.
    pub fn assign<I, O, T, S, F>(
        &self,
        task: T,
        input: I,
        on_success: S,
        on_failure: F,
    ) -> Result<(), WorkerPoolError>
    where
        I: Send + 'static,
        T: FnOnce(I) -> AnyResult<O> + Send + 'static,
        S: FnOnce(O) + Send + 'static,
        F: FnOnce(AnyError) + Send + 'static,
    {
        let slot = self
            .free_rx
            .recv_blocking()
            .map_err(|_| WorkerPoolError::Closed)?;
        self.dispatch(slot, task, input, on_success, on_failure)
    }

    /// Same as [`WorkerPool::assign`] but awaits the free slot instead of
    /// blocking the thread.
    pub async fn assign_async<I, O, T, S, F>(
        &self,
        task: T,
        input: I,
        on_success: S,
        on_failure: F,
    ) -> Result<(), WorkerPoolError>
    where
        I: Send + 'static,
        T: FnOnce(I) -> AnyResult<O> + Send + 'static,
        S: FnOnce(O) + Send + 'static,
        F: FnOnce(AnyError) + Send + 'static,
    {
        let slot = self
            .free_rx
            .recv()
            .await
            .map_err(|_| WorkerPoolError::Closed)?;
        self.dispatch(slot, task, input, on_success, on_failure)
    }

    /// Non-blocking variant: returns the input back when every slot is busy.
    pub fn try_assign<I, O, T, S, F>(
        &self,
        task: T,
        input: I,
        on_success: S,
        on_failure: F,
    ) -> Result<Result<(), I>, WorkerPoolError>
    where
        I: Send + 'static,
        T: FnOnce(I) -> AnyResult<O> + Send + 'static,
        S: FnOnce(O) + Send + 'static,
        F: FnOnce(AnyError) + Send + 'static,
    {
        match self.free_rx.try_recv() {
            Ok(slot) => self
                .dispatch(slot, task, input, on_success, on_failure)
                .map(Ok),
            Err(TryRecvError::Empty) => Ok(Err(input)),
            Err(TryRecvError::Closed) => Err(WorkerPoolError::Closed),
        }
    }

    fn dispatch<I, O, T, S, F>(
        &self,
        slot: usize,
        task: T,
        input: I,
        on_success: S,
        on_failure: F,
    ) -> Result<(), WorkerPoolError>
    where
        I: Send + 'static,
        T: FnOnce(I) -> AnyResult<O> + Send + 'static,
        S: FnOnce(O) + Send + 'static,
        F: FnOnce(AnyError) + Send + 'static,
    {
        let busy = self.busy.clone();
        let release = self.free_tx.clone();
        busy.fetch_add(1, Ordering::AcqRel);
        let job: Job = Box::new(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(move || task(input))) {
                Ok(result) => result,
                Err(panic) => Err(TaskPanic(panic_message(panic)).into()),
            };
            let delivered = catch_unwind(AssertUnwindSafe(move || match outcome {
                Ok(output) => on_success(output),
                Err(e) => on_failure(e),
            }));
            if let Err(panic) = delivered {
                error!(
                    "worker slot {slot} continuation panicked: {}",
                    panic_message(panic)
                );
            }
            busy.fetch_sub(1, Ordering::AcqRel);
            // the free list has room for every index, so this only fails once closed
            if release.try_send(slot).is_err() {
                warn!("worker slot {slot} released after pool shutdown");
            }
        });

        if let Err(e) = self.slots[slot].jobs.try_send(job) {
            self.busy.fetch_sub(1, Ordering::AcqRel);
            let _ = self.free_tx.try_send(slot);
            error!("worker slot {slot} unavailable: {e}");
            return Err(WorkerPoolError::Closed);
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.free_rx.close();
        for slot in self.slots.iter() {
            slot.jobs.close();
        }
        for handle in self.threads.drain(..) {
            // a slot dropping its own pool from a continuation must not join itself
            if handle.thread().id() == std::thread::current().id() {
                continue;
            }
            let _ = handle.join();
        }
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc,
        },
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_concurrency_is_bounded() {
        const CAPACITY: usize = 4;
        const TASKS: usize = 24;

        let pool = Arc::new(WorkerPool::new(CAPACITY).unwrap());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        let callers: Vec<_> = (0..TASKS)
            .map(|n| {
                let pool = pool.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let done_ok = done_tx.clone();
                let done_err = done_tx.clone();
                std::thread::spawn(move || {
                    pool.assign(
                        move |n: usize| {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(15));
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(n * 2)
                        },
                        n,
                        move |v| done_ok.send(Ok(v)).unwrap(),
                        move |e| done_err.send(Err(e.to_string())).unwrap(),
                    )
                    .unwrap();
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        let mut results: Vec<usize> = (0..TASKS)
            .map(|_| {
                done_rx
                    .recv_timeout(Duration::from_secs(10))
                    .unwrap()
                    .unwrap()
            })
            .collect();
        results.sort_unstable();
        assert_eq!(results, (0..TASKS).map(|n| n * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_failure_and_panic_go_to_on_failure() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        let tx2 = tx.clone();
        pool.assign(
            |_: ()| -> AnyResult<()> { Err(anyhow::anyhow!("boom")) },
            (),
            move |_| tx1.send("success".to_string()).unwrap(),
            move |e| tx2.send(format!("failure: {e}")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "failure: boom"
        );

        let tx1 = tx.clone();
        let tx2 = tx.clone();
        pool.assign(
            |_: ()| -> AnyResult<()> { panic!("kaboom") },
            (),
            move |_| tx1.send("success".to_string()).unwrap(),
            move |e| tx2.send(format!("failure: {e}")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "failure: task panicked: kaboom"
        );

        // the single slot survived both and is reusable
        let tx1 = tx.clone();
        pool.assign(
            |v: u8| Ok(v + 1),
            41,
            move |v| tx1.send(format!("success: {v}")).unwrap(),
            |_| {},
        )
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "success: 42"
        );
    }

    #[test]
    fn test_try_assign_reports_exhaustion() {
        let pool = WorkerPool::new(1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        let first = pool
            .try_assign(
                move |_: ()| {
                    gate_rx.recv().unwrap();
                    Ok(())
                },
                (),
                move |_| done_tx.send(()).unwrap(),
                |_| {},
            )
            .unwrap();
        assert!(first.is_ok());
        assert_eq!(pool.busy(), 1);

        let second = pool
            .try_assign(|v: u32| Ok(v), 5, |_| {}, |_| {})
            .unwrap();
        assert_eq!(second, Err(5));

        gate_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(WorkerPoolError::ZeroCapacity)
        ));
    }
}
