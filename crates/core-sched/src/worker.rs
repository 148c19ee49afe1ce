//! Fixed thread pool for auxiliary work (speech, tunes, blocking probes).
//!
//! Workers never touch main-loop state. A job that needs to publish a result
//! does so by posting a task through the `TaskSender` handed to
//! `execute_then`; the scheduler drains those tasks between alarms and I/O.

use std::thread::JoinHandle;

use crossbeam_channel::{Sender, bounded};
use tracing::{debug, warn};

use crate::scheduler::{Scheduler, TaskSender};

type Job = Box<dyn FnOnce() + Send>;

pub struct WorkerPool {
    name: &'static str,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers. `size` is clamped to at least one.
    pub fn new(name: &'static str, size: usize) -> Self {
        let (tx, rx) = bounded::<Job>(128);
        let size = size.max(1);
        let workers = (0..size)
            .map(|index| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .unwrap_or_else(|e| panic!("spawning {name} worker failed: {e}"))
            })
            .collect();
        debug!(target: "sched.worker", pool = name, size, "pool_started");
        Self {
            name,
            tx: Some(tx),
            workers,
        }
    }

    /// Run `job` on some worker. Blocks briefly if the queue is full.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(job)).is_err() {
                warn!(target: "sched.worker", pool = self.name, "pool_shut_down_job_dropped");
            }
        }
    }

    /// Run `job` on a worker, then deliver its result to the main loop as an
    /// injected task.
    pub fn execute_then<R: Send + 'static>(
        &self,
        tasks: &TaskSender,
        job: impl FnOnce() -> R + Send + 'static,
        done: impl FnOnce(&Scheduler, R) + Send + 'static,
    ) {
        let tasks = tasks.clone();
        self.execute(move || {
            let result = job();
            if tasks
                .send(move |sched| done(sched, result))
                .is_err()
            {
                warn!(target: "sched.worker", "completion_dropped_scheduler_gone");
            }
        });
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets each worker drain and exit.
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(target: "sched.worker", pool = self.name, "worker_panicked");
            }
        }
        debug!(target: "sched.worker", pool = self.name, "pool_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_on_worker_threads() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // join
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn completion_arrives_as_a_main_loop_task() {
        let sched = Scheduler::new().expect("scheduler");
        let pool = WorkerPool::new("test", 1);
        let result = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&result);
        pool.execute_then(
            &sched.task_sender(),
            || 21 * 2,
            move |_, value| sink.store(value, Ordering::SeqCst),
        );
        assert!(
            sched.await_condition(Duration::from_secs(2), || result.load(Ordering::SeqCst) == 42)
        );
    }
}
