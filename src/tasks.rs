use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

/// Outcome line for one unit of work, shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub ok: bool,
    pub message: String,
}

impl TaskReport {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

pub type Task = Box<dyn FnOnce() -> TaskReport + Send + 'static>;

/// Where background units of work go. The pipeline only ever submits.
pub trait TaskQueue: Send + Sync {
    fn submit(&self, task: Task) -> Result<()>;

    /// Blocks until every submitted task has finished and returns their reports.
    fn wait(&self) -> Vec<TaskReport>;
}

fn run_guarded(task: Task) -> TaskReport {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(report) => report,
        Err(panic_payload) => {
            let panic_msg = panic_payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            TaskReport::failed(format!("Task panicked: {panic_msg}"))
        }
    }
}

/// Fixed set of threads fed from a bounded channel.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reports: Receiver<TaskReport>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let (task_tx, task_rx) = bounded::<Task>(64);
        let (report_tx, report_rx) = unbounded::<TaskReport>();

        let workers = (0..threads.max(1))
            .map(|_| {
                let task_rx = task_rx.clone();
                let report_tx = report_tx.clone();
                std::thread::spawn(move || {
                    for task in task_rx {
                        if report_tx.send(run_guarded(task)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(task_tx)),
            workers: Mutex::new(workers),
            reports: report_rx,
        }
    }
}

impl TaskQueue for WorkerPool {
    fn submit(&self, task: Task) -> Result<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender
            .as_ref()
            .ok_or_else(|| anyhow!("Tasks: Worker pool is shut down"))?;
        sender
            .send(task)
            .map_err(|err| anyhow!("Tasks: Failed to submit task: {}", err))
    }

    fn wait(&self) -> Vec<TaskReport> {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Tasks: Worker thread panicked");
            }
        }
        self.reports.try_iter().collect()
    }
}

/// Runs each task on the submitting thread.
#[derive(Default)]
pub struct InlineQueue {
    reports: Mutex<Vec<TaskReport>>,
}

impl InlineQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for InlineQueue {
    fn submit(&self, task: Task) -> Result<()> {
        let report = run_guarded(task);
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
        Ok(())
    }

    fn wait(&self) -> Vec<TaskReport> {
        std::mem::take(&mut *self.reports.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
