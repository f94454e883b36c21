//! Priority DAG job scheduler: a fixed-size native-thread worker pool runs
//! arena-allocated jobs honoring dependency edges, six priority levels, and
//! FIFO ordering within a priority.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::EncoderError;

pub type JobId = usize;
pub const PRIORITY_LEVELS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Paused,
    Waiting,
    Ready,
    Running,
    Done,
}

type Callable = dyn FnOnce() -> Result<(), EncoderError> + Send;

struct JobInner {
    state: JobState,
    reverse_dependencies: Vec<JobId>,
    error: Option<EncoderError>,
}

struct Job {
    #[allow(dead_code)] // diagnostics only
    name: String,
    priority: u8,
    callable: Mutex<Option<Box<Callable>>>,
    dependency_count: AtomicUsize,
    inner: Mutex<JobInner>,
    completed: Condvar,
}

/// A DAG job scheduler with a fixed worker pool. `num_workers == 0` runs
/// every submitted job synchronously in place.
pub struct Scheduler {
    jobs: Mutex<Vec<Arc<Job>>>,
    queues: Mutex<[VecDeque<JobId>; PRIORITY_LEVELS]>,
    queue_available: Condvar,
    stop: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    synchronous: bool,
}

impl Scheduler {
    pub fn new(num_workers: usize) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            jobs: Mutex::new(Vec::new()),
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            queue_available: Condvar::new(),
            stop: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            synchronous: num_workers == 0,
        });
        let mut workers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let scheduler = Arc::clone(&scheduler);
            workers.push(std::thread::spawn(move || scheduler.worker_loop()));
        }
        *scheduler.workers.lock() = workers;
        scheduler
    }

    /// Create a new job in state `Paused`. `priority` must be `0..=5`.
    pub fn create_job(
        &self,
        name: impl Into<String>,
        priority: u8,
        callable: impl FnOnce() -> Result<(), EncoderError> + Send + 'static,
    ) -> JobId {
        assert!((priority as usize) < PRIORITY_LEVELS, "priority out of range");
        let job = Arc::new(Job {
            name: name.into(),
            priority,
            callable: Mutex::new(Some(Box::new(callable))),
            dependency_count: AtomicUsize::new(0),
            inner: Mutex::new(JobInner {
                state: JobState::Paused,
                reverse_dependencies: Vec::new(),
                error: None,
            }),
            completed: Condvar::new(),
        });
        let mut jobs = self.jobs.lock();
        let id = jobs.len();
        jobs.push(job);
        id
    }

    fn job(&self, id: JobId) -> Arc<Job> {
        Arc::clone(&self.jobs.lock()[id])
    }

    /// `job` will not run until `depends_on` completes. A no-op if
    /// `depends_on` has already completed.
    pub fn add_dependency(&self, job: JobId, depends_on: JobId) {
        let dep = self.job(depends_on);
        let this = self.job(job);
        let mut dep_inner = dep.inner.lock();
        if dep_inner.state != JobState::Done {
            this.dependency_count.fetch_add(1, Ordering::SeqCst);
            dep_inner.reverse_dependencies.push(job);
        }
    }

    /// Submit a job: run synchronously (empty pool), push it Ready if it has
    /// no outstanding dependencies, or mark it Waiting.
    pub fn submit(&self, job: JobId) {
        let j = self.job(job);
        if self.synchronous {
            Self::run_inline(&j);
            return;
        }
        let mut inner = j.inner.lock();
        if j.dependency_count.load(Ordering::SeqCst) == 0 {
            inner.state = JobState::Ready;
            drop(inner);
            self.push_ready(job, j.priority);
        } else {
            inner.state = JobState::Waiting;
        }
    }

    fn run_inline(job: &Job) {
        let callable = job.callable.lock().take();
        let result = match callable {
            Some(f) => f(),
            None => Ok(()),
        };
        let mut inner = job.inner.lock();
        inner.state = JobState::Done;
        inner.error = result.err();
        job.completed.notify_all();
    }

    fn push_ready(&self, job: JobId, priority: u8) {
        self.queues.lock()[priority as usize].push_back(job);
        self.queue_available.notify_one();
    }

    fn worker_loop(&self) {
        loop {
            let job_id = {
                let mut queues = self.queues.lock();
                loop {
                    if let Some(id) = queues
                        .iter_mut()
                        .rev()
                        .find_map(|deque| deque.pop_front())
                    {
                        break Some(id);
                    }
                    if self.stop.load(Ordering::SeqCst) {
                        break None;
                    }
                    self.queue_available.wait(&mut queues);
                }
            };
            let Some(job_id) = job_id else { break };
            let job = self.job(job_id);
            job.inner.lock().state = JobState::Running;

            let callable = job.callable.lock().take();
            let result = match callable {
                Some(f) => f(),
                None => Ok(()),
            };

            let mut inner = job.inner.lock();
            inner.state = JobState::Done;
            let failed = result.is_err();
            inner.error = result.err();
            let reverse_deps = std::mem::take(&mut inner.reverse_dependencies);
            drop(inner);
            job.completed.notify_all();

            // A failed job's dependents are never released; they are
            // abandoned along with the rest of their GOF.
            if failed {
                continue;
            }
            for dep_id in reverse_deps {
                let dep = self.job(dep_id);
                if dep.dependency_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let mut dep_inner = dep.inner.lock();
                    if dep_inner.state == JobState::Waiting {
                        dep_inner.state = JobState::Ready;
                        drop(dep_inner);
                        self.push_ready(dep_id, dep.priority);
                    }
                }
            }
        }
    }

    /// Block the calling thread until `job` reaches `Done`, returning its
    /// callable's result.
    pub fn wait_for_job(&self, job: JobId) -> Result<(), EncoderError> {
        let j = self.job(job);
        let mut inner = j.inner.lock();
        while inner.state != JobState::Done {
            j.completed.wait(&mut inner);
        }
        inner
            .error
            .clone()
            .map_or(Ok(()), Err)
    }

    pub fn job_state(&self, job: JobId) -> JobState {
        self.job(job).inner.lock().state
    }

    /// Signal all workers to stop and join them. Jobs already running finish;
    /// nothing is cancelled.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue_available.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn synchronous_mode_runs_jobs_in_place() {
        let scheduler = Scheduler::new(0);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let job = scheduler.create_job("test", 0, move || {
            ran2.store(true, Ordering::SeqCst);
            Ok(())
        });
        scheduler.submit(job);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.job_state(job), JobState::Done);
    }

    #[test]
    fn dependency_runs_before_dependent() {
        let scheduler = Scheduler::new(2);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let first = scheduler.create_job("first", 0, move || {
            o1.lock().push(1);
            Ok(())
        });
        let o2 = Arc::clone(&order);
        let second = scheduler.create_job("second", 0, move || {
            o2.lock().push(2);
            Ok(())
        });
        scheduler.add_dependency(second, first);
        scheduler.submit(second);
        scheduler.submit(first);
        scheduler.wait_for_job(second).unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
        scheduler.shutdown();
    }

    #[test]
    fn failed_job_does_not_release_dependents() {
        let scheduler = Scheduler::new(1);
        let failing = scheduler.create_job("failing", 0, || {
            Err(EncoderError::Internal("boom".to_string()))
        });
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let dependent = scheduler.create_job("dependent", 0, move || {
            ran2.store(true, Ordering::SeqCst);
            Ok(())
        });
        scheduler.add_dependency(dependent, failing);
        scheduler.submit(dependent);
        scheduler.submit(failing);
        assert!(scheduler.wait_for_job(failing).is_err());
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst));
        assert_ne!(scheduler.job_state(dependent), JobState::Done);
        scheduler.shutdown();
    }

    #[test]
    fn fifo_within_priority() {
        let scheduler = Scheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicU32::new(0));
        let mut last = None;
        for i in 0..5 {
            let order = Arc::clone(&order);
            let counter = Arc::clone(&counter);
            let job = scheduler.create_job(format!("job{i}"), 2, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().push(i);
                Ok(())
            });
            last = Some(job);
        }
        // submit in creation order so FIFO-within-priority is observable
        for id in 0..5 {
            scheduler.submit(id);
        }
        scheduler.wait_for_job(last.unwrap()).unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        scheduler.shutdown();
    }
}
