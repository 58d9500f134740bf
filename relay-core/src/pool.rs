//! Worker pool / job list (C10). Mirrors a try-lock linear scan over a
//! growing collection of job slots, parking idle workers on a condition
//! variable, with a one-way `lock()` shutdown transition.

use crate::store::Store;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// One unit of work driven by the pool. `perform` is handed the calling
/// worker's own persistence session; returning `true` means "not finished,
/// put me back in the list", `false` means "finished, drop me".
pub trait Job: Send {
    fn perform(&mut self, session: &mut Store) -> bool;
}

type Slot = Arc<Mutex<Option<Box<dyn Job>>>>;

/// Raised by [`JobList::take`] once the list has been locked for shutdown.
#[derive(Debug)]
pub struct ListLocked;

pub struct JobList {
    entries: Mutex<Vec<Slot>>,
    count: AtomicUsize,
    locked: AtomicBool,
    park: Mutex<()>,
    condition: Condvar,
}

impl JobList {
    pub fn new() -> Self {
        JobList {
            entries: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            locked: AtomicBool::new(false),
            park: Mutex::new(()),
            condition: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Reuses the first free slot found by a try-lock scan; appends a new
    /// slot only if none is free. The backing collection never shrinks.
    pub fn add(&self, job: Box<dyn Job>) {
        let snapshot: Vec<Slot> = self.entries.lock().unwrap().clone();

        for slot in &snapshot {
            if let Ok(mut guard) = slot.try_lock() {
                if guard.is_none() {
                    *guard = Some(job);
                    self.count.fetch_add(1, Ordering::SeqCst);
                    self.condition.notify_one();
                    return;
                }
            }
        }

        let slot: Slot = Arc::new(Mutex::new(Some(job)));
        self.entries.lock().unwrap().push(slot);
        self.count.fetch_add(1, Ordering::SeqCst);
        self.condition.notify_one();
    }

    /// Takes the first available job via a linear try-lock scan, blocking on
    /// the condition variable when none is free. Returns `Err(ListLocked)`
    /// once [`JobList::lock`] has been called.
    pub fn take(&self) -> Result<Box<dyn Job>, ListLocked> {
        loop {
            if self.locked.load(Ordering::SeqCst) {
                return Err(ListLocked);
            }

            let snapshot: Vec<Slot> = self.entries.lock().unwrap().clone();
            for slot in &snapshot {
                if let Ok(mut guard) = slot.try_lock() {
                    if let Some(job) = guard.take() {
                        self.count.fetch_sub(1, Ordering::SeqCst);
                        return Ok(job);
                    }
                }
            }

            let guard = self.park.lock().unwrap();
            if self.locked.load(Ordering::SeqCst) {
                continue;
            }
            drop(self.condition.wait(guard));
        }
    }

    /// One-way shutdown transition: wakes every parked worker; no further
    /// job can be taken.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
        self.condition.notify_all();
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

/// N = ceil(available_parallelism / 2), minimum 1. The main thread acts as
/// an (N+1)-th worker and is expected to run its own `JobList::take` loop.
pub fn worker_count() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    std::cmp::max(1, (cores + 1) / 2)
}

pub struct ThreadPool {
    handles: Vec<JoinHandle<()>>,
    run: Arc<AtomicBool>,
}

impl ThreadPool {
    /// Spawns `count` worker threads, each opening its own session via
    /// `open_session` and running the take/perform/requeue loop until the
    /// list is locked or the pool is stopped.
    pub fn spawn<F>(job_list: Arc<JobList>, count: usize, open_session: F) -> ThreadPool
    where
        F: Fn() -> Store + Send + Sync + 'static,
    {
        let run = Arc::new(AtomicBool::new(true));
        let open_session = Arc::new(open_session);
        let mut handles = Vec::with_capacity(count);

        for _ in 0..count {
            let job_list = Arc::clone(&job_list);
            let run = Arc::clone(&run);
            let open_session = Arc::clone(&open_session);
            handles.push(std::thread::spawn(move || {
                let mut session = open_session();
                while run.load(Ordering::SeqCst) {
                    match job_list.take() {
                        Ok(mut job) => {
                            if job.perform(&mut session) {
                                job_list.add(job);
                            }
                        }
                        Err(ListLocked) => break,
                    }
                }
            }));
        }

        ThreadPool { handles, run }
    }

    /// Idempotent: stops accepting work and wakes every parked worker.
    pub fn shutdown(&self, job_list: &JobList) {
        self.run.store(false, Ordering::SeqCst);
        job_list.lock();
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingJob {
        remaining: u32,
        counter: Arc<AtomicU32>,
    }

    impl Job for CountingJob {
        fn perform(&mut self, _session: &mut Store) -> bool {
            self.counter.fetch_add(1, Ordering::SeqCst);
            self.remaining -= 1;
            self.remaining > 0
        }
    }

    #[test]
    fn take_blocks_until_a_job_is_added() {
        let list = Arc::new(JobList::new());
        let list2 = Arc::clone(&list);
        let handle = std::thread::spawn(move || list2.take().unwrap());

        std::thread::sleep(std::time::Duration::from_millis(50));
        let counter = Arc::new(AtomicU32::new(0));
        list.add(Box::new(CountingJob { remaining: 1, counter }));

        let job = handle.join().unwrap();
        drop(job);
    }

    #[test]
    fn requeue_runs_until_finished() {
        let list = Arc::new(JobList::new());
        let counter = Arc::new(AtomicU32::new(0));
        list.add(Box::new(CountingJob {
            remaining: 3,
            counter: Arc::clone(&counter),
        }));

        let mut session = Store::open_in_memory().unwrap();
        for _ in 0..3 {
            let mut job = list.take().unwrap();
            if job.perform(&mut session) {
                list.add(job);
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn locked_list_refuses_further_takes() {
        let list = JobList::new();
        list.lock();
        assert!(matches!(list.take(), Err(ListLocked)));
    }

    #[test]
    fn slots_are_reused_not_endlessly_appended() {
        let list = JobList::new();
        let counter = Arc::new(AtomicU32::new(0));
        list.add(Box::new(CountingJob {
            remaining: 1,
            counter: Arc::clone(&counter),
        }));
        let mut session = Store::open_in_memory().unwrap();
        let job = list.take().unwrap();
        assert_eq!(list.len(), 0);
        // job finished (remaining hit 0), slot is now free for reuse.
        drop(job);
        list.add(Box::new(CountingJob {
            remaining: 1,
            counter,
        }));
        assert_eq!(list.len(), 1);
        let _ = session;
    }
}
