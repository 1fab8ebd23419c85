use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::warn;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Posts work onto the single serialized thread that owns non-real-time
/// state. Cheap to clone; background threads get their own copy.
#[derive(Clone)]
pub struct MainContext {
    tx: Sender<Task>,
}

/// The receiving end, drained by whichever thread acts as the main context.
pub struct MainLoop {
    rx: Receiver<Task>,
}

pub fn main_context() -> (MainContext, MainLoop) {
    let (tx, rx) = crossbeam::channel::unbounded();
    (MainContext { tx }, MainLoop { rx })
}

impl MainContext {
    /// Queues `task` to run on the main context. Returns `false` if the main
    /// loop is gone, in which case the task is dropped without running.
    pub fn call_async<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_err() {
            warn!("main context is gone, dropping task");
            return false;
        }
        true
    }
}

impl MainLoop {
    /// Runs everything queued so far without blocking.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Waits up to `timeout` for one task and runs it.
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn receiver(&self) -> &Receiver<Task> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_tasks_in_posting_order() {
        let (context, main_loop) = main_context();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            context.call_async(move || log.lock().push(i));
        }
        assert!(log.lock().is_empty());

        assert_eq!(main_loop.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn tasks_posted_from_other_threads_run_here() {
        let (context, main_loop) = main_context();
        let hits = Arc::new(AtomicUsize::new(0));
        let main_thread = std::thread::current().id();

        let worker = {
            let hits = hits.clone();
            std::thread::spawn(move || {
                context.call_async(move || {
                    assert_eq!(std::thread::current().id(), main_thread);
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            })
        };
        worker.join().unwrap();

        assert!(main_loop.run_one(Duration::from_secs(1)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn posting_after_the_loop_is_gone_is_refused() {
        let (context, main_loop) = main_context();
        drop(main_loop);
        assert!(!context.call_async(|| {}));
    }
}
