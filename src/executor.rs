use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("main-thread task panicked: {0}")]
    Panicked(String),

    #[error("main-thread queue is closed")]
    Closed,
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Submission handle for work that must run on the designated thread.
///
/// The designated thread owns a value of type `S` (the simulation state) and
/// hands `&mut S` to each submitted closure. Handles are cheap to clone and
/// can be used from any thread, with or without a tokio runtime.
pub struct MainThreadExecutor<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for MainThreadExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Consumer side of the executor, owned by the designated thread.
pub struct MainThreadQueue<S> {
    rx: mpsc::UnboundedReceiver<Job<S>>,
}

/// Counts from one `run_pending` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub ran: usize,
    pub panicked: usize,
}

impl<S: 'static> MainThreadExecutor<S> {
    /// Create a connected handle/queue pair.
    pub fn new() -> (Self, MainThreadQueue<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, MainThreadQueue { rx })
    }

    /// Queue `f` for the designated thread and return a future for its result.
    ///
    /// Enqueueing happens before this returns, so ordering between two
    /// `submit` calls on the same thread is preserved even if the futures are
    /// awaited out of order. Calling this from the designated thread itself is
    /// fine: the closure simply runs on a later tick.
    ///
    /// A panic inside `f` resolves the future to [`ExecutorError::Panicked`];
    /// if the queue is dropped before `f` runs it resolves to
    /// [`ExecutorError::Closed`]. No timeout is applied here.
    pub fn submit<F, T>(&self, f: F) -> impl Future<Output = Result<T, ExecutorError>> + Send + 'static
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |state: &mut S| {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(state)))
                .map_err(|payload| ExecutorError::Panicked(panic_message(payload.as_ref())));
            // Receiver gone means the caller stopped waiting.
            let _ = result_tx.send(outcome);
        });
        let queued = self.tx.send(job).is_ok();

        async move {
            if !queued {
                return Err(ExecutorError::Closed);
            }
            result_rx.await.map_err(|_| ExecutorError::Closed)?
        }
    }

    /// True once the designated thread has dropped its queue.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<S> MainThreadQueue<S> {
    /// Run every closure queued before this call, in FIFO order.
    ///
    /// The queue length is snapshotted first: closures submitted while this
    /// tick runs (including by the closures themselves) wait for the next
    /// tick. A panicking closure only fails its own future.
    pub fn run_pending(&mut self, state: &mut S) -> TickReport {
        let mut report = TickReport::default();
        let budget = self.rx.len();
        for _ in 0..budget {
            let Ok(job) = self.rx.try_recv() else {
                break;
            };
            // The job catches its own closure's panic; this guard only covers
            // the result hand-off itself.
            match catch_unwind(AssertUnwindSafe(|| job(state))) {
                Ok(()) => {}
                Err(payload) => {
                    tracing::error!(
                        panic = %panic_message(payload.as_ref()),
                        "main-thread job panicked outside its closure"
                    );
                    report.panicked += 1;
                }
            }
            report.ran += 1;
        }
        report
    }

    /// Number of closures currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn submitted_closure_sees_state() {
        let (exec, mut queue) = MainThreadExecutor::<Vec<u32>>::new();
        let fut = exec.submit(|v: &mut Vec<u32>| {
            v.push(3);
            v.len()
        });

        let mut state = vec![1, 2];
        let report = queue.run_pending(&mut state);

        assert_eq!(report, TickReport { ran: 1, panicked: 0 });
        assert_eq!(fut.await, Ok(3));
        assert_eq!(state, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn runs_in_submission_order() {
        let (exec, mut queue) = MainThreadExecutor::<Vec<&'static str>>::new();
        let a = exec.submit(|v: &mut Vec<&'static str>| v.push("a"));
        let b = exec.submit(|v: &mut Vec<&'static str>| v.push("b"));
        let c = exec.submit(|v: &mut Vec<&'static str>| v.push("c"));

        let mut state = Vec::new();
        queue.run_pending(&mut state);
        a.await.unwrap();
        b.await.unwrap();
        c.await.unwrap();
        assert_eq!(state, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn panic_fails_only_its_own_future() {
        let (exec, mut queue) = MainThreadExecutor::<u32>::new();
        let bad = exec.submit(|_: &mut u32| -> u32 { panic!("junction index out of range") });
        let good = exec.submit(|n: &mut u32| {
            *n += 1;
            *n
        });

        let mut state = 0;
        let report = queue.run_pending(&mut state);

        assert_eq!(report.ran, 2);
        assert_eq!(
            bad.await,
            Err(ExecutorError::Panicked("junction index out of range".into()))
        );
        assert_eq!(good.await, Ok(1));
    }

    #[tokio::test]
    async fn formatted_panic_message_is_kept() {
        let (exec, mut queue) = MainThreadExecutor::<()>::new();
        let fut = exec.submit(|_: &mut ()| -> u32 { panic!("car {} missing", "L-001") });
        queue.run_pending(&mut ());
        assert_eq!(fut.await, Err(ExecutorError::Panicked("car L-001 missing".into())));
    }

    #[tokio::test]
    async fn resubmission_from_inside_runs_next_tick() {
        let (exec, mut queue) = MainThreadExecutor::<u32>::new();
        let inner_exec = exec.clone();
        let outer = exec.submit(move |n: &mut u32| {
            *n += 1;
            inner_exec.submit(|n: &mut u32| {
                *n += 10;
            })
        });

        let mut state = 0;
        let first = queue.run_pending(&mut state);
        assert_eq!(first.ran, 1);
        assert_eq!(state, 1, "nested submission must not run in the same tick");

        let inner = outer.await.unwrap();
        let second = queue.run_pending(&mut state);
        assert_eq!(second.ran, 1);
        assert_eq!(state, 11);
        inner.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_queue_closes_submissions() {
        let (exec, queue) = MainThreadExecutor::<()>::new();
        let pending = exec.submit(|_: &mut ()| 1);
        drop(queue);

        assert!(exec.is_closed());
        assert_eq!(pending.await, Err(ExecutorError::Closed));
        assert_eq!(exec.submit(|_: &mut ()| 2).await, Err(ExecutorError::Closed));
    }

    #[tokio::test]
    async fn empty_tick_is_a_no_op() {
        let (_exec, mut queue) = MainThreadExecutor::<()>::new();
        assert!(queue.is_empty());
        assert_eq!(queue.run_pending(&mut ()), TickReport::default());
    }

    #[tokio::test]
    async fn submit_from_many_threads() {
        let (exec, mut queue) = MainThreadExecutor::<u64>::new();
        let mut futures = Vec::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let e = exec.clone();
                std::thread::spawn(move || e.submit(move |n: &mut u64| {
                    *n += i;
                }))
            })
            .collect();
        for h in handles {
            futures.push(h.join().unwrap());
        }

        let driver = std::thread::spawn(move || {
            let mut total = 0u64;
            let mut ran = 0;
            while ran < 8 {
                ran += queue.run_pending(&mut total).ran;
                std::thread::sleep(Duration::from_millis(1));
            }
            total
        });

        for f in futures {
            f.await.unwrap();
        }
        assert_eq!(driver.join().unwrap(), (0..8).sum::<u64>());
    }
}
