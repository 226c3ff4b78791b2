//! The single write lane. Every mutation of the timetable state runs here,
//! one task at a time, in submission order.

use std::cell::Cell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::thread;

use anyhow::Context as _;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum LaneError {
    #[error("write task failed: {0:#}")]
    Task(anyhow::Error),
    #[error("write task panicked")]
    TaskPanicked,
    #[error("task submitted from inside the write lane")]
    Reentrant,
    #[error("write lane has stopped")]
    Stopped,
}

impl LaneError {
    /// True for the errors after which the lane accepts no more work.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LaneError::Task(_))
    }
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

static NEXT_LANE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LANE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Handle to a lane thread that owns `S`. Clones share the lane.
pub struct WriteSerializer<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
    lane_id: u64,
    stopped: Arc<AtomicBool>,
}

impl<S> Clone for WriteSerializer<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            lane_id: self.lane_id,
            stopped: self.stopped.clone(),
        }
    }
}

impl<S: Send + 'static> WriteSerializer<S> {
    /// Moves `state` onto a new thread named `name`. The thread exits once
    /// every handle is dropped or the lane stops.
    pub fn spawn(name: &str, state: S) -> anyhow::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<S>>();
        let lane_id = NEXT_LANE_ID.fetch_add(1, Ordering::Relaxed);
        let stopped = Arc::new(AtomicBool::new(false));

        let flag = stopped.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = state;
                CURRENT_LANE.with(|lane| lane.set(Some(lane_id)));
                while let Some(job) = rx.blocking_recv() {
                    job(&mut state);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                }
                flag.store(true, Ordering::Release);
                debug!(lane_id, "Write lane stopped");
                // queued jobs drop their reply senders here
            })
            .with_context(|| format!("spawning write lane thread {name}"))?;

        Ok(Self { tx, lane_id, stopped })
    }

    /// Queues `task` behind every task submitted before it.
    pub fn submit<T, F>(&self, task: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> anyhow::Result<T> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let completion = Completion { rx };

        if CURRENT_LANE.with(|lane| lane.get()) == Some(self.lane_id) {
            error!(lane_id = self.lane_id, "Reentrant submission, stopping write lane");
            self.stopped.store(true, Ordering::Release);
            let _ = done.send(Err(LaneError::Reentrant));
            return completion;
        }
        if self.is_stopped() {
            let _ = done.send(Err(LaneError::Stopped));
            return completion;
        }

        let stopped = self.stopped.clone();
        let job: Job<S> = Box::new(move |state| {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task(state))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(LaneError::Task(e)),
                Err(_) => {
                    error!("Write task panicked, stopping write lane");
                    stopped.store(true, Ordering::Release);
                    Err(LaneError::TaskPanicked)
                }
            };
            let _ = done.send(outcome);
        });
        // a closed lane drops the job, and with it the reply sender
        let _ = self.tx.send(job);
        completion
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

/// Resolves once the submitted task has run.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, LaneError>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T, LaneError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(LaneError::Stopped)))
    }
}
