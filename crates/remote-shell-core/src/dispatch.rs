//! Marshaling boundary onto the controlling context.
//!
//! A `Controller` owns some state `S` and runs posted jobs against it one at
//! a time, in the order they were posted. Any thread may hold a `Dispatcher`
//! and post to it. Once the controller is gone, posting is a silent no-op.

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

/// Job run on the controlling context.
pub type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Envelope<S> {
    Run(Job<S>),
    Stop,
}

/// The controlling context has shut down.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Controller has shut down")]
pub struct ControllerClosed;

/// Posts jobs to a controller.
pub struct Dispatcher<S> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: 'static> Dispatcher<S> {
    /// Enqueue a job and return immediately.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.tx.send(Envelope::Run(Box::new(job))).is_err() {
            tracing::trace!("Controller gone, dropping posted job");
        }
    }

    /// Run a job on the controller and wait for its result.
    ///
    /// # Errors
    /// Returns `ControllerClosed` if the controller stopped before running the job.
    pub async fn call<F, R>(&self, job: F) -> Result<R, ControllerClosed>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move |state| {
            let _ = reply_tx.send(job(state));
        });
        reply_rx.await.map_err(|_| ControllerClosed)
    }

    /// Ask the controller to stop after the jobs already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Envelope::Stop);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owns the controlled state and runs posted jobs.
pub struct Controller<S> {
    state: S,
    rx: mpsc::UnboundedReceiver<Envelope<S>>,
}

impl<S: Send + 'static> Controller<S> {
    /// Create a dispatcher for state built by `init`.
    ///
    /// `init` receives the dispatcher so the state can post back to itself.
    pub fn new(init: impl FnOnce(Dispatcher<S>) -> S) -> (Dispatcher<S>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher { tx };
        let state = init(dispatcher.clone());
        (dispatcher, Self { state, rx })
    }

    /// Run jobs until `Dispatcher::shutdown` or until every dispatcher is dropped.
    ///
    /// Jobs still queued behind the stop request are dropped unrun.
    pub async fn run(mut self) -> S {
        while let Some(envelope) = self.rx.recv().await {
            match envelope {
                Envelope::Run(job) => job(&mut self.state),
                Envelope::Stop => break,
            }
        }
        self.rx.close();
        tracing::debug!("Controller stopped");
        self.state
    }

    /// Run on a new Tokio task.
    pub fn spawn(self) -> JoinHandle<S> {
        tokio::spawn(self.run())
    }
}
