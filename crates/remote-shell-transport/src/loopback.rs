//! In-process loopback transport.
//!
//! Each adapter the factory creates is paired with a `LoopbackRemote` that
//! plays the far end: it decides how `open` completes, injects data and
//! faults through the installed callbacks, and records what the session sent.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use remote_shell_core::{
    FaultCode, OpenRequest, TerminalGeometry, TransportAdapter, TransportCallbacks,
    TransportError, TransportFactory,
};
use tokio::sync::oneshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn disposed() -> TransportError {
    TransportError::new(FaultCode::SocketDisconnect, "channel disposed")
}

/// How the next adapter's `open` completes.
#[derive(Debug, Clone, Default)]
pub enum OpenPlan {
    /// Succeed immediately.
    #[default]
    Accept,
    /// Fail immediately with the given fault.
    Reject(TransportError),
    /// Stay pending until the remote releases or rejects it.
    Hold,
}

#[derive(Default)]
struct FactoryInner {
    plans: Mutex<VecDeque<OpenPlan>>,
    remotes: Mutex<Vec<LoopbackRemote>>,
    echo: AtomicBool,
}

/// Creates loopback adapters and keeps their remote ends.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    inner: Arc<FactoryInner>,
}

impl LoopbackFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose adapters send every payload straight back as data.
    #[must_use]
    pub fn echoing() -> Self {
        let factory = Self::default();
        factory.inner.echo.store(true, Ordering::SeqCst);
        factory
    }

    /// Queue the open behavior for the next adapter created.
    ///
    /// Adapters created with an empty queue accept.
    pub fn plan(&self, plan: OpenPlan) -> &Self {
        lock(&self.inner.plans).push_back(plan);
        self
    }

    /// Remote ends, in creation order.
    #[must_use]
    pub fn remotes(&self) -> Vec<LoopbackRemote> {
        lock(&self.inner.remotes).clone()
    }

    #[must_use]
    pub fn last_remote(&self) -> Option<LoopbackRemote> {
        lock(&self.inner.remotes).last().cloned()
    }

    /// Number of adapters created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        lock(&self.inner.remotes).len()
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self) -> Arc<dyn TransportAdapter> {
        let plan = lock(&self.inner.plans).pop_front().unwrap_or_default();
        let channel = Arc::new(Channel::new(plan, self.inner.echo.load(Ordering::SeqCst)));
        lock(&self.inner.remotes).push(LoopbackRemote {
            channel: Arc::clone(&channel),
        });
        tracing::trace!("Created loopback adapter");
        Arc::new(LoopbackTransport { channel })
    }
}

struct Channel {
    plan: Mutex<Option<OpenPlan>>,
    echo: bool,
    callbacks: Mutex<Option<TransportCallbacks>>,
    request: Mutex<Option<OpenRequest>>,
    hold: Mutex<Option<oneshot::Sender<Result<(), TransportError>>>>,
    sent: Mutex<Vec<String>>,
    geometry: Mutex<Option<TerminalGeometry>>,
    open: AtomicBool,
    disposals: AtomicUsize,
}

impl Channel {
    fn new(plan: OpenPlan, echo: bool) -> Self {
        Self {
            plan: Mutex::new(Some(plan)),
            echo,
            callbacks: Mutex::new(None),
            request: Mutex::new(None),
            hold: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            geometry: Mutex::new(None),
            open: AtomicBool::new(false),
            disposals: AtomicUsize::new(0),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposals.load(Ordering::SeqCst) > 0
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.is_disposed()
    }

    /// Invoke the installed callbacks, if any. Holding the lock keeps
    /// invocations from racing past `dispose`.
    fn with_callbacks(&self, f: impl FnOnce(&TransportCallbacks)) -> bool {
        let callbacks = lock(&self.callbacks);
        callbacks.as_ref().map(f).is_some()
    }

    fn complete_hold(&self, outcome: Result<(), TransportError>) -> bool {
        lock(&self.hold)
            .take()
            .is_some_and(|tx| tx.send(outcome).is_ok())
    }
}

/// Loopback adapter handed to sessions.
pub struct LoopbackTransport {
    channel: Arc<Channel>,
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    async fn open(
        &self,
        request: OpenRequest,
        callbacks: TransportCallbacks,
    ) -> Result<(), TransportError> {
        if self.channel.is_disposed() {
            return Err(disposed());
        }
        *lock(&self.channel.request) = Some(request);
        *lock(&self.channel.callbacks) = Some(callbacks);

        let plan = lock(&self.channel.plan).take().unwrap_or_default();
        let outcome = match plan {
            OpenPlan::Accept => Ok(()),
            OpenPlan::Reject(fault) => Err(fault),
            OpenPlan::Hold => {
                let (tx, rx) = oneshot::channel();
                *lock(&self.channel.hold) = Some(tx);
                rx.await.unwrap_or_else(|_| Err(disposed()))
            }
        };

        if outcome.is_ok() {
            self.channel.open.store(true, Ordering::SeqCst);
        }
        outcome
    }

    async fn send(&self, payload: &str) -> Result<(), TransportError> {
        if !self.channel.is_open() {
            return Err(TransportError::new(FaultCode::SocketSend, "channel is not open"));
        }
        lock(&self.channel.sent).push(payload.to_string());
        if self.channel.echo {
            self.channel
                .with_callbacks(|callbacks| callbacks.data(payload.to_string()));
        }
        Ok(())
    }

    async fn resize(&self, geometry: TerminalGeometry) -> Result<(), TransportError> {
        if !self.channel.is_open() {
            return Err(TransportError::new(FaultCode::ChannelFailure, "channel is not open"));
        }
        *lock(&self.channel.geometry) = Some(geometry);
        Ok(())
    }

    fn dispose(&self) {
        self.channel.disposals.fetch_add(1, Ordering::SeqCst);
        lock(&self.channel.callbacks).take();
        // A held open completes with the disposed error.
        lock(&self.channel.hold).take();
        tracing::trace!("Disposed loopback adapter");
    }
}

/// Far end of one loopback adapter.
#[derive(Clone)]
pub struct LoopbackRemote {
    channel: Arc<Channel>,
}

impl LoopbackRemote {
    /// Deliver shell output. Returns false once the adapter is disposed.
    pub fn emit_data(&self, data: impl Into<String>) -> bool {
        let data = data.into();
        self.channel.with_callbacks(|callbacks| callbacks.data(data))
    }

    /// Report an asynchronous fault. Returns false once the adapter is disposed.
    pub fn emit_error(&self, fault: TransportError) -> bool {
        self.channel.with_callbacks(|callbacks| callbacks.error(fault))
    }

    /// Let a held `open` succeed.
    pub fn release(&self) -> bool {
        self.channel.complete_hold(Ok(()))
    }

    /// Let a held `open` fail with `fault`.
    pub fn reject(&self, fault: TransportError) -> bool {
        self.channel.complete_hold(Err(fault))
    }

    /// Whether an `open` is currently held.
    #[must_use]
    pub fn is_holding(&self) -> bool {
        lock(&self.channel.hold).is_some()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.channel.is_disposed()
    }

    /// Number of times `dispose` was called.
    #[must_use]
    pub fn disposals(&self) -> usize {
        self.channel.disposals.load(Ordering::SeqCst)
    }

    /// Payloads sent by the session, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        lock(&self.channel.sent).clone()
    }

    /// Geometry from the last resize.
    #[must_use]
    pub fn geometry(&self) -> Option<TerminalGeometry> {
        *lock(&self.channel.geometry)
    }

    /// The request passed to `open`.
    #[must_use]
    pub fn request(&self) -> Option<OpenRequest> {
        lock(&self.channel.request).clone()
    }
}
