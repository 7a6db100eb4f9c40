//! Per-session connection state machine.
//!
//! A `Session` lives on the broker's controlling context and is only ever
//! touched from jobs running there. Callers interact through a cloneable
//! `SessionHandle`, which marshals every call onto that context.

use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use futures::{StreamExt, future, stream::BoxStream};
use remote_shell_core::{
    AbortCause, ConnectError, ConnectionTarget, Dispatcher, ErrorClass, EventHub,
    LifecycleEvent, Observer, OpenRequest, SessionConfig, SessionError, SessionEvent, SessionId,
    Status, SubscriptionId, TargetIdentity, TerminalGeometry, TransportAdapter,
    TransportCallbacks, TransportError, TransportFactory,
    classify::{classify, translate, translate_connect_failure},
};
use tokio::sync::{broadcast, oneshot, watch};
use uuid::Uuid;

use crate::broker::BrokerState;

/// Shared collaborators every session on a broker uses.
pub(crate) struct SessionContext {
    pub dispatcher: Dispatcher<BrokerState>,
    pub factory: Arc<dyn TransportFactory>,
    pub config: Arc<SessionConfig>,
    pub lifecycle: Arc<EventHub<LifecycleEvent>>,
}

/// Outcome of a connect attempt, delivered to the caller that started it.
pub(crate) type Settled = oneshot::Receiver<Result<(), ConnectError>>;

/// An adapter ready to be opened off the controlling context.
pub(crate) struct PendingOpen {
    pub attempt: u64,
    pub adapter: Arc<dyn TransportAdapter>,
    pub request: OpenRequest,
    pub callbacks: TransportCallbacks,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// One remote-shell session and its transport.
pub(crate) struct Session {
    id: SessionId,
    target: ConnectionTarget,
    created_at: i64,
    status: watch::Sender<Status>,
    events: Arc<EventHub<SessionEvent>>,
    transport: Option<Arc<dyn TransportAdapter>>,
    /// Attempt whose callbacks are current. `None` once the transport is released.
    attempt: Option<u64>,
    attempts: u64,
    /// Caller waiting on the outstanding attempt. Dropping it reports `Cancelled`.
    reply: Option<oneshot::Sender<Result<(), ConnectError>>>,
}

impl Session {
    pub fn new(target: ConnectionTarget, config: &SessionConfig) -> Self {
        let (status, _) = watch::channel(Status::Idle);
        Self {
            id: Uuid::new_v4(),
            target,
            created_at: now(),
            status,
            events: Arc::new(EventHub::new(config.event_capacity, config.event_history)),
            transport: None,
            attempt: None,
            attempts: 0,
            reply: None,
        }
    }

    pub const fn id(&self) -> SessionId {
        self.id
    }

    pub const fn identity(&self) -> &TargetIdentity {
        &self.target.identity
    }

    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn handle(&self, dispatcher: Dispatcher<BrokerState>) -> SessionHandle {
        SessionHandle {
            id: self.id,
            identity: self.target.identity.clone(),
            created_at: self.created_at,
            status: self.status.subscribe(),
            events: Arc::clone(&self.events),
            dispatcher,
        }
    }

    fn set_status(&mut self, status: Status) {
        tracing::debug!(
            session = %self.id,
            identity = %self.target.identity,
            from = ?self.status(),
            to = ?status,
            "Session status changed"
        );
        self.status.send_replace(status);
        self.events.push(SessionEvent::StatusChanged(status));
    }

    /// Start a connect attempt.
    ///
    /// Any previous transport is released first. The returned adapter still
    /// has to be opened; its outcome comes back through `settle_connect`.
    /// The receiver resolves once the attempt connects, fails or is abandoned.
    pub fn begin_connect(
        &mut self,
        cx: &SessionContext,
        geometry: Option<TerminalGeometry>,
    ) -> Result<(PendingOpen, Settled), ConnectError> {
        match self.status() {
            Status::Connecting => {
                return Err(ConnectError::InvalidState(format!(
                    "connection attempt to {} already in progress",
                    self.target.identity
                )));
            }
            status if status.is_terminal() => {
                return Err(ConnectError::InvalidState(format!(
                    "session {} is closed ({status:?})",
                    self.id
                )));
            }
            _ => {}
        }

        self.release_transport(cx);

        self.attempts += 1;
        let attempt = self.attempts;
        self.attempt = Some(attempt);

        let adapter = cx.factory.create();
        self.transport = Some(Arc::clone(&adapter));
        self.set_status(Status::Connecting);

        let request = OpenRequest {
            endpoint: self.target.endpoint,
            credential: self.target.credential.clone(),
            terminal_kind: cx.config.terminal_kind.clone(),
            geometry: geometry.unwrap_or(cx.config.initial_geometry),
            locale: cx.config.locale.clone(),
            banner: cx.config.banner.clone(),
        };

        let (reply, settled) = oneshot::channel();
        self.reply = Some(reply);

        let open = PendingOpen {
            attempt,
            adapter,
            request,
            callbacks: marshaled_callbacks(cx.dispatcher.clone(), self.id, attempt),
        };
        Ok((open, settled))
    }

    /// Apply the outcome of `TransportAdapter::open`.
    ///
    /// Returns true if the session is now connected. The caller records the
    /// connection and then calls `announce_connected`.
    pub fn settle_connect(
        &mut self,
        cx: &SessionContext,
        attempt: u64,
        outcome: Result<(), TransportError>,
    ) -> bool {
        if self.attempt != Some(attempt) || self.status() != Status::Connecting {
            tracing::debug!(session = %self.id, attempt, "Discarding stale connect outcome");
            return false;
        }

        match outcome {
            Ok(()) => {
                self.set_status(Status::Connected);
                true
            }
            Err(fault) => {
                self.fail_connect(cx, fault);
                false
            }
        }
    }

    /// Publish `Started` and release the caller waiting on the attempt.
    pub fn announce_connected(&mut self, cx: &SessionContext) {
        cx.lifecycle.push(LifecycleEvent::Started {
            identity: self.target.identity.clone(),
        });
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    /// Classify and apply a fault reported by the transport.
    pub fn on_transport_error(&mut self, cx: &SessionContext, attempt: u64, fault: TransportError) {
        if self.attempt != Some(attempt) {
            tracing::trace!(session = %self.id, attempt, "Discarding stale transport fault");
            return;
        }
        tracing::debug!(session = %self.id, %fault, "Fault received from transport");

        match self.status() {
            Status::Connecting => self.fail_connect(cx, fault),
            Status::Connected => {
                let class = classify(&fault);
                let error = translate(fault, class, self.target.credential.method);
                if class == ErrorClass::LostConnection {
                    self.set_status(Status::ConnectionLost);
                    self.events.push(SessionEvent::ConnectionLost(error.clone()));
                    cx.lifecycle.push(LifecycleEvent::Aborted {
                        identity: self.target.identity.clone(),
                        cause: AbortCause::from_error(&error),
                    });
                } else {
                    self.fail(cx, error);
                }
            }
            status => {
                tracing::debug!(session = %self.id, ?status, "Ignoring fault, already surfaced");
            }
        }
    }

    pub fn on_transport_data(&self, attempt: u64, data: String) {
        if self.attempt != Some(attempt) {
            tracing::trace!(session = %self.id, attempt, "Discarding stale data");
            return;
        }
        tracing::trace!(session = %self.id, chars = data.len(), "Received data from transport");
        self.events.push(SessionEvent::DataReceived(data));
    }

    /// Release the transport and close the session.
    ///
    /// Returns false, doing nothing, if no transport is held.
    pub fn disconnect(&mut self, cx: &SessionContext) -> bool {
        if !self.dispose_transport() {
            return false;
        }
        self.set_status(Status::Disconnected);
        cx.lifecycle.push(LifecycleEvent::Ended {
            identity: self.target.identity.clone(),
        });
        true
    }

    pub fn connected_transport(&self) -> Result<Arc<dyn TransportAdapter>, SessionError> {
        match (&self.transport, self.status()) {
            (Some(transport), Status::Connected) => Ok(Arc::clone(transport)),
            _ => Err(SessionError::NotConnected),
        }
    }

    fn fail_connect(&mut self, cx: &SessionContext, fault: TransportError) {
        tracing::warn!(session = %self.id, %fault, "Connect failed");
        let error = translate_connect_failure(fault, self.target.credential.method);
        self.fail(cx, error);
    }

    fn fail(&mut self, cx: &SessionContext, error: ConnectError) {
        let reply = self.reply.take();
        self.dispose_transport();
        self.set_status(Status::ConnectionFailed);
        self.events.push(SessionEvent::ConnectionFailed(error.clone()));
        cx.lifecycle.push(LifecycleEvent::Aborted {
            identity: self.target.identity.clone(),
            cause: AbortCause::from_error(&error),
        });
        if let Some(reply) = reply {
            let _ = reply.send(Err(error));
        }
    }

    /// Dispose the previous transport ahead of a reconnect.
    fn release_transport(&mut self, cx: &SessionContext) {
        if self.dispose_transport() {
            cx.lifecycle.push(LifecycleEvent::Ended {
                identity: self.target.identity.clone(),
            });
        }
    }

    fn dispose_transport(&mut self) -> bool {
        self.attempt = None;
        self.reply = None;
        match self.transport.take() {
            Some(transport) => {
                tracing::debug!(session = %self.id, "Disposing transport");
                transport.dispose();
                true
            }
            None => false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose_transport();
    }
}

/// Callbacks that forward transport events onto the controlling context.
fn marshaled_callbacks(
    dispatcher: Dispatcher<BrokerState>,
    id: SessionId,
    attempt: u64,
) -> TransportCallbacks {
    let data_dispatcher = dispatcher.clone();
    TransportCallbacks::new(
        move |data| data_dispatcher.post(move |state| state.on_transport_data(id, attempt, data)),
        move |fault| dispatcher.post(move |state| state.on_transport_error(id, attempt, fault)),
    )
}

/// Caller-side reference to a session.
///
/// Cheap to clone. Two handles are equal iff they refer to the same session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    identity: TargetIdentity,
    created_at: i64,
    status: watch::Receiver<Status>,
    events: Arc<EventHub<SessionEvent>>,
    dispatcher: Dispatcher<BrokerState>,
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SessionHandle {}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    /// Creation timestamp (Unix epoch seconds).
    #[must_use]
    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Last committed status.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Receiver notified on every committed status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Register an observer for this session's events.
    ///
    /// Invoked on the broker's controlling context.
    pub fn subscribe(&self, observer: impl Observer<SessionEvent> + 'static) -> SubscriptionId {
        self.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Get a receiver for live session events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.get_receiver()
    }

    /// Received output, replaying retained history first, until the session closes.
    #[must_use]
    pub fn output_stream(&self) -> BoxStream<'static, String> {
        self.events
            .history_plus_stream()
            .take_while(|event| {
                future::ready(
                    !matches!(event, SessionEvent::StatusChanged(status) if status.is_terminal()),
                )
            })
            .filter_map(|event| async move {
                match event {
                    SessionEvent::DataReceived(data) => Some(data),
                    _ => None,
                }
            })
            .boxed()
    }

    /// Reconnect with the configured initial geometry.
    ///
    /// # Errors
    /// Returns error if the session is connecting or closed, or if the
    /// connect attempt fails.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connect_inner(None).await
    }

    /// Reconnect with the given geometry.
    ///
    /// # Errors
    /// Returns error if the session is connecting or closed, or if the
    /// connect attempt fails.
    pub async fn connect_with_geometry(
        &self,
        geometry: TerminalGeometry,
    ) -> Result<(), ConnectError> {
        self.connect_inner(Some(geometry)).await
    }

    async fn connect_inner(&self, geometry: Option<TerminalGeometry>) -> Result<(), ConnectError> {
        let id = self.id;
        let settled = self
            .dispatcher
            .call(move |state| state.reconnect(id, geometry))
            .await??;
        settled.await.unwrap_or(Err(ConnectError::Cancelled))
    }

    /// Release the transport and close the session. No-op if nothing is held.
    pub async fn disconnect(&self) {
        let id = self.id;
        let _ = self
            .dispatcher
            .call(move |state| state.disconnect_session(id))
            .await;
    }

    /// Write to the remote shell.
    ///
    /// # Errors
    /// Returns `NotConnected` unless the session is connected, or the
    /// transport's error if the write fails.
    pub async fn send(&self, payload: &str) -> Result<(), SessionError> {
        let transport = self.connected_transport().await?;
        transport.send(payload).await?;
        Ok(())
    }

    /// Resize the remote terminal.
    ///
    /// # Errors
    /// Returns `NotConnected` unless the session is connected, or the
    /// transport's error if the resize fails.
    pub async fn resize(&self, geometry: TerminalGeometry) -> Result<(), SessionError> {
        let transport = self.connected_transport().await?;
        transport.resize(geometry).await?;
        Ok(())
    }

    async fn connected_transport(&self) -> Result<Arc<dyn TransportAdapter>, SessionError> {
        let id = self.id;
        self.dispatcher
            .call(move |state| state.connected_transport(id))
            .await
            .unwrap_or(Err(SessionError::NotConnected))
    }
}
