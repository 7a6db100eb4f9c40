//! Per-target session broker.
//!
//! Keeps at most one live session per `TargetIdentity`, tracks which one is
//! active and fans lifecycle events out to subscribers. All registry state
//! lives on a single controlling context; `Broker` is a handle that posts to it.

use std::{collections::HashMap, sync::Arc};

use futures::stream::BoxStream;
use remote_shell_core::{
    ActivationSurface, ConnectError, ConnectionTarget, Controller, Dispatcher, EventHub,
    LifecycleEvent, Observer, SessionConfig, SessionError, SessionId, Status, SubscriptionId,
    TargetIdentity, TerminalGeometry, TransportAdapter, TransportError, TransportFactory,
};
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::session::{PendingOpen, Session, SessionContext, SessionHandle, Settled};

/// Surface that never presents anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedSurface;

impl ActivationSurface<SessionHandle> for DetachedSurface {
    fn show(&self, session: &SessionHandle) {
        tracing::trace!(session = %session.id(), "No surface attached, not presenting");
    }
}

/// Summary of one session owned by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub identity: TargetIdentity,
    pub status: Status,
    /// Unix epoch seconds.
    pub created_at: i64,
    pub active: bool,
}

enum ConnectStart {
    Existing(SessionHandle),
    Started {
        handle: SessionHandle,
        settled: Settled,
    },
}

/// Registry state owned by the controlling context.
pub(crate) struct BrokerState {
    cx: SessionContext,
    surface: Arc<dyn ActivationSurface<SessionHandle>>,
    sessions: HashMap<SessionId, Session>,
    /// Sessions whose connect succeeded, by target.
    registry: HashMap<TargetIdentity, SessionId>,
    /// First connects still outstanding, by target.
    pending: HashMap<TargetIdentity, SessionId>,
    active: Option<SessionId>,
}

impl BrokerState {
    fn new(cx: SessionContext, surface: Arc<dyn ActivationSurface<SessionHandle>>) -> Self {
        Self {
            cx,
            surface,
            sessions: HashMap::new(),
            registry: HashMap::new(),
            pending: HashMap::new(),
            active: None,
        }
    }

    fn handle(&self, session: &Session) -> SessionHandle {
        session.handle(self.cx.dispatcher.clone())
    }

    fn registered(&self, identity: &TargetIdentity) -> Option<&Session> {
        self.registry
            .get(identity)
            .and_then(|id| self.sessions.get(id))
    }

    fn is_connected(&self, identity: &TargetIdentity) -> bool {
        self.registered(identity).is_some()
    }

    fn try_activate(&mut self, identity: &TargetIdentity) -> bool {
        let Some(id) = self.registry.get(identity).copied() else {
            return false;
        };
        self.activate(id);
        true
    }

    fn activate(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        tracing::debug!(session = %id, identity = %session.identity(), "Activating session");
        let handle = self.handle(session);
        self.active = Some(id);
        self.surface.show(&handle);
    }

    fn active_session(&self) -> Option<SessionHandle> {
        self.active
            .and_then(|id| self.sessions.get(&id))
            .map(|session| self.handle(session))
    }

    fn begin_connect(
        &mut self,
        target: ConnectionTarget,
        geometry: Option<TerminalGeometry>,
    ) -> Result<ConnectStart, ConnectError> {
        let identity = target.identity.clone();

        if let Some(id) = self.registry.get(&identity).copied() {
            tracing::debug!(%identity, "Reusing existing session");
            self.activate(id);
            return self
                .sessions
                .get(&id)
                .map(|session| ConnectStart::Existing(self.handle(session)))
                .ok_or(ConnectError::Cancelled);
        }

        if self.pending.contains_key(&identity) {
            return Err(ConnectError::InvalidState(format!(
                "connection attempt to {identity} already in progress"
            )));
        }

        let mut session = Session::new(target, &self.cx.config);
        let (open, settled) = session.begin_connect(&self.cx, geometry)?;
        let handle = self.handle(&session);
        let id = session.id();
        tracing::info!(session = %id, %identity, "Opening session");

        self.pending.insert(identity, id);
        self.sessions.insert(id, session);
        self.spawn_open(id, open);
        Ok(ConnectStart::Started { handle, settled })
    }

    pub(crate) fn reconnect(
        &mut self,
        id: SessionId,
        geometry: Option<TerminalGeometry>,
    ) -> Result<Settled, ConnectError> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Err(ConnectError::InvalidState(format!(
                "session {id} is closed"
            )));
        };
        tracing::info!(session = %id, identity = %session.identity(), "Reconnecting session");
        let (open, settled) = session.begin_connect(&self.cx, geometry)?;
        self.spawn_open(id, open);
        Ok(settled)
    }

    /// Open the adapter on a worker task and settle back on this context.
    fn spawn_open(&self, id: SessionId, open: PendingOpen) {
        let dispatcher = self.cx.dispatcher.clone();
        let PendingOpen {
            attempt,
            adapter,
            request,
            callbacks,
        } = open;

        tokio::spawn(async move {
            let outcome = adapter.open(request, callbacks).await;
            dispatcher.post(move |state| state.settle_connect(id, attempt, outcome));
        });
    }

    fn settle_connect(
        &mut self,
        id: SessionId,
        attempt: u64,
        outcome: Result<(), TransportError>,
    ) {
        let Some(session) = self.sessions.get_mut(&id) else {
            tracing::debug!(session = %id, "Connect settled for a closed session");
            return;
        };

        if session.settle_connect(&self.cx, attempt, outcome) {
            let identity = session.identity().clone();
            if self.pending.get(&identity) == Some(&id) {
                self.pending.remove(&identity);
                self.registry.insert(identity, id);
                self.activate(id);
            }
            if let Some(session) = self.sessions.get_mut(&id) {
                session.announce_connected(&self.cx);
            }
        }
        self.prune(id);
    }

    pub(crate) fn on_transport_data(&self, id: SessionId, attempt: u64, data: String) {
        match self.sessions.get(&id) {
            Some(session) => session.on_transport_data(attempt, data),
            None => tracing::trace!(session = %id, "Data for a closed session"),
        }
    }

    pub(crate) fn on_transport_error(&mut self, id: SessionId, attempt: u64, fault: TransportError) {
        let Some(session) = self.sessions.get_mut(&id) else {
            tracing::trace!(session = %id, %fault, "Fault for a closed session");
            return;
        };
        session.on_transport_error(&self.cx, attempt, fault);
        self.prune(id);
    }

    pub(crate) fn connected_transport(
        &self,
        id: SessionId,
    ) -> Result<Arc<dyn TransportAdapter>, SessionError> {
        self.sessions
            .get(&id)
            .ok_or(SessionError::NotConnected)?
            .connected_transport()
    }

    pub(crate) fn disconnect_session(&mut self, id: SessionId) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        let released = session.disconnect(&self.cx);
        self.prune(id);
        released
    }

    fn disconnect_identity(&mut self, identity: &TargetIdentity) -> bool {
        let id = self
            .registry
            .get(identity)
            .or_else(|| self.pending.get(identity))
            .copied();
        id.is_some_and(|id| self.disconnect_session(id))
    }

    fn disconnect_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.disconnect_session(id);
        }
    }

    fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .values()
            .map(|session| SessionInfo {
                id: session.id(),
                identity: session.identity().clone(),
                status: session.status(),
                created_at: session.created_at(),
                active: self.active == Some(session.id()),
            })
            .collect();
        infos.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        infos
    }

    /// Forget a session once it reaches a terminal status.
    fn prune(&mut self, id: SessionId) {
        let terminal = self
            .sessions
            .get(&id)
            .is_none_or(|session| session.status().is_terminal());
        if !terminal {
            return;
        }
        if let Some(session) = self.sessions.remove(&id) {
            let identity = session.identity();
            if self.registry.get(identity) == Some(&id) {
                self.registry.remove(identity);
            }
            if self.pending.get(identity) == Some(&id) {
                self.pending.remove(identity);
            }
            tracing::debug!(session = %id, %identity, status = ?session.status(), "Session removed");
        }
        if self.active == Some(id) {
            self.active = None;
        }
    }
}

/// Broker for remote-shell sessions, at most one per target.
///
/// Dropping the broker stops its controlling context and disposes every
/// transport it still holds. Session handles outliving it report
/// `NotConnected` and fail to reconnect.
pub struct Broker {
    dispatcher: Dispatcher<BrokerState>,
    lifecycle: Arc<EventHub<LifecycleEvent>>,
    controller: Option<JoinHandle<BrokerState>>,
}

impl Broker {
    /// Create a broker with no presentation surface.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(factory: Arc<dyn TransportFactory>, config: SessionConfig) -> Self {
        Self::with_surface(factory, Arc::new(DetachedSurface), config)
    }

    /// Create a broker that presents activated sessions on `surface`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_surface(
        factory: Arc<dyn TransportFactory>,
        surface: Arc<dyn ActivationSurface<SessionHandle>>,
        config: SessionConfig,
    ) -> Self {
        let config = Arc::new(config);
        let lifecycle = Arc::new(EventHub::new(config.event_capacity, config.event_history));
        let hub = Arc::clone(&lifecycle);
        let (dispatcher, controller) = Controller::new(move |dispatcher| {
            BrokerState::new(
                SessionContext {
                    dispatcher,
                    factory,
                    config,
                    lifecycle: hub,
                },
                surface,
            )
        });

        Self {
            dispatcher,
            lifecycle,
            controller: Some(controller.spawn()),
        }
    }

    /// Whether a live, registered session exists for `identity`.
    pub async fn is_connected(&self, identity: &TargetIdentity) -> bool {
        let identity = identity.clone();
        self.dispatcher
            .call(move |state| state.is_connected(&identity))
            .await
            .unwrap_or(false)
    }

    /// Bring the session for `identity` to the foreground, if one exists.
    ///
    /// Never creates a session.
    pub async fn try_activate(&self, identity: &TargetIdentity) -> bool {
        let identity = identity.clone();
        self.dispatcher
            .call(move |state| state.try_activate(&identity))
            .await
            .unwrap_or(false)
    }

    /// The session most recently activated, if it is still alive.
    pub async fn active_session(&self) -> Option<SessionHandle> {
        self.dispatcher
            .call(|state| state.active_session())
            .await
            .ok()
            .flatten()
    }

    /// Connect to a target, or activate and return its existing session.
    ///
    /// # Errors
    /// Returns error if a connect to the same target is already in progress
    /// or if the connect attempt fails.
    pub async fn connect(&self, target: ConnectionTarget) -> Result<SessionHandle, ConnectError> {
        self.connect_inner(target, None).await
    }

    /// Like `connect`, with an explicit initial terminal geometry.
    ///
    /// # Errors
    /// See `connect`.
    pub async fn connect_with_geometry(
        &self,
        target: ConnectionTarget,
        geometry: TerminalGeometry,
    ) -> Result<SessionHandle, ConnectError> {
        self.connect_inner(target, Some(geometry)).await
    }

    async fn connect_inner(
        &self,
        target: ConnectionTarget,
        geometry: Option<TerminalGeometry>,
    ) -> Result<SessionHandle, ConnectError> {
        let start = self
            .dispatcher
            .call(move |state| state.begin_connect(target, geometry))
            .await??;

        match start {
            ConnectStart::Existing(handle) => Ok(handle),
            ConnectStart::Started { handle, settled } => {
                settled.await.unwrap_or(Err(ConnectError::Cancelled))?;
                Ok(handle)
            }
        }
    }

    /// Disconnect the session for `identity`, including one still connecting.
    ///
    /// Returns false if there was nothing to disconnect.
    pub async fn disconnect(&self, identity: &TargetIdentity) -> bool {
        let identity = identity.clone();
        self.dispatcher
            .call(move |state| state.disconnect_identity(&identity))
            .await
            .unwrap_or(false)
    }

    /// Sessions owned by the broker, newest first.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.dispatcher
            .call(|state| state.sessions())
            .await
            .unwrap_or_default()
    }

    /// Register a lifecycle observer.
    ///
    /// Invoked on the controlling context, in publication order.
    pub fn subscribe(&self, observer: impl Observer<LifecycleEvent> + 'static) -> SubscriptionId {
        self.lifecycle.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lifecycle.unsubscribe(id)
    }

    /// Get a receiver for live lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.get_receiver()
    }

    /// Lifecycle events, replaying retained history first.
    #[must_use]
    pub fn event_stream(&self) -> BoxStream<'static, LifecycleEvent> {
        self.lifecycle.history_plus_stream()
    }

    /// Disconnect every session and stop the controlling context.
    pub async fn shutdown(mut self) {
        let _ = self.dispatcher.call(BrokerState::disconnect_all).await;
        self.dispatcher.shutdown();
        if let Some(controller) = self.controller.take() {
            if let Err(e) = controller.await {
                tracing::warn!("Broker controller task failed: {e}");
            }
        }
        tracing::info!("Broker shut down");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}
