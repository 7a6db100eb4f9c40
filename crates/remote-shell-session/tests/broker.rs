use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use remote_shell_core::{
    ActivationSurface, AuthorizationMethod, ConnectError, ConnectionTarget, CredentialMaterial,
    ErrorClass, FaultCode, LifecycleEvent, SessionConfig, SessionError, SessionEvent, Status,
    TargetIdentity, TerminalGeometry, TransportError,
};
use tokio_test::{assert_err, assert_ok};
use remote_shell_session::{Broker, SessionHandle};
use remote_shell_transport::{LoopbackFactory, LoopbackRemote, OpenPlan};

fn identity(instance: &str) -> TargetIdentity {
    TargetIdentity::new("my-project", "us-central1-a", instance)
}

fn target_with(instance: &str, method: AuthorizationMethod) -> ConnectionTarget {
    ConnectionTarget::new(
        identity(instance),
        SocketAddr::from(([10, 128, 0, 2], 22)),
        CredentialMaterial::new("alice", "-----BEGIN KEY-----", method),
    )
}

fn target(instance: &str) -> ConnectionTarget {
    target_with(instance, AuthorizationMethod::InstanceMetadata)
}

fn fault(code: FaultCode) -> TransportError {
    TransportError::new(code, format!("{code:?}"))
}

fn broker(factory: &LoopbackFactory) -> Broker {
    Broker::new(Arc::new(factory.clone()), SessionConfig::default())
}

fn record(broker: &Broker) -> Arc<Mutex<Vec<LifecycleEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    broker.subscribe(move |event: &LifecycleEvent| sink.lock().unwrap().push(event.clone()));
    events
}

fn kinds(events: &Mutex<Vec<LifecycleEvent>>) -> Vec<&'static str> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|event| match event {
            LifecycleEvent::Started { .. } => "started",
            LifecycleEvent::Ended { .. } => "ended",
            LifecycleEvent::Aborted { .. } => "aborted",
        })
        .collect()
}

/// Wait for posted callbacks to be applied.
async fn flush(broker: &Broker) {
    broker.sessions().await;
}

async fn held_remote(factory: &LoopbackFactory, count: usize) -> LoopbackRemote {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if factory.created() == count {
                if let Some(remote) = factory.last_remote() {
                    if remote.is_holding() {
                        return remote;
                    }
                }
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("open was never held")
}

#[derive(Default)]
struct RecordingSurface(Mutex<Vec<TargetIdentity>>);

impl ActivationSurface<SessionHandle> for RecordingSurface {
    fn show(&self, session: &SessionHandle) {
        self.0.lock().unwrap().push(session.identity().clone());
    }
}

#[tokio::test]
async fn test_unknown_identity_is_neither_connected_nor_activatable() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);

    assert!(!broker.is_connected(&identity("vm-1")).await);
    assert!(!broker.try_activate(&identity("vm-1")).await);
    assert_eq!(broker.active_session().await, None);
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_connect_registers_and_publishes_started() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let events = record(&broker);

    let session = broker.connect(target("vm-1")).await.unwrap();

    assert_eq!(session.status(), Status::Connected);
    assert!(broker.is_connected(&identity("vm-1")).await);
    assert!(!broker.is_connected(&identity("vm-2")).await);
    assert_eq!(broker.active_session().await, Some(session.clone()));
    assert_eq!(kinds(&events), vec!["started"]);
    assert_eq!(events.lock().unwrap()[0].identity(), &identity("vm-1"));
}

#[tokio::test]
async fn test_open_request_uses_config_and_geometry() {
    let factory = LoopbackFactory::new();
    let config = SessionConfig {
        terminal_kind: "xterm-256color".to_string(),
        locale: Some("en-US".to_string()),
        ..SessionConfig::default()
    };
    let broker = Broker::new(Arc::new(factory.clone()), config);

    broker
        .connect_with_geometry(target("vm-1"), TerminalGeometry::new(120, 40))
        .await
        .unwrap();

    let request = factory.last_remote().unwrap().request().unwrap();
    assert_eq!(request.terminal_kind, "xterm-256color");
    assert_eq!(request.locale.as_deref(), Some("en-US"));
    assert_eq!(request.geometry, TerminalGeometry::new(120, 40));
    assert_eq!(request.credential.username, "alice");
    assert!(request.banner.unwrap().starts_with("SSH-2.0-"));
}

#[tokio::test]
async fn test_connect_to_existing_target_reuses_session() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let events = record(&broker);

    let first = broker.connect(target("vm-1")).await.unwrap();
    let second = broker.connect(target("vm-1")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(factory.created(), 1);
    assert_eq!(kinds(&events), vec!["started"]);
    assert_eq!(broker.sessions().await.len(), 1);
}

#[tokio::test]
async fn test_switch_between_two_targets() {
    let factory = LoopbackFactory::new();
    let surface = Arc::new(RecordingSurface::default());
    let broker = Broker::with_surface(
        Arc::new(factory.clone()),
        Arc::clone(&surface) as Arc<dyn ActivationSurface<SessionHandle>>,
        SessionConfig::default(),
    );

    let a = broker.connect(target("vm-a")).await.unwrap();
    let b = broker.connect(target("vm-b")).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(broker.active_session().await, Some(b.clone()));

    assert!(broker.try_activate(&identity("vm-a")).await);
    assert_eq!(broker.active_session().await, Some(a));
    assert!(broker.is_connected(&identity("vm-b")).await);
    assert_eq!(b.status(), Status::Connected);
    assert!(!broker.try_activate(&identity("vm-c")).await);
    assert_eq!(factory.created(), 2);

    assert_eq!(
        *surface.0.lock().unwrap(),
        vec![identity("vm-a"), identity("vm-b"), identity("vm-a")]
    );

    let infos = broker.sessions().await;
    assert_eq!(infos.len(), 2);
    assert_eq!(infos.iter().filter(|info| info.active).count(), 1);
    assert!(infos.iter().all(|info| info.status == Status::Connected));
}

#[tokio::test]
async fn test_authorization_failure_aborts_with_remediation() {
    let factory = LoopbackFactory::new();
    factory.plan(OpenPlan::Reject(fault(FaultCode::AuthenticationFailed)));
    let broker = broker(&factory);
    let events = record(&broker);

    let err = broker
        .connect(target_with("vm-1", AuthorizationMethod::OsLogin))
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectError::AuthorizationDenied { .. }));
    let remediation = err.remediation().unwrap();
    assert!(!remediation.steps.is_empty());
    assert!(!broker.is_connected(&identity("vm-1")).await);
    assert!(broker.sessions().await.is_empty());
    assert_eq!(factory.last_remote().unwrap().disposals(), 1);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].abort_class(), Some(ErrorClass::AuthorizationDenied));
}

#[tokio::test]
async fn test_lost_connection_fault_while_connecting_is_a_transport_fault() {
    let factory = LoopbackFactory::new();
    factory.plan(OpenPlan::Reject(fault(FaultCode::SocketTimeout)));
    let broker = broker(&factory);
    let events = record(&broker);

    let err = broker.connect(target("vm-1")).await.unwrap_err();

    assert!(matches!(err, ConnectError::TransportFault(_)));
    assert_eq!(
        events.lock().unwrap()[0].abort_class(),
        Some(ErrorClass::TransportFault)
    );
}

#[tokio::test]
async fn test_fault_reported_while_connecting_fails_the_connect() {
    let factory = LoopbackFactory::new();
    factory.plan(OpenPlan::Hold);
    let broker = Arc::new(broker(&factory));

    let pending = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.connect(target("vm-1")).await }
    });
    let remote = held_remote(&factory, 1).await;
    assert!(remote.emit_error(fault(FaultCode::KexFailure)));

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.transport_error().unwrap().code, FaultCode::KexFailure);
    assert!(remote.is_disposed());
    assert!(!remote.release());
    assert!(!broker.is_connected(&identity("vm-1")).await);
}

#[tokio::test]
async fn test_authorization_fault_fails_connect_still_held() {
    let factory = LoopbackFactory::new();
    factory.plan(OpenPlan::Hold);
    let broker = Arc::new(broker(&factory));
    let events = record(&broker);

    let pending = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.connect(target("vm-1")).await }
    });
    let remote = held_remote(&factory, 1).await;
    assert!(remote.emit_error(fault(FaultCode::AuthenticationFailed)));

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("connect never settled")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ConnectError::AuthorizationDenied { .. }));
    assert!(remote.is_disposed());
    assert!(!broker.is_connected(&identity("vm-1")).await);
    assert!(broker.sessions().await.is_empty());
    assert_eq!(kinds(&events), vec!["aborted"]);
    assert_eq!(
        events.lock().unwrap()[0].abort_class(),
        Some(ErrorClass::AuthorizationDenied)
    );
}

#[tokio::test]
async fn test_concurrent_connect_to_same_target_is_rejected() {
    let factory = LoopbackFactory::new();
    factory.plan(OpenPlan::Hold);
    let broker = Arc::new(broker(&factory));

    let pending = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.connect(target("vm-1")).await }
    });
    let remote = held_remote(&factory, 1).await;

    let err = broker.connect(target("vm-1")).await.unwrap_err();
    assert!(matches!(err, ConnectError::InvalidState(_)));
    assert_eq!(factory.created(), 1);

    assert!(remote.release());
    let session = pending.await.unwrap().unwrap();
    assert_eq!(session.status(), Status::Connected);
}

#[tokio::test]
async fn test_disconnect_while_connecting_cancels() {
    let factory = LoopbackFactory::new();
    factory.plan(OpenPlan::Hold);
    let broker = Arc::new(broker(&factory));
    let events = record(&broker);

    let pending = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.connect(target("vm-1")).await }
    });
    let remote = held_remote(&factory, 1).await;

    assert!(broker.disconnect(&identity("vm-1")).await);
    let err = pending.await.unwrap().unwrap_err();

    assert!(matches!(err, ConnectError::Cancelled));
    assert!(remote.is_disposed());
    assert!(!broker.is_connected(&identity("vm-1")).await);
    assert_eq!(kinds(&events), vec!["ended"]);
}

#[tokio::test]
async fn test_lost_connection_then_reconnect() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let events = record(&broker);

    let session = broker.connect(target("vm-1")).await.unwrap();
    let first = factory.last_remote().unwrap();
    assert!(first.emit_error(fault(FaultCode::SocketRecv)));
    assert!(first.emit_error(fault(FaultCode::SocketSend)));
    flush(&broker).await;

    assert_eq!(session.status(), Status::ConnectionLost);
    assert_eq!(kinds(&events), vec!["started", "aborted"]);
    assert!(session.status().shows_reconnect_panel());
    assert!(broker.is_connected(&identity("vm-1")).await);
    assert_eq!(
        events.lock().unwrap()[1].abort_class(),
        Some(ErrorClass::LostConnection)
    );
    assert_eq!(
        session.send("ls\n").await,
        Err(SessionError::NotConnected)
    );

    session.connect().await.unwrap();

    assert_eq!(session.status(), Status::Connected);
    assert_eq!(factory.created(), 2);
    assert_eq!(first.disposals(), 1);
    assert_eq!(kinds(&events), vec!["started", "aborted", "ended", "started"]);
    assert_eq!(broker.connect(target("vm-1")).await.unwrap(), session);
}

#[tokio::test]
async fn test_authorization_failure_on_reconnect() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let events = record(&broker);

    let session = broker.connect(target("vm-1")).await.unwrap();
    assert!(factory.last_remote().unwrap().emit_error(fault(FaultCode::SocketTimeout)));
    flush(&broker).await;

    factory.plan(OpenPlan::Hold);
    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });
    let remote = held_remote(&factory, 2).await;
    assert!(remote.emit_error(fault(FaultCode::PublickeyUnverified)));

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectError::AuthorizationDenied { .. }));
    assert!(!remote.release());
    assert_eq!(session.status(), Status::ConnectionFailed);
    assert!(!broker.is_connected(&identity("vm-1")).await);

    let classes: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(LifecycleEvent::abort_class)
        .collect();
    assert_eq!(
        classes,
        vec![ErrorClass::LostConnection, ErrorClass::AuthorizationDenied]
    );
}

#[tokio::test]
async fn test_second_connect_during_reconnect_is_rejected() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);

    let session = broker.connect(target("vm-1")).await.unwrap();
    assert!(factory.last_remote().unwrap().emit_error(fault(FaultCode::SocketRecv)));
    flush(&broker).await;

    factory.plan(OpenPlan::Hold);
    let pending = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });
    let remote = held_remote(&factory, 2).await;

    let err = assert_err!(session.connect().await);
    assert!(matches!(err, ConnectError::InvalidState(_)));
    assert_eq!(factory.created(), 2);
    assert_eq!(session.status(), Status::Connecting);

    assert!(remote.release());
    assert_ok!(pending.await.unwrap());
    assert_eq!(session.status(), Status::Connected);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_disconnect_from_connection_lost_observer() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let events = record(&broker);

    let session = broker.connect(target("vm-1")).await.unwrap();
    let handle = session.clone();
    session.subscribe(move |event: &SessionEvent| {
        if matches!(event, SessionEvent::ConnectionLost(_)) {
            let handle = handle.clone();
            tokio::spawn(async move { handle.disconnect().await });
        }
    });

    let remote = factory.last_remote().unwrap();
    assert!(remote.emit_error(fault(FaultCode::SocketRecv)));
    let mut status = session.watch_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|status| *status == Status::Disconnected),
    )
    .await
    .expect("session never disconnected")
    .unwrap();
    flush(&broker).await;

    assert_eq!(session.status(), Status::Disconnected);
    assert_eq!(remote.disposals(), 1);
    assert_eq!(kinds(&events), vec!["started", "aborted", "ended"]);
    assert_eq!(
        events.lock().unwrap()[1].abort_class(),
        Some(ErrorClass::LostConnection)
    );
    assert!(!broker.is_connected(&identity("vm-1")).await);
}

#[tokio::test]
async fn test_fatal_fault_while_connected_closes_session() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let events = record(&broker);

    let session = broker.connect(target("vm-1")).await.unwrap();
    let mut status = session.watch_status();
    let remote = factory.last_remote().unwrap();
    assert!(remote.emit_error(fault(FaultCode::ChannelFailure)));
    flush(&broker).await;

    assert_eq!(session.status(), Status::ConnectionFailed);
    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), Status::ConnectionFailed);
    assert_eq!(remote.disposals(), 1);
    assert!(!broker.is_connected(&identity("vm-1")).await);
    assert_eq!(broker.active_session().await, None);
    assert_eq!(
        events.lock().unwrap()[1].abort_class(),
        Some(ErrorClass::TransportFault)
    );

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::InvalidState(_)));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let events = record(&broker);

    let session = broker.connect(target("vm-1")).await.unwrap();
    session.disconnect().await;
    session.disconnect().await;

    assert_eq!(session.status(), Status::Disconnected);
    assert_eq!(factory.last_remote().unwrap().disposals(), 1);
    assert_eq!(kinds(&events), vec!["started", "ended"]);
    assert!(!broker.disconnect(&identity("vm-1")).await);
    assert!(!broker.is_connected(&identity("vm-1")).await);

    // A fresh connect creates a new session.
    let next = broker.connect(target("vm-1")).await.unwrap();
    assert_ne!(next, session);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_send_and_resize() {
    let factory = LoopbackFactory::echoing();
    let broker = broker(&factory);

    let session = broker.connect(target("vm-1")).await.unwrap();
    let remote = factory.last_remote().unwrap();

    assert_ok!(session.send("uname -a\n").await);
    assert_ok!(session.resize(TerminalGeometry::new(132, 43)).await);
    assert_eq!(remote.sent(), vec!["uname -a\n"]);
    assert_eq!(remote.geometry(), Some(TerminalGeometry::new(132, 43)));

    session.disconnect().await;
    assert_eq!(session.send("x").await, Err(SessionError::NotConnected));
    assert_eq!(
        session.resize(TerminalGeometry::default()).await,
        Err(SessionError::NotConnected)
    );
}

#[tokio::test]
async fn test_output_stream_replays_and_ends_on_close() {
    let factory = LoopbackFactory::echoing();
    let broker = broker(&factory);

    let session = broker.connect(target("vm-1")).await.unwrap();
    let remote = factory.last_remote().unwrap();
    assert!(remote.emit_data("Welcome\r\n"));
    session.send("whoami\n").await.unwrap();
    flush(&broker).await;
    session.disconnect().await;

    let output: Vec<String> = session.output_stream().collect().await;
    assert_eq!(output, vec!["Welcome\r\n", "whoami\n"]);
}

#[tokio::test]
async fn test_unsubscribed_observer_sees_nothing() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let seen = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&seen);
    let id = broker.subscribe(move |_: &LifecycleEvent| *sink.lock().unwrap() += 1);

    assert!(broker.unsubscribe(id));
    broker.connect(target("vm-1")).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_lifecycle_receiver_and_stream() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let mut rx = broker.events();

    let session = broker.connect(target("vm-1")).await.unwrap();
    session.disconnect().await;

    assert!(rx.recv().await.unwrap().is_started());
    assert!(rx.recv().await.unwrap().is_ended());

    let replayed: Vec<LifecycleEvent> = broker.event_stream().take(2).collect().await;
    assert!(replayed[0].is_started());
    assert!(replayed[1].is_ended());
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let factory = LoopbackFactory::new();
    let broker = broker(&factory);
    let events = record(&broker);

    let a = broker.connect(target("vm-a")).await.unwrap();
    broker.connect(target("vm-b")).await.unwrap();
    broker.shutdown().await;

    assert_eq!(a.status(), Status::Disconnected);
    assert!(factory.remotes().iter().all(LoopbackRemote::is_disposed));
    assert_eq!(kinds(&events), vec!["started", "started", "ended", "ended"]);
    assert_eq!(a.send("x").await, Err(SessionError::NotConnected));
    assert!(matches!(
        a.connect().await,
        Err(ConnectError::InvalidState(_))
    ));
}
