use std::time::Duration;

use hwlink_protocol::InvalidationReason;
use tokio_util::sync::CancellationToken;

use super::*;

async fn seeded(client: &SessionsClient, paths: &[&str]) {
	let descriptors = paths.iter().map(|p| DeviceDescriptor::new(*p)).collect();
	client.enumerate(BackendKind::Usb, descriptors).await.unwrap();
}

async fn next_event(subscription: &mut SessionsSubscription) -> SessionsEvent {
	tokio::time::timeout(Duration::from_secs(2), subscription.recv())
		.await
		.expect("event not delivered")
		.expect("event stream closed")
}

async fn next_invalidation(subscription: &mut SessionsSubscription) -> (DevicePath, SessionId, InvalidationReason) {
	loop {
		if let SessionsEvent::Invalidated { path, session, reason } = next_event(subscription).await {
			return (path, session, reason);
		}
	}
}

#[tokio::test]
async fn test_local_acquire_release_cycle() {
	let handle = SessionsBackground::spawn();
	let first = SessionsClient::Local(LocalSessions::new(handle.clone(), "first"));
	let second = SessionsClient::Local(LocalSessions::new(handle, "second"));
	seeded(&first, &["usb:1"]).await;
	let path = DevicePath::from("usb:1");

	let s1 = first.acquire(&path, None).await.unwrap().session;
	let err = second.acquire(&path, None).await.unwrap_err();
	assert!(matches!(err, Error::DeviceUsedElsewhere { .. }));

	let info = second.sessions_info().await.unwrap();
	assert_eq!(info[&path].owner.as_str(), "first");

	assert_eq!(first.release(&s1).await.unwrap(), path);
	let s2 = second.acquire(&path, None).await.unwrap().session;
	assert_ne!(s1, s2);
	assert_eq!(second.path_by_session(&s2).await.unwrap(), Some(path));
}

#[tokio::test]
async fn test_concurrent_acquires_are_serialized() {
	let handle = SessionsBackground::spawn();
	seeded(&SessionsClient::Local(LocalSessions::new(handle.clone(), "seed")), &["p"]).await;

	let tasks: Vec<_> = (0..32)
		.map(|i| {
			let client = SessionsClient::Local(LocalSessions::new(handle.clone(), format!("caller-{i}")));
			tokio::spawn(async move { client.acquire(&DevicePath::from("p"), None).await })
		})
		.collect();

	let mut granted = 0;
	for task in tasks {
		match task.await.unwrap() {
			Ok(_) => granted += 1,
			Err(err) => assert!(matches!(err, Error::DeviceUsedElsewhere { .. })),
		}
	}
	assert_eq!(granted, 1);
}

#[tokio::test]
async fn test_events_follow_ownership_changes() {
	let client = SessionsClient::local("tab");
	let mut events = client.subscribe().await.unwrap();
	seeded(&client, &["p"]).await;
	let path = DevicePath::from("p");

	let old = client.acquire(&path, None).await.unwrap().session;
	let new = client.acquire(&path, Some(&old)).await.unwrap().session;
	assert_eq!(next_invalidation(&mut events).await, (path.clone(), old, InvalidationReason::Handoff));

	client.enumerate(BackendKind::Usb, Vec::new()).await.unwrap();
	assert_eq!(next_invalidation(&mut events).await, (path, new, InvalidationReason::Disconnected));
}

#[tokio::test]
async fn test_enumerate_reports_lost_sessions() {
	let client = SessionsClient::local("tab");
	seeded(&client, &["a", "b"]).await;
	let session = client.acquire(&DevicePath::from("a"), None).await.unwrap().session;

	let (descriptors, lost) = client.enumerate(BackendKind::Usb, vec![DeviceDescriptor::new("b")]).await.unwrap();
	assert_eq!(descriptors.len(), 1);
	assert_eq!(
		lost,
		vec![LostSession {
			path: "a".into(),
			session: session.clone()
		}]
	);

	let err = client.release(&session).await.unwrap_err();
	assert!(matches!(err, Error::SessionNotFound { session: s } if s == session));
}

#[tokio::test]
async fn test_enumerations_from_other_backends_keep_sessions() {
	let handle = SessionsBackground::spawn();
	let emulator = SessionsClient::Local(LocalSessions::new(handle.clone(), "emulator-caller"));
	let bridge = SessionsClient::Local(LocalSessions::new(handle, "bridge-caller"));
	let path = DevicePath::from("127.0.0.1:21324");

	emulator.enumerate(BackendKind::Emulator, vec![DeviceDescriptor::new(path.clone())]).await.unwrap();
	let grant = emulator.acquire(&path, None).await.unwrap();
	assert!(grant.replaced.is_none());

	let (descriptors, lost) = bridge.enumerate(BackendKind::Bridge, vec![DeviceDescriptor::new("1")]).await.unwrap();
	assert!(lost.is_empty());
	assert_eq!(descriptors, vec![DeviceDescriptor::new("1")]);
	assert_eq!(emulator.path_by_session(&grant.session).await.unwrap(), Some(path.clone()));

	let handoff = bridge.acquire(&path, Some(&grant.session)).await.unwrap();
	assert_eq!(handoff.replaced, Some(grant.session));
}

#[tokio::test]
async fn test_shutdown_stops_background() {
	let handle = SessionsBackground::spawn();
	let client = SessionsClient::Local(LocalSessions::new(handle.clone(), "tab"));
	assert_eq!(client.handshake().await.unwrap(), env!("CARGO_PKG_VERSION"));

	client.shutdown().await.unwrap();
	tokio::time::timeout(Duration::from_secs(1), handle.stopped()).await.unwrap();
	assert!(matches!(client.sessions_info().await, Err(Error::ChannelClosed)));
}

async fn serve(endpoint: Endpoint) -> (Endpoint, SessionsHandle, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
	let handle = SessionsBackground::spawn();
	let server = SessionsServer::bind(&endpoint, handle.clone()).await.unwrap();
	let bound = server.local_endpoint();
	let shutdown = CancellationToken::new();
	let task = tokio::spawn(server.run(shutdown.clone()));
	(bound, handle, shutdown, task)
}

#[cfg(unix)]
#[tokio::test]
async fn test_ipc_clients_share_one_registry() {
	let dir = tempfile::tempdir().unwrap();
	let (endpoint, _handle, shutdown, task) = serve(Endpoint::Unix(dir.path().join("sessions.sock"))).await;
	assert!(is_running(&endpoint).await);

	let first = SessionsClient::ipc(endpoint.clone(), "process-1");
	let second = SessionsClient::ipc(endpoint.clone(), "process-2");
	seeded(&first, &["usb:1"]).await;
	let path = DevicePath::from("usb:1");

	let s1 = first.acquire(&path, None).await.unwrap().session;
	let err = second.acquire(&path, None).await.unwrap_err();
	assert!(matches!(err, Error::DeviceUsedElsewhere { path: p } if p == path));

	let info = second.sessions_info().await.unwrap();
	assert_eq!(info[&path].owner.as_str(), "process-1");

	first.release(&s1).await.unwrap();
	let err = first.release(&s1).await.unwrap_err();
	assert!(matches!(err, Error::SessionNotFound { .. }));
	second.acquire(&path, None).await.unwrap();

	shutdown.cancel();
	task.await.unwrap().unwrap();
	assert!(!is_running(&endpoint).await);
}

#[tokio::test]
async fn test_ipc_subscription_streams_events() {
	let (endpoint, _handle, shutdown, task) = serve(Endpoint::Tcp("127.0.0.1:0".parse().unwrap())).await;
	let client = SessionsClient::ipc(endpoint.clone(), "watcher");
	let mut events = client.subscribe().await.unwrap();

	seeded(&client, &["p"]).await;
	let session = client.acquire(&DevicePath::from("p"), None).await.unwrap().session;
	client.release(&session).await.unwrap();

	assert_eq!(next_invalidation(&mut events).await, (DevicePath::from("p"), session, InvalidationReason::Released));

	shutdown.cancel();
	task.await.unwrap().unwrap();
	assert!(tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ipc_shutdown_request_stops_server() {
	let (endpoint, handle, _shutdown, task) = serve(Endpoint::Tcp("127.0.0.1:0".parse().unwrap())).await;
	SessionsClient::ipc(endpoint.clone(), "cli").shutdown().await.unwrap();

	tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
	assert!(handle.is_stopped());
}

#[tokio::test]
async fn test_ipc_unreachable_daemon() {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);

	let client = SessionsClient::ipc(Endpoint::Tcp(addr), "cli");
	assert!(matches!(client.handshake().await, Err(Error::BackendUnreachable(_))));
}
