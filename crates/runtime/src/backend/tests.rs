use std::time::Duration;

use hwlink_protocol::{ChunkCodec, Message};

use super::bridge::bridge_error;
use super::usb::{is_supported, usb_path};
use super::*;
use crate::test_support::{FakeBridge, FakeEmulator, reply_to};

async fn exchange<A: Api>(api: &A, handle: &A::Handle, message: &Message) -> Message {
	let codec = ChunkCodec::default();
	for chunk in codec.encode_message(message).unwrap() {
		api.write_chunk(handle, chunk.as_bytes()).await.unwrap();
	}
	let mut decoder = codec.decoder();
	loop {
		let chunk = api.read_chunk(handle, Some(Duration::from_secs(2))).await.unwrap();
		if let Some(reply) = decoder.push(&chunk).unwrap() {
			return reply;
		}
	}
}

#[tokio::test]
async fn test_emulator_enumerates_when_answering_pings() {
	let emulator = FakeEmulator::start().await;
	let backend = EmulatorBackend::new(emulator.addr());

	backend.probe().await.unwrap();
	let devices = backend.enumerate().await.unwrap();
	assert_eq!(devices.len(), 1);
	assert_eq!(devices[0].path.as_str(), emulator.addr().to_string());

	emulator.set_present(false);
	assert!(backend.enumerate().await.unwrap().is_empty());
	assert!(matches!(backend.probe().await, Err(IoError::NetworkUnreachable(_))));
}

#[tokio::test]
async fn test_emulator_multi_chunk_exchange() {
	let emulator = FakeEmulator::start().await;
	let backend = EmulatorBackend::new(emulator.addr());
	let handle = backend.open(&backend.path()).await.unwrap();

	let request = Message::new(55, (0..300u16).map(|i| i as u8).collect::<Vec<_>>());
	let reply = exchange(&backend, &handle, &request).await;

	assert_eq!(reply, reply_to(&request));
	assert_eq!(emulator.received(), vec![request]);
}

#[tokio::test]
async fn test_emulator_read_times_out() {
	let emulator = FakeEmulator::start().await;
	emulator.set_silent(true);
	let backend = EmulatorBackend::new(emulator.addr());
	let handle = backend.open(&backend.path()).await.unwrap();

	let err = backend.read_chunk(&handle, Some(Duration::from_millis(50))).await.unwrap_err();
	assert_eq!(err, IoError::Timeout);
}

#[tokio::test]
async fn test_emulator_rejects_foreign_path() {
	let emulator = FakeEmulator::start().await;
	let backend = EmulatorBackend::new(emulator.addr());
	assert!(matches!(backend.open(&DevicePath::from("1-1")).await, Err(IoError::Disconnected)));
}

fn bridge(fake: &FakeBridge) -> BridgeBackend {
	BridgeBackend::new(fake.url(), "https://test.local", ChunkCodec::default()).unwrap()
}

#[tokio::test]
async fn test_bridge_probe_and_enumerate() {
	let fake = FakeBridge::start(&["1", "2"]).await;
	let backend = bridge(&fake);

	backend.probe().await.unwrap();
	assert_eq!(backend.version().await.unwrap(), "2.0.33");

	let devices = backend.enumerate().await.unwrap();
	let paths: Vec<_> = devices.iter().map(|d| d.path.as_str()).collect();
	assert_eq!(paths, vec!["1", "2"]);
	assert_eq!(devices[0].vendor, 0x1209);
}

#[tokio::test]
async fn test_bridge_rechunks_messages() {
	let fake = FakeBridge::start(&["1"]).await;
	let backend = bridge(&fake);
	let handle = backend.open(&DevicePath::from("1")).await.unwrap();
	assert!(fake.session_of("1").is_some());

	let request = Message::new(0, vec![0xab; 200]);
	let reply = exchange(&backend, &handle, &request).await;
	assert_eq!(reply, reply_to(&request));

	backend.close(&handle).await.unwrap();
	assert!(fake.session_of("1").is_none());
}

#[tokio::test]
async fn test_bridge_conflicts_map_to_io_errors() {
	let fake = FakeBridge::start(&["1"]).await;
	let backend = bridge(&fake);

	let _held = backend.open(&DevicePath::from("1")).await.unwrap();
	assert!(matches!(backend.open(&DevicePath::from("1")).await, Err(IoError::DeviceBusy(_))));
	assert!(matches!(backend.open(&DevicePath::from("9")).await, Err(IoError::Disconnected)));
}

#[tokio::test]
async fn test_bridge_read_honours_timeout() {
	let fake = FakeBridge::start(&["1"]).await;
	fake.set_silent(true);
	let backend = bridge(&fake);
	let handle = backend.open(&DevicePath::from("1")).await.unwrap();

	let err = backend.read_chunk(&handle, Some(Duration::from_millis(100))).await.unwrap_err();
	assert_eq!(err, IoError::Timeout);
}

#[tokio::test]
async fn test_bridge_unreachable() {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let url = format!("http://{}", listener.local_addr().unwrap());
	drop(listener);

	let backend = BridgeBackend::new(&url, "https://test.local", ChunkCodec::default()).unwrap();
	assert!(matches!(backend.probe().await, Err(IoError::NetworkUnreachable(_))));
}

#[test]
fn test_bridge_error_bodies() {
	assert!(matches!(bridge_error(r#"{"error":"wrong previous session"}"#), IoError::DeviceBusy(_)));
	assert_eq!(bridge_error(r#"{"error":"device not found"}"#), IoError::Disconnected);
	assert_eq!(bridge_error(r#"{"error":"session not found"}"#), IoError::Disconnected);
	assert_eq!(bridge_error("teapot"), IoError::Other("teapot".into()));
}

#[test]
fn test_usb_filter_and_paths() {
	assert!(is_supported(0x1209, 0x53c1));
	assert!(is_supported(0x1209, 0x53c0));
	assert!(!is_supported(0x1209, 0x0001));
	assert!(!is_supported(0x534c, 0x53c1));
	assert_eq!(usb_path(1, 4).as_str(), "1-4");
}

#[tokio::test]
async fn test_dispatch_rejects_foreign_handles() {
	let emulator = FakeEmulator::start().await;
	let fake = FakeBridge::start(&["1"]).await;
	let emulator_backend = EmulatorBackend::new(emulator.addr());
	let handle = DeviceHandle::Emulator(emulator_backend.open(&emulator_backend.path()).await.unwrap());

	let backend = Backend::Bridge(bridge(&fake));
	assert_eq!(backend.kind(), BackendKind::Bridge);
	assert!(matches!(backend.write_chunk(&handle, b"?##").await, Err(IoError::Other(_))));
}

#[test]
fn test_usb_reads_configured_chunk_size() {
	let config = TransportConfig {
		chunk_size: 128,
		..Default::default()
	};
	match Backend::from_config(BackendKind::Usb, &config).unwrap() {
		Backend::Usb(usb) => assert_eq!(usb.chunk_size(), 128),
		_ => panic!("expected the usb backend"),
	}
	assert_eq!(UsbBackend::default().chunk_size(), hwlink_protocol::CHUNK_SIZE);
}

#[tokio::test]
async fn test_bridge_take_over_displaces_stale_session() {
	let fake = FakeBridge::start(&["1"]).await;
	let backend = bridge(&fake);
	let stale = backend.open(&DevicePath::from("1")).await.unwrap();
	let stale_session = fake.session_of("1").unwrap();

	let handle = backend.take_over(&DevicePath::from("1")).await.unwrap();
	let current = fake.session_of("1").unwrap();
	assert_ne!(current, stale_session);

	let request = Message::new(9, vec![1, 2]);
	assert_eq!(exchange(&backend, &handle, &request).await, reply_to(&request));
	// The displaced handle's release is a no-op at the bridge.
	backend.close(&stale).await.unwrap();
	assert_eq!(fake.session_of("1"), Some(current));
}
