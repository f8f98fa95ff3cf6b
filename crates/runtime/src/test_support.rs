//! In-process fake devices for tests.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use hwlink_protocol::{ChunkCodec, Decoder, DeviceDescriptor, Message};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::backend::emulator::{PING, PONG};

/// Reply the fakes send for a request: same payload, type + 1.
pub(crate) fn reply_to(request: &Message) -> Message {
	Message::new(request.message_type.wrapping_add(1), request.payload.clone())
}

#[derive(Default)]
struct EmulatorState {
	absent: AtomicBool,
	silent: AtomicBool,
	headless: AtomicBool,
	delay: Mutex<Option<Duration>>,
	received: Mutex<Vec<Message>>,
}

/// UDP device emulator answering every message with [`reply_to`].
pub(crate) struct FakeEmulator {
	addr: SocketAddr,
	state: Arc<EmulatorState>,
	task: JoinHandle<()>,
}

impl FakeEmulator {
	pub(crate) async fn start() -> Self {
		let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
		let addr = socket.local_addr().unwrap();
		let state = Arc::new(EmulatorState::default());
		let task = tokio::spawn(serve_emulator(socket, Arc::clone(&state)));
		Self { addr, state, task }
	}

	pub(crate) fn addr(&self) -> SocketAddr {
		self.addr
	}

	/// Stops answering pings, so enumeration no longer sees the device.
	pub(crate) fn set_present(&self, present: bool) {
		self.state.absent.store(!present, Ordering::SeqCst);
	}

	/// Swallows messages without replying.
	pub(crate) fn set_silent(&self, silent: bool) {
		self.state.silent.store(silent, Ordering::SeqCst);
	}

	/// Replies with a bare continuation chunk, never a head chunk.
	pub(crate) fn set_headless(&self, headless: bool) {
		self.state.headless.store(headless, Ordering::SeqCst);
	}

	pub(crate) fn set_delay(&self, delay: Option<Duration>) {
		*self.state.delay.lock() = delay;
	}

	pub(crate) fn received(&self) -> Vec<Message> {
		self.state.received.lock().clone()
	}
}

impl Drop for FakeEmulator {
	fn drop(&mut self) {
		self.task.abort();
	}
}

async fn serve_emulator(socket: Arc<UdpSocket>, state: Arc<EmulatorState>) {
	let codec = ChunkCodec::default();
	let mut decoders: HashMap<SocketAddr, Decoder> = HashMap::new();
	let mut buf = [0u8; 4096];

	loop {
		let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
			continue;
		};
		if state.absent.load(Ordering::SeqCst) {
			continue;
		}
		let datagram = &buf[..len];
		if datagram == PING {
			let _ = socket.send_to(PONG, peer).await;
			continue;
		}

		let decoder = decoders.entry(peer).or_insert_with(|| codec.decoder());
		let Ok(Some(message)) = decoder.push(datagram) else {
			continue;
		};
		state.received.lock().push(message.clone());
		if state.silent.load(Ordering::SeqCst) {
			continue;
		}

		let reply = reply_to(&message);
		let chunks: Vec<Vec<u8>> = if state.headless.load(Ordering::SeqCst) {
			vec![[b"?".as_slice(), reply.payload.as_slice()].concat()]
		} else {
			let Ok(chunks) = codec.encode_message(&reply) else {
				continue;
			};
			chunks.into_iter().map(|c| c.into_vec()).collect()
		};
		let delay = *state.delay.lock();
		let socket = Arc::clone(&socket);
		tokio::spawn(async move {
			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}
			for chunk in chunks {
				let _ = socket.send_to(&chunk, peer).await;
			}
		});
	}
}

#[derive(Default)]
struct BridgeState {
	devices: Vec<DeviceDescriptor>,
	sessions: HashMap<String, String>,
	replies: HashMap<String, VecDeque<String>>,
	last_session: u64,
	silent: bool,
}

type SharedBridge = Arc<Mutex<BridgeState>>;

/// HTTP bridge daemon with the trezord routes, answering with [`reply_to`].
pub(crate) struct FakeBridge {
	url: String,
	state: SharedBridge,
	task: JoinHandle<()>,
}

impl FakeBridge {
	pub(crate) async fn start(paths: &[&str]) -> Self {
		let state: SharedBridge = Arc::default();
		state.lock().devices = paths.iter().map(|p| DeviceDescriptor::new(*p).with_ids(0x1209, 0x53c1)).collect();

		let app = Router::new()
			.route("/", post(|| async { axum::Json(json!({"version": "2.0.33"})) }))
			.route("/enumerate", post(enumerate))
			.route("/acquire/{path}/{previous}", post(acquire))
			.route("/release/{session}", post(release))
			.route("/post/{session}", post(post_message))
			.route("/read/{session}", post(read_message))
			.with_state(Arc::clone(&state));

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("http://{}", listener.local_addr().unwrap());
		let task = tokio::spawn(async move {
			let _ = axum::serve(listener, app).await;
		});

		Self { url, state, task }
	}

	pub(crate) fn url(&self) -> &str {
		&self.url
	}

	pub(crate) fn set_devices(&self, paths: &[&str]) {
		self.state.lock().devices = paths.iter().map(|p| DeviceDescriptor::new(*p)).collect();
	}

	pub(crate) fn set_silent(&self, silent: bool) {
		self.state.lock().silent = silent;
	}

	/// Removes `path` the way an unplug does: the device and its bridge session vanish.
	pub(crate) fn unplug(&self, path: &str) {
		let mut state = self.state.lock();
		state.devices.retain(|d| d.path.as_str() != path);
		if let Some(session) = state.sessions.remove(path) {
			state.replies.remove(&session);
		}
	}

	/// Bridge-side session for `path`, as another bridge client would see it.
	pub(crate) fn session_of(&self, path: &str) -> Option<String> {
		self.state.lock().sessions.get(path).cloned()
	}
}

impl Drop for FakeBridge {
	fn drop(&mut self) {
		self.task.abort();
	}
}

fn failure(message: &str) -> Response {
	(StatusCode::BAD_REQUEST, axum::Json(json!({ "error": message }))).into_response()
}

async fn enumerate(State(state): State<SharedBridge>) -> Response {
	let state = state.lock();
	let devices: Vec<DeviceDescriptor> = state
		.devices
		.iter()
		.map(|d| {
			let mut d = d.clone();
			d.session = state.sessions.get(d.path.as_str()).map(|s| s.as_str().into());
			d
		})
		.collect();
	axum::Json(devices).into_response()
}

async fn acquire(State(state): State<SharedBridge>, Path((path, previous)): Path<(String, String)>) -> Response {
	let mut state = state.lock();
	if !state.devices.iter().any(|d| d.path.as_str() == path) {
		return failure("device not found");
	}
	if let Some(current) = state.sessions.get(&path) {
		if *current != previous {
			return failure("wrong previous session");
		}
	}
	state.last_session += 1;
	let session = state.last_session.to_string();
	state.sessions.insert(path, session.clone());
	axum::Json(json!({ "session": session })).into_response()
}

async fn release(State(state): State<SharedBridge>, Path(session): Path<String>) -> Response {
	let mut state = state.lock();
	let before = state.sessions.len();
	state.sessions.retain(|_, s| *s != session);
	if state.sessions.len() == before {
		return failure("session not found");
	}
	state.replies.remove(&session);
	axum::Json(json!({})).into_response()
}

async fn post_message(State(state): State<SharedBridge>, Path(session): Path<String>, body: String) -> Response {
	let mut state = state.lock();
	if !state.sessions.values().any(|s| *s == session) {
		return failure("session not found");
	}
	let message = match Message::from_bridge_hex(&body) {
		Ok(message) => message,
		Err(err) => return failure(&err.to_string()),
	};
	if !state.silent {
		if let Ok(reply) = reply_to(&message).to_bridge_hex() {
			state.replies.entry(session).or_default().push_back(reply);
		}
	}
	StatusCode::OK.into_response()
}

async fn read_message(State(state): State<SharedBridge>, Path(session): Path<String>) -> Response {
	let reply = {
		let mut state = state.lock();
		if !state.sessions.values().any(|s| *s == session) {
			return failure("session not found");
		}
		state.replies.get_mut(&session).and_then(|queue| queue.pop_front())
	};
	match reply {
		Some(reply) => reply.into_response(),
		None => std::future::pending().await,
	}
}
