use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use heal_core::{PendingSelectors, extract_selector};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::browser::{BrowserConnection, CONNECT_TIMEOUT};
use crate::discover::discover_ws_url;
use crate::server::ProxyState;

enum BrowserSlot {
	Idle,
	Dialing,
	Ready(Arc<BrowserConnection>),
}

/// One client connection and its half of the relay.
///
/// The browser side is dialed lazily on the first client command; until it is
/// open, sanitized commands accumulate in a FIFO queue that is flushed in
/// arrival order once the connection settles.
pub struct ProxySession {
	pub id: String,
	state: Arc<ProxyState>,
	client_tx: mpsc::UnboundedSender<Message>,
	queue: Mutex<VecDeque<String>>,
	pending: Arc<PendingSelectors>,
	browser: Mutex<BrowserSlot>,
	closed: AtomicBool,
}

pub async fn handle_client_socket(socket: WebSocket, state: Arc<ProxyState>) {
	let id = format!(
		"s{:06}",
		state.next_session_id.fetch_add(1, Ordering::Relaxed)
	);

	let (tx, rx) = mpsc::unbounded_channel();
	let session = Arc::new(ProxySession {
		id,
		state,
		client_tx: tx,
		queue: Mutex::new(VecDeque::new()),
		pending: Arc::new(PendingSelectors::new()),
		browser: Mutex::new(BrowserSlot::Idle),
		closed: AtomicBool::new(false),
	});
	info!(target = "heal", session = %session.id, "client connected");

	let mut rx_stream = UnboundedReceiverStream::new(rx);
	let (mut ws_tx, mut ws_rx) = socket.split();

	let send_task = tokio::spawn(async move {
		while let Some(msg) = rx_stream.next().await {
			if ws_tx.send(msg).await.is_err() {
				break;
			}
		}
	});

	while let Some(msg) = ws_rx.next().await {
		match msg {
			Ok(Message::Text(text)) => session.clone().on_client_message(&text).await,
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(err) => {
				warn!(target = "heal", session = %session.id, error = %err, "client websocket error");
				break;
			}
		}
	}

	session.shutdown().await;
	send_task.abort();
	info!(target = "heal", session = %session.id, "client disconnected");
}

enum SlotAction {
	Send(Arc<BrowserConnection>),
	Queue,
	Dial,
}

impl ProxySession {
	async fn on_client_message(self: Arc<Self>, raw: &str) {
		if let Some(dumper) = &self.state.dumper {
			dumper.dump("FROM_CLIENT", raw);
		}

		// The tracker sees the original command; the browser only ever sees
		// the sanitized rendition.
		let sanitized = sanitize_message(raw);
		if let Ok(command) = serde_json::from_str::<Value>(raw) {
			self.inspect_command(&command);
		}

		let action = {
			let mut slot = self.browser.lock().await;
			let action = match &*slot {
				BrowserSlot::Ready(conn) if conn.is_open() => SlotAction::Send(conn.clone()),
				// The remote dropped us; dial a fresh connection.
				BrowserSlot::Ready(conn) if conn.is_closed() => SlotAction::Dial,
				BrowserSlot::Ready(_) | BrowserSlot::Dialing => SlotAction::Queue,
				BrowserSlot::Idle => SlotAction::Dial,
			};
			if matches!(action, SlotAction::Dial) {
				*slot = BrowserSlot::Dialing;
			}
			action
		};

		match action {
			SlotAction::Send(conn) => {
				if let Err(err) = conn.send(&sanitized) {
					warn!(target = "heal", session = %self.id, error = %err, "send to browser failed, reconnecting");
					self.queue.lock().await.push_back(sanitized);
					self.clone().reconnect_once(conn).await;
				}
			}
			SlotAction::Queue => self.queue.lock().await.push_back(sanitized),
			SlotAction::Dial => {
				self.queue.lock().await.push_back(sanitized);
				self.clone().spawn_dial();
			}
		}
	}

	/// Feed the locator tracker from a client command and remember which
	/// command id the selector rode in on.
	fn inspect_command(&self, command: &Value) {
		let Some(info) = extract_selector(command) else {
			return;
		};
		if let Some(id) = command.get("id").and_then(Value::as_u64) {
			self.pending.insert(id, info.selector.clone());
		}
		debug!(target = "heal", session = %self.id, selector = %info.selector, engine = %info.engine, "locator attempt");
		self.state.tracker.track(&self.id, &info.selector, info.engine);
	}

	fn spawn_dial(self: Arc<Self>) {
		let session = self;
		tokio::spawn(async move {
			match discover_ws_url(&session.state.http, &session.state.browser_http_url).await {
				Ok(url) => {
					let conn = BrowserConnection::connect(url, session.clone());
					if !session.install_connection(&conn).await {
						return;
					}
					session.finish_dial(conn).await;
				}
				Err(err) => {
					warn!(target = "heal", session = %session.id, error = %err, "browser discovery failed");
					session.send_error_frame(&format!("Failed to connect to browser: {err}"));
					*session.browser.lock().await = BrowserSlot::Idle;
				}
			}
		});
	}

	/// Wait for an in-flight dial to settle, then flush the queue or back
	/// off to idle so a later command retries.
	async fn finish_dial(&self, conn: Arc<BrowserConnection>) {
		if conn.wait_until_open(CONNECT_TIMEOUT).await {
			self.flush_queue(&conn).await;
		} else {
			warn!(target = "heal", session = %self.id, url = %conn.url(), "timed out waiting for browser connection");
			self.send_error_frame("Timed out waiting for browser connection");
			conn.close();
			*self.browser.lock().await = BrowserSlot::Idle;
		}
	}

	/// A single reconnect to the previously discovered URL, skipping
	/// rediscovery. The failed payload is already back in the queue.
	async fn reconnect_once(self: Arc<Self>, old: Arc<BrowserConnection>) {
		old.close();
		let conn = BrowserConnection::connect(old.url().to_string(), self.clone());
		if !self.install_connection(&conn).await {
			return;
		}
		tokio::spawn(async move { self.finish_dial(conn).await });
	}

	/// Take ownership of a freshly dialed connection, unless the client has
	/// already disconnected, in which case the connection is closed instead
	/// of installed. Returns whether the connection was installed.
	async fn install_connection(&self, conn: &Arc<BrowserConnection>) -> bool {
		let mut slot = self.browser.lock().await;
		if self.closed.load(Ordering::Relaxed) {
			conn.close();
			return false;
		}
		*slot = BrowserSlot::Ready(conn.clone());
		true
	}

	/// Drain queued commands in arrival order, stopping (and requeueing) at
	/// the first send failure.
	async fn flush_queue(&self, conn: &BrowserConnection) {
		let mut queue = self.queue.lock().await;
		while let Some(payload) = queue.pop_front() {
			if let Err(err) = conn.send(&payload) {
				debug!(target = "heal", session = %self.id, error = %err, "flush interrupted, requeueing");
				queue.push_front(payload);
				break;
			}
		}
	}

	fn send_error_frame(&self, message: &str) {
		let frame = json!({ "error": message }).to_string();
		let _ = self.client_tx.send(Message::Text(frame.into()));
	}

	/// Browser-to-client path: observe the reply, then forward it verbatim.
	pub fn on_browser_message(&self, raw: &str) {
		if let Some(dumper) = &self.state.dumper {
			dumper.dump("FROM_BROWSER", raw);
		}
		match serde_json::from_str::<Value>(raw) {
			Ok(reply) => self
				.state
				.tracker
				.observe_reply(&self.id, &self.pending, &reply),
			Err(err) => {
				debug!(target = "heal", session = %self.id, error = %err, "unparseable browser frame")
			}
		}
		let _ = self.client_tx.send(Message::Text(raw.to_string().into()));
	}

	async fn shutdown(&self) {
		self.closed.store(true, Ordering::Relaxed);
		let slot = mem::replace(&mut *self.browser.lock().await, BrowserSlot::Idle);
		if let BrowserSlot::Ready(conn) = slot {
			conn.close();
		}
		self.queue.lock().await.clear();
		self.pending.clear();
	}
}

/// Reduce a client command to the field whitelist the browser accepts:
/// `id`, `method`, `params`, and a string `sessionId`. Anything that does
/// not parse as a JSON object passes through untouched.
pub fn sanitize_message(raw: &str) -> String {
	let Ok(Value::Object(message)) = serde_json::from_str::<Value>(raw) else {
		return raw.to_string();
	};

	let mut sanitized = Map::new();
	for key in ["id", "method", "params"] {
		if let Some(value) = message.get(key) {
			sanitized.insert(key.to_string(), value.clone());
		}
	}
	if let Some(session_id @ Value::String(_)) = message.get("sessionId") {
		sanitized.insert("sessionId".to_string(), session_id.clone());
	}
	Value::Object(sanitized).to_string()
}
