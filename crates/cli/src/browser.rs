use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::session::ProxySession;

/// How long a session waits for the browser socket to open before it gives
/// up and surfaces an error frame.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
	Connecting,
	Open,
	Closed,
}

#[derive(Debug, Error)]
pub enum SendError {
	#[error("browser connection is not open")]
	NotOpen,
}

/// One WebSocket connection to the real browser, owned by a single session.
///
/// The connection runs its own socket task; callers interact through the
/// state watch and the outbound queue. Once `Closed` it never reopens; the
/// session dials a fresh connection instead.
pub struct BrowserConnection {
	url: String,
	state: watch::Sender<ConnState>,
	outbound: mpsc::UnboundedSender<String>,
}

impl BrowserConnection {
	/// Start dialing `url`. Returns immediately; the socket task drives the
	/// state from `Connecting` to `Open` or `Closed`.
	pub fn connect(url: String, session: Arc<ProxySession>) -> Arc<Self> {
		let (state_tx, _) = watch::channel(ConnState::Connecting);
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let conn = Arc::new(Self {
			url,
			state: state_tx,
			outbound: outbound_tx,
		});
		tokio::spawn(run_socket(conn.clone(), session, outbound_rx));
		conn
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	pub fn is_open(&self) -> bool {
		*self.state.borrow() == ConnState::Open
	}

	pub fn is_closed(&self) -> bool {
		*self.state.borrow() == ConnState::Closed
	}

	/// Queue a payload for the browser. Fails when the connection is not
	/// (or no longer) open.
	pub fn send(&self, payload: &str) -> Result<(), SendError> {
		if !self.is_open() {
			return Err(SendError::NotOpen);
		}
		self.outbound
			.send(payload.to_string())
			.map_err(|_| SendError::NotOpen)
	}

	/// Wait for the dial to settle, up to `timeout`. Returns whether the
	/// connection ended up open.
	pub async fn wait_until_open(&self, timeout: Duration) -> bool {
		let mut rx = self.state.subscribe();
		match tokio::time::timeout(timeout, rx.wait_for(|s| *s != ConnState::Connecting)).await {
			Ok(Ok(state)) => *state == ConnState::Open,
			_ => false,
		}
	}

	/// Transition to `Closed`. Idempotent; the socket task notices through
	/// the state watch and tears the socket down.
	pub fn close(&self) {
		self.state.send_replace(ConnState::Closed);
	}
}

async fn run_socket(
	conn: Arc<BrowserConnection>,
	session: Arc<ProxySession>,
	mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
	let stream = match connect_async(conn.url.as_str()).await {
		Ok((stream, _)) => stream,
		Err(err) => {
			warn!(target = "heal", session = %session.id, url = %conn.url, error = %err, "browser dial failed");
			conn.state.send_replace(ConnState::Closed);
			return;
		}
	};

	// The session may have shut down while the dial was in flight.
	if conn.is_closed() {
		return;
	}
	conn.state.send_replace(ConnState::Open);
	info!(target = "heal", session = %session.id, url = %conn.url, "browser connection open");

	let (mut ws_tx, mut ws_rx) = stream.split();

	let writer = tokio::spawn(async move {
		while let Some(payload) = outbound_rx.recv().await {
			if ws_tx.send(WsMessage::Text(payload.into())).await.is_err() {
				break;
			}
		}
	});

	let mut closed = conn.state.subscribe();
	loop {
		tokio::select! {
			_ = closed.wait_for(|s| *s == ConnState::Closed) => break,
			msg = ws_rx.next() => match msg {
				Some(Ok(WsMessage::Text(text))) => session.on_browser_message(&text),
				Some(Ok(WsMessage::Close(_))) | None => break,
				Some(Ok(_)) => {}
				Some(Err(err)) => {
					warn!(target = "heal", session = %session.id, error = %err, "browser websocket error");
					break;
				}
			},
		}
	}

	conn.state.send_replace(ConnState::Closed);
	writer.abort();
	debug!(target = "heal", session = %session.id, "browser connection closed");
}
