use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::routing::get;
use axum::{Json, Router};
use heal_core::{JsonlSink, LocatorTracker, spawn_sweeper};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::cli::Cli;
use crate::dump::MessageDumper;
use crate::session;

/// Shared across sessions: the tracker, the discovery HTTP client, and the
/// knobs the sessions need to dial out and to stamp themselves.
pub struct ProxyState {
	pub tracker: Arc<LocatorTracker>,
	pub http: reqwest::Client,
	pub browser_http_url: String,
	pub advertised_port: u16,
	pub dumper: Option<Arc<MessageDumper>>,
	pub next_session_id: AtomicU64,
}

pub fn app(state: Arc<ProxyState>) -> Router {
	Router::new()
		.route("/", get(|| async { "OK" }))
		.route("/json/version", get(version_handler))
		.route("/json/version/", get(version_handler))
		.route("/json/list", get(list_handler))
		.route("/json/list/", get(list_handler))
		.route(
			"/cdp",
			get(
				|ws: WebSocketUpgrade, State(state): State<Arc<ProxyState>>| async move {
					ws.on_upgrade(|socket| session::handle_client_socket(socket, state))
				},
			),
		)
		.with_state(state)
}

async fn version_handler(State(state): State<Arc<ProxyState>>) -> Json<Value> {
	Json(version_response(state.advertised_port))
}

async fn list_handler(State(state): State<Arc<ProxyState>>) -> Json<Value> {
	Json(list_response(state.advertised_port))
}

/// Discovery stub mirroring what a real browser serves, so clients that probe
/// `/json/version` before opening a socket are pointed at the proxy itself.
pub fn version_response(port: u16) -> Value {
	json!({
		"Browser": "Chrome/115.0.0.0",
		"Protocol-Version": "1.3",
		"User-Agent": "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
		"V8-Version": "11.5.0",
		"WebKit-Version": "537.36",
		"webSocketDebuggerUrl": format!("ws://localhost:{port}/cdp")
	})
}

pub fn list_response(port: u16) -> Value {
	json!([{
		"id": "default",
		"title": "CDP Proxy",
		"type": "page",
		"url": "about:blank",
		"webSocketDebuggerUrl": format!("ws://localhost:{port}/cdp")
	}])
}

pub async fn run(cli: Cli) -> Result<()> {
	let sink = JsonlSink::create(&cli.report_file)
		.with_context(|| format!("Failed to open report file {}", cli.report_file.display()))?;
	let tracker = Arc::new(LocatorTracker::new(Arc::new(sink)));

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let sweeper = spawn_sweeper(tracker.clone(), shutdown_rx);

	let dumper = match &cli.dump_file {
		Some(path) => Some(Arc::new(MessageDumper::create(path)?)),
		None => None,
	};

	let state = Arc::new(ProxyState {
		tracker,
		http: reqwest::Client::new(),
		browser_http_url: cli.browser_url.clone(),
		advertised_port: cli.port,
		dumper,
		next_session_id: AtomicU64::new(1),
	});

	let addr = format!("{}:{}", cli.host, cli.port);
	let listener = TcpListener::bind(&addr)
		.await
		.with_context(|| format!("Failed to bind proxy to {addr}"))?;

	info!(
		target = "heal",
		host = %cli.host,
		port = cli.port,
		browser = %cli.browser_url,
		report = %cli.report_file.display(),
		"starting CDP healing proxy"
	);

	axum::serve(listener, app(state).into_make_service())
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
		})
		.await
		.context("Proxy server error")?;

	// Stop the sweeper after the listener winds down so late reports from
	// live sessions still land.
	let _ = shutdown_tx.send(true);
	let _ = sweeper.await;
	Ok(())
}
