use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::debug;

/// Resolve the real browser's WebSocket debugger URL.
///
/// `GET /json/version` is authoritative when it carries a
/// `webSocketDebuggerUrl`; otherwise `GET /json/list` is consulted and a
/// page target is preferred over other target kinds.
pub async fn discover_ws_url(client: &reqwest::Client, base_url: &str) -> Result<String> {
	let base = base_url.trim_end_matches('/');

	if let Some(url) = fetch_version_url(client, base).await {
		debug!(target = "heal", url = %url, "discovered browser endpoint via /json/version");
		return Ok(url);
	}

	let list_url = format!("{base}/json/list");
	let response = client
		.get(&list_url)
		.send()
		.await
		.with_context(|| format!("Requesting {list_url}"))?;
	if !response.status().is_success() {
		bail!("{list_url} returned {}", response.status());
	}
	let targets: Vec<Value> = response
		.json()
		.await
		.with_context(|| format!("Decoding {list_url}"))?;

	let Some(url) = pick_target(&targets) else {
		bail!("no debuggable target advertised by {base}");
	};
	debug!(target = "heal", url = %url, "discovered browser endpoint via /json/list");
	Ok(url)
}

/// Any failure here (unreachable endpoint, non-200, malformed body, missing
/// field) is not terminal; `/json/list` is the fallback.
async fn fetch_version_url(client: &reqwest::Client, base: &str) -> Option<String> {
	let version_url = format!("{base}/json/version");
	let response = match client.get(&version_url).send().await {
		Ok(response) if response.status().is_success() => response,
		Ok(response) => {
			debug!(target = "heal", url = %version_url, status = %response.status(), "version endpoint unusable, trying target list");
			return None;
		}
		Err(err) => {
			debug!(target = "heal", url = %version_url, error = %err, "version endpoint unreachable, trying target list");
			return None;
		}
	};
	let body: Value = match response.json().await {
		Ok(body) => body,
		Err(err) => {
			debug!(target = "heal", url = %version_url, error = %err, "version endpoint returned a malformed body, trying target list");
			return None;
		}
	};
	body.get("webSocketDebuggerUrl")
		.and_then(|v| v.as_str())
		.map(str::to_owned)
}

/// Prefer a `type == "page"` target; fall back to any target advertising a
/// debugger URL.
pub fn pick_target(targets: &[Value]) -> Option<String> {
	let url_of = |target: &Value| {
		target
			.get("webSocketDebuggerUrl")
			.and_then(|v| v.as_str())
			.map(str::to_owned)
	};

	targets
		.iter()
		.filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
		.find_map(&url_of)
		.or_else(|| targets.iter().find_map(&url_of))
}
