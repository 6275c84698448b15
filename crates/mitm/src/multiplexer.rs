//! Session multiplexer (C6): holds the live session set, fans pipeline callbacks out to every
//! attached session, and exposes the `/mitm/<name>/...` HTTP control-plane endpoints.
//!
//! Grounded on `original_source/web/web.go` (`WebAddon`'s `conns`/`connsMu`, `addConn`/
//! `removeConn`/`disconnect`, `forEachConn`/`sendFlow`) and `web_server.go`'s `Router`. The
//! session set is a single read-write-locked map; `<name>` in every route is the proxy's one
//! configured session name (`Config::name`), so a relogin under that name evicts whatever session
//! currently holds it — the "same-user re-login evicts" scenario in `SPEC_FULL.md` §8.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

use crate::client;
use crate::codec::RequestEditV2;
use crate::config::Config;
use crate::flow::{Flow, Phase};
use crate::history::HistoryStore;
use crate::assets;
use crate::session::Session;

pub struct Multiplexer {
	config: Arc<Config>,
	store_dir: PathBuf,
	sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Multiplexer {
	pub fn new(config: Arc<Config>, store_dir: impl Into<PathBuf>) -> Arc<Multiplexer> {
		Arc::new(Multiplexer {
			config,
			store_dir: store_dir.into(),
			sessions: RwLock::new(HashMap::new()),
		})
	}

	/// Fan-out entry point: acquires the read lock, snapshots the session list, releases the
	/// lock, then calls each session's `on_phase` — never holding the lock across a blocking
	/// pause.
	pub async fn dispatch(&self, phase: Phase, flow: &mut Flow) {
		let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
		for session in sessions {
			session.on_phase(phase, flow).await;
		}
	}

	fn authorize(&self, headers: &HeaderMap) -> Option<Arc<Session>> {
		let token = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
		self
			.sessions
			.read()
			.values()
			.find(|s| s.token == token)
			.cloned()
	}

	/// Evicts whatever session currently holds `name`, draining its pauses and closing its store
	/// so the pipeline tasks it had suspended unblock before the name is reused.
	fn evict(&self, name: &str) {
		if let Some(old) = self.sessions.write().remove(name) {
			old.drain_pauses();
			if let Err(e) = old.history.close() {
				tracing::warn!(error = %e, session = name, "failed to close evicted session's history store");
			}
		}
	}

	async fn run_session(self: Arc<Self>, socket: axum::extract::ws::WebSocket) {
		use futures_util::StreamExt;

		let (sink, stream) = socket.split();
		let token = Uuid::new_v4().to_string();
		let name = self.config.name.clone();
		let history = match HistoryStore::open(&self.store_dir, &name) {
			Ok(h) => h,
			Err(e) => {
				tracing::error!(error = %e, session = name, "failed to open history store, refusing attach");
				return;
			},
		};

		self.evict(&name);
		let session = Arc::new(Session::new(name.clone(), token, sink, history));
		self.sessions.write().insert(name.clone(), session.clone());
		tracing::info!(session = %name, "operator attached");

		session.send_login().await;
		session.clone().run_read_loop(stream).await;

		let mut sessions = self.sessions.write();
		if let Some(current) = sessions.get(&name) {
			if Arc::ptr_eq(current, &session) {
				sessions.remove(&name);
			}
		}
		drop(sessions);
		session.drain_pauses();
		if let Err(e) = session.history.close() {
			tracing::warn!(error = %e, session = %name, "failed to close history store on teardown");
		}
		tracing::info!(session = %name, "operator detached");
	}

	pub fn router(self: &Arc<Self>) -> Router {
		Router::new()
			.route("/mitm/{name}/connect", get(handle_connect))
			.route("/mitm/{name}/history/pull", get(history_pull))
			.route("/mitm/{name}/flow/pull", get(flow_pull))
			.route("/mitm/{name}/history/clear", get(history_clear))
			.route("/mitm/{name}/proxy/repeat", post(proxy_replay))
			.route("/mitm/{name}/proxy/intruder", post(proxy_replay))
			.route("/mitm/{name}/dummy/cert", get(dummy_cert))
			.route("/", get(serve_root))
			.route("/{*path}", get(serve_static))
			.layer(build_cors(&self.config))
			.with_state(self.clone())
	}
}

fn build_cors(config: &Config) -> CorsLayer {
	let allowed = config.origin.clone();
	CorsLayer::new()
		.allow_origin(AllowOrigin::predicate(move |origin, _| {
			origin
				.to_str()
				.map(|o| allowed.iter().any(|a| a == o))
				.unwrap_or(false)
		}))
		.allow_methods([
			axum::http::Method::GET,
			axum::http::Method::PUT,
			axum::http::Method::POST,
			axum::http::Method::DELETE,
			axum::http::Method::OPTIONS,
		])
		.allow_headers([
			header::CONTENT_TYPE,
			header::AUTHORIZATION,
			header::ORIGIN,
			header::ACCEPT,
		])
}

fn not_found() -> Response {
	(StatusCode::NOT_FOUND, "not found").into_response()
}

fn unauthorized() -> Response {
	(StatusCode::UNAUTHORIZED, "check you login info").into_response()
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
	id: String,
}

async fn handle_connect(
	State(mux): State<Arc<Multiplexer>>,
	AxumPath(name): AxumPath<String>,
	Query(query): Query<ConnectQuery>,
	ws: WebSocketUpgrade,
) -> Response {
	if name != mux.config.name {
		return not_found();
	}
	if query.id != mux.config.pass {
		tracing::error!(session = %name, "connect failed: bad credentials");
		return unauthorized();
	}
	ws.on_upgrade(move |socket| mux.run_session(socket))
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
	page: Option<i64>,
	pagesize: Option<i64>,
}

/// Mirrors `original_source/web/web_history.go`'s page/pagesize validation; this repo's own
/// error taxonomy (`SPEC_FULL.md` §7) prefers 400 for bad input over the original's 404 — a
/// documented deviation, see `DESIGN.md`.
fn validate_page(query: &PageQuery) -> Result<(usize, usize), String> {
	let page = query.page.unwrap_or(0);
	let page_size = query.pagesize.unwrap_or(0);
	if page < 1 || page_size <= 0 {
		return Err(format!("page number fail page:{page} page_size:{page_size}"));
	}
	let skip = ((page - 1) * page_size).max(0) as usize;
	Ok((skip, page_size as usize))
}

async fn history_pull(
	State(mux): State<Arc<Multiplexer>>,
	AxumPath(name): AxumPath<String>,
	Query(query): Query<PageQuery>,
	headers: HeaderMap,
) -> Response {
	if name != mux.config.name {
		return not_found();
	}
	let Some(session) = mux.authorize(&headers) else {
		return unauthorized();
	};
	let (skip, limit) = match validate_page(&query) {
		Ok(v) => v,
		Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
	};
	match session.history.history(skip, limit) {
		Ok((aggregate, flows)) => Json(serde_json::json!({ "aggregate": aggregate, "flows": flows })).into_response(),
		Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct FlowQuery {
	flow: String,
}

async fn flow_pull(
	State(mux): State<Arc<Multiplexer>>,
	AxumPath(name): AxumPath<String>,
	Query(query): Query<FlowQuery>,
	headers: HeaderMap,
) -> Response {
	if name != mux.config.name {
		return not_found();
	}
	let Some(session) = mux.authorize(&headers) else {
		return unauthorized();
	};
	let Ok(flow_id) = Uuid::parse_str(&query.flow) else {
		return (StatusCode::NOT_FOUND, "invalid flow id").into_response();
	};
	match session.history.find(flow_id) {
		Ok(record) => Json(record).into_response(),
		Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
	}
}

async fn history_clear(
	State(mux): State<Arc<Multiplexer>>,
	AxumPath(name): AxumPath<String>,
	headers: HeaderMap,
) -> Response {
	if name != mux.config.name {
		return not_found();
	}
	let Some(session) = mux.authorize(&headers) else {
		return unauthorized();
	};
	match session.history.reset() {
		Ok(()) => (StatusCode::OK, "ok").into_response(),
		Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
	}
}

async fn proxy_replay(
	State(mux): State<Arc<Multiplexer>>,
	AxumPath(name): AxumPath<String>,
	headers: HeaderMap,
	Json(edit): Json<RequestEditV2>,
) -> Response {
	if name != mux.config.name {
		return not_found();
	}
	if mux.authorize(&headers).is_none() {
		return unauthorized();
	}
	match client::send_request(&edit.method, &edit.raw_url, &edit.header, Bytes::from(edit.body)).await {
		Ok(resp) => Json(resp).into_response(),
		Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("http request fail {e}")).into_response(),
	}
}

async fn dummy_cert(
	State(mux): State<Arc<Multiplexer>>,
	AxumPath(name): AxumPath<String>,
	headers: HeaderMap,
) -> Response {
	if name != mux.config.name {
		return not_found();
	}
	if mux.authorize(&headers).is_none() {
		return unauthorized();
	}
	let path = std::path::Path::new(mux.config.cert_dir()).join("mitmproxy-ca-cert.cer");
	match fs_err::tokio::read(&path).await {
		Ok(bytes) => (
			[(header::CONTENT_TYPE, "application/octet-stream")],
			bytes,
		)
			.into_response(),
		Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
	}
}

async fn serve_root() -> Response {
	serve_asset("/")
}

async fn serve_static(AxumPath(path): AxumPath<String>) -> Response {
	serve_asset(&path)
}

fn serve_asset(path: &str) -> Response {
	match assets::lookup(path) {
		Some((contents, mime)) => ([(header::CONTENT_TYPE, mime)], contents).into_response(),
		None => not_found(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn validate_page_rejects_zero_page() {
		let q = PageQuery {
			page: Some(0),
			pagesize: Some(10),
		};
		assert!(validate_page(&q).is_err());
	}

	#[test]
	fn validate_page_rejects_nonpositive_pagesize() {
		let q = PageQuery {
			page: Some(1),
			pagesize: Some(0),
		};
		assert!(validate_page(&q).is_err());
	}

	#[test]
	fn validate_page_computes_skip() {
		let q = PageQuery {
			page: Some(3),
			pagesize: Some(20),
		};
		assert_eq!(validate_page(&q).unwrap(), (40, 20));
	}

	#[test]
	fn cors_allows_only_configured_origins() {
		let config = Config {
			addr: "0.0.0.0".into(),
			port: 9080,
			large: 1024,
			name: "mitm".into(),
			pass: "secret".into(),
			origin: vec!["http://127.0.0.1".into()],
			mode: String::new(),
		};
		assert!(config.allows_origin("http://127.0.0.1"));
		assert!(!config.allows_origin("http://evil.test"));
	}
}
