//! Session (C5): one operator attachment's channel I/O, rule slots, pause registry, and history
//! store handle.
//!
//! Two roles run concurrently per session: the *read loop* (driven by [`run_read_loop`], consuming
//! operator→proxy frames) and the *writer*, serialized through `writer`'s async mutex so that
//! concurrent pipeline tasks sending flow frames never interleave partial writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::codec::{self, EditDecision, Incoming, MessageType};
use crate::compression;
use crate::flow::{Flow, Phase, PersistedFlow};
use crate::history::HistoryStore;
use crate::pause::PauseRegistry;
use crate::rules::{CompiledRule, Rule};

/// The per-session interception toggle set by the `interceptor-on/off` control frame. Only gates
/// request-body pausing, per `on_phase`'s pseudocode.
struct InterceptorFlag(AtomicBool);

pub struct Session {
	pub user_name: String,
	pub token: String,
	writer: AsyncMutex<SplitSink<WebSocket, WsMessage>>,
	pub history: HistoryStore,
	pause: PauseRegistry,
	breakpoint: RwLock<Arc<CompiledRule>>,
	history_rule: RwLock<Arc<CompiledRule>>,
	interceptor: InterceptorFlag,
}

impl Session {
	pub fn new(
		user_name: String,
		token: String,
		writer: SplitSink<WebSocket, WsMessage>,
		history: HistoryStore,
	) -> Session {
		Session {
			user_name,
			token,
			writer: AsyncMutex::new(writer),
			history,
			pause: PauseRegistry::new(),
			breakpoint: RwLock::new(Arc::new(CompiledRule::compile(Rule::default()))),
			history_rule: RwLock::new(Arc::new(CompiledRule::compile(Rule::default()))),
			interceptor: InterceptorFlag(AtomicBool::new(false)),
		}
	}

	async fn send_frame(&self, bytes: Bytes) {
		let mut writer = self.writer.lock().await;
		if let Err(e) = writer.send(WsMessage::Binary(bytes)).await {
			tracing::error!(error = %e, session = %self.user_name, "failed to write to operator channel");
		}
	}

	pub async fn send_login(&self) {
		self.send_frame(codec::encode_login_frame(&self.token)).await;
	}

	/// The pipeline entry point, called by the multiplexer's fan-out for every phase of every
	/// in-flight flow. Blocks the calling task if (and only if) the flow is paused.
	pub async fn on_phase(&self, phase: Phase, flow: &mut Flow) {
		let breakpoint = self.breakpoint.read().clone();
		let intercept = phase.is_pausable()
			&& breakpoint.rule.enabled
			&& phase
				.rule_phase_name()
				.is_some_and(|name| breakpoint.phase_enabled(name))
			&& (phase != Phase::RequestBody
				|| (self.interceptor.0.load(Ordering::Relaxed) && flow.request.method != "CONNECT"))
			&& breakpoint.matches(flow);

		if intercept {
			let content = serde_json::to_vec(&*flow).unwrap_or_default();
			let frame = codec::encode_flow_frame(phase_message_type(phase), flow.flow_id, true, &content);
			self.send_frame(frame).await;
		}

		if phase == Phase::ResponseBody {
			let history_rule = self.history_rule.read().clone();
			if history_rule.rule.enabled && history_rule.matches(flow) {
				match to_persisted_flow(flow).await {
					Ok(record) => {
						if let Err(e) = self.history.upsert(record) {
							tracing::error!(error = %e, "history upsert failed");
						}
					},
					Err(e) => tracing::warn!(error = %e, "failed to materialize history record"),
				}
			}
		}

		if intercept {
			let decision = self.pause.await_decision(flow.flow_id).await;
			apply_edit(flow, decision);
		}
	}

	/// Drains all pending pauses with the synthetic off decision — called on eviction/teardown
	/// and whenever the breakpoint rule is replaced with a disabled one.
	pub fn drain_pauses(&self) {
		self.pause.drain_all();
	}

	/// Consumes operator→proxy frames until the channel closes, dispatching each. `"ping"` text
	/// frames get an immediate raw `"pong"` reply outside the binary frame envelope.
	pub async fn run_read_loop(self: Arc<Self>, mut receiver: futures_util::stream::SplitStream<WebSocket>) {
		while let Some(msg) = receiver.next().await {
			let msg = match msg {
				Ok(m) => m,
				Err(e) => {
					tracing::warn!(error = %e, session = %self.user_name, "operator channel read error");
					break;
				},
			};
			match msg {
				WsMessage::Text(text) if text == "ping" => {
					let mut writer = self.writer.lock().await;
					let _ = writer.send(WsMessage::Text("pong".into())).await;
				},
				WsMessage::Binary(data) => self.handle_incoming(&data).await,
				WsMessage::Close(_) => break,
				_ => {},
			}
		}
	}

	async fn handle_incoming(&self, data: &[u8]) {
		match codec::parse_message(data) {
			Ok(Incoming::Edit { flow_id, decision }) => self.pause.deliver(flow_id, decision),
			Ok(Incoming::ChangeBreakpointRules(rule)) => {
				let disabled = !rule.enabled;
				*self.breakpoint.write() = Arc::new(CompiledRule::compile(rule));
				if disabled {
					self.pause.drain_all();
				}
			},
			Ok(Incoming::ChangeHistoryRules(rule)) => {
				*self.history_rule.write() = Arc::new(CompiledRule::compile(rule));
			},
			Ok(Incoming::Interceptor { enable }) => {
				self.interceptor.0.store(enable, Ordering::Relaxed);
			},
			Ok(Incoming::Pull { page, page_size }) => self.handle_pull(page, page_size).await,
			Err(e) => tracing::warn!(error = %e, "dropping malformed operator frame"),
		}
	}

	async fn handle_pull(&self, page: i64, page_size: i64) {
		if page < 1 || page_size <= 0 {
			return;
		}
		let skip = ((page - 1) * page_size).max(0) as usize;
		match self.history.history(skip, page_size as usize) {
			Ok((aggregate, flows)) => {
				let payload = serde_json::json!({ "aggregate": aggregate, "flows": flows });
				let content = serde_json::to_vec(&payload).unwrap_or_default();
				let frame = codec::encode_flow_frame(MessageType::Flows, Uuid::nil(), false, &content);
				self.send_frame(frame).await;
			},
			Err(e) => tracing::error!(error = %e, "history pull failed"),
		}
	}
}

fn phase_message_type(phase: Phase) -> MessageType {
	match phase {
		Phase::RequestHeaders => MessageType::RequestHeader,
		Phase::RequestBody => MessageType::RequestBody,
		Phase::ResponseHeaders => MessageType::ResponseHeader,
		Phase::ResponseBody => MessageType::ResponseBody,
		Phase::ServerDisconnected => MessageType::ConnClose,
	}
}

/// `wait_intercept`: applies the operator's delivered edit decision to the in-flight flow.
fn apply_edit(flow: &mut Flow, decision: EditDecision) {
	match decision {
		EditDecision::DropRequest | EditDecision::DropResponse => {
			flow.response = Some(crate::flow::FlowResponse {
				status_code: 502,
				..Default::default()
			});
		},
		EditDecision::ChangeRequest { header, body } => {
			apply_v1_request_header(flow, &header);
			flow.request.body = body;
		},
		EditDecision::ChangeResponse { header, body } => {
			apply_v1_response_header(flow, &header);
			stamp_response_body(flow, body);
		},
		EditDecision::ChangeRequestV2(edit) => {
			flow.request.method = edit.method;
			flow.request.proto = edit.proto;
			flow.request.url = edit.raw_url;
			flow.request.header = edit.header;
			flow.request.body = Bytes::from(edit.body);
		},
		EditDecision::ChangeResponseV2(edit) => {
			if edit.status_code != 0 {
				ensure_response(flow).status_code = edit.status_code;
			}
			ensure_response(flow).header = edit.header;
			stamp_response_body(flow, Bytes::from(edit.body));
		},
		EditDecision::InterceptorOff => {},
	}
}

fn ensure_response(flow: &mut Flow) -> &mut crate::flow::FlowResponse {
	flow.response.get_or_insert_with(Default::default)
}

fn apply_v1_request_header(flow: &mut Flow, header: &serde_json::Value) {
	if let Some(m) = header.get("method").and_then(|v| v.as_str()) {
		flow.request.method = m.to_string();
	}
	if let Some(u) = header.get("url").and_then(|v| v.as_str()) {
		flow.request.url = u.to_string();
	}
	if let Some(p) = header.get("proto").and_then(|v| v.as_str()) {
		flow.request.proto = p.to_string();
	}
	if let Some(h) = header.get("header") {
		if let Ok(parsed) = serde_json::from_value(h.clone()) {
			flow.request.header = parsed;
		}
	}
}

fn apply_v1_response_header(flow: &mut Flow, header: &serde_json::Value) {
	let response = ensure_response(flow);
	if let Some(status) = header.get("statusCode").and_then(|v| v.as_u64()) {
		response.status_code = status as u16;
	}
	if let Some(h) = header.get("header") {
		if let Ok(parsed) = serde_json::from_value(h.clone()) {
			response.header = parsed;
		}
	}
}

/// Replaces the response body, stamps `Content-Length`, and strips `Content-Encoding` (an edited
/// body is never still compressed per the original encoding).
fn stamp_response_body(flow: &mut Flow, body: Bytes) {
	let response = ensure_response(flow);
	response.header.remove("Content-Encoding");
	response.header.remove("content-encoding");
	if body.is_empty() {
		response.header.insert("Content-Length".into(), vec!["0".into()]);
	} else {
		response
			.header
			.insert("Content-Length".into(), vec![body.len().to_string()]);
	}
	response.body = body;
}

async fn to_persisted_flow(flow: &Flow) -> anyhow::Result<PersistedFlow> {
	let uri = flow.request_uri();
	let response = flow.response.as_ref();
	let content_encoding = response.and_then(|r| {
		r.header
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case("content-encoding"))
			.and_then(|(_, v)| v.first())
			.map(String::as_str)
	});
	let response_body = match response {
		Some(r) => compression::decompress(&r.body, content_encoding).await?,
		None => Bytes::new(),
	};

	Ok(PersistedFlow {
		id: 0,
		flow_id: flow.flow_id,
		scheme: uri.as_ref().and_then(|u| u.scheme_str()).unwrap_or("").to_string(),
		host: uri.as_ref().and_then(|u| u.host()).unwrap_or("").to_string(),
		path: flow.request_path(),
		query: uri.as_ref().and_then(|u| u.query()).unwrap_or("").to_string(),
		method: flow.request.method.clone(),
		request_header: flow.request.header.clone(),
		request_body: flow.request.body.clone(),
		status_code: response.map(|r| r.status_code).unwrap_or(0),
		response_header: response.map(|r| r.header.clone()).unwrap_or_default(),
		response_size: response_body.len(),
		response_body,
		captured_at: Utc::now(),
	})
}
