//! The in-memory flow record and its durable counterpart.
//!
//! A [`Flow`] is what the proxy pipeline hands to a session on every phase callback; a
//! [`PersistedFlow`] is what the history store keeps. The two are deliberately distinct types:
//! the former borrows nothing and owns its bytes so it can cross task boundaries during a pause,
//! the latter adds the parsed/derived fields the history store indexes on.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stage of the pipeline a callback fires at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
	RequestHeaders,
	RequestBody,
	ResponseHeaders,
	ResponseBody,
	ServerDisconnected,
}

impl Phase {
	/// Whether this phase is one the breakpoint rule's `phases` set can gate.
	pub fn is_pausable(self) -> bool {
		matches!(self, Phase::RequestBody | Phase::ResponseBody)
	}

	/// The name used in a [`Rule`](crate::rules::Rule)'s `phases` set (`"Request"`/`"Response"`).
	pub fn rule_phase_name(self) -> Option<&'static str> {
		match self {
			Phase::RequestBody => Some("Request"),
			Phase::ResponseBody => Some("Response"),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowRequest {
	pub method: String,
	pub url: String,
	pub proto: String,
	#[serde(default)]
	pub header: BTreeMap<String, Vec<String>>,
	#[serde(with = "serde_bytes_as_base64", default)]
	pub body: Bytes,
}

impl FlowRequest {
	pub fn header_value(&self, name: &str) -> Option<&str> {
		self
			.header
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.and_then(|(_, v)| v.first())
			.map(String::as_str)
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowResponse {
	pub status_code: u16,
	pub proto: String,
	#[serde(default)]
	pub header: BTreeMap<String, Vec<String>>,
	#[serde(with = "serde_bytes_as_base64", default)]
	pub body: Bytes,
}

/// The mutable per-exchange record the pipeline threads through its phase callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
	pub flow_id: Uuid,
	pub conn_id: Uuid,
	pub client_addr: String,
	pub client_tls: bool,
	pub server_addr: String,
	pub server_peer: Option<String>,
	pub request: FlowRequest,
	pub response: Option<FlowResponse>,
}

impl Flow {
	pub fn new(flow_id: Uuid, conn_id: Uuid, client_addr: String, client_tls: bool) -> Self {
		Flow {
			flow_id,
			conn_id,
			client_addr,
			client_tls,
			server_addr: String::new(),
			server_peer: None,
			request: FlowRequest::default(),
			response: None,
		}
	}

	/// Parsed request URL, used by the rule engine's `ignore-extensions` check and by history
	/// persistence's scheme/host/path/query split.
	pub fn request_uri(&self) -> Option<http::Uri> {
		self.request.url.parse().ok()
	}

	pub fn request_path(&self) -> String {
		self
			.request_uri()
			.map(|u| u.path().to_string())
			.unwrap_or_default()
	}
}

mod serde_bytes_as_base64 {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use bytes::Bytes;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
		let raw = String::deserialize(d)?;
		STANDARD
			.decode(raw.as_bytes())
			.map(Bytes::from)
			.map_err(serde::de::Error::custom)
	}
}

/// One durable history record. Mirrors [`Flow`] plus the fields the store indexes or derives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFlow {
	pub id: u64,
	pub flow_id: Uuid,
	pub scheme: String,
	pub host: String,
	pub path: String,
	pub query: String,
	pub method: String,
	pub request_header: BTreeMap<String, Vec<String>>,
	pub request_body: Bytes,
	pub status_code: u16,
	pub response_header: BTreeMap<String, Vec<String>>,
	pub response_body: Bytes,
	pub response_size: usize,
	pub captured_at: DateTime<Utc>,
}

impl PersistedFlow {
	pub fn status_bucket(&self) -> StatusBucket {
		StatusBucket::classify(self.status_code)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBucket {
	Http2xx,
	Http3xx,
	Http4xx,
	Http5xx,
	Other,
}

impl StatusBucket {
	/// Faithfully reproduces the off-by-one source ranges: `>300 && <399`, `>400 && <499`,
	/// `>500 && <599`. See `DESIGN.md` for the open question this preserves rather than fixes.
	pub fn classify(status: u16) -> StatusBucket {
		if status == 200 {
			StatusBucket::Http2xx
		} else if status > 300 && status < 399 {
			StatusBucket::Http3xx
		} else if status > 400 && status < 499 {
			StatusBucket::Http4xx
		} else if status > 500 && status < 599 {
			StatusBucket::Http5xx
		} else {
			StatusBucket::Other
		}
	}
}

/// Per-store counters, incremented on every successful [`upsert`](crate::history::HistoryStore::upsert).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusAggregate {
	pub total: u64,
	pub http_2xx: u64,
	pub http_3xx: u64,
	pub http_4xx: u64,
	pub http_5xx: u64,
}

impl StatusAggregate {
	pub fn record(&mut self, bucket: StatusBucket) {
		self.total += 1;
		match bucket {
			StatusBucket::Http2xx => self.http_2xx += 1,
			StatusBucket::Http3xx => self.http_3xx += 1,
			StatusBucket::Http4xx => self.http_4xx += 1,
			StatusBucket::Http5xx => self.http_5xx += 1,
			StatusBucket::Other => {},
		}
	}
}
