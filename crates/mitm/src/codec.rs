//! Framed binary wire codec for the operator channel (C1).
//!
//! Byte 0 is always the protocol version (`2`); byte 1 is the message type (see the table in
//! `SPEC_FULL.md` §6). Everything after depends on the type. Flow frames carry a 36-character
//! ASCII UUID immediately after the type byte; edit and meta frames do too, except meta frames
//! which carry only the rule JSON (no flow-id — a rule update applies to the whole session).

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::rules::Rule;

pub const PROTOCOL_VERSION: u8 = 2;
const UUID_LEN: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
	Conn = 0,
	RequestHeader = 1,
	RequestBody = 2,
	ResponseHeader = 3,
	ResponseBody = 4,
	ConnClose = 5,
	ChangeRequest = 11,
	ChangeResponse = 12,
	DropRequest = 13,
	DropResponse = 14,
	ChangeBreakpointRules = 21,
	Interceptor = 22,
	InterceptorOff = 23,
	ChangeRequestV2 = 101,
	ChangeResponseV2 = 102,
	ChangeHistoryRules = 103,
	Pull = 105,
	Flows = 106,
	Login = 110,
}

impl MessageType {
	pub fn from_byte(b: u8) -> Option<MessageType> {
		use MessageType::*;
		Some(match b {
			0 => Conn,
			1 => RequestHeader,
			2 => RequestBody,
			3 => ResponseHeader,
			4 => ResponseBody,
			5 => ConnClose,
			11 => ChangeRequest,
			12 => ChangeResponse,
			13 => DropRequest,
			14 => DropResponse,
			21 => ChangeBreakpointRules,
			22 => Interceptor,
			23 => InterceptorOff,
			101 => ChangeRequestV2,
			102 => ChangeResponseV2,
			103 => ChangeHistoryRules,
			105 => Pull,
			106 => Flows,
			110 => Login,
			_ => return None,
		})
	}
}

/// An operator→proxy edit, covering both v1 (length-prefixed header+body) and v2 (JSON object)
/// wire shapes. This is what [`crate::pause::PauseRegistry::deliver`] stores.
#[derive(Debug, Clone)]
pub enum EditDecision {
	ChangeRequest {
		header: serde_json::Value,
		body: Bytes,
	},
	ChangeResponse {
		header: serde_json::Value,
		body: Bytes,
	},
	DropRequest,
	DropResponse,
	ChangeRequestV2(RequestEditV2),
	ChangeResponseV2(ResponseEditV2),
	/// Synthetic decision delivered by [`crate::pause::PauseRegistry::drain_all`] when the
	/// breakpoint rule is disabled mid-pause.
	InterceptorOff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEditV2 {
	pub method: String,
	pub proto: String,
	#[serde(rename = "rawURL")]
	pub raw_url: String,
	#[serde(default)]
	pub header: std::collections::BTreeMap<String, Vec<String>>,
	#[serde(default)]
	pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEditV2 {
	#[serde(rename = "statusCode")]
	pub status_code: u16,
	#[serde(default)]
	pub header: std::collections::BTreeMap<String, Vec<String>>,
	#[serde(default)]
	pub body: String,
}

/// One fully-parsed operator→proxy frame, with its flow-id (meta/control frames don't carry one).
#[derive(Debug, Clone)]
pub enum Incoming {
	Edit { flow_id: Uuid, decision: EditDecision },
	ChangeBreakpointRules(Rule),
	ChangeHistoryRules(Rule),
	Interceptor { enable: bool },
	Pull { page: i64, page_size: i64 },
}

/// Parses a binary operator→proxy frame. Dispatch is by the raw type byte the frame carries,
/// not by any inferred/normalized type — a `change-history-rules` frame and a
/// `change-breakpoint-rules` frame share the same payload shape (a bare rule JSON document) and
/// are distinguished only by which of the two type bytes was actually sent.
pub fn parse_message(data: &[u8]) -> Result<Incoming, CodecError> {
	if data.len() < 2 {
		return Err(CodecError::TooShort);
	}
	if data[0] != PROTOCOL_VERSION {
		return Err(CodecError::InvalidVersion(data[0]));
	}
	let mtype = MessageType::from_byte(data[1]).ok_or(CodecError::InvalidType(data[1]))?;

	match mtype {
		MessageType::ChangeRequest
		| MessageType::ChangeResponse
		| MessageType::DropRequest
		| MessageType::DropResponse => parse_edit_v1(mtype, data),
		MessageType::ChangeRequestV2 => parse_edit_v2_request(data),
		MessageType::ChangeResponseV2 => parse_edit_v2_response(data),
		MessageType::ChangeBreakpointRules => {
			parse_meta(data).map(Incoming::ChangeBreakpointRules)
		},
		MessageType::ChangeHistoryRules => parse_meta(data).map(Incoming::ChangeHistoryRules),
		MessageType::Interceptor => {
			if data.len() < 3 {
				return Err(CodecError::TooShort);
			}
			Ok(Incoming::Interceptor {
				enable: data[2] == 1,
			})
		},
		MessageType::Pull => parse_pull(data),
		_ => Err(CodecError::Malformed(format!(
			"unexpected incoming message type {:?}",
			mtype
		))),
	}
}

fn parse_flow_id(data: &[u8], offset: usize) -> Result<Uuid, CodecError> {
	if data.len() < offset + UUID_LEN {
		return Err(CodecError::TooShort);
	}
	let raw = std::str::from_utf8(&data[offset..offset + UUID_LEN])
		.map_err(|e| CodecError::Malformed(e.to_string()))?;
	Uuid::parse_str(raw).map_err(CodecError::InvalidFlowId)
}

fn parse_edit_v1(mtype: MessageType, data: &[u8]) -> Result<Incoming, CodecError> {
	// version(1) + type(1) + flow-id(36)
	let flow_id = parse_flow_id(data, 2)?;
	let decision = match mtype {
		MessageType::DropRequest => EditDecision::DropRequest,
		MessageType::DropResponse => EditDecision::DropResponse,
		MessageType::ChangeRequest | MessageType::ChangeResponse => {
			const HEADER_BASE: usize = 2 + UUID_LEN;
			if data.len() < HEADER_BASE + 4 {
				return Err(CodecError::TooShort);
			}
			let header_len =
				u32::from_be_bytes(data[HEADER_BASE..HEADER_BASE + 4].try_into().unwrap()) as usize;
			let body_len_offset = HEADER_BASE + 4 + header_len;
			if body_len_offset + 4 > data.len() {
				return Err(CodecError::Malformed("header length overruns frame".into()));
			}
			let header_json = &data[HEADER_BASE + 4..body_len_offset];
			let body_len = u32::from_be_bytes(
				data[body_len_offset..body_len_offset + 4]
					.try_into()
					.unwrap(),
			) as usize;
			let body_start = body_len_offset + 4;
			if body_start + body_len != data.len() {
				return Err(CodecError::Malformed(
					"body length does not match remaining frame".into(),
				));
			}
			let header: serde_json::Value = serde_json::from_slice(header_json)
				.map_err(|e| CodecError::Malformed(e.to_string()))?;
			let body = Bytes::copy_from_slice(&data[body_start..]);
			if mtype == MessageType::ChangeRequest {
				EditDecision::ChangeRequest { header, body }
			} else {
				EditDecision::ChangeResponse { header, body }
			}
		},
		_ => unreachable!(),
	};
	Ok(Incoming::Edit { flow_id, decision })
}

fn parse_edit_v2_request(data: &[u8]) -> Result<Incoming, CodecError> {
	let flow_id = parse_flow_id(data, 2)?;
	let content = &data[2 + UUID_LEN..];
	let edit: RequestEditV2 =
		serde_json::from_slice(content).map_err(|e| CodecError::Malformed(e.to_string()))?;
	Ok(Incoming::Edit {
		flow_id,
		decision: EditDecision::ChangeRequestV2(edit),
	})
}

fn parse_edit_v2_response(data: &[u8]) -> Result<Incoming, CodecError> {
	let flow_id = parse_flow_id(data, 2)?;
	let content = &data[2 + UUID_LEN..];
	let edit: ResponseEditV2 =
		serde_json::from_slice(content).map_err(|e| CodecError::Malformed(e.to_string()))?;
	Ok(Incoming::Edit {
		flow_id,
		decision: EditDecision::ChangeResponseV2(edit),
	})
}

/// Meta frames carry no flow-id: `version | type | rule-json`.
fn parse_meta(data: &[u8]) -> Result<Rule, CodecError> {
	if data.len() < 2 {
		return Err(CodecError::TooShort);
	}
	serde_json::from_slice(&data[2..]).map_err(|e| CodecError::Malformed(e.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
struct PullPayload {
	#[serde(default)]
	page: i64,
	#[serde(default, rename = "page_size")]
	page_size: i64,
}

fn parse_pull(data: &[u8]) -> Result<Incoming, CodecError> {
	if data.len() < 2 {
		return Err(CodecError::TooShort);
	}
	let payload: PullPayload =
		serde_json::from_slice(&data[2..]).map_err(|e| CodecError::Malformed(e.to_string()))?;
	Ok(Incoming::Pull {
		page: payload.page,
		page_size: payload.page_size,
	})
}

/// Encodes a proxy→operator flow frame: `version | type | flow-id | wait-flag | content`, where
/// `content` is the JSON-serialized flow snapshot (the preferred form; legacy raw-body framing is
/// not emitted by this implementation, only accepted in spirit via the same JSON envelope).
pub fn encode_flow_frame(mtype: MessageType, flow_id: Uuid, wait: bool, content: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(2 + UUID_LEN + 1 + content.len());
	buf.put_u8(PROTOCOL_VERSION);
	buf.put_u8(mtype as u8);
	buf.put_slice(flow_id.to_string().as_bytes());
	buf.put_u8(if wait { 1 } else { 0 });
	buf.put_slice(content);
	buf.freeze()
}

/// Encodes the `login` control frame: `version | type | zero-uuid | 0 | token`.
pub fn encode_login_frame(token: &str) -> Bytes {
	encode_flow_frame(MessageType::Login, Uuid::nil(), false, token.as_bytes())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_flow_id() -> Uuid {
		Uuid::parse_str("c9d771f2-2f3b-4ab0-9e44-2a4a9f0a1234").unwrap()
	}

	#[test]
	fn flow_frame_round_trips_through_encode() {
		let id = sample_flow_id();
		let frame = encode_flow_frame(MessageType::RequestBody, id, true, b"{}");
		assert_eq!(frame[0], PROTOCOL_VERSION);
		assert_eq!(frame[1], MessageType::RequestBody as u8);
		assert_eq!(&frame[2..2 + UUID_LEN], id.to_string().as_bytes());
		assert_eq!(frame[2 + UUID_LEN], 1);
		assert_eq!(&frame[2 + UUID_LEN + 1..], b"{}");
	}

	#[test]
	fn rejects_too_short_frame() {
		assert!(matches!(parse_message(&[2]), Err(CodecError::TooShort)));
	}

	#[test]
	fn rejects_wrong_version() {
		assert!(matches!(
			parse_message(&[9, 22, 1]),
			Err(CodecError::InvalidVersion(9))
		));
	}

	#[test]
	fn rejects_unknown_type() {
		assert!(matches!(
			parse_message(&[2, 200]),
			Err(CodecError::InvalidType(200))
		));
	}

	#[test]
	fn parses_interceptor_toggle() {
		let data = [2u8, MessageType::Interceptor as u8, 1];
		let msg = parse_message(&data).unwrap();
		assert!(matches!(msg, Incoming::Interceptor { enable: true }));
	}

	#[test]
	fn parses_drop_request_without_tail() {
		let id = sample_flow_id();
		let mut data = vec![2u8, MessageType::DropRequest as u8];
		data.extend_from_slice(id.to_string().as_bytes());
		let msg = parse_message(&data).unwrap();
		match msg {
			Incoming::Edit { flow_id, decision } => {
				assert_eq!(flow_id, id);
				assert!(matches!(decision, EditDecision::DropRequest));
			},
			_ => panic!("expected Edit"),
		}
	}

	#[test]
	fn parses_change_request_v1_header_and_body() {
		let id = sample_flow_id();
		let mut data = vec![2u8, MessageType::ChangeRequest as u8];
		data.extend_from_slice(id.to_string().as_bytes());
		let header = br#"{"Content-Type":["text/plain"]}"#;
		data.extend_from_slice(&(header.len() as u32).to_be_bytes());
		data.extend_from_slice(header);
		let body = b"hello";
		data.extend_from_slice(&(body.len() as u32).to_be_bytes());
		data.extend_from_slice(body);

		let msg = parse_message(&data).unwrap();
		match msg {
			Incoming::Edit { flow_id, decision } => {
				assert_eq!(flow_id, id);
				match decision {
					EditDecision::ChangeRequest { body, .. } => assert_eq!(&body[..], b"hello"),
					_ => panic!("wrong variant"),
				}
			},
			_ => panic!("expected Edit"),
		}
	}

	#[test]
	fn parses_change_request_v2() {
		let id = sample_flow_id();
		let mut data = vec![2u8, MessageType::ChangeRequestV2 as u8];
		data.extend_from_slice(id.to_string().as_bytes());
		let json = br#"{"method":"POST","proto":"HTTP/1.1","rawURL":"http://a.test/x","header":{},"body":"hello"}"#;
		data.extend_from_slice(json);

		let msg = parse_message(&data).unwrap();
		match msg {
			Incoming::Edit {
				decision: EditDecision::ChangeRequestV2(edit),
				..
			} => {
				assert_eq!(edit.method, "POST");
				assert_eq!(edit.raw_url, "http://a.test/x");
				assert_eq!(edit.body, "hello");
			},
			_ => panic!("expected ChangeRequestV2"),
		}
	}

	#[test]
	fn change_breakpoint_and_history_rules_share_payload_shape_but_dispatch_by_type_byte() {
		let rule_json = br#"{"enabled":true,"ignore_extensions":[],"methods":["ANY"],"conditions":[],"phases":["Request"],"script":""}"#;
		let mut bp = vec![2u8, MessageType::ChangeBreakpointRules as u8];
		bp.extend_from_slice(rule_json);
		let mut hr = vec![2u8, MessageType::ChangeHistoryRules as u8];
		hr.extend_from_slice(rule_json);

		assert!(matches!(
			parse_message(&bp).unwrap(),
			Incoming::ChangeBreakpointRules(_)
		));
		assert!(matches!(
			parse_message(&hr).unwrap(),
			Incoming::ChangeHistoryRules(_)
		));
	}

	#[test]
	fn parses_pull() {
		let mut data = vec![2u8, MessageType::Pull as u8];
		data.extend_from_slice(br#"{"page":2,"page_size":10}"#);
		let msg = parse_message(&data).unwrap();
		assert!(matches!(
			msg,
			Incoming::Pull {
				page: 2,
				page_size: 10
			}
		));
	}
}
