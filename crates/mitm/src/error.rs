//! Typed error taxonomy for the wire codec, rule engine, and history store.
//!
//! Each component gets its own `thiserror` enum that callers match on; outer boundaries (config
//! loading, the CLI entrypoint) use `anyhow` instead, matching the split the teacher uses between
//! `cel::Error`/`http::compression::Error` and its top-level `main`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame shorter than the minimum header")]
	TooShort,
	#[error("unsupported protocol version: {0}")]
	InvalidVersion(u8),
	#[error("unknown message type: {0}")]
	InvalidType(u8),
	#[error("invalid flow id: {0}")]
	InvalidFlowId(#[from] uuid::Error),
	#[error("malformed frame: {0}")]
	Malformed(String),
}

#[derive(Debug, Error)]
pub enum RuleError {
	#[error("script compile error: {0}")]
	ScriptCompile(String),
	#[error("script execution error: {0}")]
	ScriptExecution(String),
}

#[derive(Debug, Error)]
pub enum HistoryError {
	#[error("store error: {0}")]
	Store(#[from] sled::Error),
	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("flow not found: {0}")]
	NotFound(uuid::Uuid),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}
