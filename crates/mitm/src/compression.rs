//! Buffered gzip/deflate/brotli/zstd decompression for bodies captured into history.
//!
//! Flow bodies are always fully buffered by the time they reach the history store, so this
//! operates on `Bytes` in and `Bytes` out rather than streaming a live `http_body::Body`.

use async_compression::tokio::bufread::{
	BrotliDecoder, BrotliEncoder, GzipDecoder, GzipEncoder, ZlibDecoder, ZlibEncoder, ZstdDecoder,
	ZstdEncoder,
};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

const GZIP: &str = "gzip";
const DEFLATE: &str = "deflate";
const BR: &str = "br";
const ZSTD: &str = "zstd";

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unsupported content encoding: {0}")]
	UnsupportedEncoding(String),
	#[error("multiple content encodings are not supported")]
	MultipleEncodings,
	#[error("decompression failed: {0}")]
	Io(#[from] std::io::Error),
}

enum EncodingDecision {
	None,
	Single(&'static str),
	Multiple,
	Unsupported(String),
}

/// Parses a `Content-Encoding` header value, identifying at most one supported codec.
/// `identity` tokens are ignored per RFC 9110 ยง8.4.1, so `"identity, gzip"` is treated as `gzip`.
fn detect_encoding(raw: &str) -> EncodingDecision {
	let mut supported_count = 0;
	let mut single_supported = None;
	let mut unknown = None;

	for token in raw.split(',') {
		let token = token.trim();
		if token.is_empty() || token.eq_ignore_ascii_case("identity") {
			continue;
		}
		if token.eq_ignore_ascii_case(GZIP) {
			supported_count += 1;
			single_supported = Some(GZIP);
		} else if token.eq_ignore_ascii_case(DEFLATE) {
			supported_count += 1;
			single_supported = Some(DEFLATE);
		} else if token.eq_ignore_ascii_case(BR) {
			supported_count += 1;
			single_supported = Some(BR);
		} else if token.eq_ignore_ascii_case(ZSTD) {
			supported_count += 1;
			single_supported = Some(ZSTD);
		} else {
			unknown = Some(token.to_string());
		}
	}

	if let Some(u) = unknown {
		return EncodingDecision::Unsupported(u);
	}
	match supported_count {
		0 => EncodingDecision::None,
		1 => single_supported.map(EncodingDecision::Single).unwrap_or(EncodingDecision::None),
		_ => EncodingDecision::Multiple,
	}
}

/// Decompresses `body` according to a raw `Content-Encoding` header value. Returns the body
/// unchanged if the header is absent, empty, or only `identity`.
pub async fn decompress(body: &[u8], content_encoding: Option<&str>) -> Result<Bytes, Error> {
	let Some(raw) = content_encoding else {
		return Ok(Bytes::copy_from_slice(body));
	};
	match detect_encoding(raw) {
		EncodingDecision::None => Ok(Bytes::copy_from_slice(body)),
		EncodingDecision::Multiple => Err(Error::MultipleEncodings),
		EncodingDecision::Unsupported(u) => Err(Error::UnsupportedEncoding(u)),
		EncodingDecision::Single(enc) => decode(body, enc).await,
	}
}

async fn decode(body: &[u8], encoding: &str) -> Result<Bytes, Error> {
	let reader = BufReader::new(body);
	let decoder: Box<dyn AsyncRead + Unpin + Send> = match encoding {
		GZIP => Box::new(GzipDecoder::new(reader)),
		DEFLATE => Box::new(ZlibDecoder::new(reader)),
		BR => Box::new(BrotliDecoder::new(reader)),
		ZSTD => Box::new(ZstdDecoder::new(reader)),
		other => return Err(Error::UnsupportedEncoding(other.to_string())),
	};
	read_to_bytes(decoder).await
}

/// Encodes `body` with the given codec name. Exercised directly by this module's round-trip
/// tests; kept alongside `decompress` as the pair a body codec module exposes.
pub async fn encode(body: &[u8], encoding: &str) -> Result<Bytes, Error> {
	let reader = BufReader::new(body);
	let encoder: Box<dyn AsyncRead + Unpin + Send> = match encoding {
		GZIP => Box::new(GzipEncoder::new(reader)),
		DEFLATE => Box::new(ZlibEncoder::new(reader)),
		BR => Box::new(BrotliEncoder::new(reader)),
		ZSTD => Box::new(ZstdEncoder::new(reader)),
		other => return Err(Error::UnsupportedEncoding(other.to_string())),
	};
	read_to_bytes(encoder).await
}

async fn read_to_bytes<R: AsyncRead + Unpin>(mut reader: R) -> Result<Bytes, Error> {
	let mut buffer = BytesMut::with_capacity(8192);
	reader.read_buf(&mut buffer).await?;
	loop {
		let n = reader.read_buf(&mut buffer).await?;
		if n == 0 {
			break;
		}
	}
	Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn identity_passthrough() {
		let out = decompress(b"hello", Some("identity")).await.unwrap();
		assert_eq!(out, Bytes::from_static(b"hello"));
	}

	#[tokio::test]
	async fn no_header_passthrough() {
		let out = decompress(b"hello", None).await.unwrap();
		assert_eq!(out, Bytes::from_static(b"hello"));
	}

	#[tokio::test]
	async fn gzip_round_trip() {
		let original = b"hello world from a round trip test";
		let compressed = encode(original, GZIP).await.unwrap();
		let out = decompress(&compressed, Some(GZIP)).await.unwrap();
		assert_eq!(out.as_ref(), original.as_slice());
	}

	#[tokio::test]
	async fn brotli_round_trip() {
		let original = b"some response body worth compressing";
		let compressed = encode(original, BR).await.unwrap();
		let out = decompress(&compressed, Some(BR)).await.unwrap();
		assert_eq!(out.as_ref(), original.as_slice());
	}

	#[tokio::test]
	async fn identity_gzip_treated_as_gzip() {
		let original = b"identity then gzip";
		let compressed = encode(original, GZIP).await.unwrap();
		let out = decompress(&compressed, Some("identity, gzip")).await.unwrap();
		assert_eq!(out.as_ref(), original.as_slice());
	}

	#[tokio::test]
	async fn multiple_encodings_rejected() {
		let err = decompress(b"hello", Some("gzip, br")).await.unwrap_err();
		assert!(matches!(err, Error::MultipleEncodings));
	}

	#[tokio::test]
	async fn unsupported_encoding_rejected() {
		let err = decompress(b"hello", Some("bogus")).await.unwrap_err();
		assert!(matches!(err, Error::UnsupportedEncoding(_)));
	}
}
