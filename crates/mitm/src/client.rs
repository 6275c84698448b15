//! Upstream dialing and request-replay transport collaborator shim.
//!
//! `SPEC_FULL.md` §6 treats "upstream dialing" and "request replay transport" as out-of-scope
//! collaborators; this module is the minimal shim both the proxy-side listener stub
//! ([`crate::proxy`]) and the `proxy/repeat`/`proxy/intruder` endpoints ([`crate::multiplexer`])
//! dial through. Grounded on `original_source/web/web_repeat.go`'s `NewTransport`: when the
//! operator's edited request carries an `X-Mitmproxy-Peer` header, the request is dialed straight
//! at that host instead of whatever the URL itself resolves to.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use reqwest::Url;

use crate::compression;
use crate::flow::FlowResponse;

/// Builds a client pinned to `peer` (an `ip:port` pair), if given, by overriding DNS resolution
/// for `target_host` — the request's own `Host`/URL host is left untouched, matching the
/// original's custom `DialContext`, which dials the peer while the request line keeps its own URL.
pub fn client_for_peer(peer: Option<&str>, target_host: &str) -> anyhow::Result<reqwest::Client> {
	let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
	if let Some(peer) = peer {
		if let Some(addr) = parse_peer_addr(peer) {
			builder = builder.resolve(target_host, addr);
		} else {
			tracing::warn!(peer, "could not parse X-Mitmproxy-Peer as ip:port, ignoring");
		}
	}
	Ok(builder.build()?)
}

fn parse_peer_addr(peer: &str) -> Option<SocketAddr> {
	if let Ok(addr) = peer.parse::<SocketAddr>() {
		return Some(addr);
	}
	let (host, port) = peer.rsplit_once(':')?;
	let port: u16 = port.parse().ok()?;
	let ip: IpAddr = host.parse().ok()?;
	Some(SocketAddr::new(ip, port))
}

/// Looks up a header by case-insensitive name in the request's header map, returning the first
/// value (the same shape `http.Header.Get` has in the original).
pub fn header_lookup<'a>(header: &'a BTreeMap<String, Vec<String>>, name: &str) -> Option<&'a str> {
	header
		.iter()
		.find(|(k, _)| k.eq_ignore_ascii_case(name))
		.and_then(|(_, v)| v.first())
		.map(String::as_str)
}

/// Sends a one-off request and turns the response into a [`FlowResponse`], decompressing the
/// body the same way the history tap does. Used by `proxy/repeat`, `proxy/intruder`, and the
/// proxy-side listener stub's forward path.
pub async fn send_request(
	method: &str,
	raw_url: &str,
	header: &BTreeMap<String, Vec<String>>,
	body: Bytes,
) -> anyhow::Result<FlowResponse> {
	let peer = header_lookup(header, "x-mitmproxy-peer").map(str::to_string);
	let url = Url::parse(raw_url)?;
	let host = url.host_str().unwrap_or_default().to_string();
	let client = client_for_peer(peer.as_deref(), &host)?;

	let method: reqwest::Method = method.parse()?;
	let mut builder = client.request(method, url).body(body);
	for (name, values) in header {
		if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("x-mitmproxy-peer") {
			continue;
		}
		for v in values {
			builder = builder.header(name, v);
		}
	}

	let resp = builder.send().await?;
	let status = resp.status().as_u16();
	let mut resp_header: BTreeMap<String, Vec<String>> = BTreeMap::new();
	for (k, v) in resp.headers() {
		if let Ok(v) = v.to_str() {
			resp_header.entry(k.to_string()).or_default().push(v.to_string());
		}
	}
	let content_encoding = header_lookup(&resp_header, "content-encoding").map(str::to_string);
	let raw_body = resp.bytes().await?;
	let body = compression::decompress(&raw_body, content_encoding.as_deref())
		.await
		.unwrap_or(raw_body);

	Ok(FlowResponse {
		status_code: status,
		proto: "HTTP/1.1".into(),
		header: resp_header,
		body,
	})
}
