//! Proxy-side listener stub: the addon contract (§6) inbound side.
//!
//! The TLS-MITM engine, CA/cert generation, connection lifecycle, and HTTP parsing are all
//! out-of-scope collaborators per `SPEC_FULL.md` §1 — the corpus's own TLS-MITM stack lives in
//! `agentgateway`'s `proxy`/`client` modules and is far larger than the control plane this repo
//! transforms. This module is the minimal stand-in `SPEC_FULL.md` §A.4 asks for: a plain-HTTP
//! forward listener that builds a [`Flow`] per request, drives it through the four phase
//! callbacks against the shared [`Multiplexer`], and forwards upstream — enough to exercise
//! C1-C6 end to end without pretending to reimplement a MITM engine.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::client;
use crate::flow::{Flow, FlowRequest, FlowResponse, Phase};
use crate::multiplexer::Multiplexer;

pub async fn serve(addr: &str, mux: Arc<Multiplexer>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	tracing::info!(addr, "proxy listener started");
	loop {
		let (stream, peer) = listener.accept().await?;
		let mux = mux.clone();
		tokio::spawn(async move {
			let io = TokioIo::new(stream);
			let service = service_fn(move |req| handle(req, peer, mux.clone()));
			if let Err(e) = hyper::server::conn::http1::Builder::new()
				.serve_connection(io, service)
				.await
			{
				tracing::debug!(error = %e, peer = %peer, "proxy connection ended");
			}
		});
	}
}

async fn handle(
	req: Request<Incoming>,
	peer: SocketAddr,
	mux: Arc<Multiplexer>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
	let flow_id = Uuid::new_v4();
	let conn_id = Uuid::new_v4();
	let (parts, body) = req.into_parts();
	let body_bytes = body
		.collect()
		.await
		.map(|collected| collected.to_bytes())
		.unwrap_or_default();

	let mut flow = Flow::new(flow_id, conn_id, peer.to_string(), false);
	flow.request = FlowRequest {
		method: parts.method.to_string(),
		url: parts.uri.to_string(),
		proto: format!("{:?}", parts.version),
		header: headers_to_map(&parts.headers),
		body: body_bytes,
	};

	mux.dispatch(Phase::RequestHeaders, &mut flow).await;
	mux.dispatch(Phase::RequestBody, &mut flow).await;

	if flow.response.is_none() {
		match forward(&flow).await {
			Ok(resp) => flow.response = Some(resp),
			Err(e) => {
				tracing::warn!(error = %e, flow_id = %flow_id, "upstream dispatch failed");
				flow.response = Some(FlowResponse {
					status_code: 502,
					..Default::default()
				});
			},
		}
	}

	mux.dispatch(Phase::ResponseHeaders, &mut flow).await;
	mux.dispatch(Phase::ResponseBody, &mut flow).await;
	mux.dispatch(Phase::ServerDisconnected, &mut flow).await;

	Ok(flow_to_response(&flow))
}

async fn forward(flow: &Flow) -> anyhow::Result<FlowResponse> {
	client::send_request(
		&flow.request.method,
		&flow.request.url,
		&flow.request.header,
		flow.request.body.clone(),
	)
	.await
}

fn headers_to_map(headers: &hyper::HeaderMap) -> std::collections::BTreeMap<String, Vec<String>> {
	let mut map: std::collections::BTreeMap<String, Vec<String>> = std::collections::BTreeMap::new();
	for (name, value) in headers.iter() {
		if let Ok(v) = value.to_str() {
			map.entry(name.to_string()).or_default().push(v.to_string());
		}
	}
	map
}

fn flow_to_response(flow: &Flow) -> Response<Full<Bytes>> {
	let response = flow.response.clone().unwrap_or(FlowResponse {
		status_code: 502,
		..Default::default()
	});
	let mut builder = Response::builder().status(response.status_code);
	for (name, values) in &response.header {
		for v in values {
			builder = builder.header(name.as_str(), v.as_str());
		}
	}
	builder
		.body(Full::new(response.body))
		.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flow_to_response_defaults_to_bad_gateway_when_unset() {
		let flow = Flow::new(Uuid::new_v4(), Uuid::new_v4(), "c".into(), false);
		let resp = flow_to_response(&flow);
		assert_eq!(resp.status(), 502);
	}

	#[test]
	fn headers_to_map_preserves_values() {
		let mut headers = hyper::HeaderMap::new();
		headers.insert("x-test", "value".parse().unwrap());
		let map = headers_to_map(&headers);
		assert_eq!(map.get("x-test"), Some(&vec!["value".to_string()]));
	}
}
