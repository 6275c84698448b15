//! Entrypoint: parses CLI args, loads configuration, wires up tracing, and starts the two
//! listeners side by side — the proxy-side stub ([`mitm::proxy`]) and the operator control plane
//! ([`mitm::multiplexer::Multiplexer`]'s axum router) — mirroring `original_source/main.go`'s
//! `main`, which starts the MITM proxy and the web addon's HTTP server as sibling goroutines.

use std::sync::Arc;

use clap::Parser;
use mitm::config;
use mitm::multiplexer::Multiplexer;
use mitm::proxy;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "mitm", about = "Intercepting HTTP(S) proxy with an operator control plane")]
struct Args {
	/// Path to the YAML config file; created with generated defaults if missing.
	#[arg(short, long, default_value = "mitm.yaml")]
	config: String,
}

fn init_tracing() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer())
		.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = Args::parse();

	let cfg = Arc::new(config::load_config(&args.config)?);
	tracing::info!(
		name = %cfg.name,
		proxy = %cfg.proxy_listen(),
		web = %cfg.web_listen(),
		"starting"
	);

	let mux = Multiplexer::new(cfg.clone(), "store.d");

	let web_listener = tokio::net::TcpListener::bind(cfg.web_listen()).await?;
	let router = mux.router();
	let web_addr = cfg.web_listen();
	let web_server = tokio::spawn(async move {
		tracing::info!(addr = %web_addr, "control plane listener started");
		if let Err(e) = axum::serve(web_listener, router).await {
			tracing::error!(error = %e, "control plane server exited");
		}
	});

	let proxy_addr = cfg.proxy_listen();
	tokio::select! {
		res = proxy::serve(&proxy_addr, mux) => {
			if let Err(e) = res {
				tracing::error!(error = %e, "proxy listener exited");
			}
		}
		_ = web_server => {
			tracing::error!("control plane listener exited unexpectedly");
		}
	}

	Ok(())
}
