#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::routes::handle_request;
use super::state::AppState;

/// Accept loop for the public HTTP surface. One task per connection.
pub async fn run_http_server(bind: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind http listener on {bind}"))?;
	info!(%bind, "http server listening");
	state.mark_ready();

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(err) => {
				warn!(error = %err, "http accept failed");
				continue;
			}
		};
		metrics::counter!("starlight_http_connections_total").increment(1);

		let io = TokioIo::new(stream);
		let state = Arc::clone(&state);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, %remote, "http connection error");
			}
		});
	}
}
