#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use starlight_platform::live_status::{LiveStatusCache, SnapshotStore};
use starlight_platform::twitch::helix::{HelixApi, HelixClient, HelixEndpoints};
use starlight_platform::twitch::{AppCredentials, EventSubWebhook, SubscriptionReconciler, TokenCache, WebhookTarget};
use starlight_util::clock::SystemClock;
use starlight_util::endpoint::HttpEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::http::run_http_server;
use crate::server::reconcile_task::spawn_periodic_reconcile;
use crate::server::roster::load_roster;
use crate::server::state::{AppState, CredentialPresence};

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: starlight_server [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Listen endpoint (default: {})\n\
\t          Format: http://host:port\n\
\t--config   Config file (default: ~/.starlight/config.toml)\n\
\t--help     Show this help\n\
",
		config::DEFAULT_BIND
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args { bind: None, config: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(raw: &str) -> SocketAddr {
	let bind = HttpEndpoint::parse(raw).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,starlight_server=debug,starlight_platform=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("starlight_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let bind_addr = resolve_bind(args.bind.as_deref().unwrap_or(&cfg.server.bind));

	let roster = load_roster(cfg.server.roster_path.as_deref());

	let endpoints = HelixEndpoints {
		api_base_url: cfg.twitch.api_base_url.clone(),
		auth_base_url: cfg.twitch.auth_base_url.clone(),
	};
	let helix = HelixClient::new(
		cfg.twitch.client_id.clone().unwrap_or_default(),
		&endpoints,
		cfg.server.request_timeout,
	)
	.context("build helix client")?;
	let api: Arc<dyn HelixApi> = Arc::new(helix);

	let clock = Arc::new(SystemClock);
	let credentials = AppCredentials::from_parts(cfg.twitch.client_id.as_deref(), cfg.twitch.client_secret.as_ref());
	let tokens = Arc::new(TokenCache::new(Arc::clone(&api), credentials, clock.clone()));

	let live = Arc::new(LiveStatusCache::new(
		Arc::clone(&api),
		Arc::clone(&tokens),
		SnapshotStore::new(cfg.server.cache_path.clone()),
		roster.clone(),
		clock,
	));
	info!(path = %cfg.server.cache_path.display(), ttl_ms = cfg.server.cache_ttl.as_millis() as u64, "live status cache ready");

	let reconciler = Arc::new(
		SubscriptionReconciler::new(
			Arc::clone(&api),
			Arc::clone(&tokens),
			WebhookTarget {
				callback_url: cfg.twitch.callback_url(),
				signing_secret: cfg.twitch.eventsub_secret.clone(),
			},
		)
		.with_max_concurrent_creates(cfg.server.reconcile_concurrency),
	);

	let webhook = EventSubWebhook::new(cfg.twitch.eventsub_secret.clone(), live.clone());

	if let Some(every) = cfg.server.reconcile_interval {
		info!(every_secs = every.as_secs(), "periodic eventsub reconcile enabled");
		spawn_periodic_reconcile(Arc::clone(&reconciler), roster, every);
	}

	let presence = CredentialPresence {
		client_id: cfg.twitch.client_id.is_some(),
		client_secret: cfg.twitch.client_secret.is_some(),
		eventsub_secret: cfg.twitch.eventsub_secret.is_some(),
		base_url: cfg.twitch.base_url.is_some(),
	};
	let state = Arc::new(AppState::new(live, reconciler, webhook, cfg.server.cache_ttl, presence));

	run_http_server(bind_addr, state).await
}
