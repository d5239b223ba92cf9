#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use starlight_platform::SecretString;
use starlight_platform::live_status::{DEFAULT_CACHE_TTL, default_cache_path};
use starlight_platform::twitch::EVENTSUB_CALLBACK_PATH;
use starlight_platform::twitch::helix::{DEFAULT_API_BASE_URL, DEFAULT_AUTH_BASE_URL};
use starlight_util::endpoint::public_url;
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "http://127.0.0.1:3000";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);
const DEFAULT_RECONCILE_CONCURRENCY: usize = 4;

/// Default config path: `~/.starlight/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".starlight").join("config.toml"))
}

/// Load the config from TOML, then apply process env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP listen endpoint (`http://host:port`).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// JSON roster of tracked participants.
	pub roster_path: Option<PathBuf>,
	pub cache_path: PathBuf,
	pub cache_ttl: Duration,
	/// Bound on every upstream call.
	pub request_timeout: Duration,
	/// Run the reconciler on this period when set.
	pub reconcile_interval: Option<Duration>,
	pub reconcile_concurrency: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
			roster_path: None,
			cache_path: default_cache_path(),
			cache_ttl: DEFAULT_CACHE_TTL,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			reconcile_interval: None,
			reconcile_concurrency: DEFAULT_RECONCILE_CONCURRENCY,
		}
	}
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	/// Shared EventSub webhook signing secret.
	pub eventsub_secret: Option<SecretString>,
	/// Externally reachable base URL of this service.
	pub base_url: Option<String>,
	pub api_base_url: String,
	pub auth_base_url: String,
}

impl Default for TwitchSettings {
	fn default() -> Self {
		Self {
			client_id: None,
			client_secret: None,
			eventsub_secret: None,
			base_url: None,
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
		}
	}
}

impl TwitchSettings {
	/// EventSub callback URL derived from `base_url`.
	pub fn callback_url(&self) -> Option<String> {
		self.base_url
			.as_deref()
			.map(|base| public_url(base, EVENTSUB_CALLBACK_PATH))
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	roster_path: Option<String>,
	cache_path: Option<String>,
	cache_ttl_ms: Option<u64>,
	request_timeout_ms: Option<u64>,
	reconcile_interval_secs: Option<u64>,
	reconcile_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	eventsub_secret: Option<String>,
	base_url: Option<String>,
	api_base_url: Option<String>,
	auth_base_url: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		let server = ServerSettings {
			bind: non_blank(file.server.bind).unwrap_or(defaults.bind),
			metrics_bind: non_blank(file.server.metrics_bind),
			roster_path: non_blank(file.server.roster_path).map(PathBuf::from),
			cache_path: non_blank(file.server.cache_path)
				.map(PathBuf::from)
				.unwrap_or(defaults.cache_path),
			cache_ttl: file
				.server
				.cache_ttl_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.cache_ttl),
			request_timeout: file
				.server
				.request_timeout_ms
				.filter(|v| *v > 0)
				.map(Duration::from_millis)
				.unwrap_or(defaults.request_timeout),
			reconcile_interval: file
				.server
				.reconcile_interval_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs),
			reconcile_concurrency: file
				.server
				.reconcile_concurrency
				.filter(|v| *v > 0)
				.unwrap_or(defaults.reconcile_concurrency),
		};

		let twitch = TwitchSettings {
			client_id: non_blank(file.twitch.client_id),
			client_secret: non_blank(file.twitch.client_secret).map(SecretString::new),
			eventsub_secret: non_blank(file.twitch.eventsub_secret).map(SecretString::new),
			base_url: non_blank(file.twitch.base_url),
			api_base_url: non_blank(file.twitch.api_base_url).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
			auth_base_url: non_blank(file.twitch.auth_base_url).unwrap_or_else(|| DEFAULT_AUTH_BASE_URL.to_string()),
		};

		Self { server, twitch }
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `TWITCH_*`, `BASE_URL` and `STARLIGHT_*` overrides read through `env`.
pub(crate) fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| non_blank(env(key));

	if let Some(v) = var("TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = var("TWITCH_EVENTSUB_SECRET") {
		cfg.twitch.eventsub_secret = Some(SecretString::new(v));
		info!("twitch config: eventsub_secret overridden by env");
	}

	if let Some(v) = var("BASE_URL") {
		info!(base_url = %v, "twitch config: base_url overridden by env");
		cfg.twitch.base_url = Some(v);
	}

	if let Some(v) = var("STARLIGHT_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = var("STARLIGHT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("STARLIGHT_ROSTER_PATH") {
		cfg.server.roster_path = Some(PathBuf::from(v));
		info!("server config: roster_path overridden by env");
	}

	if let Some(v) = var("STARLIGHT_CACHE_PATH") {
		cfg.server.cache_path = PathBuf::from(v);
		info!("server config: cache_path overridden by env");
	}

	if let Some(v) = var("STARLIGHT_CACHE_TTL_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.cache_ttl = Duration::from_millis(ms);
		info!(ms, "server config: cache_ttl overridden by env");
	}

	if let Some(v) = var("STARLIGHT_REQUEST_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.server.request_timeout = Duration::from_millis(ms);
		info!(ms, "server config: request_timeout overridden by env");
	}

	if let Some(v) = var("STARLIGHT_RECONCILE_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.server.reconcile_interval = (secs > 0).then(|| Duration::from_secs(secs));
		info!(secs, "server config: reconcile_interval overridden by env");
	}

	if cfg.twitch.client_id.is_none() || cfg.twitch.client_secret.is_none() {
		warn!("twitch config: client credentials missing; live refresh and subscriptions will report configuration errors");
	}
	if cfg.twitch.eventsub_secret.is_none() {
		warn!("twitch config: no eventsub_secret; webhook deliveries will be refused");
	}
	if cfg.twitch.base_url.is_none() {
		warn!("twitch config: no base_url; subscriptions cannot be created");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(toml_src).unwrap();
		ServerConfig::from_file(file)
	}

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.server.bind, DEFAULT_BIND);
		assert_eq!(cfg.server.cache_ttl, Duration::from_millis(30_000));
		assert_eq!(cfg.server.request_timeout, Duration::from_millis(10_000));
		assert_eq!(cfg.server.reconcile_concurrency, 4);
		assert!(cfg.server.reconcile_interval.is_none());
		assert!(cfg.server.cache_path.ends_with("starlight_streams.json"));
		assert_eq!(cfg.twitch.api_base_url, "https://api.twitch.tv");
		assert!(cfg.twitch.client_id.is_none());
	}

	#[test]
	fn file_values_are_normalized() {
		let cfg = parse(
			r#"
[server]
bind = "http://0.0.0.0:8080"
cache_path = "/var/tmp/streams.json"
cache_ttl_ms = 5000
reconcile_interval_secs = 0

[twitch]
client_id = "  cid  "
client_secret = "   "
eventsub_secret = "whsec"
base_url = "https://starlight.example/"
"#,
		);
		assert_eq!(cfg.server.bind, "http://0.0.0.0:8080");
		assert_eq!(cfg.server.cache_path, PathBuf::from("/var/tmp/streams.json"));
		assert_eq!(cfg.server.cache_ttl, Duration::from_millis(5000));
		assert!(cfg.server.reconcile_interval.is_none());
		assert_eq!(cfg.twitch.client_id.as_deref(), Some("cid"));
		assert!(cfg.twitch.client_secret.is_none());
		assert_eq!(
			cfg.twitch.callback_url().as_deref(),
			Some("https://starlight.example/api/twitch/eventsub")
		);
	}

	#[test]
	fn env_overrides_win_over_file() {
		let mut cfg = parse("[twitch]\nclient_id = \"from-file\"\n");
		let env: HashMap<&str, &str> = HashMap::from([
			("TWITCH_CLIENT_ID", "from-env"),
			("TWITCH_CLIENT_SECRET", "sec"),
			("BASE_URL", "https://env.example"),
			("STARLIGHT_CACHE_TTL_MS", "1234"),
			("STARLIGHT_RECONCILE_INTERVAL_SECS", "600"),
			("STARLIGHT_REQUEST_TIMEOUT_MS", "not-a-number"),
			("TWITCH_EVENTSUB_SECRET", "   "),
		]);

		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.twitch.client_id.as_deref(), Some("from-env"));
		assert_eq!(cfg.twitch.client_secret.as_ref().map(|s| s.expose()), Some("sec"));
		assert_eq!(cfg.twitch.base_url.as_deref(), Some("https://env.example"));
		assert_eq!(cfg.server.cache_ttl, Duration::from_millis(1234));
		assert_eq!(cfg.server.reconcile_interval, Some(Duration::from_secs(600)));
		assert_eq!(cfg.server.request_timeout, Duration::from_millis(10_000));
		assert!(cfg.twitch.eventsub_secret.is_none());
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let dir = tempfile::tempdir().unwrap();
		assert!(read_toml_if_exists(&dir.path().join("nope.toml")).unwrap().is_none());
	}

	#[test]
	fn malformed_file_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		std::fs::write(&path, "[server\nbind = 1").unwrap();
		assert!(load_server_config_from_path(&path).is_err());
	}
}
