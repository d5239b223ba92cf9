#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Social handles attached to a roster entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocialMedia {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub twitch: Option<String>,

	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl SocialMedia {
	fn is_empty(&self) -> bool {
		self.twitch.is_none() && self.extra.is_empty()
	}
}

/// One person from the external roster.
///
/// Unknown roster fields are carried through untouched so the presentation
/// layer sees the same participant object it authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedAccount {
	pub id: String,

	#[serde(rename = "name", alias = "displayName", default)]
	pub display_name: String,

	#[serde(default, skip_serializing_if = "SocialMedia::is_empty")]
	pub social_media: SocialMedia,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub platform_handle: Option<String>,

	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl TrackedAccount {
	pub fn new(id: impl Into<String>, display_name: impl Into<String>, platform_handle: Option<&str>) -> Self {
		Self {
			id: id.into(),
			display_name: display_name.into(),
			social_media: SocialMedia::default(),
			platform_handle: platform_handle.map(str::to_string),
			extra: Map::new(),
		}
	}

	/// Normalized (trimmed, lowercase) streaming-platform login, if any.
	pub fn platform_handle(&self) -> Option<String> {
		self.social_media
			.twitch
			.as_deref()
			.or(self.platform_handle.as_deref())
			.map(|h| h.trim().to_ascii_lowercase())
			.filter(|h| !h.is_empty())
	}
}

/// Collect unique platform handles across a roster, preserving first-seen order.
pub fn unique_handles(accounts: &[TrackedAccount]) -> Vec<String> {
	let mut out: Vec<String> = Vec::new();
	for handle in accounts.iter().filter_map(TrackedAccount::platform_handle) {
		if !out.contains(&handle) {
			out.push(handle);
		}
	}
	out
}

/// A live stream as reported by the Helix streams endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
	pub id: String,
	pub user_id: String,
	pub user_login: String,
	#[serde(default)]
	pub user_name: String,
	#[serde(default)]
	pub game_name: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub viewer_count: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub started_at: Option<String>,

	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Live status of a single tracked account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStatusEntry {
	#[serde(rename = "id")]
	pub account_id: String,

	#[serde(rename = "participant")]
	pub account: TrackedAccount,

	/// `None` when offline or unresolved.
	#[serde(rename = "stream", default)]
	pub live_stream_info: Option<StreamInfo>,
}

impl LiveStatusEntry {
	pub fn offline(account: &TrackedAccount) -> Self {
		Self {
			account_id: account.id.clone(),
			account: account.clone(),
			live_stream_info: None,
		}
	}

	pub fn is_live(&self) -> bool {
		self.live_stream_info.is_some()
	}
}

/// Provenance of a persisted snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotSource {
	Helix,
	Fallback,
	Error,
	NoUserIds,
}

impl SnapshotSource {
	pub const fn as_str(self) -> &'static str {
		match self {
			SnapshotSource::Helix => "helix",
			SnapshotSource::Fallback => "fallback",
			SnapshotSource::Error => "error",
			SnapshotSource::NoUserIds => "noUserIds",
		}
	}
}

impl fmt::Display for SnapshotSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SnapshotSource {
	type Err = SyncError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"helix" => Ok(SnapshotSource::Helix),
			"fallback" => Ok(SnapshotSource::Fallback),
			"error" => Ok(SnapshotSource::Error),
			"noUserIds" => Ok(SnapshotSource::NoUserIds),
			other => Err(SyncError::MalformedPayload(format!("unknown snapshot source: {other}"))),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredMeta")]
pub struct SnapshotMeta {
	/// Unix epoch milliseconds.
	#[serde(rename = "lastUpdated")]
	pub written_at: i64,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source: Option<SnapshotSource>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// Metadata as found on disk. Anything unexpected degrades to "unknown"
/// instead of rejecting the entries next to it.
#[derive(Deserialize)]
struct StoredMeta {
	#[serde(default, rename = "lastUpdated")]
	last_updated: Option<Value>,
	#[serde(default, rename = "writtenAt")]
	written_at: Option<Value>,
	#[serde(default)]
	source: Option<Value>,
	#[serde(default)]
	error: Option<Value>,
}

fn epoch_ms(v: Option<&Value>) -> Option<i64> {
	let v = v?;
	v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

impl From<StoredMeta> for SnapshotMeta {
	fn from(raw: StoredMeta) -> Self {
		Self {
			written_at: epoch_ms(raw.last_updated.as_ref())
				.or_else(|| epoch_ms(raw.written_at.as_ref()))
				.unwrap_or(0),
			source: raw.source.as_ref().and_then(Value::as_str).and_then(|s| s.parse().ok()),
			error: raw.error.as_ref().and_then(Value::as_str).map(str::to_string),
		}
	}
}

/// The persisted live-status document. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
	pub data: Vec<LiveStatusEntry>,
	#[serde(default)]
	pub meta: SnapshotMeta,
}

impl CacheSnapshot {
	pub fn new(data: Vec<LiveStatusEntry>, source: SnapshotSource, written_at: i64) -> Self {
		Self {
			data,
			meta: SnapshotMeta {
				written_at,
				source: Some(source),
				error: None,
			},
		}
	}

	/// Snapshot with one offline entry per tracked account.
	pub fn offline(accounts: &[TrackedAccount], source: SnapshotSource, written_at: i64) -> Self {
		Self::new(accounts.iter().map(LiveStatusEntry::offline).collect(), source, written_at)
	}

	pub fn with_error(mut self, error: impl Into<String>) -> Self {
		self.meta.error = Some(error.into());
		self
	}

	pub fn source(&self) -> Option<SnapshotSource> {
		self.meta.source
	}

	/// True when the entries line up one-to-one, in order, with `accounts`.
	pub fn matches_roster(&self, accounts: &[TrackedAccount]) -> bool {
		self.data.len() == accounts.len() && self.data.iter().zip(accounts).all(|(e, a)| e.account_id == a.id)
	}

	/// Fresh while `now - written_at <= ttl_ms`.
	pub fn is_fresh(&self, now_ms: i64, ttl_ms: i64) -> bool {
		now_ms.saturating_sub(self.meta.written_at) <= ttl_ms
	}
}

/// Why the read path served something other than fresh live data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeReason {
	/// Live refresh failed; the last persisted snapshot is served.
	StaleSnapshot { error: String },
	/// Live refresh failed with nothing persisted; every account is offline.
	NoSnapshot { error: String },
	/// A fresh snapshot exists but was itself written by a failed refresh.
	CachedFailure { error: String },
}

impl DegradeReason {
	pub fn error(&self) -> &str {
		match self {
			Self::StaleSnapshot { error } | Self::NoSnapshot { error } | Self::CachedFailure { error } => error,
		}
	}

	/// Short text suitable for the public `warning` field.
	pub fn warning(&self) -> &'static str {
		match self {
			Self::StaleSnapshot { .. } => "Using fallback due to Twitch API unavailable",
			Self::NoSnapshot { .. } | Self::CachedFailure { .. } => "Live status unavailable; showing everyone offline",
		}
	}
}

/// Outcome of the never-failing read path.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveStatus {
	Ok(Vec<LiveStatusEntry>),
	Degraded {
		entries: Vec<LiveStatusEntry>,
		reason: DegradeReason,
	},
}

impl LiveStatus {
	pub fn entries(&self) -> &[LiveStatusEntry] {
		match self {
			Self::Ok(entries) | Self::Degraded { entries, .. } => entries,
		}
	}

	pub fn into_entries(self) -> Vec<LiveStatusEntry> {
		match self {
			Self::Ok(entries) | Self::Degraded { entries, .. } => entries,
		}
	}

	pub fn degrade_reason(&self) -> Option<&DegradeReason> {
		match self {
			Self::Ok(_) => None,
			Self::Degraded { reason, .. } => Some(reason),
		}
	}

	pub fn is_degraded(&self) -> bool {
		matches!(self, Self::Degraded { .. })
	}
}

/// Synchronization failure taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
	/// Missing credentials, signing secret or base URL.
	#[error("configuration error: {0}")]
	Configuration(String),

	/// Token endpoint rejected us or returned something unusable.
	#[error("upstream auth error: {0}")]
	UpstreamAuth(String),

	/// Non-2xx, timeout or transport failure from the platform API.
	#[error("upstream api error: {message}")]
	UpstreamApi { status: Option<u16>, message: String },

	/// Webhook authentication failure.
	#[error("signature error: {0}")]
	Signature(String),

	#[error("malformed payload: {0}")]
	MalformedPayload(String),

	/// Snapshot persistence failure.
	#[error("snapshot io error: {0}")]
	Io(String),
}

impl SyncError {
	pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
		Self::UpstreamApi {
			status,
			message: message.into(),
		}
	}

	/// Stable identifier used in JSON error bodies and metric labels.
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::Configuration(_) => "configuration",
			Self::UpstreamAuth(_) => "upstream_auth",
			Self::UpstreamApi { .. } => "upstream_api",
			Self::Signature(_) => "signature",
			Self::MalformedPayload(_) => "malformed_payload",
			Self::Io(_) => "io",
		}
	}

	/// HTTP status reflecting the failure class on admin/webhook paths.
	pub const fn http_status(&self) -> u16 {
		match self {
			Self::Configuration(_) | Self::Io(_) => 500,
			Self::UpstreamAuth(_) | Self::UpstreamApi { .. } | Self::MalformedPayload(_) => 502,
			Self::Signature(_) => 401,
		}
	}
}
