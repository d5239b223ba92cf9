#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use starlight_domain::SyncError;
use starlight_util::clock::Clock;
use tracing::{debug, info};

use super::helix::HelixApi;
use crate::SecretString;

/// Tokens are treated as expired this long before their declared expiry.
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Client-credentials pair for the app token exchange.
#[derive(Clone, Debug)]
pub struct AppCredentials {
	pub client_id: String,
	pub client_secret: SecretString,
}

impl AppCredentials {
	/// Both halves must be present and non-blank.
	pub fn from_parts(client_id: Option<&str>, client_secret: Option<&SecretString>) -> Option<Self> {
		let client_id = client_id.map(str::trim).filter(|s| !s.is_empty())?;
		let client_secret = client_secret.filter(|s| !s.expose().trim().is_empty())?;
		Some(Self {
			client_id: client_id.to_string(),
			client_secret: client_secret.clone(),
		})
	}
}

/// App-level bearer credential. Immutable once issued.
#[derive(Clone, Debug)]
pub struct AppToken {
	value: SecretString,
	expires_at_ms: i64,
}

impl AppToken {
	pub fn new(value: impl Into<String>, expires_at_ms: i64) -> Self {
		Self {
			value: SecretString::new(value),
			expires_at_ms,
		}
	}

	pub fn bearer(&self) -> &str {
		self.value.expose()
	}

	pub fn expires_at_ms(&self) -> i64 {
		self.expires_at_ms
	}

	/// Usable until `TOKEN_EXPIRY_SKEW` before the declared expiry.
	pub fn is_usable_at(&self, now_ms: i64) -> bool {
		now_ms < self.expires_at_ms - TOKEN_EXPIRY_SKEW.as_millis() as i64
	}
}

/// Process-wide app token holder.
///
/// Lifecycle: empty at construction, populated on first `get_token`, replaced
/// wholesale once the held token is inside the expiry skew. Two callers racing
/// on an expired token may both hit the token endpoint; the last write wins
/// and both tokens stay valid upstream.
pub struct TokenCache {
	api: Arc<dyn HelixApi>,
	credentials: Option<AppCredentials>,
	clock: Arc<dyn Clock>,
	current: RwLock<Option<AppToken>>,
}

impl TokenCache {
	pub fn new(api: Arc<dyn HelixApi>, credentials: Option<AppCredentials>, clock: Arc<dyn Clock>) -> Self {
		Self {
			api,
			credentials,
			clock,
			current: RwLock::new(None),
		}
	}

	pub fn has_credentials(&self) -> bool {
		self.credentials.is_some()
	}

	/// Cached token, or a fresh one from the token endpoint. No internal retry.
	pub async fn get_token(&self) -> Result<AppToken, SyncError> {
		let Some(credentials) = self.credentials.as_ref() else {
			return Err(SyncError::Configuration(
				"missing TWITCH_CLIENT_ID / TWITCH_CLIENT_SECRET".to_string(),
			));
		};

		let now = self.clock.now_ms();
		let cached = self.current.read().clone();
		if let Some(token) = cached
			&& token.is_usable_at(now)
		{
			return Ok(token);
		}

		debug!("requesting twitch app token");
		let grant = self.api.request_app_token(credentials).await?;
		let token = AppToken::new(grant.access_token, now + grant.expires_in.as_millis() as i64);

		*self.current.write() = Some(token.clone());
		metrics::counter!("starlight_app_token_refresh_total").increment(1);
		info!(expires_in_secs = grant.expires_in.as_secs(), "twitch app token refreshed");

		Ok(token)
	}

	/// Drop the held token so the next `get_token` exchanges again.
	pub fn invalidate(&self) {
		if self.current.write().take().is_some() {
			debug!("twitch app token invalidated");
		}
	}
}

impl fmt::Debug for TokenCache {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TokenCache")
			.field("credentials", &self.credentials)
			.field("populated", &self.current.read().is_some())
			.finish()
	}
}
