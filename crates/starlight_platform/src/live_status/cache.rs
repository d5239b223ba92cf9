#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use starlight_domain::{
	CacheSnapshot, DegradeReason, LiveStatus, LiveStatusEntry, SnapshotSource, StreamInfo, SyncError, TrackedAccount,
	unique_handles,
};
use starlight_util::clock::Clock;
use tracing::{debug, info, warn};

use super::store::SnapshotStore;
use crate::twitch::eventsub::LiveStatusRefresher;
use crate::twitch::helix::HelixApi;
use crate::twitch::token::TokenCache;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(30_000);

/// Persisted, TTL-bounded view of which tracked accounts are live.
///
/// The read path never fails: it serves a fresh snapshot, a live refresh, the
/// last persisted snapshot, or an all-offline roster, in that order.
/// A fresh snapshot written for a different roster counts as stale.
pub struct LiveStatusCache {
	api: Arc<dyn HelixApi>,
	tokens: Arc<TokenCache>,
	store: SnapshotStore,
	roster: Vec<TrackedAccount>,
	clock: Arc<dyn Clock>,
}

impl LiveStatusCache {
	pub fn new(
		api: Arc<dyn HelixApi>,
		tokens: Arc<TokenCache>,
		store: SnapshotStore,
		roster: Vec<TrackedAccount>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			api,
			tokens,
			store,
			roster,
			clock,
		}
	}

	pub fn roster(&self) -> &[TrackedAccount] {
		&self.roster
	}

	pub fn store(&self) -> &SnapshotStore {
		&self.store
	}

	pub fn tokens(&self) -> &TokenCache {
		&self.tokens
	}

	pub async fn get_live_status(&self, ttl: Duration) -> LiveStatus {
		let now = self.clock.now_ms();

		if let Some(snapshot) = self.read_prior().await
			&& snapshot.is_fresh(now, ttl.as_millis() as i64)
			&& snapshot.matches_roster(&self.roster)
		{
			metrics::counter!("starlight_live_status_cache_hits_total").increment(1);
			if snapshot.source() == Some(SnapshotSource::Error) {
				let error = snapshot.meta.error.clone().unwrap_or_default();
				return LiveStatus::Degraded {
					entries: snapshot.data,
					reason: DegradeReason::CachedFailure { error },
				};
			}
			return LiveStatus::Ok(snapshot.data);
		}

		self.refresh_or_fallback().await
	}

	/// Live refresh with the fallback chain applied on failure.
	pub async fn refresh_or_fallback(&self) -> LiveStatus {
		match self.refresh().await {
			Ok(snapshot) => LiveStatus::Ok(snapshot.data),
			Err(err) => self.fallback_after_error(err).await,
		}
	}

	/// Fetch from upstream and persist. Persistence failures are logged only.
	pub async fn refresh(&self) -> Result<CacheSnapshot, SyncError> {
		metrics::counter!("starlight_live_refresh_attempts_total").increment(1);

		let snapshot = match self.fetch().await {
			Ok(snapshot) => snapshot,
			Err(err) => {
				metrics::counter!("starlight_live_refresh_failures_total", "kind" => err.kind()).increment(1);
				if matches!(err, SyncError::UpstreamAuth(_)) {
					self.tokens.invalidate();
				}
				warn!(error = %err, "live status refresh failed");
				return Err(err);
			}
		};

		metrics::counter!("starlight_live_refresh_success_total").increment(1);
		if let Err(err) = self.store.write(&snapshot).await {
			warn!(error = %err, "live status snapshot not persisted");
		}

		info!(
			entries = snapshot.data.len(),
			live = snapshot.data.iter().filter(|e| e.is_live()).count(),
			source = %snapshot.source().map(SnapshotSource::as_str).unwrap_or(""),
			"live status refreshed"
		);
		Ok(snapshot)
	}

	/// Fetch without touching the persisted snapshot.
	pub async fn probe(&self) -> Result<CacheSnapshot, SyncError> {
		self.fetch().await
	}

	async fn fetch(&self) -> Result<CacheSnapshot, SyncError> {
		let handles = unique_handles(&self.roster);
		if handles.is_empty() {
			debug!("no tracked account has a platform handle");
			return Ok(CacheSnapshot::offline(&self.roster, SnapshotSource::Fallback, self.clock.now_ms()));
		}

		let token = self.tokens.get_token().await?;
		let users = self.api.get_users_by_login(&token, &handles).await?;
		let id_by_login: HashMap<String, String> = users
			.into_iter()
			.map(|u| (u.login.to_ascii_lowercase(), u.id))
			.collect();

		let mut user_ids: Vec<String> = Vec::new();
		for id in id_by_login.values() {
			if !user_ids.contains(id) {
				user_ids.push(id.clone());
			}
		}
		if user_ids.is_empty() {
			debug!(handles = handles.len(), "no handles resolved to user ids");
			return Ok(CacheSnapshot::offline(&self.roster, SnapshotSource::NoUserIds, self.clock.now_ms()));
		}

		let streams = self.api.get_streams_by_user_id(&token, &user_ids).await?;
		let mut stream_by_user: HashMap<String, StreamInfo> = HashMap::with_capacity(streams.len());
		for stream in streams {
			stream_by_user.entry(stream.user_id.clone()).or_insert(stream);
		}

		let entries = self
			.roster
			.iter()
			.map(|account| {
				let live_stream_info = account
					.platform_handle()
					.and_then(|login| id_by_login.get(&login))
					.and_then(|id| stream_by_user.get(id))
					.cloned();
				LiveStatusEntry {
					account_id: account.id.clone(),
					account: account.clone(),
					live_stream_info,
				}
			})
			.collect();

		Ok(CacheSnapshot::new(entries, SnapshotSource::Helix, self.clock.now_ms()))
	}

	async fn fallback_after_error(&self, err: SyncError) -> LiveStatus {
		metrics::counter!("starlight_live_status_fallback_total").increment(1);
		let error = err.to_string();

		if let Some(prior) = self.read_prior().await {
			debug!(source = ?prior.source(), "serving prior snapshot after refresh failure");
			return LiveStatus::Degraded {
				entries: prior.data,
				reason: DegradeReason::StaleSnapshot { error },
			};
		}

		let snapshot =
			CacheSnapshot::offline(&self.roster, SnapshotSource::Error, self.clock.now_ms()).with_error(error.clone());
		if let Err(e) = self.store.write(&snapshot).await {
			warn!(error = %e, "error snapshot not persisted");
		}
		LiveStatus::Degraded {
			entries: snapshot.data,
			reason: DegradeReason::NoSnapshot { error },
		}
	}

	async fn read_prior(&self) -> Option<CacheSnapshot> {
		match self.store.read().await {
			Ok(snapshot) => snapshot,
			Err(err) => {
				warn!(error = %err, "live status cache unreadable");
				None
			}
		}
	}
}

#[async_trait::async_trait]
impl LiveStatusRefresher for LiveStatusCache {
	async fn refresh_after_notification(&self) {
		if let LiveStatus::Degraded { reason, .. } = self.refresh_or_fallback().await {
			warn!(error = reason.error(), "notification-triggered refresh degraded");
		}
	}
}
