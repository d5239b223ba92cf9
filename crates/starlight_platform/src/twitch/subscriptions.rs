#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use starlight_domain::{SyncError, TrackedAccount, unique_handles};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::helix::{HelixApi, HelixSubscriptionData, list_all_eventsub_subscriptions};
use super::token::TokenCache;
use crate::SecretString;

/// Path the platform delivers EventSub callbacks to, relative to the public base URL.
pub const EVENTSUB_CALLBACK_PATH: &str = "/api/twitch/eventsub";

const DEFAULT_MAX_CONCURRENT_CREATES: usize = 4;

/// Stream lifecycle events this service subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamEventType {
	#[serde(rename = "stream.online")]
	Online,
	#[serde(rename = "stream.offline")]
	Offline,
}

impl StreamEventType {
	pub const ALL: [StreamEventType; 2] = [StreamEventType::Online, StreamEventType::Offline];

	pub const fn as_helix_type(self) -> &'static str {
		match self {
			Self::Online => "stream.online",
			Self::Offline => "stream.offline",
		}
	}
}

/// A desired or existing webhook registration. Identity is `(account_id, event_type)`.
#[derive(Debug, Clone)]
pub struct SubscriptionDescriptor {
	pub event_type: StreamEventType,
	pub account_id: String,
	pub callback_url: String,
	pub signing_secret: SecretString,
}

impl SubscriptionDescriptor {
	fn key(&self) -> (String, &'static str) {
		(self.account_id.clone(), self.event_type.as_helix_type())
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionFailure {
	pub account_id: String,
	pub event_type: StreamEventType,
	pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
	pub created_count: usize,
	#[serde(rename = "createdSubs")]
	pub created: Vec<HelixSubscriptionData>,
	pub errors: Vec<SubscriptionFailure>,
}

/// Webhook settings the reconciler needs; both are required to create anything.
#[derive(Debug, Clone, Default)]
pub struct WebhookTarget {
	pub callback_url: Option<String>,
	pub signing_secret: Option<SecretString>,
}

/// Closes the gap between desired and existing EventSub webhook subscriptions.
pub struct SubscriptionReconciler {
	api: Arc<dyn HelixApi>,
	tokens: Arc<TokenCache>,
	target: WebhookTarget,
	max_concurrent_creates: usize,
}

impl SubscriptionReconciler {
	pub fn new(api: Arc<dyn HelixApi>, tokens: Arc<TokenCache>, target: WebhookTarget) -> Self {
		Self {
			api,
			tokens,
			target,
			max_concurrent_creates: DEFAULT_MAX_CONCURRENT_CREATES,
		}
	}

	pub fn with_max_concurrent_creates(mut self, n: usize) -> Self {
		self.max_concurrent_creates = n.max(1);
		self
	}

	fn require_target(&self) -> Result<(&str, &SecretString), SyncError> {
		let Some(secret) = self.target.signing_secret.as_ref().filter(|s| !s.expose().is_empty()) else {
			return Err(SyncError::Configuration("missing TWITCH_EVENTSUB_SECRET".to_string()));
		};
		let Some(callback) = self.target.callback_url.as_deref().filter(|s| !s.trim().is_empty()) else {
			return Err(SyncError::Configuration("missing BASE_URL".to_string()));
		};
		if !self.tokens.has_credentials() {
			return Err(SyncError::Configuration(
				"missing TWITCH_CLIENT_ID / TWITCH_CLIENT_SECRET".to_string(),
			));
		}
		Ok((callback, secret))
	}

	/// Fails with the same configuration error `ensure_subscriptions` would.
	pub fn ensure_configured(&self) -> Result<(), SyncError> {
		self.require_target().map(|_| ())
	}

	/// Desired set: one online and one offline subscription per account.
	pub fn desired_subscriptions(&self, account_ids: &[String]) -> Result<Vec<SubscriptionDescriptor>, SyncError> {
		let (callback, secret) = self.require_target()?;
		let mut seen = HashSet::new();
		let mut out = Vec::with_capacity(account_ids.len() * 2);
		for id in account_ids.iter().filter(|id| seen.insert(id.as_str())) {
			for event_type in StreamEventType::ALL {
				out.push(SubscriptionDescriptor {
					event_type,
					account_id: id.clone(),
					callback_url: callback.to_string(),
					signing_secret: secret.clone(),
				});
			}
		}
		Ok(out)
	}

	/// Create whatever is missing. Per-item failures are collected, never fatal.
	pub async fn ensure_subscriptions(&self, account_ids: &[String]) -> Result<ReconcileReport, SyncError> {
		let desired = self.desired_subscriptions(account_ids)?;
		if desired.is_empty() {
			debug!("no accounts to subscribe");
			return Ok(ReconcileReport::default());
		}

		let token = self.tokens.get_token().await?;
		let existing = list_all_eventsub_subscriptions(self.api.as_ref(), &token).await?;
		let existing_keys: HashSet<(String, String)> = existing
			.iter()
			.map(|s| (s.broadcaster_user_id().to_string(), s.r#type.clone()))
			.collect();

		let missing: Vec<SubscriptionDescriptor> = desired
			.into_iter()
			.filter(|d| {
				let (id, ty) = d.key();
				!existing_keys.contains(&(id, ty.to_string()))
			})
			.collect();

		info!(
			existing = existing.len(),
			missing = missing.len(),
			"eventsub reconcile computed"
		);

		if missing.is_empty() {
			return Ok(ReconcileReport::default());
		}

		let sem = Arc::new(Semaphore::new(self.max_concurrent_creates));
		let attempts = missing.iter().map(|descriptor| {
			let sem = Arc::clone(&sem);
			let token = &token;
			async move {
				let _permit = sem.acquire().await;
				let result = self.api.create_eventsub_subscription(token, descriptor).await;
				(descriptor, result)
			}
		});
		let results = futures::future::join_all(attempts).await;

		let mut report = ReconcileReport::default();
		for (descriptor, result) in results {
			match result {
				Ok(sub) => {
					metrics::counter!("starlight_eventsub_subscriptions_created_total").increment(1);
					info!(
						broadcaster = %descriptor.account_id,
						kind = descriptor.event_type.as_helix_type(),
						id = %sub.id,
						"eventsub subscription created"
					);
					report.created.push(sub);
				}
				Err(err) => {
					metrics::counter!("starlight_eventsub_subscription_failures_total").increment(1);
					warn!(
						broadcaster = %descriptor.account_id,
						kind = descriptor.event_type.as_helix_type(),
						error = %err,
						"eventsub subscription create failed"
					);
					report.errors.push(SubscriptionFailure {
						account_id: descriptor.account_id.clone(),
						event_type: descriptor.event_type,
						error: err.to_string(),
					});
				}
			}
		}
		report.created_count = report.created.len();

		Ok(report)
	}

	/// Resolve roster handles to platform user ids.
	pub async fn resolve_account_ids(&self, accounts: &[TrackedAccount]) -> Result<Vec<String>, SyncError> {
		let logins = unique_handles(accounts);
		if logins.is_empty() {
			return Ok(Vec::new());
		}
		let token = self.tokens.get_token().await?;
		let users = self.api.get_users_by_login(&token, &logins).await?;
		Ok(users.into_iter().map(|u| u.id).collect())
	}

	/// Every subscription currently registered for this app.
	pub async fn list_subscriptions(&self) -> Result<Vec<HelixSubscriptionData>, SyncError> {
		let token = self.tokens.get_token().await?;
		list_all_eventsub_subscriptions(self.api.as_ref(), &token).await
	}
}
