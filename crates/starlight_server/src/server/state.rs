#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use starlight_platform::{EventSubWebhook, LiveStatusCache, SubscriptionReconciler};

/// Which secrets were configured; values are never exposed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialPresence {
	pub client_id: bool,
	pub client_secret: bool,
	pub eventsub_secret: bool,
	pub base_url: bool,
}

/// Shared handles for request handlers.
pub struct AppState {
	pub live: Arc<LiveStatusCache>,
	pub reconciler: Arc<SubscriptionReconciler>,
	pub webhook: EventSubWebhook,
	pub cache_ttl: Duration,
	pub credentials: CredentialPresence,
	ready: AtomicBool,
}

impl AppState {
	pub fn new(
		live: Arc<LiveStatusCache>,
		reconciler: Arc<SubscriptionReconciler>,
		webhook: EventSubWebhook,
		cache_ttl: Duration,
		credentials: CredentialPresence,
	) -> Self {
		Self {
			live,
			reconciler,
			webhook,
			cache_ttl,
			credentials,
			ready: AtomicBool::new(false),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}
