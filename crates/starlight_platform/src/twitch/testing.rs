#![forbid(unsafe_code)]

//! In-memory `HelixApi` for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, json};
use starlight_domain::{StreamInfo, SyncError};

use super::helix::{HelixApi, HelixListSubscriptionsResponse, HelixPagination, HelixSubscriptionData, HelixUser, TokenGrant};
use super::subscriptions::SubscriptionDescriptor;
use super::token::{AppCredentials, AppToken};

#[derive(Default)]
struct State {
	token_ttl: Option<Duration>,
	token_error: Option<SyncError>,

	users: Vec<HelixUser>,
	users_error: Option<SyncError>,
	last_logins: Vec<String>,

	streams: Vec<StreamInfo>,
	streams_error: Option<SyncError>,

	subscriptions: Vec<HelixSubscriptionData>,
	page_size: usize,
	fail_create_for: HashSet<(String, String)>,
}

#[derive(Default)]
pub struct FakeHelix {
	state: Mutex<State>,
	token_calls: AtomicUsize,
	user_calls: AtomicUsize,
	stream_calls: AtomicUsize,
	list_calls: AtomicUsize,
	create_calls: AtomicUsize,
	creates_in_flight: AtomicUsize,
	peak_creates_in_flight: AtomicUsize,
	create_delay: Mutex<Option<Duration>>,
}

pub fn user(id: &str, login: &str) -> HelixUser {
	HelixUser {
		id: id.to_string(),
		login: login.to_string(),
		display_name: None,
	}
}

pub fn stream(user_id: &str, login: &str, viewers: u64) -> StreamInfo {
	StreamInfo {
		id: format!("s-{user_id}"),
		user_id: user_id.to_string(),
		user_login: login.to_string(),
		user_name: login.to_string(),
		game_name: "Just Chatting".to_string(),
		title: format!("{login} live"),
		viewer_count: viewers,
		started_at: Some("2024-01-01T00:00:00Z".to_string()),
		extra: Map::new(),
	}
}

pub fn subscription(id: &str, broadcaster: &str, kind: &str) -> HelixSubscriptionData {
	HelixSubscriptionData {
		id: id.to_string(),
		status: "enabled".to_string(),
		r#type: kind.to_string(),
		version: "1".to_string(),
		condition: json!({ "broadcaster_user_id": broadcaster }),
		transport: Some(json!({ "method": "webhook", "callback": "https://example.test/api/twitch/eventsub" })),
		extra: Map::new(),
	}
}

impl FakeHelix {
	pub fn set_token_ttl(&self, ttl: Duration) {
		self.state.lock().token_ttl = Some(ttl);
	}

	pub fn fail_token(&self, err: SyncError) {
		self.state.lock().token_error = Some(err);
	}

	pub fn set_users(&self, users: Vec<HelixUser>) {
		self.state.lock().users = users;
	}

	pub fn fail_users(&self, err: SyncError) {
		self.state.lock().users_error = Some(err);
	}

	pub fn set_streams(&self, streams: Vec<StreamInfo>) {
		self.state.lock().streams = streams;
	}

	pub fn fail_streams(&self, err: SyncError) {
		self.state.lock().streams_error = Some(err);
	}

	pub fn clear_stream_failure(&self) {
		self.state.lock().streams_error = None;
	}

	pub fn set_subscriptions(&self, subs: Vec<HelixSubscriptionData>) {
		self.state.lock().subscriptions = subs;
	}

	pub fn subscriptions(&self) -> Vec<HelixSubscriptionData> {
		self.state.lock().subscriptions.clone()
	}

	pub fn set_page_size(&self, n: usize) {
		self.state.lock().page_size = n;
	}

	pub fn fail_create_for(&self, account_id: &str, kind: &str) {
		self.state
			.lock()
			.fail_create_for
			.insert((account_id.to_string(), kind.to_string()));
	}

	/// Hold each create open for `delay` so overlapping calls can be observed.
	pub fn set_create_delay(&self, delay: Duration) {
		*self.create_delay.lock() = Some(delay);
	}

	pub fn peak_creates_in_flight(&self) -> usize {
		self.peak_creates_in_flight.load(Ordering::SeqCst)
	}

	pub fn last_logins(&self) -> Vec<String> {
		self.state.lock().last_logins.clone()
	}

	pub fn token_calls(&self) -> usize {
		self.token_calls.load(Ordering::SeqCst)
	}

	pub fn user_calls(&self) -> usize {
		self.user_calls.load(Ordering::SeqCst)
	}

	pub fn stream_calls(&self) -> usize {
		self.stream_calls.load(Ordering::SeqCst)
	}

	pub fn list_calls(&self) -> usize {
		self.list_calls.load(Ordering::SeqCst)
	}

	pub fn create_calls(&self) -> usize {
		self.create_calls.load(Ordering::SeqCst)
	}

	pub fn total_calls(&self) -> usize {
		self.token_calls() + self.user_calls() + self.stream_calls() + self.list_calls() + self.create_calls()
	}
}

#[async_trait::async_trait]
impl HelixApi for FakeHelix {
	async fn request_app_token(&self, _credentials: &AppCredentials) -> Result<TokenGrant, SyncError> {
		let n = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
		let st = self.state.lock();
		if let Some(err) = st.token_error.clone() {
			return Err(err);
		}
		Ok(TokenGrant {
			access_token: format!("token-{n}"),
			expires_in: st.token_ttl.unwrap_or(Duration::from_secs(3600)),
		})
	}

	async fn get_users_by_login(&self, _token: &AppToken, logins: &[String]) -> Result<Vec<HelixUser>, SyncError> {
		self.user_calls.fetch_add(1, Ordering::SeqCst);
		let mut st = self.state.lock();
		st.last_logins = logins.to_vec();
		if let Some(err) = st.users_error.clone() {
			return Err(err);
		}
		Ok(st
			.users
			.iter()
			.filter(|u| logins.iter().any(|l| l.eq_ignore_ascii_case(&u.login)))
			.cloned()
			.collect())
	}

	async fn get_streams_by_user_id(&self, _token: &AppToken, user_ids: &[String]) -> Result<Vec<StreamInfo>, SyncError> {
		self.stream_calls.fetch_add(1, Ordering::SeqCst);
		let st = self.state.lock();
		if let Some(err) = st.streams_error.clone() {
			return Err(err);
		}
		Ok(st
			.streams
			.iter()
			.filter(|s| user_ids.contains(&s.user_id))
			.cloned()
			.collect())
	}

	async fn list_eventsub_subscriptions(
		&self,
		_token: &AppToken,
		after: Option<&str>,
	) -> Result<HelixListSubscriptionsResponse, SyncError> {
		self.list_calls.fetch_add(1, Ordering::SeqCst);
		let st = self.state.lock();
		let page_size = if st.page_size == 0 { 100 } else { st.page_size };
		let start = match after {
			Some(cursor) => cursor
				.parse::<usize>()
				.map_err(|_| SyncError::upstream(Some(400), format!("bad cursor {cursor}")))?,
			None => 0,
		};
		let end = (start + page_size).min(st.subscriptions.len());
		let data = st.subscriptions.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
		let pagination = (end < st.subscriptions.len()).then(|| HelixPagination {
			cursor: Some(end.to_string()),
		});
		Ok(HelixListSubscriptionsResponse { data, pagination })
	}

	async fn create_eventsub_subscription(
		&self,
		_token: &AppToken,
		descriptor: &SubscriptionDescriptor,
	) -> Result<HelixSubscriptionData, SyncError> {
		let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
		let in_flight = self.creates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.peak_creates_in_flight.fetch_max(in_flight, Ordering::SeqCst);
		let delay = *self.create_delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		self.creates_in_flight.fetch_sub(1, Ordering::SeqCst);

		let kind = descriptor.event_type.as_helix_type();
		let mut st = self.state.lock();
		if st
			.fail_create_for
			.contains(&(descriptor.account_id.clone(), kind.to_string()))
		{
			return Err(SyncError::upstream(Some(400), format!("create rejected for {}", descriptor.account_id)));
		}
		let sub = subscription(&format!("sub-{n}"), &descriptor.account_id, kind);
		st.subscriptions.push(sub.clone());
		Ok(sub)
	}
}
