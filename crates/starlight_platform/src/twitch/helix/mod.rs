#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use starlight_domain::{StreamInfo, SyncError};
use starlight_util::text::truncate_chars;
use url::Url;

use super::subscriptions::SubscriptionDescriptor;
use super::token::{AppCredentials, AppToken};

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const USERS_PATH: &str = "/helix/users";
const STREAMS_PATH: &str = "/helix/streams";
const TOKEN_PATH: &str = "/oauth2/token";

pub const DEFAULT_API_BASE_URL: &str = "https://api.twitch.tv";
pub const DEFAULT_AUTH_BASE_URL: &str = "https://id.twitch.tv";

/// Helix accepts at most this many `login`/`user_id` query params per request.
pub const HELIX_BATCH_LIMIT: usize = 100;

const ERROR_BODY_MAX_CHARS: usize = 500;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(5);
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Upstream calls the synchronization components depend on.
#[async_trait::async_trait]
pub trait HelixApi: Send + Sync + 'static {
	/// Client-credentials exchange against the token endpoint.
	async fn request_app_token(&self, credentials: &AppCredentials) -> Result<TokenGrant, SyncError>;

	async fn get_users_by_login(&self, token: &AppToken, logins: &[String]) -> Result<Vec<HelixUser>, SyncError>;

	async fn get_streams_by_user_id(&self, token: &AppToken, user_ids: &[String]) -> Result<Vec<StreamInfo>, SyncError>;

	/// One page of EventSub subscriptions.
	async fn list_eventsub_subscriptions(
		&self,
		token: &AppToken,
		after: Option<&str>,
	) -> Result<HelixListSubscriptionsResponse, SyncError>;

	async fn create_eventsub_subscription(
		&self,
		token: &AppToken,
		descriptor: &SubscriptionDescriptor,
	) -> Result<HelixSubscriptionData, SyncError>;
}

/// Follow the pagination cursor until exhausted.
pub async fn list_all_eventsub_subscriptions(
	api: &dyn HelixApi,
	token: &AppToken,
) -> Result<Vec<HelixSubscriptionData>, SyncError> {
	let mut out: Vec<HelixSubscriptionData> = Vec::new();
	let mut after: Option<String> = None;

	loop {
		let page = api.list_eventsub_subscriptions(token, after.as_deref()).await?;

		out.extend(page.data);

		let next = page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty());
		if next.is_none() {
			break;
		}
		after = next;
	}

	Ok(out)
}

/// Base URLs for the Helix API and the OAuth token endpoint.
#[derive(Debug, Clone)]
pub struct HelixEndpoints {
	pub api_base_url: String,
	pub auth_base_url: String,
}

impl Default for HelixEndpoints {
	fn default() -> Self {
		Self {
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
		}
	}
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

fn transport_error(label: &str, err: reqwest::Error) -> SyncError {
	if err.is_timeout() {
		SyncError::upstream(None, format!("helix {label} timed out"))
	} else {
		SyncError::upstream(None, format!("helix {label} send: {err}"))
	}
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> Result<reqwest::Response, SyncError> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.map_err(|e| transport_error(label, e))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		return Err(SyncError::UpstreamAuth(format!(
			"helix {label} auth failed (status={status}) body={}",
			truncate_chars(&body, ERROR_BODY_MAX_CHARS)
		)));
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& delay <= MAX_RETRY_AFTER
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		return retry.send().await.map_err(|e| transport_error(label, e));
	}

	Ok(resp)
}

/// Read the body and fail on non-2xx; body text is kept (truncated) in the error.
async fn read_success_body(resp: reqwest::Response, label: &'static str) -> Result<String, SyncError> {
	let status = resp.status();
	let body = resp
		.text()
		.await
		.map_err(|e| SyncError::upstream(Some(status.as_u16()), format!("helix {label} read body: {e}")))?;

	if !status.is_success() {
		return Err(SyncError::upstream(
			Some(status.as_u16()),
			format!(
				"helix {label} failed: status={status} body={}",
				truncate_chars(&body, ERROR_BODY_MAX_CHARS)
			),
		));
	}

	Ok(body)
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &str, label: &'static str) -> Result<T, SyncError> {
	serde_json::from_str(body).map_err(|e| SyncError::MalformedPayload(format!("helix {label} parse json: {e}")))
}

#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	api_base: Url,
	token_url: Url,
	client_id: String,
}

impl HelixClient {
	/// `timeout` bounds every request, connect through body.
	pub fn new(client_id: impl Into<String>, endpoints: &HelixEndpoints, timeout: Duration) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("starlight/0.x (helix)")
			.timeout(timeout)
			.build()
			.context("build reqwest client")?;

		let api_base = base_url(&endpoints.api_base_url)
			.with_context(|| format!("parse helix api base url {}", endpoints.api_base_url))?;
		let token_url = base_url(&endpoints.auth_base_url)
			.and_then(|u| join_under(&u, TOKEN_PATH))
			.with_context(|| format!("parse oauth base url {}", endpoints.auth_base_url))?;

		Ok(Self {
			http,
			api_base,
			token_url,
			client_id: client_id.into(),
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder, token: &AppToken) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", token.bearer()))
	}

	fn url(&self, path_and_query: &str) -> Result<Url, SyncError> {
		join_under(&self.api_base, path_and_query).map_err(|e| SyncError::Configuration(format!("join helix url {path_and_query}: {e}")))
	}
}

/// Parse a base URL so that any path prefix survives joins (`https://proxy/twitch`
/// becomes `https://proxy/twitch/`).
fn base_url(raw: &str) -> Result<Url, url::ParseError> {
	let mut url = Url::parse(raw.trim())?;
	if !url.path().ends_with('/') {
		let path = format!("{}/", url.path());
		url.set_path(&path);
	}
	Ok(url)
}

/// Join relative to the base path instead of replacing it.
fn join_under(base: &Url, path_and_query: &str) -> Result<Url, url::ParseError> {
	base.join(path_and_query.trim_start_matches('/'))
}

fn repeated_query(path: &str, key: &str, values: &[String], extra: Option<&str>) -> String {
	let mut q = values
		.iter()
		.map(|v| format!("{key}={}", urlencoding::encode(v)))
		.collect::<Vec<_>>()
		.join("&");
	if let Some(extra) = extra {
		if !q.is_empty() {
			q.push('&');
		}
		q.push_str(extra);
	}
	format!("{path}?{q}")
}

#[async_trait::async_trait]
impl HelixApi for HelixClient {
	async fn request_app_token(&self, credentials: &AppCredentials) -> Result<TokenGrant, SyncError> {
		let resp = self
			.http
			.post(self.token_url.clone())
			.form(&[
				("grant_type", "client_credentials"),
				("client_id", credentials.client_id.as_str()),
				("client_secret", credentials.client_secret.expose()),
			])
			.send()
			.await
			.map_err(|e| SyncError::UpstreamAuth(format!("twitch app token request: {e}")))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.map_err(|e| SyncError::UpstreamAuth(format!("twitch app token read body: {e}")))?;

		if !status.is_success() {
			return Err(SyncError::UpstreamAuth(format!(
				"twitch app token failed: status={status} body={}",
				truncate_chars(&body, ERROR_BODY_MAX_CHARS)
			)));
		}

		let parsed: TwitchTokenResponse = serde_json::from_str(&body)
			.map_err(|e| SyncError::UpstreamAuth(format!("twitch app token parse json: {e}")))?;

		token_grant_from_response(parsed)
	}

	async fn get_users_by_login(&self, token: &AppToken, logins: &[String]) -> Result<Vec<HelixUser>, SyncError> {
		let mut out = Vec::with_capacity(logins.len());
		for chunk in logins.chunks(HELIX_BATCH_LIMIT) {
			let url = self.url(&repeated_query(USERS_PATH, "login", chunk, None))?;
			let resp = send_with_retry(self.authed(self.http.get(url), token), "GET /helix/users").await?;
			let body = read_success_body(resp, "GET /helix/users").await?;
			let parsed: HelixUsersResponse = parse_json(&body, "GET /helix/users")?;
			out.extend(parsed.data);
		}
		Ok(out)
	}

	async fn get_streams_by_user_id(&self, token: &AppToken, user_ids: &[String]) -> Result<Vec<StreamInfo>, SyncError> {
		let mut out = Vec::new();
		for chunk in user_ids.chunks(HELIX_BATCH_LIMIT) {
			let url = self.url(&repeated_query(STREAMS_PATH, "user_id", chunk, Some("first=100")))?;
			let resp = send_with_retry(self.authed(self.http.get(url), token), "GET /helix/streams").await?;
			let body = read_success_body(resp, "GET /helix/streams").await?;
			let parsed: HelixStreamsResponse = parse_json(&body, "GET /helix/streams")?;
			out.extend(parsed.data);
		}
		Ok(out)
	}

	async fn list_eventsub_subscriptions(
		&self,
		token: &AppToken,
		after: Option<&str>,
	) -> Result<HelixListSubscriptionsResponse, SyncError> {
		let mut path = format!("{EVENTSUB_SUBSCRIPTIONS_PATH}?first=100");
		if let Some(after) = after {
			path.push_str("&after=");
			path.push_str(&urlencoding::encode(after));
		}

		let url = self.url(&path)?;
		let resp = send_with_retry(self.authed(self.http.get(url), token), "GET /helix/eventsub/subscriptions").await?;
		let body = read_success_body(resp, "GET /helix/eventsub/subscriptions").await?;
		parse_json(&body, "GET /helix/eventsub/subscriptions")
	}

	async fn create_eventsub_subscription(
		&self,
		token: &AppToken,
		descriptor: &SubscriptionDescriptor,
	) -> Result<HelixSubscriptionData, SyncError> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let kind = descriptor.event_type.as_helix_type();

		let req = HelixCreateSubscriptionRequest {
			r#type: kind,
			version: "1",
			condition: HelixBroadcasterCondition {
				broadcaster_user_id: &descriptor.account_id,
			},
			transport: HelixWebhookTransport {
				method: "webhook",
				callback: &descriptor.callback_url,
				secret: descriptor.signing_secret.expose(),
			},
		};

		let resp = send_with_retry(
			self.authed(self.http.post(url), token).json(&req),
			"POST /helix/eventsub/subscriptions",
		)
		.await?;

		if resp.status() == StatusCode::CONFLICT {
			let body = resp.text().await.unwrap_or_default();
			return Err(SyncError::upstream(
				Some(StatusCode::CONFLICT.as_u16()),
				format!(
					"helix create subscription conflict (type={kind}): body={}",
					truncate_chars(&body, ERROR_BODY_MAX_CHARS)
				),
			));
		}

		let body = read_success_body(resp, "POST /helix/eventsub/subscriptions").await?;
		let parsed: HelixCreateSubscriptionResponse = parse_json(&body, "POST /helix/eventsub/subscriptions")?;
		parsed
			.data
			.into_iter()
			.next()
			.ok_or_else(|| SyncError::MalformedPayload(format!("helix create subscription returned empty data (type={kind})")))
	}
}

#[derive(Debug, Deserialize)]
struct TwitchTokenResponse {
	#[serde(default)]
	access_token: Option<String>,
	#[serde(default)]
	expires_in: Option<u64>,
}

/// Result of a successful client-credentials exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
	pub access_token: String,
	pub expires_in: Duration,
}

fn token_grant_from_response(resp: TwitchTokenResponse) -> Result<TokenGrant, SyncError> {
	let access_token = resp
		.access_token
		.filter(|t| !t.trim().is_empty())
		.ok_or_else(|| SyncError::UpstreamAuth("no access_token in twitch token response".to_string()))?;

	let secs = resp.expires_in.filter(|s| *s > 0).unwrap_or(DEFAULT_TOKEN_TTL_SECS);

	Ok(TokenGrant {
		access_token,
		expires_in: Duration::from_secs(secs),
	})
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixUsersResponse {
	pub(crate) data: Vec<HelixUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
	pub id: String,
	pub login: String,

	#[serde(default)]
	pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixStreamsResponse {
	pub(crate) data: Vec<StreamInfo>,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'static str,
	version: &'static str,
	condition: HelixBroadcasterCondition<'a>,
	transport: HelixWebhookTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixBroadcasterCondition<'a> {
	broadcaster_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixWebhookTransport<'a> {
	method: &'static str,
	callback: &'a str,
	secret: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixCreateSubscriptionResponse {
	pub(crate) data: Vec<HelixSubscriptionData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelixListSubscriptionsResponse {
	pub data: Vec<HelixSubscriptionData>,

	#[serde(default)]
	pub pagination: Option<HelixPagination>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelixPagination {
	#[serde(default)]
	pub cursor: Option<String>,
}

/// An existing EventSub subscription; unknown fields are kept for verbatim listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelixSubscriptionData {
	pub id: String,

	#[serde(default)]
	pub status: String,

	#[serde(rename = "type")]
	pub r#type: String,

	#[serde(default)]
	pub version: String,

	#[serde(default)]
	pub condition: Value,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub transport: Option<Value>,

	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl HelixSubscriptionData {
	/// `condition.broadcaster_user_id`, empty when absent.
	pub fn broadcaster_user_id(&self) -> &str {
		self.condition
			.get("broadcaster_user_id")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
	}
}
