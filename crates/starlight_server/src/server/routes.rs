#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{Value, json};
use starlight_domain::{CacheSnapshot, LiveStatusEntry, SyncError, unique_handles};
use starlight_platform::twitch::EVENTSUB_CALLBACK_PATH;
use starlight_platform::{WebhookBody, WebhookResponse};
use tracing::{debug, info, warn};

use super::state::AppState;

pub const STREAMS_PATH: &str = "/api/twitch/streams";

const MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;
const STATUS_DEBUG_PREVIEW_CHARS: usize = 2000;
const CACHEPATH_PREVIEW_CHARS: usize = 4000;
const SAMPLE_ENTRIES: usize = 5;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Handler output, independent of the hyper body type.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
	Json(StatusCode, Value),
	Text(StatusCode, String),
}

impl Reply {
	fn ok(body: Value) -> Self {
		Self::Json(StatusCode::OK, body)
	}

	fn error(status: StatusCode, message: &str) -> Self {
		Self::Json(status, json!({ "error": message }))
	}

	fn sync_error(err: &SyncError) -> Self {
		let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		Self::Json(status, json!({ "ok": false, "error": err.to_string(), "kind": err.kind() }))
	}

	pub fn status(&self) -> StatusCode {
		match self {
			Self::Json(status, _) | Self::Text(status, _) => *status,
		}
	}

	fn into_response(self) -> Response<Full<Bytes>> {
		let (status, content_type, body) = match self {
			Self::Json(status, v) => (status, JSON_CONTENT_TYPE, Bytes::from(v.to_string())),
			Self::Text(status, t) => (status, TEXT_CONTENT_TYPE, Bytes::from(t)),
		};
		let mut resp = Response::new(Full::new(body));
		*resp.status_mut() = status;
		resp.headers_mut()
			.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
		resp
	}
}

impl From<WebhookResponse> for Reply {
	fn from(resp: WebhookResponse) -> Self {
		match resp.body {
			WebhookBody::Text(text) => Self::Text(resp.status, text),
			WebhookBody::Json(v) => Self::Json(resp.status, v),
		}
	}
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
	url::form_urlencoded::parse(query?.as_bytes())
		.find(|(k, _)| k == key)
		.map(|(_, v)| v.into_owned())
}

pub async fn handle_request(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();
	let path = parts.uri.path();
	let action = query_param(parts.uri.query(), "action");

	let reply = match path {
		"/healthz" => Reply::Text(StatusCode::OK, "ok".to_string()),
		"/readyz" if state.is_ready() => Reply::Text(StatusCode::OK, "ready".to_string()),
		"/readyz" => Reply::Text(StatusCode::SERVICE_UNAVAILABLE, "not-ready".to_string()),
		STREAMS_PATH => streams(&state, &parts.method, action.as_deref()).await,
		EVENTSUB_CALLBACK_PATH => match &parts.method {
			&Method::GET => eventsub_admin(&state, action.as_deref()).await,
			&Method::POST => match Limited::new(body, MAX_WEBHOOK_BODY_BYTES).collect().await {
				Ok(collected) => eventsub_delivery(&state, &parts.headers, &collected.to_bytes()),
				Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
					metrics::counter!("starlight_eventsub_webhook_rejected_total", "reason" => "too_large").increment(1);
					Reply::error(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large")
				}
				Err(err) => {
					warn!(error = %err, "eventsub webhook body read failed");
					Reply::error(StatusCode::BAD_REQUEST, "Unreadable body")
				}
			},
			_ => Reply::error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
		},
		_ => Reply::error(StatusCode::NOT_FOUND, "Not found"),
	};

	debug!(method = %parts.method, path, status = reply.status().as_u16(), "request handled");
	Ok(reply.into_response())
}

/// `/api/twitch/streams`: public live status plus the refresh/debug actions.
pub async fn streams(state: &AppState, method: &Method, action: Option<&str>) -> Reply {
	if method != Method::GET {
		let fallback: Vec<LiveStatusEntry> = state.live.roster().iter().map(LiveStatusEntry::offline).collect();
		return Reply::ok(json!({ "data": fallback, "warning": "Only GET supported on this endpoint" }));
	}

	match action {
		Some("debug") => streams_debug(state).await,
		Some("refresh") => match state.live.refresh().await {
			Ok(snapshot) => Reply::ok(json!({
				"ok": true,
				"count": snapshot.data.len(),
				"source": snapshot.source(),
				"sample": sample(&snapshot),
			})),
			Err(err) => Reply::sync_error(&err),
		},
		_ => {
			let status = state.live.get_live_status(state.cache_ttl).await;
			let warning = status.degrade_reason().map(|r| r.warning());
			let mut body = json!({ "data": status.entries() });
			if let Some(warning) = warning {
				body["warning"] = Value::from(warning);
			}
			Reply::ok(body)
		}
	}
}

fn sample(snapshot: &CacheSnapshot) -> &[LiveStatusEntry] {
	&snapshot.data[..snapshot.data.len().min(SAMPLE_ENTRIES)]
}

async fn streams_debug(state: &AppState) -> Reply {
	let store = state.live.store();
	let cache_exists = store.exists().await;
	let cache_preview = match store.preview(STATUS_DEBUG_PREVIEW_CHARS).await {
		Ok(preview) => preview.map(Value::from).unwrap_or(Value::Null),
		Err(err) => Value::from(err.to_string()),
	};

	let token = state.live.tokens().get_token().await;
	let live_sample = match &token {
		Ok(_) => match state.live.probe().await {
			Ok(snapshot) => json!(sample(&snapshot)),
			Err(err) => json!({ "error": err.to_string() }),
		},
		Err(err) => json!({ "error": err.to_string() }),
	};

	let creds = state.credentials;
	Reply::ok(json!({
		"ok": true,
		"env": {
			"TWITCH_CLIENT_ID": creds.client_id,
			"TWITCH_CLIENT_SECRET": creds.client_secret,
			"TWITCH_EVENTSUB_SECRET": creds.eventsub_secret,
			"BASE_URL": creds.base_url,
		},
		"cacheFile": store.path().display().to_string(),
		"cacheExists": cache_exists,
		"cachePreview": cache_preview,
		"token": token.is_ok(),
		"liveSample": live_sample,
	}))
}

/// `GET /api/twitch/eventsub?action=…` admin and diagnostic actions.
pub async fn eventsub_admin(state: &AppState, action: Option<&str>) -> Reply {
	match action {
		Some("subscribe") => subscribe(state).await,
		Some("list") => match state.reconciler.list_subscriptions().await {
			Ok(subs) => Reply::ok(json!({ "ok": true, "total": subs.len(), "data": subs })),
			Err(err) => {
				warn!(error = %err, "list subscriptions failed");
				Reply::sync_error(&err)
			}
		},
		Some("cachepath") => {
			let store = state.live.store();
			match store.preview(CACHEPATH_PREVIEW_CHARS).await {
				Ok(preview) => Reply::ok(json!({
					"cacheFile": store.path().display().to_string(),
					"exists": preview.is_some(),
					"preview": preview,
				})),
				Err(err) => Reply::sync_error(&err),
			}
		}
		_ => Reply::error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
	}
}

/// Resolve roster handles and reconcile webhook subscriptions for them.
pub async fn subscribe(state: &AppState) -> Reply {
	if let Err(err) = state.reconciler.ensure_configured() {
		return Reply::sync_error(&err);
	}

	let roster = state.live.roster();
	if unique_handles(roster).is_empty() {
		return Reply::ok(json!({ "message": "No twitch logins found in participants" }));
	}

	let ids = match state.reconciler.resolve_account_ids(roster).await {
		Ok(ids) => ids,
		Err(err) => {
			warn!(error = %err, "resolving broadcaster ids failed");
			return Reply::sync_error(&err);
		}
	};
	if ids.is_empty() {
		return Reply::ok(json!({ "message": "No user ids found for given logins" }));
	}

	match state.reconciler.ensure_subscriptions(&ids).await {
		Ok(report) => {
			info!(
				created = report.created_count,
				errors = report.errors.len(),
				"eventsub subscribe action finished"
			);
			Reply::ok(json!({ "ok": true, "result": report }))
		}
		Err(err) => {
			warn!(error = %err, "eventsub subscribe action failed");
			Reply::sync_error(&err)
		}
	}
}

/// `POST /api/twitch/eventsub`: platform delivery.
pub fn eventsub_delivery(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Reply {
	state.webhook.handle(headers, body).into()
}
