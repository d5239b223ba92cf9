#![forbid(unsafe_code)]

//! EventSub webhook delivery handling.
//!
//! Each delivery is authenticated and dispatched on its own; nothing is kept
//! between requests. The handler is transport-agnostic: the HTTP layer hands
//! over the header map and the exact body bytes.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use sha2::Sha256;
use starlight_domain::SyncError;
use tracing::{debug, info, warn};

use crate::SecretString;

pub const HEADER_MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "twitch-eventsub-message-signature";
pub const HEADER_MESSAGE_TYPE: &str = "twitch-eventsub-message-type";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
	Verification,
	Notification,
	Revocation,
	Unknown(String),
}

impl MessageType {
	pub fn parse(raw: &str) -> Self {
		match raw {
			"webhook_callback_verification" => Self::Verification,
			"notification" => Self::Notification,
			"revocation" => Self::Revocation,
			other => Self::Unknown(other.to_string()),
		}
	}
}

/// `sha256=` + hex(HMAC-SHA256(secret, id ++ timestamp ++ body)).
pub fn compute_signature(secret: &[u8], message_id: &[u8], timestamp: &[u8], body: &[u8]) -> Result<String, SyncError> {
	let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
		.map_err(|e| SyncError::Configuration(format!("invalid eventsub signing secret: {e}")))?;
	mac.update(message_id);
	mac.update(timestamp);
	mac.update(body);
	Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

pub fn verify_signature(secret: &[u8], message_id: &[u8], timestamp: &[u8], body: &[u8], provided: &[u8]) -> bool {
	match compute_signature(secret, message_id, timestamp, body) {
		Ok(expected) => constant_time_eq(expected.as_bytes(), provided),
		Err(_) => false,
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookBody {
	/// `text/plain`, returned verbatim.
	Text(String),
	Json(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
	pub status: StatusCode,
	pub body: WebhookBody,
}

impl WebhookResponse {
	fn json(status: StatusCode, body: Value) -> Self {
		Self {
			status,
			body: WebhookBody::Json(body),
		}
	}

	fn error(status: StatusCode, message: &str) -> Self {
		Self::json(status, json!({ "error": message }))
	}

	fn text(body: impl Into<String>) -> Self {
		Self {
			status: StatusCode::OK,
			body: WebhookBody::Text(body.into()),
		}
	}
}

/// Receiver of stream online/offline notifications.
#[async_trait::async_trait]
pub trait LiveStatusRefresher: Send + Sync + 'static {
	/// Refresh live status; failures are handled by the implementor.
	async fn refresh_after_notification(&self);
}

struct DeliveryHeaders<'a> {
	message_id: &'a str,
	timestamp: &'a str,
	signature: &'a str,
	message_type: &'a str,
}

impl<'a> DeliveryHeaders<'a> {
	fn from_map(headers: &'a HeaderMap) -> Option<Self> {
		let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty());
		Some(Self {
			message_id: get(HEADER_MESSAGE_ID)?,
			timestamp: get(HEADER_MESSAGE_TIMESTAMP)?,
			signature: get(HEADER_MESSAGE_SIGNATURE)?,
			message_type: get(HEADER_MESSAGE_TYPE)?,
		})
	}
}

pub struct EventSubWebhook {
	secret: Option<SecretString>,
	refresher: Arc<dyn LiveStatusRefresher>,
}

impl EventSubWebhook {
	pub fn new(secret: Option<SecretString>, refresher: Arc<dyn LiveStatusRefresher>) -> Self {
		Self { secret, refresher }
	}

	/// Authenticate and dispatch one delivery.
	///
	/// Notification refreshes run on a spawned task, so this must be called
	/// from within a Tokio runtime.
	pub fn handle(&self, headers: &HeaderMap, body: &[u8]) -> WebhookResponse {
		metrics::counter!("starlight_eventsub_webhook_requests_total").increment(1);

		let Some(delivery) = DeliveryHeaders::from_map(headers) else {
			metrics::counter!("starlight_eventsub_webhook_rejected_total", "reason" => "headers").increment(1);
			return WebhookResponse::error(StatusCode::BAD_REQUEST, "Missing EventSub headers");
		};

		let Some(secret) = self.secret.as_ref().filter(|s| !s.expose().is_empty()) else {
			warn!("eventsub delivery received but no signing secret is configured");
			let err = SyncError::Configuration("missing TWITCH_EVENTSUB_SECRET".to_string());
			return WebhookResponse::json(
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({ "error": err.to_string(), "kind": err.kind() }),
			);
		};

		if !verify_signature(
			secret.expose().as_bytes(),
			delivery.message_id.as_bytes(),
			delivery.timestamp.as_bytes(),
			body,
			delivery.signature.as_bytes(),
		) {
			metrics::counter!("starlight_eventsub_webhook_rejected_total", "reason" => "signature").increment(1);
			warn!(message_id = delivery.message_id, "eventsub signature mismatch");
			return WebhookResponse::error(StatusCode::UNAUTHORIZED, "Invalid signature");
		}

		let payload: Value = if body.is_empty() {
			json!({})
		} else {
			match serde_json::from_slice(body) {
				Ok(v) => v,
				Err(e) => {
					metrics::counter!("starlight_eventsub_webhook_rejected_total", "reason" => "payload").increment(1);
					warn!(message_id = delivery.message_id, error = %e, "eventsub payload not json");
					return WebhookResponse::error(StatusCode::BAD_REQUEST, "Malformed payload");
				}
			}
		};

		let subscription_type = payload
			.pointer("/subscription/type")
			.and_then(Value::as_str)
			.unwrap_or("");

		match MessageType::parse(delivery.message_type) {
			MessageType::Verification => {
				let Some(challenge) = payload.get("challenge").and_then(Value::as_str) else {
					return WebhookResponse::error(StatusCode::BAD_REQUEST, "Missing challenge");
				};
				info!(subscription_type, "eventsub callback verification");
				WebhookResponse::text(challenge)
			}
			MessageType::Notification => {
				metrics::counter!("starlight_eventsub_notifications_total").increment(1);
				let broadcaster = payload
					.pointer("/event/broadcaster_user_login")
					.and_then(Value::as_str)
					.unwrap_or("");
				info!(subscription_type, broadcaster, "eventsub notification");

				let refresher = Arc::clone(&self.refresher);
				tokio::spawn(async move {
					refresher.refresh_after_notification().await;
				});

				WebhookResponse::json(StatusCode::OK, json!({ "received": true }))
			}
			MessageType::Revocation => {
				metrics::counter!("starlight_eventsub_revocations_total").increment(1);
				let status = payload
					.pointer("/subscription/status")
					.and_then(Value::as_str)
					.unwrap_or("");
				warn!(subscription_type, status, "eventsub subscription revoked");
				WebhookResponse::json(StatusCode::OK, json!({ "revoked": true }))
			}
			MessageType::Unknown(other) => {
				debug!(message_type = %other, "unknown eventsub message type");
				WebhookResponse::error(StatusCode::BAD_REQUEST, "Unknown message type")
			}
		}
	}
}

#[cfg(test)]
mod tests;
