#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::*;

const SECRET: &str = "test-secret";

#[derive(Default)]
struct GatedRefresher {
	started: AtomicUsize,
	gate: Notify,
	finished: Notify,
}

#[async_trait::async_trait]
impl LiveStatusRefresher for GatedRefresher {
	async fn refresh_after_notification(&self) {
		self.started.fetch_add(1, Ordering::SeqCst);
		self.gate.notified().await;
		self.finished.notify_one();
	}
}

fn webhook(refresher: Arc<GatedRefresher>) -> EventSubWebhook {
	EventSubWebhook::new(Some(SecretString::new(SECRET)), refresher)
}

fn signed_headers(message_type: &str, id: &str, ts: &str, body: &[u8]) -> HeaderMap {
	let sig = compute_signature(SECRET.as_bytes(), id.as_bytes(), ts.as_bytes(), body).unwrap();
	let mut h = HeaderMap::new();
	h.insert(HEADER_MESSAGE_ID, HeaderValue::from_str(id).unwrap());
	h.insert(HEADER_MESSAGE_TIMESTAMP, HeaderValue::from_str(ts).unwrap());
	h.insert(HEADER_MESSAGE_SIGNATURE, HeaderValue::from_str(&sig).unwrap());
	h.insert(HEADER_MESSAGE_TYPE, HeaderValue::from_str(message_type).unwrap());
	h
}

#[test]
fn signature_matches_reference_vector() {
	let sig = compute_signature(SECRET.as_bytes(), b"m1", b"t1", b"{}").unwrap();
	assert_eq!(
		sig,
		"sha256=e5ab3161731dfc31ab960013e7ad2fe8537e7bd786268587c47f4b619f2aa142"
	);
	assert!(verify_signature(SECRET.as_bytes(), b"m1", b"t1", b"{}", sig.as_bytes()));
}

proptest! {
	#[test]
	fn any_single_bit_flip_is_rejected(field in 0usize..4, byte in 0usize..64, bit in 0u8..8) {
		let mut parts: [Vec<u8>; 4] = [
			SECRET.as_bytes().to_vec(),
			b"m1".to_vec(),
			b"t1".to_vec(),
			b"{}".to_vec(),
		];
		let sig = compute_signature(&parts[0], &parts[1], &parts[2], &parts[3]).unwrap();

		let target = &mut parts[field];
		let idx = byte % target.len();
		target[idx] ^= 1 << bit;

		prop_assert!(!verify_signature(&parts[0], &parts[1], &parts[2], &parts[3], sig.as_bytes()));
	}
}

#[tokio::test]
async fn tampered_body_is_unauthorized() {
	let refresher = Arc::new(GatedRefresher::default());
	let hook = webhook(refresher.clone());
	let headers = signed_headers("notification", "m1", "t1", b"{}");

	let resp = hook.handle(&headers, b"{ }");
	assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
	assert_eq!(resp.body, WebhookBody::Json(json!({ "error": "Invalid signature" })));
	assert_eq!(refresher.started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn verification_returns_challenge_as_plain_text() {
	let hook = webhook(Arc::new(GatedRefresher::default()));
	let body = br#"{"challenge":"abc123","subscription":{"type":"stream.online"}}"#;
	let headers = signed_headers("webhook_callback_verification", "m2", "t2", body);

	let resp = hook.handle(&headers, body);
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(resp.body, WebhookBody::Text("abc123".to_string()));
}

#[tokio::test]
async fn verification_without_challenge_is_bad_request() {
	let hook = webhook(Arc::new(GatedRefresher::default()));
	let headers = signed_headers("webhook_callback_verification", "m1", "t1", b"{}");

	let resp = hook.handle(&headers, b"{}");
	assert_eq!(resp.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn notification_acknowledges_before_refresh_completes() {
	let refresher = Arc::new(GatedRefresher::default());
	let hook = webhook(refresher.clone());
	let body = br#"{"subscription":{"type":"stream.online"},"event":{"broadcaster_user_login":"alpha"}}"#;
	let headers = signed_headers("notification", "m3", "t3", body);

	let resp = hook.handle(&headers, body);
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(resp.body, WebhookBody::Json(json!({ "received": true })));

	refresher.gate.notify_one();
	timeout(Duration::from_secs(2), refresher.finished.notified())
		.await
		.expect("refresh should run in the background");
	assert_eq!(refresher.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn revocation_is_acknowledged_without_refresh() {
	let refresher = Arc::new(GatedRefresher::default());
	let hook = webhook(refresher.clone());
	let body = br#"{"subscription":{"type":"stream.offline","status":"authorization_revoked"}}"#;
	let headers = signed_headers("revocation", "m4", "t4", body);

	let resp = hook.handle(&headers, body);
	assert_eq!(resp.status, StatusCode::OK);
	assert_eq!(resp.body, WebhookBody::Json(json!({ "revoked": true })));

	tokio::task::yield_now().await;
	assert_eq!(refresher.started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_message_type_is_bad_request() {
	let hook = webhook(Arc::new(GatedRefresher::default()));
	let headers = signed_headers("something_else", "m5", "t5", b"{}");

	let resp = hook.handle(&headers, b"{}");
	assert_eq!(resp.status, StatusCode::BAD_REQUEST);
	assert_eq!(resp.body, WebhookBody::Json(json!({ "error": "Unknown message type" })));
}

#[tokio::test]
async fn missing_header_is_bad_request_before_verification() {
	let hook = webhook(Arc::new(GatedRefresher::default()));
	let mut headers = signed_headers("notification", "m1", "t1", b"{}");
	headers.remove(HEADER_MESSAGE_TIMESTAMP);

	let resp = hook.handle(&headers, b"{}");
	assert_eq!(resp.status, StatusCode::BAD_REQUEST);
	assert_eq!(resp.body, WebhookBody::Json(json!({ "error": "Missing EventSub headers" })));
}

#[tokio::test]
async fn header_names_are_case_insensitive() {
	let hook = webhook(Arc::new(GatedRefresher::default()));
	let body = br#"{"challenge":"xyz"}"#;
	let sig = compute_signature(SECRET.as_bytes(), b"m6", b"t6", body).unwrap();

	let mut headers = HeaderMap::new();
	for (name, value) in [
		("Twitch-Eventsub-Message-Id", "m6"),
		("TWITCH-EVENTSUB-MESSAGE-TIMESTAMP", "t6"),
		("Twitch-EventSub-Message-Signature", sig.as_str()),
		("twitch-eventsub-message-type", "webhook_callback_verification"),
	] {
		headers.insert(
			HeaderName::from_bytes(name.as_bytes()).unwrap(),
			HeaderValue::from_str(value).unwrap(),
		);
	}

	let resp = hook.handle(&headers, body);
	assert_eq!(resp.body, WebhookBody::Text("xyz".to_string()));
}

#[tokio::test]
async fn missing_secret_is_a_configuration_failure() {
	let hook = EventSubWebhook::new(None, Arc::new(GatedRefresher::default()));
	let headers = signed_headers("notification", "m1", "t1", b"{}");

	let resp = hook.handle(&headers, b"{}");
	assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn signed_garbage_body_is_bad_request() {
	let hook = webhook(Arc::new(GatedRefresher::default()));
	let headers = signed_headers("notification", "m7", "t7", b"not json");

	let resp = hook.handle(&headers, b"not json");
	assert_eq!(resp.status, StatusCode::BAD_REQUEST);
}
