#![forbid(unsafe_code)]

pub mod eventsub;
pub mod helix;
pub mod subscriptions;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;


pub use eventsub::{EventSubWebhook, LiveStatusRefresher, WebhookBody, WebhookResponse};
pub use helix::{HelixApi, HelixClient, HelixEndpoints, HelixSubscriptionData};
pub use subscriptions::{EVENTSUB_CALLBACK_PATH, ReconcileReport, SubscriptionReconciler, WebhookTarget};
pub use token::{AppCredentials, AppToken, TokenCache};
