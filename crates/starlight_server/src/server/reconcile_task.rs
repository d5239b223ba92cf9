#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use starlight_domain::TrackedAccount;
use starlight_platform::SubscriptionReconciler;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Periodically run the same flow as `?action=subscribe`.
pub fn spawn_periodic_reconcile(
	reconciler: Arc<SubscriptionReconciler>,
	roster: Vec<TrackedAccount>,
	every: Duration,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(every);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			ticker.tick().await;
			reconcile_once(&reconciler, &roster).await;
		}
	})
}

async fn reconcile_once(reconciler: &SubscriptionReconciler, roster: &[TrackedAccount]) {
	if let Err(err) = reconciler.ensure_configured() {
		warn!(error = %err, "periodic reconcile skipped");
		return;
	}

	let ids = match reconciler.resolve_account_ids(roster).await {
		Ok(ids) => ids,
		Err(err) => {
			warn!(error = %err, "periodic reconcile: resolving ids failed");
			return;
		}
	};

	match reconciler.ensure_subscriptions(&ids).await {
		Ok(report) => info!(
			accounts = ids.len(),
			created = report.created_count,
			errors = report.errors.len(),
			"periodic reconcile finished"
		),
		Err(err) => warn!(error = %err, "periodic reconcile failed"),
	}
}
