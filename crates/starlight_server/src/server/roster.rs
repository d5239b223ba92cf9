#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use anyhow::Context as _;
use starlight_domain::{TrackedAccount, unique_handles};
use tracing::{info, warn};

/// Load the participant roster once at startup.
///
/// A missing or malformed file yields an empty roster; the read path still
/// serves an empty `data` array in that case.
pub fn load_roster(path: Option<&Path>) -> Vec<TrackedAccount> {
	let Some(path) = path else {
		warn!("no roster_path configured; tracking nobody");
		return Vec::new();
	};

	match read_roster(path) {
		Ok(roster) => {
			info!(
				path = %path.display(),
				accounts = roster.len(),
				handles = unique_handles(&roster).len(),
				"roster loaded"
			);
			roster
		}
		Err(e) => {
			warn!(path = %path.display(), error = %format!("{e:#}"), "failed to load roster");
			Vec::new()
		}
	}
}

fn read_roster(path: &Path) -> anyhow::Result<Vec<TrackedAccount>> {
	let raw = fs::read_to_string(path).context("read roster file")?;
	serde_json::from_str(&raw).context("parse roster JSON")
}
