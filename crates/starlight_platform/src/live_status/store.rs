#![forbid(unsafe_code)]

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use starlight_domain::{CacheSnapshot, LiveStatusEntry, SnapshotMeta, SyncError};
use starlight_util::text::truncate_chars;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CACHE_FILE_NAME: &str = "starlight_streams.json";

/// Snapshot file under the system temp dir.
pub fn default_cache_path() -> PathBuf {
	std::env::temp_dir().join(DEFAULT_CACHE_FILE_NAME)
}

/// Older cache files hold the bare entry array with no metadata.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSnapshot {
	Current(CacheSnapshot),
	Legacy(Vec<LiveStatusEntry>),
}

impl From<StoredSnapshot> for CacheSnapshot {
	fn from(stored: StoredSnapshot) -> Self {
		match stored {
			StoredSnapshot::Current(snapshot) => snapshot,
			StoredSnapshot::Legacy(data) => CacheSnapshot {
				data,
				meta: SnapshotMeta::default(),
			},
		}
	}
}

/// On-disk home of the single live-status snapshot.
///
/// Writes go to a uniquely named sibling temp file and are published with one
/// rename, so readers only ever see a complete document. Concurrent writers do
/// not coordinate; whichever rename lands last wins.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
	path: PathBuf,
}

impl SnapshotStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// `Ok(None)` when no snapshot has been written or the file is unreadable as one.
	pub async fn read(&self) -> Result<Option<CacheSnapshot>, SyncError> {
		let raw = match tokio::fs::read(&self.path).await {
			Ok(raw) => raw,
			Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(SyncError::Io(format!("read {}: {e}", self.path.display()))),
		};

		match serde_json::from_slice::<StoredSnapshot>(&raw) {
			Ok(stored) => Ok(Some(stored.into())),
			Err(e) => {
				warn!(path = %self.path.display(), error = %e, "ignoring unparseable live status cache");
				Ok(None)
			}
		}
	}

	pub async fn write(&self, snapshot: &CacheSnapshot) -> Result<(), SyncError> {
		if let Some(parent) = self.path.parent()
			&& !parent.as_os_str().is_empty()
		{
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|e| SyncError::Io(format!("prepare cache directory: {e}")))?;
		}

		let payload = serde_json::to_vec(snapshot).map_err(|e| SyncError::Io(format!("encode snapshot: {e}")))?;

		let tmp = self.temp_path();
		tokio::fs::write(&tmp, payload)
			.await
			.map_err(|e| SyncError::Io(format!("write {}: {e}", tmp.display())))?;

		if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
			let _ = tokio::fs::remove_file(&tmp).await;
			return Err(SyncError::Io(format!("replace {}: {e}", self.path.display())));
		}

		debug!(
			path = %self.path.display(),
			entries = snapshot.data.len(),
			source = ?snapshot.meta.source,
			"live status snapshot written"
		);
		Ok(())
	}

	pub async fn exists(&self) -> bool {
		tokio::fs::try_exists(&self.path).await.unwrap_or(false)
	}

	/// First `max_chars` characters of the raw file, if present.
	pub async fn preview(&self, max_chars: usize) -> Result<Option<String>, SyncError> {
		match tokio::fs::read_to_string(&self.path).await {
			Ok(text) => Ok(Some(truncate_chars(&text, max_chars).to_string())),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
			Err(e) => Err(SyncError::Io(format!("read {}: {e}", self.path.display()))),
		}
	}

	fn temp_path(&self) -> PathBuf {
		let name = self
			.path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| DEFAULT_CACHE_FILE_NAME.to_string());
		self.path
			.with_file_name(format!("{name}.{}.tmp", Uuid::new_v4().simple()))
	}
}

#[cfg(test)]
mod tests {
	use starlight_domain::{SnapshotSource, TrackedAccount};

	use super::*;

	fn roster() -> Vec<TrackedAccount> {
		vec![
			TrackedAccount::new("p1", "Alpha", Some("alpha")),
			TrackedAccount::new("p2", "Beta", None),
		]
	}

	#[tokio::test]
	async fn missing_file_reads_as_none() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::new(dir.path().join("streams.json"));

		assert!(store.read().await.unwrap().is_none());
		assert!(!store.exists().await);
		assert!(store.preview(10).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn write_replaces_whole_document_and_leaves_no_temp_files() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::new(dir.path().join("streams.json"));

		let first = CacheSnapshot::offline(&roster(), SnapshotSource::Fallback, 10);
		store.write(&first).await.unwrap();
		let second = CacheSnapshot::offline(&roster()[..1], SnapshotSource::Helix, 20);
		store.write(&second).await.unwrap();

		assert_eq!(store.read().await.unwrap(), Some(second));

		let names: Vec<String> = std::fs::read_dir(dir.path())
			.unwrap()
			.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		assert_eq!(names, vec!["streams.json".to_string()]);
	}

	#[tokio::test]
	async fn creates_missing_parent_directory() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::new(dir.path().join("nested").join("streams.json"));

		store
			.write(&CacheSnapshot::offline(&roster(), SnapshotSource::NoUserIds, 1))
			.await
			.unwrap();
		assert!(store.exists().await);
	}

	#[tokio::test]
	async fn legacy_bare_array_reads_as_always_stale() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("streams.json");
		let entries = CacheSnapshot::offline(&roster(), SnapshotSource::Helix, 5).data;
		std::fs::write(&path, serde_json::to_vec(&entries).unwrap()).unwrap();

		let snap = SnapshotStore::new(&path).read().await.unwrap().unwrap();
		assert_eq!(snap.data, entries);
		assert_eq!(snap.meta.written_at, 0);
		assert_eq!(snap.source(), None);
	}

	#[tokio::test]
	async fn loosely_shaped_documents_keep_their_entries() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("streams.json");
		let store = SnapshotStore::new(&path);
		let data = serde_json::to_string(&CacheSnapshot::offline(&roster(), SnapshotSource::Helix, 5).data).unwrap();

		let cases = [
			(format!(r#"{{"data":{data}}}"#), 0, None),
			(
				format!(r#"{{"data":{data},"meta":{{"lastUpdated":300,"writtenAt":200,"source":"helix"}}}}"#),
				300,
				Some(SnapshotSource::Helix),
			),
			(
				format!(r#"{{"data":{data},"meta":{{"writtenAt":200,"source":"blob-storage"}}}}"#),
				200,
				None,
			),
		];

		for (doc, written_at, source) in cases {
			std::fs::write(&path, &doc).unwrap();
			let snap = store.read().await.unwrap().unwrap_or_else(|| panic!("dropped: {doc}"));
			assert_eq!(snap.data.len(), 2, "{doc}");
			assert_eq!(snap.meta.written_at, written_at, "{doc}");
			assert_eq!(snap.source(), source, "{doc}");
		}
	}

	#[tokio::test]
	async fn garbage_reads_as_none() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("streams.json");
		std::fs::write(&path, b"{not json").unwrap();

		assert!(SnapshotStore::new(&path).read().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn preview_is_truncated() {
		let dir = tempfile::tempdir().unwrap();
		let store = SnapshotStore::new(dir.path().join("streams.json"));
		store
			.write(&CacheSnapshot::offline(&roster(), SnapshotSource::Fallback, 1))
			.await
			.unwrap();

		let preview = store.preview(8).await.unwrap().unwrap();
		assert_eq!(preview.chars().count(), 8);
		assert!(preview.starts_with("{\"data\""));
	}
}
