//! Lazily computed global settings snapshot.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use kiln_proto::GlobalSettings;

/// Caches the [`GlobalSettings`] sent with every build request.
///
/// Readers never block; a concurrent miss may compute the snapshot twice, and
/// the last store wins.
#[derive(Debug, Default)]
pub struct SettingsCache {
	cached: ArcSwapOption<GlobalSettings>,
}

impl SettingsCache {
	/// Creates an empty cache.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the cached snapshot, computing it with `compute` on a miss.
	pub fn get_or_compute(&self, compute: impl FnOnce() -> GlobalSettings) -> Arc<GlobalSettings> {
		if let Some(settings) = self.cached.load_full() {
			return settings;
		}
		let settings = Arc::new(compute());
		self.cached.store(Some(settings.clone()));
		settings
	}

	/// Drops the snapshot; the next build recomputes it.
	pub fn invalidate(&self) {
		if self.cached.swap(None).is_some() {
			tracing::debug!("global settings invalidated");
		}
	}

	/// Whether a snapshot is cached.
	pub fn is_cached(&self) -> bool {
		self.cached.load().is_some()
	}
}
