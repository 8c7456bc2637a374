//! Build targets and the project model collaborator.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use kiln_proto::GlobalSettings;
use parking_lot::Mutex;

/// A project identified by its canonical root path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildTarget(PathBuf);

impl BuildTarget {
	/// Canonicalizes `path` when it exists, keeping it as given otherwise.
	pub fn new(path: impl AsRef<Path>) -> Self {
		let path = path.as_ref();
		Self(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
	}

	/// Root path.
	pub fn path(&self) -> &Path {
		&self.0
	}

	/// Identifier sent to the build process, with `/` separators.
	pub fn project_id(&self) -> String {
		self.0.to_string_lossy().replace('\\', "/")
	}
}

impl fmt::Display for BuildTarget {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.display())
	}
}

/// The host's view of open projects.
pub trait ProjectModel: Send + Sync + 'static {
	/// Computes the global environment builds run against.
	fn global_settings(&self) -> GlobalSettings;

	/// Open targets that opt into building in the background.
	fn auto_make_targets(&self) -> Vec<BuildTarget>;

	/// Whether `target` was closed by the host.
	fn is_disposed(&self, _target: &BuildTarget) -> bool {
		false
	}
}

/// A fixed, mutable project model.
#[derive(Debug, Default)]
pub struct StaticProject {
	settings: Mutex<GlobalSettings>,
	auto_make: Mutex<Vec<BuildTarget>>,
	disposed: Mutex<HashSet<BuildTarget>>,
	settings_computed: AtomicUsize,
}

impl StaticProject {
	/// Creates a model serving `settings` with no auto-make targets.
	#[must_use]
	pub fn new(settings: GlobalSettings) -> Self {
		Self {
			settings: Mutex::new(settings),
			..Self::default()
		}
	}

	/// Replaces the served settings. Callers must also invalidate the manager's
	/// cached copy.
	pub fn set_settings(&self, settings: GlobalSettings) {
		*self.settings.lock() = settings;
	}

	/// Opts `target` into auto-make.
	pub fn enable_auto_make(&self, target: BuildTarget) {
		let mut targets = self.auto_make.lock();
		if !targets.contains(&target) {
			targets.push(target);
		}
	}

	/// Marks `target` as closed.
	pub fn dispose(&self, target: BuildTarget) {
		self.auto_make.lock().retain(|t| *t != target);
		self.disposed.lock().insert(target);
	}

	/// How many times settings were computed.
	pub fn settings_computed(&self) -> usize {
		self.settings_computed.load(Ordering::SeqCst)
	}
}

impl ProjectModel for StaticProject {
	fn global_settings(&self) -> GlobalSettings {
		self.settings_computed.fetch_add(1, Ordering::SeqCst);
		self.settings.lock().clone()
	}

	fn auto_make_targets(&self) -> Vec<BuildTarget> {
		self.auto_make.lock().clone()
	}

	fn is_disposed(&self, target: &BuildTarget) -> bool {
		self.disposed.lock().contains(target)
	}
}
