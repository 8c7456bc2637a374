//! Per-target accumulation of file changes between builds.

use std::collections::BTreeSet;

use kiln_proto::FsEvent;

/// Changed and deleted paths accumulated since the last consumed build.
///
/// A path is never in both sets: recording it as changed evicts it from the
/// deleted set and vice versa. While a full rescan is pending every
/// notification is dropped, since the rescan will observe it anyway.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
	changed: BTreeSet<String>,
	deleted: BTreeSet<String>,
	ordinal: u64,
	needs_full_rescan: bool,
}

impl Default for ChangeTracker {
	fn default() -> Self {
		Self::new()
	}
}

impl ChangeTracker {
	/// Creates a tracker for a new target. The first build does a full scan.
	#[must_use]
	pub fn new() -> Self {
		Self {
			changed: BTreeSet::new(),
			deleted: BTreeSet::new(),
			ordinal: 0,
			needs_full_rescan: true,
		}
	}

	/// Records created or modified paths.
	pub fn record_changed<I, S>(&mut self, paths: I)
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		if self.needs_full_rescan {
			return;
		}
		for path in paths {
			let path = normalize_path(path.as_ref());
			self.deleted.remove(&path);
			self.changed.insert(path);
		}
	}

	/// Records removed paths.
	pub fn record_deleted<I, S>(&mut self, paths: I)
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		if self.needs_full_rescan {
			return;
		}
		for path in paths {
			let path = normalize_path(path.as_ref());
			self.changed.remove(&path);
			self.deleted.insert(path);
		}
	}

	/// Takes the accumulated delta for the next build.
	///
	/// Returns `None` when a full rescan is pending, clearing that flag so the
	/// following build is incremental again. Otherwise bumps the ordinal and
	/// drains both sets. Call at most once per build attempt.
	pub fn consume_delta(&mut self) -> Option<FsEvent> {
		if std::mem::take(&mut self.needs_full_rescan) {
			return None;
		}
		self.ordinal += 1;
		Some(FsEvent {
			ordinal: self.ordinal,
			changed_paths: std::mem::take(&mut self.changed).into_iter().collect(),
			deleted_paths: std::mem::take(&mut self.deleted).into_iter().collect(),
		})
	}

	/// Discards all deltas and requires a full rescan on the next build.
	pub fn invalidate(&mut self) {
		self.needs_full_rescan = true;
		self.ordinal = 0;
		self.changed.clear();
		self.deleted.clear();
	}

	/// Whether the next build must rescan everything.
	#[must_use]
	pub fn needs_full_rescan(&self) -> bool {
		self.needs_full_rescan
	}

	/// Number of paths waiting to be consumed.
	#[must_use]
	pub fn pending(&self) -> usize {
		self.changed.len() + self.deleted.len()
	}
}

/// Lexically normalizes a path for set membership.
///
/// Separators become `/`, `.` segments and duplicate separators are dropped,
/// and `..` pops the previous segment when there is one. The filesystem is
/// never consulted.
#[must_use]
pub fn normalize_path(path: &str) -> String {
	let unified = path.replace('\\', "/");
	let absolute = unified.starts_with('/');
	let mut parts: Vec<&str> = Vec::new();
	for part in unified.split('/') {
		match part {
			"" | "." => {}
			".." => match parts.last() {
				Some(&last) if last != ".." => {
					parts.pop();
				}
				_ if absolute => {}
				_ => parts.push(".."),
			},
			other => parts.push(other),
		}
	}
	let joined = parts.join("/");
	if absolute {
		format!("/{joined}")
	} else if joined.is_empty() {
		".".to_string()
	} else {
		joined
	}
}
