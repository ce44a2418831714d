//! File watching and the restart-on-change coordinator.
//!
//! ```text
//! notify → classify (change only) → Debouncer (idle/pending/cooldown) → disconnect_all(restart)
//! ```
//!
//! The first `change` from idle arms the debounce delay; when it fires every
//! connected worker is gracefully disconnected with a restart requested, then
//! the cooldown window runs. Changes that arrive while not idle are dropped.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use tokio::sync::{mpsc, Mutex};

use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
	Idle,
	Pending,
	Cooldown,
}

/// The three-state gate. Each transition only fires from its one source state.
#[derive(Debug)]
pub struct Debouncer {
	state: DebounceState,
}

impl Default for Debouncer {
	fn default() -> Self {
		Self {
			state: DebounceState::Idle,
		}
	}
}

impl Debouncer {
	pub fn state(&self) -> DebounceState {
		self.state
	}

	/// idle → pending. Returns false (and changes nothing) from any other state.
	pub fn trigger(&mut self) -> bool {
		self.transition(DebounceState::Idle, DebounceState::Pending)
	}

	/// pending → cooldown, once the debounce delay fired.
	pub fn fire(&mut self) -> bool {
		self.transition(DebounceState::Pending, DebounceState::Cooldown)
	}

	/// cooldown → idle, once the cooldown window elapsed.
	pub fn settle(&mut self) -> bool {
		self.transition(DebounceState::Cooldown, DebounceState::Idle)
	}

	fn transition(&mut self, from: DebounceState, to: DebounceState) -> bool {
		if self.state != from {
			return false;
		}
		self.state = to;
		true
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
	/// File contents changed.
	Change,
	/// Created, removed or renamed.
	Rename,
	Other,
}

impl From<&EventKind> for FsEventKind {
	fn from(kind: &EventKind) -> Self {
		match kind {
			EventKind::Modify(ModifyKind::Name(_)) => FsEventKind::Rename,
			// mtime/chmod noise
			EventKind::Modify(ModifyKind::Metadata(_)) => FsEventKind::Other,
			EventKind::Modify(_) => FsEventKind::Change,
			EventKind::Create(_) | EventKind::Remove(_) => FsEventKind::Rename,
			_ => FsEventKind::Other,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct WatchTimings {
	/// Wait after the first change before restarting, so half-written files
	/// and duplicate notifications settle.
	pub debounce: Duration,
	/// Quiet period after the restart during which changes are ignored.
	pub cooldown: Duration,
}

impl Default for WatchTimings {
	fn default() -> Self {
		Self {
			debounce: Duration::from_millis(1000),
			cooldown: Duration::from_millis(5000),
		}
	}
}

/// Turns filesystem events into at most one bulk restart per cooldown window.
#[derive(Clone)]
pub struct WatchCoordinator {
	supervisor: Arc<Supervisor>,
	debouncer: Arc<Mutex<Debouncer>>,
	timings: WatchTimings,
}

impl WatchCoordinator {
	pub fn new(supervisor: Arc<Supervisor>, timings: WatchTimings) -> Self {
		Self {
			supervisor,
			debouncer: Arc::new(Mutex::new(Debouncer::default())),
			timings,
		}
	}

	pub async fn state(&self) -> DebounceState {
		self.debouncer.lock().await.state()
	}

	pub async fn on_fs_event(&self, kind: FsEventKind, path: Option<&Path>) {
		if kind != FsEventKind::Change {
			return;
		}
		if !self.debouncer.lock().await.trigger() {
			tracing::debug!(path = ?path, "change ignored, restart already in progress");
			return;
		}

		tracing::info!(
			path = ?path,
			"change detected, restarting workers in {}ms",
			self.timings.debounce.as_millis()
		);

		let supervisor = Arc::clone(&self.supervisor);
		let debouncer = Arc::clone(&self.debouncer);
		let timings = self.timings;
		tokio::spawn(async move {
			tokio::time::sleep(timings.debounce).await;
			supervisor.disconnect_all(true).await;
			debouncer.lock().await.fire();

			tokio::time::sleep(timings.cooldown).await;
			debouncer.lock().await.settle();
			tracing::debug!("watch cooldown over");
		});
	}
}

/// Owned set of watch registrations, torn down together.
pub struct WatchSet {
	watcher: RecommendedWatcher,
	paths: BTreeSet<PathBuf>,
}

impl WatchSet {
	fn add(&mut self, path: &Path) -> Result<(), String> {
		self.watcher
			.watch(path, RecursiveMode::NonRecursive)
			.map_err(|e| format!("watch {}: {}", path.display(), e))?;
		self.paths.insert(path.to_path_buf());
		Ok(())
	}

	pub fn paths(&self) -> &BTreeSet<PathBuf> {
		&self.paths
	}

	/// Unwatch every path. Returns how many registrations were removed.
	pub fn close(&mut self) -> usize {
		let paths = std::mem::take(&mut self.paths);
		for path in &paths {
			let _ = self.watcher.unwatch(path);
		}
		paths.len()
	}
}

impl Drop for WatchSet {
	fn drop(&mut self) {
		self.close();
	}
}

pub struct WatchSession {
	pub set: WatchSet,
	pub coordinator: WatchCoordinator,
}

impl WatchSession {
	pub async fn state(&self) -> DebounceState {
		self.coordinator.state().await
	}
}

/// Install listeners on `root` and, when it is a directory, on every
/// subdirectory whose name does not match `ignore`.
pub fn watch(
	coordinator: WatchCoordinator,
	root: &Path,
	ignore: &Regex,
) -> Result<WatchSession, String> {
	let mut targets = vec![root.to_path_buf()];
	if root.is_dir() {
		targets.extend(collect_dirs(root, ignore));
	}

	let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();
	let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
		Ok(event) => {
			let _ = tx.send(event);
		}
		Err(e) => tracing::warn!("watch error: {}", e),
	})
	.map_err(|e| format!("failed to create watcher: {}", e))?;

	let mut set = WatchSet {
		watcher,
		paths: BTreeSet::new(),
	};
	for path in &targets {
		set.add(path)?;
	}
	tracing::info!(
		"watching {} ({} directories)",
		root.display(),
		set.paths().len()
	);

	let events = coordinator.clone();
	tokio::spawn(async move {
		while let Some(event) = rx.recv().await {
			let kind = FsEventKind::from(&event.kind);
			events.on_fs_event(kind, event.paths.first().map(|p| p.as_path())).await;
		}
	});

	Ok(WatchSession { set, coordinator })
}

/// Every directory below `root` whose basename does not match `ignore`,
/// depth first, sorted per level. Ignored directories are not descended into
/// and symlinks are not followed.
pub fn collect_dirs(root: &Path, ignore: &Regex) -> Vec<PathBuf> {
	let mut dirs = Vec::new();
	let Ok(entries) = std::fs::read_dir(root) else {
		return dirs;
	};

	let mut children: Vec<_> = entries
		.flatten()
		.filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
		.filter(|e| !ignore.is_match(&e.file_name().to_string_lossy()))
		.map(|e| e.path())
		.collect();
	children.sort();

	for child in children {
		let nested = collect_dirs(&child, ignore);
		dirs.push(child);
		dirs.extend(nested);
	}
	dirs
}

#[cfg(test)]
mod tests {
	use super::*;
	use notify::event::{CreateKind, DataChange, MetadataKind, RenameMode};

	#[test]
	fn debouncer_transitions_only_from_source_state() {
		let mut d = Debouncer::default();
		assert!(!d.fire());
		assert!(!d.settle());
		assert!(d.trigger());
		assert_eq!(d.state(), DebounceState::Pending);
		assert!(!d.trigger());
		assert!(!d.settle());
		assert!(d.fire());
		assert_eq!(d.state(), DebounceState::Cooldown);
		assert!(!d.trigger());
		assert!(d.settle());
		assert_eq!(d.state(), DebounceState::Idle);
		assert!(d.trigger());
	}

	#[test]
	fn only_content_changes_count() {
		let change = EventKind::Modify(ModifyKind::Data(DataChange::Content));
		assert_eq!(FsEventKind::from(&change), FsEventKind::Change);
		let any = EventKind::Modify(ModifyKind::Any);
		assert_eq!(FsEventKind::from(&any), FsEventKind::Change);

		let rename = EventKind::Modify(ModifyKind::Name(RenameMode::Both));
		assert_eq!(FsEventKind::from(&rename), FsEventKind::Rename);
		let create = EventKind::Create(CreateKind::File);
		assert_eq!(FsEventKind::from(&create), FsEventKind::Rename);
		let meta = EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime));
		assert_eq!(FsEventKind::from(&meta), FsEventKind::Other);
	}

	#[test]
	fn default_ignore_skips_hidden_deps_tests_and_logs() {
		let ignore = Regex::new(herd_core::config::DEFAULT_IGNORE).unwrap();
		for name in [".git", "node_modules", "target", "test", "tests", "logs"] {
			assert!(ignore.is_match(name), "{} should be ignored", name);
		}
		for name in ["src", "lib", "app"] {
			assert!(!ignore.is_match(name), "{} should be watched", name);
		}
	}
}
