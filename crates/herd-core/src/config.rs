use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_IGNORE: &str = r"^(\.|node_modules|target|test|log)";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HerdConfig {
	#[serde(default)]
	pub supervisor: SupervisorSection,
	#[serde(default)]
	pub report: ReportSection,
	#[serde(default)]
	pub watch: WatchSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
	/// Pool size. `None` means one worker per CPU.
	pub workers: Option<u32>,
	#[serde(default = "default_kill_wait")]
	pub kill_wait_ms: u64,
	#[serde(default = "default_grace")]
	pub grace_ms: u64,
	#[serde(default = "default_max_grace")]
	pub max_grace_ms: u64,
	#[serde(default = "default_stats_interval")]
	pub stats_interval_ms: u64,
	#[serde(default = "default_true")]
	pub broadcast_to_sender: bool,
}

impl Default for SupervisorSection {
	fn default() -> Self {
		Self {
			workers: None,
			kill_wait_ms: default_kill_wait(),
			grace_ms: default_grace(),
			max_grace_ms: default_max_grace(),
			stats_interval_ms: default_stats_interval(),
			broadcast_to_sender: true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportSection {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_report_interval")]
	pub interval_ms: u64,
}

impl Default for ReportSection {
	fn default() -> Self {
		Self {
			enabled: false,
			interval_ms: default_report_interval(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchSection {
	pub path: Option<PathBuf>,
	#[serde(default = "default_ignore")]
	pub ignore: String,
	#[serde(default = "default_debounce")]
	pub debounce_ms: u64,
	#[serde(default = "default_cooldown")]
	pub cooldown_ms: u64,
}

impl Default for WatchSection {
	fn default() -> Self {
		Self {
			path: None,
			ignore: default_ignore(),
			debounce_ms: default_debounce(),
			cooldown_ms: default_cooldown(),
		}
	}
}

fn default_true() -> bool {
	true
}
fn default_kill_wait() -> u64 {
	5000
}
fn default_grace() -> u64 {
	2000
}
fn default_max_grace() -> u64 {
	30000
}
fn default_stats_interval() -> u64 {
	5000
}
fn default_report_interval() -> u64 {
	5000
}
fn default_ignore() -> String {
	DEFAULT_IGNORE.to_string()
}
fn default_debounce() -> u64 {
	1000
}
fn default_cooldown() -> u64 {
	5000
}

pub fn config_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
		PathBuf::from(dir).join("herd")
	} else if let Some(home) = home_dir() {
		home.join(".config").join("herd")
	} else {
		PathBuf::from("/tmp/herd/config")
	}
}

pub fn default_config_path() -> PathBuf {
	config_dir().join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}

pub fn parse_config(content: &str) -> Result<HerdConfig, String> {
	toml::from_str(content).map_err(|e| e.to_string())
}

/// Load the config at `path`. A missing file yields defaults; an unreadable or
/// unparsable one is reported as an error so the caller can decide.
pub fn load_config(path: &Path) -> Result<HerdConfig, String> {
	match std::fs::read_to_string(path) {
		Ok(content) => {
			parse_config(&content).map_err(|e| format!("{}: {}", path.display(), e))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HerdConfig::default()),
		Err(e) => Err(format!("{}: {}", path.display(), e)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_config_uses_defaults() {
		let config = parse_config("").unwrap();
		assert_eq!(config.supervisor.workers, None);
		assert_eq!(config.supervisor.kill_wait_ms, 5000);
		assert_eq!(config.supervisor.grace_ms, 2000);
		assert_eq!(config.supervisor.max_grace_ms, 30000);
		assert!(config.supervisor.broadcast_to_sender);
		assert!(!config.report.enabled);
		assert_eq!(config.watch.ignore, DEFAULT_IGNORE);
		assert_eq!(config.watch.debounce_ms, 1000);
		assert_eq!(config.watch.cooldown_ms, 5000);
	}

	#[test]
	fn partial_sections_keep_other_defaults() {
		let config = parse_config(
			r#"
[supervisor]
workers = 3
grace_ms = 500

[watch]
path = "/srv/app"
"#,
		)
		.unwrap();
		assert_eq!(config.supervisor.workers, Some(3));
		assert_eq!(config.supervisor.grace_ms, 500);
		assert_eq!(config.supervisor.stats_interval_ms, 5000);
		assert_eq!(config.watch.path, Some(PathBuf::from("/srv/app")));
		assert_eq!(config.watch.cooldown_ms, 5000);
	}

	#[test]
	fn invalid_toml_is_an_error() {
		assert!(parse_config("[supervisor\nworkers = ").is_err());
	}

	#[test]
	fn missing_file_is_default() {
		let config = load_config(Path::new("/nonexistent/herd/config.toml")).unwrap();
		assert_eq!(config.supervisor.grace_ms, 2000);
	}
}
