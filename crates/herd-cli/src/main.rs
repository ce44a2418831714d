mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use herd::config::{self, HerdConfig};
use herd::watch::{self, WatchCoordinator, WatchTimings};
use herd::{ProcessSpawner, Supervisor, SupervisorConfig, SysinfoProbe};
use owo_colors::OwoColorize;
use regex::Regex;

#[derive(Parser, Debug)]
#[command(name = "herd", version, about = "Keep a pool of worker processes alive")]
struct Cli {
	/// Worker executable, forked once per slot
	exec: PathBuf,

	/// Arguments passed to every worker
	#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
	args: Vec<String>,

	/// Number of workers (default: one per CPU)
	#[arg(short, long)]
	workers: Option<u32>,

	/// Restart all workers when files under this path change
	#[arg(long)]
	watch: Option<PathBuf>,

	/// Directory names matching this regex are not watched
	#[arg(long)]
	ignore: Option<String>,

	/// Config file (default: $XDG_CONFIG_HOME/herd/config.toml)
	#[arg(long)]
	config: Option<PathBuf>,

	/// Print aggregated worker stats periodically
	#[arg(long)]
	report: bool,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt().with_writer(std::io::stderr).init();

	let cli = Cli::parse();
	let config = load_config(cli.config.as_deref());

	if !cli.exec.exists() {
		fatal(&format!("{}: no such file", cli.exec.display()));
	}

	let watch_path = cli.watch.clone().or_else(|| config.watch.path.clone());
	if let Some(path) = &watch_path {
		if !path.exists() {
			fatal(&format!("watch path {}: no such file or directory", path.display()));
		}
	}

	let ignore_src = cli.ignore.clone().unwrap_or_else(|| config.watch.ignore.clone());
	let ignore = match Regex::new(&ignore_src) {
		Ok(re) => re,
		Err(e) => fatal(&format!("invalid ignore pattern '{}': {}", ignore_src, e)),
	};

	let mut sup_config = SupervisorConfig::from_section(&cli.exec, &config.supervisor);
	sup_config.args = cli.args.clone();
	if let Some(workers) = cli.workers {
		sup_config.workers = workers;
	}

	let sup = Supervisor::new(sup_config, Arc::new(ProcessSpawner), Arc::new(SysinfoProbe));
	if let Err(e) = sup.start().await {
		fatal(&e);
	}
	sup.spawn_stats_ticker();

	if cli.report || config.report.enabled {
		report::spawn(Arc::clone(&sup), Duration::from_millis(config.report.interval_ms));
	}

	// Dropping the session unwatches everything, so it lives until exit.
	let _session = match watch_path {
		Some(path) => {
			let timings = WatchTimings {
				debounce: Duration::from_millis(config.watch.debounce_ms),
				cooldown: Duration::from_millis(config.watch.cooldown_ms),
			};
			let coordinator = WatchCoordinator::new(Arc::clone(&sup), timings);
			match watch::watch(coordinator, &path, &ignore) {
				Ok(session) => Some(session),
				Err(e) => fatal(&e),
			}
		}
		None => None,
	};

	let code = match herd::signals::listen(vec![sup]).await {
		Ok(code) => code,
		Err(e) => {
			tracing::error!("{}", e);
			1
		}
	};
	std::process::exit(code);
}

fn load_config(path: Option<&Path>) -> HerdConfig {
	let path = path
		.map(Path::to_path_buf)
		.unwrap_or_else(config::default_config_path);
	match config::load_config(&path) {
		Ok(config) => config,
		Err(e) => {
			tracing::warn!("{}, using defaults", e);
			HerdConfig::default()
		}
	}
}

fn fatal(message: &str) -> ! {
	eprintln!("{} {}", "error:".red().bold(), message);
	std::process::exit(1);
}
