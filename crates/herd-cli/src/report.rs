use std::sync::Arc;
use std::time::Duration;

use herd::types::AggregatedStats;
use herd::Supervisor;
use owo_colors::OwoColorize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Print the aggregated stats to stderr every `interval` until the pool stops.
pub fn spawn(sup: Arc<Supervisor>, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
		loop {
			ticker.tick().await;
			if sup.is_stopped().await {
				return;
			}
			eprint!("{}", render(&sup.snapshot().await));
		}
	})
}

pub fn render(stats: &AggregatedStats) -> String {
	let sys = &stats.system;
	let mut out = format!(
		"{} {} processes, {} reporting  load {:.2} {:.2} {:.2}  mem {}/{} ({} cpus)\n",
		"herd".bold(),
		sys.process_count,
		sys.worker_count,
		sys.loadavg[0],
		sys.loadavg[1],
		sys.loadavg[2],
		format_bytes(sys.used_mem),
		format_bytes(sys.total_mem),
		sys.cpu_count,
	);

	let width = stats.per_app.keys().map(|k| k.len()).max().unwrap_or(0);
	for (app, totals) in &stats.per_app {
		out.push_str(&format!(
			"  {} {:<width$} {:>3} {:>9} {:>9} {:>9}\n",
			"●".green(),
			app,
			totals.workers,
			format_bytes(totals.rss),
			format_bytes(totals.heap_total),
			format_bytes(totals.heap_used),
			width = width
		));
	}

	out.push_str(&format!(
		"  {} rss {}  heap {}/{}\n",
		"total".dimmed(),
		format_bytes(sys.rss),
		format_bytes(sys.heap_used),
		format_bytes(sys.heap_total),
	));
	out
}

fn format_bytes(bytes: u64) -> String {
	const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
	let mut value = bytes as f64;
	let mut unit = 0;
	while value >= 1024.0 && unit < UNITS.len() - 1 {
		value /= 1024.0;
		unit += 1;
	}
	if unit == 0 {
		format!("{}B", bytes)
	} else {
		format!("{:.1}{}", value, UNITS[unit])
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use herd::types::*;
	use std::collections::BTreeMap;

	fn sample() -> AggregatedStats {
		let mut per_app = BTreeMap::new();
		per_app.insert(
			"/srv/app.js".to_string(),
			AppTotals {
				workers: 2,
				rss: 3 * 1024 * 1024,
				heap_total: 2048,
				heap_used: 1024,
			},
		);
		per_app.insert(
			"/usr/bin/herd".to_string(),
			AppTotals {
				workers: 1,
				rss: 512,
				heap_total: 512,
				heap_used: 512,
			},
		);
		AggregatedStats {
			per_process: BTreeMap::new(),
			per_app,
			system: SystemTotals {
				loadavg: [0.5, 0.25, 0.75],
				total_mem: 8 * 1024 * 1024 * 1024,
				free_mem: 6 * 1024 * 1024 * 1024,
				used_mem: 2 * 1024 * 1024 * 1024,
				cpu_count: 4,
				process_count: 3,
				worker_count: 2,
				master_memory: MemoryUsage {
					rss: 512,
					heap_total: 512,
					heap_used: 512,
				},
				rss: 3 * 1024 * 1024 + 512,
				heap_total: 2560,
				heap_used: 1536,
			},
		}
	}

	#[test]
	fn bytes_use_binary_units() {
		assert_eq!(format_bytes(0), "0B");
		assert_eq!(format_bytes(512), "512B");
		assert_eq!(format_bytes(1536), "1.5K");
		assert_eq!(format_bytes(3 * 1024 * 1024), "3.0M");
		assert_eq!(format_bytes(8 * 1024 * 1024 * 1024), "8.0G");
	}

	#[test]
	fn report_lists_every_app() {
		let out = render(&sample());
		let lines: Vec<&str> = out.lines().collect();
		assert_eq!(lines.len(), 4);
		assert!(lines[0].contains("3 processes, 2 reporting"));
		assert!(lines[0].contains("load 0.50 0.25 0.75"));
		assert!(lines[0].contains("mem 2.0G/8.0G"));
		assert!(lines[1].contains("/srv/app.js"));
		assert!(lines[1].contains("3.0M"));
		assert!(lines[2].contains("/usr/bin/herd"));
		assert!(lines[3].contains("rss 3.0M"));
	}
}
