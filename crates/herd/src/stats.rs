//! Per-worker resource snapshots and their aggregation.
//!
//! Nothing here is incremental: [`aggregate`] rebuilds the totals from the
//! stored snapshots and a fresh host sample every time it is called.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use herd_core::types::{
	AggregatedStats, AppTotals, MemoryUsage, StatsReport, StatsSnapshot, SystemTotals,
};

/// Host-wide numbers plus the master's own memory, read at aggregation time.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSample {
	pub loadavg: [f64; 3],
	pub total_mem: u64,
	pub free_mem: u64,
	pub cpu_count: usize,
	pub master_memory: MemoryUsage,
	/// Key for the master's own `per_app` bucket.
	pub master_app: String,
}

pub trait HostProbe: Send + Sync {
	fn sample(&self) -> HostSample;
}

/// Reads the host through `sysinfo`. Never caches.
pub struct SysinfoProbe;

impl HostProbe for SysinfoProbe {
	fn sample(&self) -> HostSample {
		use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

		let mut sys = System::new();
		sys.refresh_memory();
		sys.refresh_cpu_all();

		let pid = Pid::from_u32(std::process::id());
		sys.refresh_processes_specifics(
			ProcessesToUpdate::Some(&[pid]),
			true,
			ProcessRefreshKind::new().with_memory(),
		);
		let master_memory = sys
			.process(pid)
			.map(|p| MemoryUsage {
				rss: p.memory(),
				heap_total: p.virtual_memory(),
				heap_used: p.memory(),
			})
			.unwrap_or_default();

		let load = System::load_average();
		HostSample {
			loadavg: [load.one, load.five, load.fifteen],
			total_mem: sys.total_memory(),
			free_mem: sys.free_memory(),
			cpu_count: sys.cpus().len(),
			master_memory,
			master_app: current_app(),
		}
	}
}

/// Path of the running executable, used as the app key for self-reports.
pub fn current_app() -> String {
	std::env::current_exe()
		.map(|p| p.display().to_string())
		.unwrap_or_else(|_| "herd".to_string())
}

pub fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

/// Latest snapshot per worker pid. A new reply replaces the old one wholesale.
#[derive(Debug, Default)]
pub struct StatsStore {
	snapshots: HashMap<u32, StatsSnapshot>,
}

impl StatsStore {
	pub fn record(&mut self, pid: u32, report: StatsReport) {
		self.snapshots
			.insert(pid, StatsSnapshot::from_report(report, now_millis()));
	}

	pub fn forget(&mut self, pid: u32) {
		self.snapshots.remove(&pid);
	}

	pub fn get(&self, pid: u32) -> Option<&StatsSnapshot> {
		self.snapshots.get(&pid)
	}

	pub fn len(&self) -> usize {
		self.snapshots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.snapshots.is_empty()
	}
}

/// Fold the connected workers into process-wide and per-app totals.
///
/// The master always counts as one process and one `per_app` entry. A
/// connected worker without a snapshot yet bumps `process_count` but adds
/// nothing to `worker_count` or to the memory totals.
pub fn aggregate<'a, I>(workers: I, host: &HostSample) -> AggregatedStats
where
	I: IntoIterator<Item = (u32, Option<&'a StatsSnapshot>)>,
{
	let mut per_process = BTreeMap::new();
	let mut per_app: BTreeMap<String, AppTotals> = BTreeMap::new();
	per_app
		.entry(host.master_app.clone())
		.or_default()
		.add(&host.master_memory);

	let mut totals = host.master_memory;
	let mut process_count = 1;
	let mut worker_count = 0;

	for (pid, snapshot) in workers {
		process_count += 1;
		let Some(snapshot) = snapshot else {
			continue;
		};
		worker_count += 1;
		totals.add(&snapshot.memory);
		per_app
			.entry(snapshot.app_filename.clone())
			.or_default()
			.add(&snapshot.memory);
		per_process.insert(pid, snapshot.clone());
	}

	AggregatedStats {
		per_process,
		per_app,
		system: SystemTotals {
			loadavg: host.loadavg,
			total_mem: host.total_mem,
			free_mem: host.free_mem,
			used_mem: host.total_mem.saturating_sub(host.free_mem),
			cpu_count: host.cpu_count,
			process_count,
			worker_count,
			master_memory: host.master_memory,
			rss: totals.rss,
			heap_total: totals.heap_total,
			heap_used: totals.heap_used,
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn host() -> HostSample {
		HostSample {
			loadavg: [0.5, 0.25, 0.125],
			total_mem: 8000,
			free_mem: 3000,
			cpu_count: 4,
			master_memory: MemoryUsage {
				rss: 10,
				heap_total: 20,
				heap_used: 5,
			},
			master_app: "/usr/bin/herd".into(),
		}
	}

	fn snap(pid: u32, app: &str, rss: u64, heap_total: u64, heap_used: u64) -> StatsSnapshot {
		StatsSnapshot {
			pid,
			app_filename: app.into(),
			memory: MemoryUsage {
				rss,
				heap_total,
				heap_used,
			},
			uptime: 1.0,
			captured_at: 0,
		}
	}

	#[test]
	fn master_only() {
		let stats = aggregate(Vec::new(), &host());
		assert_eq!(stats.system.process_count, 1);
		assert_eq!(stats.system.worker_count, 0);
		assert_eq!(stats.system.rss, 10);
		assert_eq!(stats.system.used_mem, 5000);
		assert_eq!(
			stats.per_app["/usr/bin/herd"],
			AppTotals {
				workers: 1,
				rss: 10,
				heap_total: 20,
				heap_used: 5,
			}
		);
		assert!(stats.per_process.is_empty());
	}

	#[test]
	fn same_app_workers_share_a_bucket() {
		let a = snap(10, "app.js", 100, 50, 30);
		let b = snap(11, "app.js", 200, 60, 40);
		let stats = aggregate(vec![(10, Some(&a)), (11, Some(&b))], &host());
		assert_eq!(
			stats.per_app["app.js"],
			AppTotals {
				workers: 2,
				rss: 300,
				heap_total: 110,
				heap_used: 70,
			}
		);
		assert_eq!(stats.system.worker_count, 2);
		assert_eq!(stats.system.process_count, 3);
		assert_eq!(stats.system.rss, 310);
		assert_eq!(stats.system.heap_total, 130);
		assert_eq!(stats.system.heap_used, 75);
		assert_eq!(stats.per_process.len(), 2);
	}

	#[test]
	fn worker_without_snapshot_counts_as_process_only() {
		let a = snap(10, "app.js", 100, 50, 30);
		let stats = aggregate(vec![(10, Some(&a)), (12, None)], &host());
		assert_eq!(stats.system.process_count, 3);
		assert_eq!(stats.system.worker_count, 1);
		assert_eq!(stats.system.rss, 110);
		assert!(!stats.per_process.contains_key(&12));
	}

	#[test]
	fn record_replaces_wholesale() {
		let mut store = StatsStore::default();
		store.record(
			7,
			StatsReport {
				pid: 7,
				filename: "a".into(),
				memory: MemoryUsage {
					rss: 1,
					heap_total: 2,
					heap_used: 3,
				},
				uptime: 1.0,
			},
		);
		store.record(
			7,
			StatsReport {
				pid: 7,
				filename: "b".into(),
				memory: MemoryUsage {
					rss: 9,
					heap_total: 0,
					heap_used: 0,
				},
				uptime: 2.0,
			},
		);
		let s = store.get(7).unwrap();
		assert_eq!(s.app_filename, "b");
		assert_eq!(
			s.memory,
			MemoryUsage {
				rss: 9,
				heap_total: 0,
				heap_used: 0,
			}
		);
		assert_eq!(store.len(), 1);

		store.forget(7);
		assert!(store.is_empty());
	}

	#[test]
	fn aggregation_is_repeatable() {
		let a = snap(10, "app.js", 100, 50, 30);
		let first = aggregate(vec![(10, Some(&a))], &host());
		let second = aggregate(vec![(10, Some(&a))], &host());
		assert_eq!(first, second);
	}
}
