use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable logical worker identity, 1-based. Survives restarts.
pub type SlotId = u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
	pub rss: u64,
	pub heap_total: u64,
	pub heap_used: u64,
}

impl MemoryUsage {
	pub fn add(&mut self, other: &MemoryUsage) {
		self.rss += other.rss;
		self.heap_total += other.heap_total;
		self.heap_used += other.heap_used;
	}
}

/// Payload a worker sends back in response to a stats request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
	pub pid: u32,
	pub filename: String,
	pub memory: MemoryUsage,
	#[serde(default)]
	pub uptime: f64,
}

/// Latest self-reported sample from one worker, as stored by the master.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
	pub pid: u32,
	pub app_filename: String,
	pub memory: MemoryUsage,
	pub uptime: f64,
	/// Milliseconds since the unix epoch.
	pub captured_at: u64,
}

impl StatsSnapshot {
	pub fn from_report(report: StatsReport, captured_at: u64) -> Self {
		Self {
			pid: report.pid,
			app_filename: report.filename,
			memory: report.memory,
			uptime: report.uptime,
			captured_at,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTotals {
	pub workers: u32,
	pub rss: u64,
	pub heap_total: u64,
	pub heap_used: u64,
}

impl AppTotals {
	pub fn add(&mut self, memory: &MemoryUsage) {
		self.workers += 1;
		self.rss += memory.rss;
		self.heap_total += memory.heap_total;
		self.heap_used += memory.heap_used;
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemTotals {
	pub loadavg: [f64; 3],
	pub total_mem: u64,
	pub free_mem: u64,
	pub used_mem: u64,
	pub cpu_count: usize,
	pub process_count: u32,
	pub worker_count: u32,
	pub master_memory: MemoryUsage,
	pub rss: u64,
	pub heap_total: u64,
	pub heap_used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
	pub per_process: BTreeMap<u32, StatsSnapshot>,
	pub per_app: BTreeMap<String, AppTotals>,
	pub system: SystemTotals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
	Starting,
	Connected,
	Disconnecting,
	Dead,
}

/// Where a slot currently is in its fork/backoff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
	Starting,
	Connected,
	Disconnecting,
	BackoffWait,
	Stopped,
}

impl SlotState {
	pub fn is_live(&self) -> bool {
		matches!(self, SlotState::Starting | SlotState::Connected)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatus {
	pub slot: SlotId,
	pub state: SlotState,
	pub pid: Option<u32>,
	pub grace_period_ms: u64,
	pub restarts: u32,
}
