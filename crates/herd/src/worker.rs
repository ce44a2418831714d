//! Worker side of the channel, for workers written in Rust.
//!
//! A forked worker reads master messages from stdin and writes its own to
//! stdout. [`WorkerLink::serve`] answers stats requests and hands broadcasts
//! to a callback until the master closes stdin.

use std::sync::Arc;

use herd_core::protocol::{Message, ROLE_ENV, ROLE_WORKER, WORKER_ENV};
use herd_core::types::{MemoryUsage, SlotId, StatsReport};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::stats::current_app;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEnv {
	pub slot: SlotId,
}

impl WorkerEnv {
	/// `Some` when this process was forked by a master.
	pub fn detect() -> Option<Self> {
		let role = std::env::var(ROLE_ENV).ok();
		let slot = std::env::var(WORKER_ENV).ok();
		Self::from_vars(role.as_deref(), slot.as_deref())
	}

	pub fn from_vars(role: Option<&str>, slot: Option<&str>) -> Option<Self> {
		if role != Some(ROLE_WORKER) {
			return None;
		}
		let slot = slot?.trim().parse().ok()?;
		Some(Self { slot })
	}
}

type Output = Box<dyn AsyncWrite + Send + Unpin>;

pub struct WorkerLink {
	pub env: WorkerEnv,
	started: Instant,
	output: Arc<Mutex<Output>>,
}

impl WorkerLink {
	/// Link over this process's stdout. `None` unless forked by a master.
	pub fn connect() -> Option<Self> {
		let env = WorkerEnv::detect()?;
		Some(Self::with_output(env, tokio::io::stdout()))
	}

	pub fn with_output<W>(env: WorkerEnv, output: W) -> Self
	where
		W: AsyncWrite + Send + Unpin + 'static,
	{
		Self {
			env,
			started: Instant::now(),
			output: Arc::new(Mutex::new(Box::new(output))),
		}
	}

	pub async fn send(&self, message: &Message) -> Result<(), String> {
		let mut out = self.output.lock().await;
		out.write_all(message.to_line().as_bytes())
			.await
			.map_err(|e| format!("write to master failed: {}", e))?;
		out.flush()
			.await
			.map_err(|e| format!("write to master failed: {}", e))
	}

	/// Ask the master to relay `payload` to every worker.
	pub async fn broadcast(&self, payload: Map<String, Value>) -> Result<(), String> {
		self.send(&Message::broadcast(payload)).await
	}

	pub fn stats_report(&self) -> StatsReport {
		stats_report(self.started)
	}

	/// Answer stats requests and pass broadcast payloads to `on_broadcast`
	/// until stdin closes.
	pub async fn serve<F>(&self, on_broadcast: F) -> Result<(), String>
	where
		F: FnMut(Map<String, Value>),
	{
		self.serve_from(tokio::io::stdin(), on_broadcast).await
	}

	pub async fn serve_from<R, F>(&self, input: R, mut on_broadcast: F) -> Result<(), String>
	where
		R: AsyncRead + Unpin,
		F: FnMut(Map<String, Value>),
	{
		let mut lines = BufReader::new(input).lines();
		while let Some(line) = lines
			.next_line()
			.await
			.map_err(|e| format!("read from master failed: {}", e))?
		{
			let Ok(messages) = Message::decode(&line) else {
				continue;
			};
			for message in messages {
				match message {
					Message::StatsRequest => {
						self.send(&Message::StatsResponse(self.stats_report())).await?
					}
					Message::Broadcast(payload) => on_broadcast(payload),
					Message::StatsResponse(_) => {}
				}
			}
		}
		Ok(())
	}
}

/// Stats for the current process, uptime counted from `started`.
pub fn stats_report(started: Instant) -> StatsReport {
	use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

	let pid = std::process::id();
	let sys_pid = Pid::from_u32(pid);
	let mut sys = System::new();
	sys.refresh_processes_specifics(
		ProcessesToUpdate::Some(&[sys_pid]),
		true,
		ProcessRefreshKind::new().with_memory(),
	);
	let memory = sys
		.process(sys_pid)
		.map(|p| MemoryUsage {
			rss: p.memory(),
			heap_total: p.virtual_memory(),
			heap_used: p.memory(),
		})
		.unwrap_or_default();

	StatsReport {
		pid,
		filename: current_app(),
		memory,
		uptime: started.elapsed().as_secs_f64(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_requires_worker_role_and_slot() {
		assert_eq!(
			WorkerEnv::from_vars(Some("worker"), Some("3")),
			Some(WorkerEnv { slot: 3 })
		);
		assert_eq!(WorkerEnv::from_vars(None, Some("3")), None);
		assert_eq!(WorkerEnv::from_vars(Some("master"), Some("3")), None);
		assert_eq!(WorkerEnv::from_vars(Some("worker"), None), None);
		assert_eq!(WorkerEnv::from_vars(Some("worker"), Some("x")), None);
	}

	async fn read_output(mut rx: tokio::io::DuplexStream) -> Vec<Message> {
		use tokio::io::AsyncReadExt;

		let mut raw = String::new();
		rx.read_to_string(&mut raw).await.unwrap();
		raw.lines()
			.flat_map(|line| Message::decode(line).unwrap())
			.collect()
	}

	#[tokio::test]
	async fn serve_answers_stats_and_hands_over_broadcasts() {
		let (tx, rx) = tokio::io::duplex(64 * 1024);
		let link = WorkerLink::with_output(WorkerEnv { slot: 2 }, tx);

		let input = concat!(
			"{\"cmd\":\"send stats\"}\n",
			"not json\n",
			"{\"broadcast\":true,\"reload\":\"cache\"}\n",
		)
		.as_bytes();
		let mut payloads = Vec::new();
		link.serve_from(input, |p| payloads.push(p)).await.unwrap();
		drop(link);

		assert_eq!(payloads.len(), 1);
		assert_eq!(payloads[0]["reload"], "cache");

		let sent = read_output(rx).await;
		assert_eq!(sent.len(), 1);
		let Message::StatsResponse(report) = &sent[0] else {
			panic!("expected a stats reply, got {:?}", sent[0]);
		};
		assert_eq!(report.pid, std::process::id());
	}

	#[tokio::test]
	async fn broadcast_writes_one_flagged_line() {
		let (tx, rx) = tokio::io::duplex(64 * 1024);
		let link = WorkerLink::with_output(WorkerEnv { slot: 1 }, tx);

		let mut payload = Map::new();
		payload.insert("event".into(), Value::from("flush"));
		link.broadcast(payload).await.unwrap();
		drop(link);

		let sent = read_output(rx).await;
		let Message::Broadcast(obj) = &sent[0] else {
			panic!("expected a broadcast, got {:?}", sent[0]);
		};
		assert_eq!(obj["broadcast"], true);
		assert_eq!(obj["event"], "flush");
		assert_eq!(sent.len(), 1);
	}

	#[test]
	fn report_describes_this_process() {
		let report = stats_report(Instant::now());
		assert_eq!(report.pid, std::process::id());
		assert!(!report.filename.is_empty());
		assert!(report.memory.rss > 0);
	}
}
