use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use herd_core::config::SupervisorSection;
use herd_core::protocol::Message;
use herd_core::types::*;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::router;
use crate::spawn::{ProcessControl, Spawner};
use crate::stats::{self, HostProbe, StatsStore};

const SPAWN_RETRY_FLOOR: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	pub exec: PathBuf,
	pub args: Vec<String>,
	pub workers: u32,
	/// Delay before a disconnected process that has not exited is killed.
	pub kill_wait: Duration,
	pub default_grace: Duration,
	pub max_grace: Duration,
	pub stats_interval: Duration,
	/// Whether a worker's broadcast is echoed back to the worker that sent it.
	pub broadcast_to_sender: bool,
}

impl SupervisorConfig {
	pub fn new(exec: impl Into<PathBuf>) -> Self {
		Self::from_section(exec, &SupervisorSection::default())
	}

	pub fn from_section(exec: impl Into<PathBuf>, section: &SupervisorSection) -> Self {
		Self {
			exec: exec.into(),
			args: Vec::new(),
			workers: section.workers.unwrap_or_else(cpu_count),
			kill_wait: Duration::from_millis(section.kill_wait_ms),
			default_grace: Duration::from_millis(section.grace_ms),
			max_grace: Duration::from_millis(section.max_grace_ms),
			stats_interval: Duration::from_millis(section.stats_interval_ms),
			broadcast_to_sender: section.broadcast_to_sender,
		}
	}
}

fn cpu_count() -> u32 {
	std::thread::available_parallelism()
		.map(|n| n.get() as u32)
		.unwrap_or(1)
}

/// Owns the pool. Every slot, process handle, route and stored snapshot lives
/// behind the one `pool` lock; timers re-acquire it and check the slot's
/// generation before acting.
pub struct Supervisor {
	pub config: SupervisorConfig,
	spawner: Arc<dyn Spawner>,
	probe: Arc<dyn HostProbe>,
	pool: RwLock<Pool>,
}

#[derive(Default)]
struct Pool {
	slots: BTreeMap<SlotId, WorkerSlot>,
	routes: HashMap<u32, SlotId>,
	stats: StatsStore,
	stopped: bool,
}

pub struct WorkerSlot {
	pub id: SlotId,
	pub exec: PathBuf,
	pub state: SlotState,
	pub last_start: Instant,
	pub grace_period: Duration,
	/// Bumped on every fork and on shutdown. Scheduled work captures it.
	pub generation: u64,
	pub restarts: u32,
	process: Option<WorkerProcess>,
}

pub struct WorkerProcess {
	pub pid: u32,
	pub status: WorkerStatus,
	pub generation: u64,
	outbound: Option<mpsc::UnboundedSender<Message>>,
	control: Arc<dyn ProcessControl>,
	/// Set when the master itself asked for the disconnect.
	intentional: bool,
	restart_requested: bool,
}

impl WorkerProcess {
	fn is_live(&self) -> bool {
		matches!(self.status, WorkerStatus::Starting | WorkerStatus::Connected)
	}

	fn send(&self, message: &Message) {
		if let Some(tx) = &self.outbound {
			let _ = tx.send(message.clone());
		}
	}

	fn disconnect(&mut self, restart: bool) {
		self.intentional = true;
		self.restart_requested = restart;
		self.status = WorkerStatus::Disconnecting;
		self.outbound = None;
	}
}

enum Next {
	Stay,
	Backoff(Duration),
	Refork,
}

impl Supervisor {
	pub fn new(
		config: SupervisorConfig,
		spawner: Arc<dyn Spawner>,
		probe: Arc<dyn HostProbe>,
	) -> Arc<Self> {
		Arc::new(Self {
			config,
			spawner,
			probe,
			pool: RwLock::new(Pool::default()),
		})
	}

	/// Create slots `1..=workers` and fork into each.
	pub async fn start(self: &Arc<Self>) -> Result<(), String> {
		let mut pool = self.pool.write().await;
		if !pool.slots.is_empty() {
			return Err("supervisor already started".to_string());
		}
		if self.config.workers == 0 {
			return Err("worker count must be at least 1".to_string());
		}

		let now = Instant::now();
		for id in 1..=self.config.workers {
			pool.slots.insert(
				id,
				WorkerSlot {
					id,
					exec: self.config.exec.clone(),
					state: SlotState::Starting,
					last_start: now,
					grace_period: self.config.default_grace,
					generation: 0,
					restarts: 0,
					process: None,
				},
			);
		}
		for id in 1..=self.config.workers {
			self.fork_locked(&mut pool, id, self.config.default_grace);
		}

		tracing::info!(
			"started {} workers running {}",
			self.config.workers,
			self.config.exec.display()
		);
		Ok(())
	}

	/// Spawn a process into `slot`. Must be called with the pool locked.
	fn fork_locked(self: &Arc<Self>, pool: &mut Pool, slot: SlotId, grace: Duration) {
		if pool.stopped {
			return;
		}
		let Some(ws) = pool.slots.get_mut(&slot) else {
			return;
		};

		ws.generation += 1;
		ws.last_start = Instant::now();
		ws.grace_period = grace;
		let generation = ws.generation;

		match self.spawner.spawn(slot, &ws.exec, &self.config.args) {
			Ok(channel) => {
				ws.state = SlotState::Starting;
				ws.process = Some(WorkerProcess {
					pid: channel.pid,
					status: WorkerStatus::Starting,
					generation,
					outbound: Some(channel.outbound),
					control: channel.process,
					intentional: false,
					restart_requested: false,
				});
				pool.routes.insert(channel.pid, slot);
				tracing::debug!(slot, pid = channel.pid, "forked worker");

				let sup = Arc::clone(self);
				let pid = channel.pid;
				let inbound = channel.inbound;
				tokio::spawn(async move {
					pump(sup, slot, generation, pid, inbound).await;
				});
			}
			Err(e) => {
				tracing::error!(slot, "failed to fork worker: {}", e);
				// Same path as a crash right after fork, but always through a timer.
				ws.process = None;
				let next = match backoff(ws, self.config.default_grace, self.config.max_grace) {
					Next::Refork => Next::Backoff(ws.grace_period.max(SPAWN_RETRY_FLOOR)),
					next => next,
				};
				self.apply_next(pool, slot, next);
			}
		}
	}

	async fn mark_connected(&self, slot: SlotId, generation: u64) {
		let mut pool = self.pool.write().await;
		let Some(ws) = pool.slots.get_mut(&slot) else {
			return;
		};
		if let Some(process) = ws.process.as_mut() {
			if process.generation == generation && process.status == WorkerStatus::Starting {
				process.status = WorkerStatus::Connected;
				ws.state = SlotState::Connected;
			}
		}
	}

	/// The channel to the process forked at `generation` closed.
	pub(crate) async fn on_disconnect(self: &Arc<Self>, slot: SlotId, generation: u64) {
		let mut pool = self.pool.write().await;
		self.disconnect_locked(&mut pool, slot, generation);
	}

	fn disconnect_locked(self: &Arc<Self>, pool: &mut Pool, slot: SlotId, generation: u64) {
		let Some(ws) = pool.slots.get_mut(&slot) else {
			return;
		};
		let current = ws.process.as_ref().map(|p| p.generation);
		if current != Some(generation) {
			// Stale notification for a process this slot no longer owns.
			return;
		}
		let Some(mut process) = ws.process.take() else {
			return;
		};

		process.status = WorkerStatus::Dead;
		process.outbound = None;
		schedule_kill(Arc::clone(&process.control), process.pid, self.config.kill_wait);

		let next = if pool.stopped || (process.intentional && !process.restart_requested) {
			ws.state = SlotState::Stopped;
			Next::Stay
		} else {
			ws.state = SlotState::Disconnecting;
			ws.restarts += 1;
			backoff(ws, self.config.default_grace, self.config.max_grace)
		};

		pool.routes.remove(&process.pid);
		pool.stats.forget(process.pid);
		tracing::info!(slot, pid = process.pid, "worker disconnected");

		self.apply_next(pool, slot, next);
	}

	fn apply_next(self: &Arc<Self>, pool: &mut Pool, slot: SlotId, next: Next) {
		match next {
			Next::Stay => {}
			Next::Refork => self.fork_locked(pool, slot, self.config.default_grace),
			Next::Backoff(delay) => {
				let Some(ws) = pool.slots.get_mut(&slot) else {
					return;
				};
				ws.state = SlotState::BackoffWait;
				let generation = ws.generation;
				tracing::warn!(
					slot,
					"worker restarted too quickly, next fork in {}ms",
					delay.as_millis()
				);
				self.schedule_refork(slot, generation, delay);
			}
		}
	}

	fn schedule_refork(self: &Arc<Self>, slot: SlotId, generation: u64, delay: Duration) {
		let sup = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let mut pool = sup.pool.write().await;
			let current = pool
				.slots
				.get(&slot)
				.map(|ws| (ws.generation, ws.state));
			if current != Some((generation, SlotState::BackoffWait)) {
				return;
			}
			sup.fork_locked(&mut pool, slot, delay);
		});
	}

	/// Send `message` to every connected worker.
	pub async fn broadcast(&self, message: &Message) -> usize {
		self.broadcast_except(message, None).await
	}

	pub async fn broadcast_except(&self, message: &Message, except: Option<u32>) -> usize {
		let pool = self.pool.read().await;
		let mut sent = 0;
		for process in pool.slots.values().filter_map(|ws| ws.process.as_ref()) {
			if !process.is_live() || Some(process.pid) == except {
				continue;
			}
			process.send(message);
			sent += 1;
		}
		sent
	}

	/// Ask every connected worker for a stats reply. Does not wait.
	pub async fn request_stats(&self) -> usize {
		self.broadcast(&Message::StatsRequest).await
	}

	/// Store a stats reply from `pid`. Replies from pids that are no longer
	/// routed to a slot are dropped.
	pub async fn record_snapshot(&self, pid: u32, report: StatsReport) -> bool {
		let mut pool = self.pool.write().await;
		if !pool.routes.contains_key(&pid) {
			tracing::debug!(pid, "dropping stats from unknown worker");
			return false;
		}
		pool.stats.record(pid, report);
		true
	}

	/// Aggregate the most recent reply of every connected worker.
	pub async fn snapshot(&self) -> AggregatedStats {
		let host = self.probe.sample();
		let pool = self.pool.read().await;
		let workers = pool
			.slots
			.values()
			.filter_map(|ws| ws.process.as_ref())
			.filter(|p| p.status == WorkerStatus::Connected)
			.map(|p| (p.pid, pool.stats.get(p.pid)));
		stats::aggregate(workers, &host)
	}

	/// Gracefully disconnect every live worker. With `restart` the normal
	/// disconnect handling reforks them; without it the slots stay empty.
	///
	/// Closing the channel from this side counts as the disconnect: the
	/// kill-wait timer starts now, whether or not the worker ever exits.
	pub async fn disconnect_all(self: &Arc<Self>, restart: bool) -> usize {
		let mut pool = self.pool.write().await;
		let mut closed = Vec::new();
		for ws in pool.slots.values_mut() {
			let Some(process) = ws.process.as_mut() else {
				continue;
			};
			if !process.is_live() {
				continue;
			}
			process.disconnect(restart);
			ws.state = SlotState::Disconnecting;
			closed.push((ws.id, process.generation));
		}
		tracing::info!(count = closed.len(), restart, "disconnecting workers");

		for (slot, generation) in &closed {
			self.disconnect_locked(&mut pool, *slot, *generation);
		}
		closed.len()
	}

	/// Stop every slot and hard-kill every live process. Nothing is reforked
	/// afterwards.
	pub async fn kill_all(&self) -> usize {
		let mut pool = self.pool.write().await;
		pool.stopped = true;
		let mut killed = Vec::new();
		for ws in pool.slots.values_mut() {
			ws.generation += 1;
			ws.state = SlotState::Stopped;
			if let Some(mut process) = ws.process.take() {
				process.status = WorkerStatus::Dead;
				process.outbound = None;
				process.control.kill();
				killed.push(process.pid);
			}
		}
		for pid in &killed {
			pool.routes.remove(pid);
			pool.stats.forget(*pid);
		}
		tracing::info!(count = killed.len(), "killed all workers");
		killed.len()
	}

	pub async fn status(&self) -> Vec<SlotStatus> {
		let pool = self.pool.read().await;
		pool.slots
			.values()
			.map(|ws| SlotStatus {
				slot: ws.id,
				state: ws.state,
				pid: ws.process.as_ref().map(|p| p.pid),
				grace_period_ms: ws.grace_period.as_millis() as u64,
				restarts: ws.restarts,
			})
			.collect()
	}

	pub async fn pids(&self) -> Vec<u32> {
		let pool = self.pool.read().await;
		pool.slots
			.values()
			.filter_map(|ws| ws.process.as_ref())
			.filter(|p| p.is_live())
			.map(|p| p.pid)
			.collect()
	}

	pub async fn is_stopped(&self) -> bool {
		self.pool.read().await.stopped
	}

	/// Request stats from every worker every `stats_interval`, starting one
	/// interval from now.
	pub fn spawn_stats_ticker(self: &Arc<Self>) -> JoinHandle<()> {
		let sup = Arc::clone(self);
		let period = self.config.stats_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
			loop {
				ticker.tick().await;
				if sup.is_stopped().await {
					return;
				}
				sup.request_stats().await;
			}
		})
	}
}

/// Decide what follows a disconnect given the slot's uptime.
fn backoff(ws: &mut WorkerSlot, default_grace: Duration, max_grace: Duration) -> Next {
	if ws.last_start.elapsed() < ws.grace_period {
		ws.grace_period = (ws.grace_period * 2).min(max_grace);
		Next::Backoff(ws.grace_period)
	} else {
		ws.grace_period = default_grace;
		Next::Refork
	}
}

fn schedule_kill(control: Arc<dyn ProcessControl>, pid: u32, wait: Duration) {
	tokio::spawn(async move {
		tokio::time::sleep(wait).await;
		if !control.has_exited() {
			tracing::debug!(pid, "killing worker that did not exit after disconnect");
			control.kill();
		}
	});
}

/// Route every line a worker sends until its channel closes, then report the
/// disconnect.
async fn pump(
	sup: Arc<Supervisor>,
	slot: SlotId,
	generation: u64,
	pid: u32,
	mut inbound: mpsc::UnboundedReceiver<String>,
) {
	sup.mark_connected(slot, generation).await;
	while let Some(line) = inbound.recv().await {
		router::receive(&sup, pid, &line).await;
	}
	sup.on_disconnect(slot, generation).await;
}
