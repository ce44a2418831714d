use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use herd_core::protocol::{Message, ROLE_ENV, ROLE_WORKER, WORKER_ENV};
use herd_core::types::SlotId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

/// Both ends of a freshly forked worker, as seen by the master.
pub struct WorkerChannel {
	pub pid: u32,
	/// Master to worker. Dropping every sender closes the worker's stdin,
	/// which is how the master asks for a graceful disconnect.
	pub outbound: mpsc::UnboundedSender<Message>,
	/// Worker to master, one raw line per item. Closes when the worker's
	/// stdout reaches EOF.
	pub inbound: mpsc::UnboundedReceiver<String>,
	pub process: Arc<dyn ProcessControl>,
}

pub trait ProcessControl: Send + Sync {
	/// Hard kill. Killing a process that already exited is a no-op.
	fn kill(&self);
	fn has_exited(&self) -> bool;
}

pub trait Spawner: Send + Sync + 'static {
	fn spawn(&self, slot: SlotId, exec: &Path, args: &[String]) -> Result<WorkerChannel, String>;
}

/// Forks real OS processes and talks to them over stdin/stdout.
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
	fn spawn(&self, slot: SlotId, exec: &Path, args: &[String]) -> Result<WorkerChannel, String> {
		let mut cmd = Command::new(exec);
		cmd.args(args)
			.env(WORKER_ENV, slot.to_string())
			.env(ROLE_ENV, ROLE_WORKER)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::inherit());

		let mut child = cmd
			.spawn()
			.map_err(|e| format!("spawn {} failed: {}", exec.display(), e))?;
		let pid = child.id().ok_or_else(|| "spawned worker has no pid".to_string())?;
		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| "worker stdin not captured".to_string())?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| "worker stdout not captured".to_string())?;

		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let (in_tx, in_rx) = mpsc::unbounded_channel();
		tokio::spawn(write_lines(stdin, out_rx));
		tokio::spawn(read_lines(stdout, in_tx));

		let exited = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&exited);
		tokio::spawn(async move {
			let _ = child.wait().await;
			flag.store(true, Ordering::SeqCst);
		});

		Ok(WorkerChannel {
			pid,
			outbound: out_tx,
			inbound: in_rx,
			process: Arc::new(OsProcess { pid, exited }),
		})
	}
}

struct OsProcess {
	pid: u32,
	exited: Arc<AtomicBool>,
}

impl ProcessControl for OsProcess {
	fn kill(&self) {
		if self.has_exited() {
			return;
		}
		use nix::sys::signal::{kill, Signal};
		use nix::unistd::Pid;
		let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
	}

	fn has_exited(&self) -> bool {
		self.exited.load(Ordering::SeqCst)
	}
}

async fn write_lines(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Message>) {
	while let Some(message) = rx.recv().await {
		if stdin.write_all(message.to_line().as_bytes()).await.is_err() {
			break;
		}
		if stdin.flush().await.is_err() {
			break;
		}
	}
}

/// Forward each stdout line until EOF or a read error. Lines that are not
/// UTF-8 are dropped without closing the channel.
async fn read_lines(stdout: ChildStdout, tx: mpsc::UnboundedSender<String>) {
	let mut reader = BufReader::new(stdout);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf).await {
			Ok(0) | Err(_) => break,
			Ok(_) => {}
		}
		let Ok(line) = String::from_utf8(std::mem::take(&mut buf)) else {
			tracing::debug!("dropping non-utf8 line from worker");
			continue;
		};
		let line = line.trim_end_matches(['\n', '\r']);
		if line.trim().is_empty() {
			continue;
		}
		if tx.send(line.to_string()).is_err() {
			break;
		}
	}
}
