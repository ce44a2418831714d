//! OS signals mapped to pool-wide actions.
//!
//! SIGHUP reloads: every worker is gracefully disconnected and reforked, the
//! master keeps running. Every other consumed signal hard-kills the pool and
//! ends the master with status 0.

use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::supervisor::Supervisor;

pub const RELOAD_SIGNAL: Signal = Signal::SIGHUP;

/// Signals that shut the whole pool down.
pub const TERMINATION_SIGNALS: [Signal; 5] = [
	Signal::SIGINT,
	Signal::SIGQUIT,
	Signal::SIGTERM,
	Signal::SIGUSR1,
	Signal::SIGUSR2,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
	Reload,
	Terminate,
}

impl From<Signal> for SignalAction {
	fn from(signal: Signal) -> Self {
		if signal == RELOAD_SIGNAL {
			SignalAction::Reload
		} else {
			SignalAction::Terminate
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
	Continue,
	Exit(i32),
}

pub async fn apply(action: SignalAction, supervisors: &[Arc<Supervisor>]) -> SignalOutcome {
	match action {
		SignalAction::Reload => {
			for sup in supervisors {
				sup.disconnect_all(true).await;
			}
			SignalOutcome::Continue
		}
		SignalAction::Terminate => {
			for sup in supervisors {
				sup.kill_all().await;
			}
			SignalOutcome::Exit(0)
		}
	}
}

/// Listen for the reload and termination signals until one asks the master
/// to exit. Returns the exit status.
pub async fn listen(supervisors: Vec<Arc<Supervisor>>) -> Result<i32, String> {
	let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();

	for sig in std::iter::once(RELOAD_SIGNAL).chain(TERMINATION_SIGNALS) {
		let mut stream = signal(SignalKind::from_raw(sig as i32))
			.map_err(|e| format!("failed to install {} handler: {}", sig, e))?;
		let tx = tx.clone();
		tokio::spawn(async move {
			while stream.recv().await.is_some() {
				if tx.send(sig).is_err() {
					break;
				}
			}
		});
	}
	drop(tx);

	while let Some(sig) = rx.recv().await {
		let action = SignalAction::from(sig);
		tracing::info!("received {}, {:?}", sig, action);
		if let SignalOutcome::Exit(code) = apply(action, &supervisors).await {
			return Ok(code);
		}
	}
	Err("signal listeners closed".to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hangup_reloads() {
		assert_eq!(SignalAction::from(Signal::SIGHUP), SignalAction::Reload);
	}

	#[test]
	fn everything_else_terminates() {
		for sig in TERMINATION_SIGNALS {
			assert_eq!(SignalAction::from(sig), SignalAction::Terminate);
		}
		assert_eq!(SignalAction::from(Signal::SIGALRM), SignalAction::Terminate);
	}
}
