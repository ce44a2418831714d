//! Dispatch of lines arriving from workers.
//!
//! Each rule is evaluated on its own: a stats reply goes to the aggregator, a
//! broadcast is relayed to the pool. Anything that fails to decode is dropped
//! here and never reaches the supervisor.

use std::sync::Arc;

use herd_core::protocol::Message;

use crate::supervisor::Supervisor;

pub async fn receive(supervisor: &Arc<Supervisor>, pid: u32, line: &str) {
	let messages = match Message::decode(line) {
		Ok(m) => m,
		Err(e) => {
			tracing::debug!(pid, "dropping worker message: {}", e);
			return;
		}
	};

	for message in messages {
		dispatch(supervisor, pid, message).await;
	}
}

async fn dispatch(supervisor: &Arc<Supervisor>, pid: u32, message: Message) {
	match message {
		Message::StatsResponse(report) => {
			supervisor.record_snapshot(pid, report).await;
		}
		Message::Broadcast(_) => {
			let except = if supervisor.config.broadcast_to_sender {
				None
			} else {
				Some(pid)
			};
			supervisor.broadcast_except(&message, except).await;
		}
		Message::StatsRequest => {
			tracing::debug!(pid, "ignoring stats request sent by a worker");
		}
	}
}
