//! # herd
//!
//! Keeps a fixed pool of long-lived worker processes alive.
//!
//! Workers are forked into stable slots and talk to the master over
//! newline-delimited JSON on their stdin/stdout. A worker whose channel closes
//! is reforked, with the slot's grace period doubling (up to a cap) while it
//! keeps dying young. The master periodically asks workers for stats and can
//! restart the whole pool when watched files change.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use herd::{ProcessSpawner, Supervisor, SupervisorConfig, SysinfoProbe};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut config = SupervisorConfig::new("/srv/app/worker");
//! config.workers = 4;
//!
//! let sup = Supervisor::new(config, Arc::new(ProcessSpawner), Arc::new(SysinfoProbe));
//! sup.start().await.unwrap();
//! sup.spawn_stats_ticker();
//!
//! let code = herd::signals::listen(vec![sup]).await.unwrap_or(1);
//! std::process::exit(code);
//! # }
//! ```

pub mod router;
pub mod signals;
pub mod spawn;
pub mod stats;
pub mod supervisor;
pub mod watch;
pub mod worker;

pub use herd_core::{config, protocol, types};
pub use spawn::{ProcessControl, ProcessSpawner, Spawner, WorkerChannel};
pub use stats::{HostProbe, HostSample, SysinfoProbe};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use watch::{WatchCoordinator, WatchSession, WatchTimings};
