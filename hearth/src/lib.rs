//! Master/worker network server framework.
//!
//! A supervisor process forks off a pool of worker processes, each running an
//! event-driven task dispatcher over non-blocking sockets. Supervisor and
//! workers exchange command records and OS descriptors over per-worker
//! control channels, so workers can address one another even across respawns.

pub mod channel;
pub mod config;
pub mod logging;
pub mod master;
pub mod message;
pub mod net;
pub mod server;
pub mod status;
pub mod task;
pub mod worker;

pub use crate::config::Config;
pub use crate::master::Master;
pub use crate::server::Server;
pub use crate::status::{Result, Status};
pub use crate::task::Handler;

/// Capacity of the supervisor's process table. Slot numbers are part of the
/// control-channel wire format, so the table is a fixed arena rather than a
/// growable map.
pub const MAX_PROCESS: usize = 1024;

/// Number of independent task sequences inside a worker. The shard id of a
/// task is derived from its descriptor and stays stable for its lifetime.
pub const NUM_SHARDS: usize = 10;

/// Idle interval after which a connected task is probed, in milliseconds.
pub const KEEP_ALIVE_MS: u64 = 3000;

/// Number of unanswered probes after which a peer is evicted.
pub const KEEP_ALIVE_CNT: u8 = 5;

/// Descriptor on which a spawned worker inherits its channel endpoint.
pub const CHANNEL_FD: i32 = 3;

/// Send buffer applied to accepted stream sockets.
pub const SEND_BUF_SIZE: usize = 0x0030_0000;

pub const SOFTWARE_NAME: &str = "hearth";
pub const SOFTWARE_VERSION: &str = "0.1.0";
