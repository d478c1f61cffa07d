//! # Netmark
//!
//! A two-party network micro-benchmark implemented in Rust. A client process
//! and a server process cooperate to measure latency, bandwidth, and
//! messaging rate across stream sockets (TCP, SDP), datagram sockets (UDP,
//! RDS), and the RDMA queue-pair transports (RC, UC, UD).

pub mod cli;
pub mod clock;
pub mod control;
pub mod params;
#[cfg(feature = "rdma")]
pub mod rdma;
pub mod registry;
pub mod results;
pub mod sock;
pub mod stats;
pub mod wire;

pub use cli::Args;
pub use control::{ControlChannel, DEFAULT_CONTROL_PORT};
pub use params::{ParamTable, Request};
pub use registry::{run_client, run_server, TestContext, TESTS};
pub use stats::StatBlock;

/// The current version of netmark.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
