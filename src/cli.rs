//! # Command-Line Interface Module
//!
//! Argument parsing for both endpoint roles, built on the `clap` derive API.
//! The same binary is the client and the server: with `--listen` it serves
//! tests; otherwise the positional host and test names select what to run.
//!
//! Every measurement knob maps onto an entry in the parameter table, and the
//! generic `--set-param NAME=VALUE` escape hatch reaches any entry directly,
//! including the `L_`/`R_` per-side views that have no dedicated flag.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Server
//! netmark --listen
//!
//! # TCP bandwidth and latency against a server, ten seconds each
//! netmark -t 10 perf-server tcp_bw tcp_lat
//!
//! # RDMA read latency on a chosen device and port, polling the CQ
//! netmark -I mlx5_0:2 -P perf-server rc_rdma_read_lat
//!
//! # Pin the remote side's message size only
//! netmark --set-param R_msg_size=4096 perf-server udp_bw
//! ```

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::control::DEFAULT_CONTROL_PORT;
use crate::params::ParamTable;
use crate::registry::{ClientConfig, ServerConfig};

/// Defines the styles for the help message.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Host running the netmark server (client mode)
    #[arg(value_name = "HOST", help_heading = "Core Options")]
    pub host: Option<String>,

    /// Tests to run, in order (e.g. tcp_bw rc_lat ud_bi_bw)
    #[arg(value_name = "TESTS", help_heading = "Core Options")]
    pub tests: Vec<String>,

    /// Run as the server and wait for clients
    #[arg(short = 'l', long, help_heading = "Core Options")]
    pub listen: bool,

    /// Control-channel port to listen on (server)
    #[arg(long, alias = "lp", default_value_t = DEFAULT_CONTROL_PORT, help_heading = "Core Options")]
    pub listen_port: u16,

    /// Control-channel port of the remote server (client)
    #[arg(long, alias = "rp", default_value_t = DEFAULT_CONTROL_PORT, help_heading = "Core Options")]
    pub remote_port: u16,

    /// Duration of each test in seconds
    #[arg(short = 't', long, help_heading = "Measurement")]
    pub time: Option<u32>,

    /// Message size in bytes (accepts k/m/g suffixes)
    #[arg(short = 'M', long, help_heading = "Measurement")]
    pub msg_size: Option<String>,

    /// Stop after this many messages, alarm or not
    #[arg(long = "no-msgs", alias = "nm", help_heading = "Measurement")]
    pub no_msgs: Option<u32>,

    /// Socket buffer size in bytes for the socket transports
    #[arg(short = 'B', long, help_heading = "Socket Transports")]
    pub sock_buf_size: Option<String>,

    /// Pin the server's data port instead of an ephemeral one
    #[arg(long, help_heading = "Socket Transports")]
    pub port: Option<u16>,

    /// Pin the client's local data port
    #[arg(long, help_heading = "Socket Transports")]
    pub alt_port: Option<u16>,

    /// Reverse the direction of bandwidth tests
    #[arg(long, help_heading = "Measurement")]
    pub flip: bool,

    /// RDMA path MTU (256, 512, 1024, 2048 or 4096)
    #[arg(short = 'm', long, help_heading = "RDMA Transports")]
    pub mtu: Option<u32>,

    /// RDMA device identifier, "device[:port]"
    #[arg(short = 'I', long, help_heading = "RDMA Transports")]
    pub id: Option<String>,

    /// Static rate of the link (e.g. 2.5, 10, 1x, 4x, 12x)
    #[arg(short = 'r', long, help_heading = "RDMA Transports")]
    pub rate: Option<String>,

    /// Spin on the completion queue instead of waiting for events
    #[arg(short = 'P', long, help_heading = "RDMA Transports")]
    pub poll: bool,

    /// Outstanding RDMA reads and atomics per queue pair
    #[arg(short = 'A', long, help_heading = "RDMA Transports")]
    pub rd_atomic: Option<u32>,

    /// Touch every received buffer on the server side
    #[arg(long, help_heading = "RDMA Transports")]
    pub access_recv: bool,

    /// Pin the process to one CPU core
    #[arg(short = 'a', long, help_heading = "Measurement")]
    pub affinity: Option<u32>,

    /// Timeout in seconds for control-channel operations
    #[arg(long, help_heading = "Measurement")]
    pub timeout: Option<u32>,

    /// Set a named parameter, NAME=VALUE; L_/R_ prefixes address one side
    #[arg(long = "set-param", alias = "ip", value_name = "NAME=VALUE", help_heading = "Parameters")]
    pub set_param: Vec<String>,

    /// Print the value of a named parameter and exit
    #[arg(long = "show-param", alias = "op", value_name = "NAME", help_heading = "Parameters")]
    pub show_param: Vec<String>,

    /// Append one JSON record per test to this file
    #[arg(long, help_heading = "Output and Logging")]
    pub output_json: Option<PathBuf>,

    /// Detailed log destination: a file path, or "stderr"
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Silence user-facing output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

impl Args {
    /// Build the base parameter table from the flags. Dedicated flags and
    /// `--set-param` land in the same entries; the generic form wins when
    /// both name the same parameter because it is applied last.
    pub fn to_param_table(&self) -> Result<ParamTable> {
        let mut table = ParamTable::new();
        let mut set = |name: &str, value: String| -> Result<()> {
            table
                .set_by_user(name, &value)
                .with_context(|| format!("bad value for {}", name))
        };

        if let Some(v) = self.time {
            set("time", v.to_string())?;
        }
        if let Some(v) = &self.msg_size {
            set("msg_size", v.clone())?;
        }
        if let Some(v) = self.no_msgs {
            set("no_msgs", v.to_string())?;
        }
        if let Some(v) = &self.sock_buf_size {
            set("sock_buf_size", v.clone())?;
        }
        if let Some(v) = self.port {
            set("port", v.to_string())?;
        }
        if let Some(v) = self.alt_port {
            set("alt_port", v.to_string())?;
        }
        if self.flip {
            set("flip", "1".to_string())?;
        }
        if let Some(v) = self.mtu {
            set("mtu_size", v.to_string())?;
        }
        if let Some(v) = &self.id {
            set("id", v.clone())?;
        }
        if let Some(v) = &self.rate {
            set("static_rate", v.clone())?;
        }
        if self.poll {
            set("poll_mode", "1".to_string())?;
        }
        if let Some(v) = self.rd_atomic {
            set("rd_atomic", v.to_string())?;
        }
        if self.access_recv {
            set("access_recv", "1".to_string())?;
        }
        if let Some(v) = self.affinity {
            set("affinity", v.to_string())?;
        }
        if let Some(v) = self.timeout {
            set("timeout", v.to_string())?;
        }

        for spec in &self.set_param {
            let (name, value) = spec
                .split_once('=')
                .with_context(|| format!("--set-param wants NAME=VALUE, got '{}'", spec))?;
            table
                .set_by_user(name, value)
                .with_context(|| format!("bad --set-param '{}'", spec))?;
        }
        Ok(table)
    }

    /// Client-mode configuration, or an error when the positionals are
    /// missing.
    pub fn to_client_config(&self) -> Result<ClientConfig> {
        let host = match &self.host {
            Some(host) => host.clone(),
            None => bail!("a server host is required unless --listen is given"),
        };
        if self.tests.is_empty() {
            bail!("no tests named; try e.g. 'netmark {} tcp_bw'", host);
        }
        Ok(ClientConfig {
            host,
            remote_port: self.remote_port,
            tests: self.tests.clone(),
            table: self.to_param_table()?,
            json_path: self.output_json.clone(),
        })
    }

    /// Server-mode configuration.
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_port: self.listen_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamId;

    #[test]
    fn test_client_args_parse() {
        let args = Args::parse_from(["netmark", "-t", "10", "-M", "64k", "host1", "tcp_bw"]);
        let cfg = args.to_client_config().unwrap();
        assert_eq!(cfg.host, "host1");
        assert_eq!(cfg.tests, vec!["tcp_bw"]);
        assert_eq!(cfg.table.peek_u32(ParamId::Time), 10);
        assert_eq!(cfg.table.peek_u32(ParamId::MsgSize), 65536);
    }

    #[test]
    fn test_server_args_parse() {
        let args = Args::parse_from(["netmark", "--listen", "--listen-port", "20000"]);
        assert!(args.listen);
        assert_eq!(args.to_server_config().listen_port, 20000);
    }

    #[test]
    fn test_client_requires_host_and_tests() {
        let args = Args::parse_from(["netmark"]);
        assert!(args.to_client_config().is_err());

        let args = Args::parse_from(["netmark", "host1"]);
        assert!(args.to_client_config().is_err());
    }

    #[test]
    fn test_set_param_reaches_sided_views() {
        let args = Args::parse_from([
            "netmark",
            "--set-param",
            "L_msg_size=1024",
            "--set-param",
            "R_msg_size=2048",
            "host1",
            "tcp_bw",
        ]);
        let table = args.to_param_table().unwrap();
        assert_eq!(table.peek_u32(ParamId::MsgSize), 1024);
        assert_eq!(table.to_request(0).msg_size, 2048);
    }

    #[test]
    fn test_bad_set_param_rejected() {
        let args = Args::parse_from(["netmark", "--set-param", "nonsense", "host1", "tcp_bw"]);
        assert!(args.to_param_table().is_err());

        let args = Args::parse_from(["netmark", "--set-param", "bogus=1", "host1", "tcp_bw"]);
        assert!(args.to_param_table().is_err());
    }
}
