//! # Test Registry & Dispatch Module
//!
//! The table that gives every test a stable sixteen-bit index and a pair of
//! driver functions, plus the client and server execution loops that wrap a
//! driver invocation in the shared per-test protocol: ship the REQUEST, run
//! the driver, exchange statistics, report.
//!
//! The index of a row is part of the wire protocol — the server picks its
//! driver by the index in the request — so rows are only ever appended. The
//! RDMA rows keep their indices even in builds without the `rdma` feature;
//! there the drivers are stubs that fail with a clear diagnostic, which
//! keeps a feature-lean endpoint protocol-compatible with a full one.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};

use crate::clock::{self, RunClock};
use crate::control::{self, ControlChannel};
use crate::params::{ParamId, ParamTable, NO_AFFINITY};
use crate::results;
use crate::sock;
use crate::stats::StatBlock;

/// What a test measures, which decides how its results are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    Bandwidth,
    Latency,
    MsgRate,
    /// Meta tests (`conf`, `quit`) exchange no statistics.
    None,
}

/// One driver half; every test names two of these.
pub type DriverFn = fn(&mut TestContext) -> Result<()>;

/// One registry row.
#[derive(Debug)]
pub struct TestSpec {
    pub name: &'static str,
    pub measure: Measure,
    pub client: DriverFn,
    pub server: DriverFn,
}

impl TestSpec {
    fn exchanges_stats(&self) -> bool {
        self.measure != Measure::None
    }
}

/// Everything a driver needs for one test run.
pub struct TestContext {
    pub control: ControlChannel,
    pub params: ParamTable,
    pub stats: StatBlock,
    pub run_clock: RunClock,
    pub is_client: bool,
}

impl TestContext {
    fn new(control: ControlChannel, params: ParamTable, is_client: bool) -> Self {
        Self {
            control,
            params,
            stats: StatBlock::new(),
            run_clock: RunClock::new(),
            is_client,
        }
    }

    /// Consume the parameters every driver honors: the control-channel
    /// timeout and the processor affinity.
    pub fn common_setup(&mut self) -> Result<()> {
        let timeout = self.params.take_u32(ParamId::Timeout);
        self.control
            .apply_timeout(Duration::from_secs(u64::from(timeout.max(1))))?;

        let affinity = self.params.take_u32(ParamId::Affinity);
        if affinity != NO_AFFINITY {
            pin_to_core(affinity as usize)?;
        }
        Ok(())
    }

    /// The tail of every driver's setup phase: fail on inapplicable
    /// parameters, then hit the barrier and start the run clock.
    pub fn validate_and_barrier(&mut self) -> Result<bool> {
        let duration = self.params.take_u32(ParamId::Time);
        self.params.validate()?;
        let released = control::barrier(&mut self.control, &mut self.run_clock, duration)?;
        if !released {
            warn!("peer failed the barrier; skipping the measurement loop");
        }
        Ok(released)
    }
}

/// Pin the calling process to one core so the measurement loop does not
/// migrate mid-run.
fn pin_to_core(core: usize) -> Result<()> {
    let cores = core_affinity::get_core_ids()
        .ok_or_else(|| anyhow!("cannot enumerate CPU cores on this platform"))?;
    let target = cores.get(core).ok_or_else(|| {
        anyhow!(
            "invalid core id {}: system has {} cores (0 to {})",
            core,
            cores.len(),
            cores.len() - 1
        )
    })?;
    if !core_affinity::set_for_current(*target) {
        warn!("failed to set affinity for core {}", core);
    }
    Ok(())
}

/// `conf`: exchange and print endpoint configuration. No measurement.
fn conf_client(ctx: &mut TestContext) -> Result<()> {
    let local = endpoint_info();
    ctx.control.send_mesg(&encode_info(&local), "config")?;
    let mut buf = [0u8; INFO_LEN];
    ctx.control.recv_mesg(&mut buf, "config")?;
    info!("local  {}", local);
    info!("remote {}", decode_info(&buf));
    Ok(())
}

fn conf_server(ctx: &mut TestContext) -> Result<()> {
    let mut buf = [0u8; INFO_LEN];
    ctx.control.recv_mesg(&mut buf, "config")?;
    ctx.control
        .send_mesg(&encode_info(&endpoint_info()), "config")?;
    Ok(())
}

const INFO_LEN: usize = 128;

fn endpoint_info() -> String {
    format!(
        "netmark {} cpus={} ticks={}",
        crate::VERSION,
        crate::clock::online_cpus(),
        crate::clock::ticks_per_second(),
    )
}

fn encode_info(s: &str) -> Vec<u8> {
    let mut enc = crate::wire::Encoder::with_capacity(INFO_LEN);
    enc.put_str(s, INFO_LEN);
    enc.finish()
}

fn decode_info(buf: &[u8]) -> String {
    crate::wire::Decoder::new(buf)
        .get_str(INFO_LEN)
        .unwrap_or_default()
}

/// `quit`: the request itself is the message; both halves are no-ops.
fn quit_noop(_ctx: &mut TestContext) -> Result<()> {
    Ok(())
}

#[cfg(not(feature = "rdma"))]
fn rdma_unavailable(_ctx: &mut TestContext) -> Result<()> {
    Err(anyhow!(
        "netmark was built without RDMA support (enable the `rdma` feature)"
    ))
}

/// Expands to an RDMA driver pair, or to stubs in a build without the
/// `rdma` feature. The unexpanded paths in the stub arm are never resolved.
#[cfg(feature = "rdma")]
macro_rules! rdma_pair {
    ($client:path, $server:path) => {
        ($client as DriverFn, $server as DriverFn)
    };
}
#[cfg(not(feature = "rdma"))]
macro_rules! rdma_pair {
    ($client:path, $server:path) => {
        (rdma_unavailable as DriverFn, rdma_unavailable as DriverFn)
    };
}

macro_rules! test {
    ($name:literal, $measure:ident, $client:path, $server:path) => {
        TestSpec {
            name: $name,
            measure: Measure::$measure,
            client: $client,
            server: $server,
        }
    };
    ($name:literal, $measure:ident, rdma: $client:path, $server:path) => {
        TestSpec {
            name: $name,
            measure: Measure::$measure,
            client: rdma_pair!($client, $server).0,
            server: rdma_pair!($client, $server).1,
        }
    };
}

#[cfg(feature = "rdma")]
use crate::rdma::loops as rl;

/// The registry. Append-only; indices are wire protocol.
pub static TESTS: &[TestSpec] = &[
    test!("conf", None, conf_client, conf_server),
    test!("quit", None, quit_noop, quit_noop),
    test!("tcp_bw", Bandwidth, sock::tcp_bw_client, sock::tcp_bw_server),
    test!("tcp_lat", Latency, sock::tcp_lat_client, sock::tcp_lat_server),
    test!("sdp_bw", Bandwidth, sock::sdp_bw_client, sock::sdp_bw_server),
    test!("sdp_lat", Latency, sock::sdp_lat_client, sock::sdp_lat_server),
    test!("udp_bw", Bandwidth, sock::udp_bw_client, sock::udp_bw_server),
    test!("udp_lat", Latency, sock::udp_lat_client, sock::udp_lat_server),
    test!("rds_bw", Bandwidth, sock::rds_bw_client, sock::rds_bw_server),
    test!("rds_lat", Latency, sock::rds_lat_client, sock::rds_lat_server),
    test!("rc_bw", Bandwidth, rdma: rl::rc_bw_client, rl::rc_bw_server),
    test!("rc_bi_bw", Bandwidth, rdma: rl::rc_bi_bw_client, rl::rc_bi_bw_server),
    test!("rc_lat", Latency, rdma: rl::rc_lat_client, rl::rc_lat_server),
    test!("uc_bw", Bandwidth, rdma: rl::uc_bw_client, rl::uc_bw_server),
    test!("uc_bi_bw", Bandwidth, rdma: rl::uc_bi_bw_client, rl::uc_bi_bw_server),
    test!("uc_lat", Latency, rdma: rl::uc_lat_client, rl::uc_lat_server),
    test!("ud_bw", Bandwidth, rdma: rl::ud_bw_client, rl::ud_bw_server),
    test!("ud_bi_bw", Bandwidth, rdma: rl::ud_bi_bw_client, rl::ud_bi_bw_server),
    test!("ud_lat", Latency, rdma: rl::ud_lat_client, rl::ud_lat_server),
    test!("rc_rdma_read_bw", Bandwidth, rdma: rl::rc_rdma_read_bw_client, rl::rc_nop_bw_server),
    test!("rc_rdma_read_lat", Latency, rdma: rl::rc_rdma_read_lat_client, rl::rc_nop_lat_server),
    test!("rc_rdma_write_bw", Bandwidth, rdma: rl::rc_rdma_write_bw_client, rl::rc_nop_bw_server),
    test!("rc_rdma_write_lat", Latency, rdma: rl::rc_rdma_write_lat_client, rl::rc_rdma_write_lat_server),
    test!("rc_rdma_write_poll_lat", Latency, rdma: rl::rc_rdma_write_poll_lat_client, rl::rc_rdma_write_poll_lat_server),
    test!("uc_rdma_write_bw", Bandwidth, rdma: rl::uc_rdma_write_bw_client, rl::uc_nop_bw_server),
    test!("uc_rdma_write_lat", Latency, rdma: rl::uc_rdma_write_lat_client, rl::uc_rdma_write_lat_server),
    test!("uc_rdma_write_poll_lat", Latency, rdma: rl::uc_rdma_write_poll_lat_client, rl::uc_rdma_write_poll_lat_server),
    test!("rc_compare_swap_mr", MsgRate, rdma: rl::rc_compare_swap_client, rl::rc_atomic_server),
    test!("rc_fetch_add_mr", MsgRate, rdma: rl::rc_fetch_add_client, rl::rc_atomic_server),
    test!("ver_rc_compare_swap", MsgRate, rdma: rl::ver_rc_compare_swap_client, rl::rc_atomic_server),
    test!("ver_rc_fetch_add", MsgRate, rdma: rl::ver_rc_fetch_add_client, rl::rc_atomic_server),
];

/// Find a test by name.
pub fn lookup(name: &str) -> Result<(u16, &'static TestSpec)> {
    TESTS
        .iter()
        .enumerate()
        .find(|(_, t)| t.name == name)
        .map(|(i, t)| (i as u16, t))
        .ok_or_else(|| {
            anyhow!(
                "unknown test '{}'; known tests: {}",
                name,
                TESTS
                    .iter()
                    .map(|t| t.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
}

/// Client-side configuration assembled by the CLI.
pub struct ClientConfig {
    pub host: String,
    pub remote_port: u16,
    pub tests: Vec<String>,
    pub table: ParamTable,
    pub json_path: Option<std::path::PathBuf>,
}

/// Run every requested test against the server, stopping at the first
/// failure.
pub fn run_client(cfg: &ClientConfig) -> Result<()> {
    for name in &cfg.tests {
        let (index, spec) = lookup(name)?;
        run_one_client_test(cfg, index, spec)
            .with_context(|| format!("test {} failed", spec.name))?;
    }
    Ok(())
}

fn run_one_client_test(cfg: &ClientConfig, index: u16, spec: &TestSpec) -> Result<()> {
    info!("running {}", spec.name);
    clock::reset_finished();

    let table = cfg.table.clone();
    let timeout = table.peek_u32(ParamId::Timeout);
    let mut control = ControlChannel::connect(&cfg.host, cfg.remote_port, timeout)?;
    control.send_request(&table.to_request(index))?;

    let mut ctx = TestContext::new(control, table, true);
    ctx.common_setup()?;
    (spec.client)(&mut ctx)?;

    if spec.exchanges_stats() {
        ctx.run_clock.stop();
        ctx.run_clock.fill_stats(&mut ctx.stats);
        let peer = ctx.control.exchange_results(&ctx.stats)?;
        ctx.stats.merge_remote(&peer);
        results::report(spec, &ctx.stats, ctx.run_clock.elapsed())?;
        if let Some(path) = &cfg.json_path {
            results::append_json(path, spec.name, &ctx.stats, ctx.run_clock.elapsed())?;
        }
    }
    Ok(())
}

/// Server-side configuration assembled by the CLI.
pub struct ServerConfig {
    pub listen_port: u16,
}

/// Serve tests until a client sends `quit` or the listener dies.
pub fn run_server(cfg: &ServerConfig) -> Result<()> {
    let listener = ControlChannel::bind_listener(cfg.listen_port)?;
    info!("serving on control port {}", cfg.listen_port);

    loop {
        let mut control = ControlChannel::accept(&listener)?;
        let req = match control.recv_request(TESTS.len() as u16) {
            Ok(req) => req,
            Err(e) => {
                error!("rejected request: {}", e);
                continue;
            }
        };
        let spec = &TESTS[usize::from(req.req_index)];
        if spec.name == "quit" {
            info!("quit requested; shutting down");
            return Ok(());
        }

        debug!("serving {}", spec.name);
        clock::reset_finished();
        let mut table = ParamTable::new();
        table.adopt_request(&req);

        let mut ctx = TestContext::new(control, table, false);
        let outcome = ctx.common_setup().and_then(|()| (spec.server)(&mut ctx));
        match outcome {
            Ok(()) if spec.exchanges_stats() => {
                ctx.run_clock.stop();
                ctx.run_clock.fill_stats(&mut ctx.stats);
                match ctx.control.exchange_results(&ctx.stats) {
                    Ok(peer) => ctx.stats.merge_remote(&peer),
                    Err(e) => error!("results exchange for {} failed: {}", spec.name, e),
                }
            }
            Ok(()) => {}
            Err(e) => error!("test {} failed: {:#}", spec.name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Indices are wire protocol: pin the stable prefix of the table.
    #[test]
    fn test_registry_indices_are_stable() {
        assert_eq!(lookup("conf").unwrap().0, 0);
        assert_eq!(lookup("quit").unwrap().0, 1);
        assert_eq!(lookup("tcp_bw").unwrap().0, 2);
        assert_eq!(lookup("udp_lat").unwrap().0, 7);
        assert_eq!(lookup("rc_bw").unwrap().0, 10);
        assert_eq!(lookup("ud_bi_bw").unwrap().0, 17);
        assert_eq!(lookup("rc_rdma_read_lat").unwrap().0, 20);
        assert_eq!(lookup("rc_rdma_write_poll_lat").unwrap().0, 23);
        assert_eq!(lookup("ver_rc_fetch_add").unwrap().0, 30);
        assert_eq!(TESTS.len(), 31);
    }

    #[test]
    fn test_lookup_unknown_test() {
        let err = lookup("warp_drive_bw").unwrap_err().to_string();
        assert!(err.contains("unknown test"));
        assert!(err.contains("tcp_bw"));
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = TESTS.iter().map(|t| t.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), TESTS.len());
    }
}
