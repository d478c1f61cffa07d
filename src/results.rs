//! # Results Module
//!
//! Turns the raw counter tuples of a finished test into the lines the user
//! reads, and optionally into a machine-readable JSON record. Only derived
//! values that fall straight out of the tuples are computed here — a
//! bandwidth, a latency, a message rate; anything fancier belongs to the
//! consumer of the JSON output.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use crate::registry::{Measure, TestSpec};
use crate::stats::{time_index, StatBlock};

/// Print the selected metric for a finished test, with the supporting
/// counters behind the verbosity flags.
pub fn report(spec: &TestSpec, stats: &StatBlock, elapsed: Duration) -> Result<()> {
    let secs = elapsed.as_secs_f64();
    info!("{}:", spec.name);
    if secs <= 0.0 {
        info!("    no measurement interval; test did not run");
        return Ok(());
    }

    match spec.measure {
        Measure::Bandwidth => {
            let bw = stats.s.no_bytes as f64 / secs;
            info!("    bw        =  {}/sec", format_bytes(bw));
            info!(
                "    msg_rate  =  {}/sec",
                format_count(stats.s.no_msgs as f64 / secs)
            );
        }
        Measure::Latency => {
            // Ping-pong tests count a send and a receive per round trip, so
            // this is the one-way figure; one-sided tests count a single
            // operation per round trip and report its full latency.
            let ops = (stats.s.no_msgs + stats.r.no_msgs).max(1);
            let lat = secs / ops as f64;
            info!("    latency   =  {}", format_seconds(lat));
            info!(
                "    msg_rate  =  {}/sec",
                format_count((stats.s.no_msgs + stats.r.no_msgs) as f64 / secs)
            );
        }
        Measure::MsgRate => {
            info!(
                "    msg_rate  =  {}/sec",
                format_count(stats.s.no_msgs as f64 / secs)
            );
        }
        Measure::None => {}
    }

    debug!(
        "    sent {} msgs / {} bytes / {} errs, received {} msgs / {} bytes / {} errs",
        stats.s.no_msgs,
        stats.s.no_bytes,
        stats.s.no_errs,
        stats.r.no_msgs,
        stats.r.no_bytes,
        stats.r.no_errs
    );
    debug!(
        "    remote sent {} msgs / {} bytes, remote received {} msgs / {} bytes",
        stats.rem_s.no_msgs, stats.rem_s.no_bytes, stats.rem_r.no_msgs, stats.rem_r.no_bytes
    );
    if stats.no_ticks > 0 {
        let busy: u64 = [
            time_index::USER,
            time_index::NICE,
            time_index::KERNEL,
            time_index::IRQ,
            time_index::SOFTIRQ,
            time_index::STEAL,
        ]
        .iter()
        .map(|&i| stats.time_s[i])
        .sum();
        debug!(
            "    local cpu busy {:.3}s of {:.3}s real, {} cpus",
            busy as f64 / f64::from(stats.no_ticks),
            stats.time_s[time_index::REAL] as f64 / f64::from(stats.no_ticks),
            stats.no_cpus
        );
    }
    if stats.max_cqes > 0 {
        debug!("    completion queue high-water mark {}", stats.max_cqes);
    }
    Ok(())
}

/// Append one JSON record for a finished test. Records are newline
/// delimited so a multi-test run produces a streamable file.
pub fn append_json(path: &Path, test: &str, stats: &StatBlock, elapsed: Duration) -> Result<()> {
    use std::io::Write;

    let record = json!({
        "test": test,
        "timestamp": chrono::Local::now().to_rfc3339(),
        "duration_s": elapsed.as_secs_f64(),
        "stats": stats,
    });
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open results file {:?}", path))?;
    writeln!(file, "{}", record).context("write results record")?;
    Ok(())
}

/// Format a byte rate with a decimal unit, the way bandwidth figures are
/// conventionally quoted.
fn format_bytes(v: f64) -> String {
    const UNITS: &[(f64, &str)] = &[(1e9, "GB"), (1e6, "MB"), (1e3, "KB")];
    for &(scale, unit) in UNITS {
        if v >= scale {
            return format!("{:.3} {}", v / scale, unit);
        }
    }
    format!("{:.0} bytes", v)
}

/// Format a count rate (messages per second).
fn format_count(v: f64) -> String {
    const UNITS: &[(f64, &str)] = &[(1e9, "G"), (1e6, "M"), (1e3, "K")];
    for &(scale, unit) in UNITS {
        if v >= scale {
            return format!("{:.3} {}", v / scale, unit);
        }
    }
    format!("{:.1}", v)
}

/// Format a time interval, scaled to the unit latency figures live in.
fn format_seconds(v: f64) -> String {
    if v >= 1.0 {
        format!("{:.3} sec", v)
    } else if v >= 1e-3 {
        format!("{:.3} ms", v * 1e3)
    } else if v >= 1e-6 {
        format!("{:.3} us", v * 1e6)
    } else {
        format!("{:.1} ns", v * 1e9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(2_500_000_000.0), "2.500 GB");
        assert_eq!(format_bytes(1_500_000.0), "1.500 MB");
        assert_eq!(format_bytes(2_000.0), "2.000 KB");
        assert_eq!(format_bytes(512.0), "512 bytes");
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(2.0), "2.000 sec");
        assert_eq!(format_seconds(0.0042), "4.200 ms");
        assert_eq!(format_seconds(0.0000037), "3.700 us");
        assert_eq!(format_seconds(0.000000250), "250.0 ns");
    }

    #[test]
    fn test_append_json_is_line_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");

        let mut stats = StatBlock::new();
        stats.s.add_op(65536);
        append_json(&path, "tcp_bw", &stats, Duration::from_secs(2)).unwrap();
        append_json(&path, "tcp_lat", &stats, Duration::from_secs(1)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["test"], "tcp_bw");
        assert_eq!(first["duration_s"], 2.0);
        assert_eq!(first["stats"]["s"]["no_bytes"], 65536);
    }
}
