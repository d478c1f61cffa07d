//! # Timer & Termination Module
//!
//! Wall-clock and CPU-time sampling for a measurement run, plus the
//! duration alarm that ends it.
//!
//! ## Termination model
//!
//! The alarm is a real POSIX `alarm(2)`: after the configured duration the
//! process receives SIGALRM, whose handler does exactly one thing — store
//! `true` into the process-wide `finished` flag. The handler is installed
//! without `SA_RESTART`, so a blocking syscall in flight when the signal
//! lands returns EINTR instead of resuming, which is what bounds how long a
//! measurement loop can outlive its deadline.
//!
//! Measurement loops must check [`finished`] immediately after every return
//! from a blocking call, before accounting the result: a completion that
//! only returned because the alarm fired is discarded, and EINTR is "no work
//! done this iteration", never an error.
//!
//! The flag is write-once per test: it is reset only by [`reset_finished`]
//! at the start of the next test.

use anyhow::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::stats::{time_index, StatBlock};

/// The one piece of state shared between the signal handler and the main
/// execution path.
static FINISHED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_alarm(_: libc::c_int) {
    FINISHED.store(true, Ordering::Release);
}

/// True once the current test's duration has elapsed (or the peer went away
/// and a driver declared the test over).
pub fn finished() -> bool {
    FINISHED.load(Ordering::Acquire)
}

/// Declare the current test over. Used by drivers on end-of-file.
pub fn set_finished() {
    FINISHED.store(true, Ordering::Release);
}

/// Re-arm the flag for the next test. Called once per test, before setup.
pub fn reset_finished() {
    FINISHED.store(false, Ordering::Release);
}

/// Install the SIGALRM handler. Called once at process start, before any
/// test runs. `SaFlags::empty()` deliberately omits `SA_RESTART` so the
/// signal interrupts blocking syscalls.
pub fn install_alarm_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_alarm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGALRM, &action) }
        .context("failed to install SIGALRM handler")?;
    Ok(())
}

/// The nine CPU-time samples, in clock ticks, in stat-block order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTimes {
    ticks: [u64; time_index::COUNT],
}

impl CpuTimes {
    /// Sample the aggregate CPU counters. The real-time slot stays zero; it
    /// is derived from the wall clock when the run is folded into stats.
    pub fn sample() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Ok(contents) = std::fs::read_to_string("/proc/stat") {
                return Self {
                    ticks: parse_proc_stat(&contents),
                };
            }
        }
        Self::default()
    }
}

/// Parse the aggregate `cpu` line of /proc/stat into the stat-block time
/// vector (real-time slot left zero).
fn parse_proc_stat(contents: &str) -> [u64; time_index::COUNT] {
    let mut ticks = [0u64; time_index::COUNT];
    let line = contents
        .lines()
        .find(|l| l.starts_with("cpu "))
        .unwrap_or("");
    // cpu  user nice system idle iowait irq softirq steal ...
    for (slot, field) in ticks.iter_mut().skip(1).zip(line.split_whitespace().skip(1)) {
        *slot = field.parse().unwrap_or(0);
    }
    ticks
}

/// Clock ticks per second, the unit every time sample is expressed in.
pub fn ticks_per_second() -> u32 {
    let t = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if t > 0 {
        t as u32
    } else {
        100
    }
}

/// Online processor count, shipped alongside the time samples.
pub fn online_cpus() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as u32
    } else {
        1
    }
}

/// The measurement run clock: `t0` on barrier release, `t1` when the loop
/// exits, and the duration alarm in between.
#[derive(Debug, Default)]
pub struct RunClock {
    started: Option<(Instant, CpuTimes)>,
    stopped: Option<(Instant, CpuTimes)>,
}

impl RunClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `t0` and arm the duration alarm. A zero duration arms nothing;
    /// the loop then runs until its message cap or the peer ends it.
    pub fn start(&mut self, duration_secs: u32) {
        debug!("run clock started, duration {}s", duration_secs);
        self.started = Some((Instant::now(), CpuTimes::sample()));
        self.stopped = None;
        if duration_secs > 0 {
            unsafe { libc::alarm(duration_secs) };
        }
    }

    /// Take `t1` and cancel any pending alarm. Idempotent; the first stop
    /// wins so late calls cannot stretch the measured interval.
    pub fn stop(&mut self) {
        if self.stopped.is_none() && self.started.is_some() {
            self.stopped = Some((Instant::now(), CpuTimes::sample()));
            unsafe { libc::alarm(0) };
            debug!("run clock stopped after {:?}", self.elapsed());
        }
    }

    /// Measured wall-clock interval. Zero if the run never started (a failed
    /// barrier skips the measurement loop entirely).
    pub fn elapsed(&self) -> Duration {
        match (self.started, self.stopped) {
            (Some((t0, _)), Some((t1, _))) => t1 - t0,
            (Some((t0, _)), None) => t0.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Fold the measured interval into a stat block: tick rate, CPU count,
    /// and the nine time deltas with real time converted to ticks.
    pub fn fill_stats(&self, stats: &mut StatBlock) {
        stats.no_ticks = ticks_per_second();
        stats.no_cpus = online_cpus();
        stats.time_s[time_index::REAL] =
            (self.elapsed().as_secs_f64() * f64::from(stats.no_ticks)) as u64;
        if let (Some((_, c0)), Some((_, c1))) = (self.started, self.stopped) {
            for i in 1..time_index::COUNT {
                stats.time_s[i] = c1.ticks[i].saturating_sub(c0.ticks[i]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "\
cpu  10132153 290696 3084719 46828483 16683 0 25195 1 0 0
cpu0 1393280 32966 572056 13343292 6130 0 17875 0 0 0
intr 1462898 0 0\n";

    #[test]
    fn test_parse_proc_stat() {
        let t = parse_proc_stat(PROC_STAT);
        assert_eq!(t[time_index::REAL], 0);
        assert_eq!(t[time_index::USER], 10132153);
        assert_eq!(t[time_index::NICE], 290696);
        assert_eq!(t[time_index::KERNEL], 3084719);
        assert_eq!(t[time_index::IDLE], 46828483);
        assert_eq!(t[time_index::IOWAIT], 16683);
        assert_eq!(t[time_index::IRQ], 0);
        assert_eq!(t[time_index::SOFTIRQ], 25195);
        assert_eq!(t[time_index::STEAL], 1);
    }

    #[test]
    fn test_parse_proc_stat_garbage() {
        assert_eq!(parse_proc_stat("no cpu line here"), [0; 9]);
    }

    /// Zero duration must not arm the alarm, and the clock still measures.
    #[test]
    fn test_run_clock_without_alarm() {
        let mut clock = RunClock::new();
        assert_eq!(clock.elapsed(), Duration::ZERO);

        clock.start(0);
        std::thread::sleep(Duration::from_millis(20));
        clock.stop();
        let first = clock.elapsed();
        assert!(first >= Duration::from_millis(20));

        // Idempotent stop: a later call cannot stretch the interval.
        std::thread::sleep(Duration::from_millis(5));
        clock.stop();
        assert_eq!(clock.elapsed(), first);

        let mut stats = StatBlock::new();
        clock.fill_stats(&mut stats);
        assert!(stats.no_ticks > 0);
        assert!(stats.no_cpus > 0);
    }

    /// The flag is write-once per test and explicitly reset between tests.
    #[test]
    fn test_finished_flag_cycle() {
        reset_finished();
        assert!(!finished());
        set_finished();
        assert!(finished());
        set_finished();
        assert!(finished());
        reset_finished();
        assert!(!finished());
    }
}
