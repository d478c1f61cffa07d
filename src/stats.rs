//! # Measurement Statistics Module
//!
//! Raw counters accumulated by the measurement loops and shipped to the peer
//! in the final statistics exchange. Everything here is a monotonic count or
//! a sampled gauge; turning these into bandwidth or latency figures is the
//! job of the results module.
//!
//! Counters are partitioned into four roles: what this side sent (`s`), what
//! it received (`r`), and what it observed the remote side send and receive
//! (`rem_s`, `rem_r`). The remote roles matter for one-sided RDMA: an RDMA
//! read pulls bytes out of the passive peer's buffer without generating any
//! completion there, so the active side credits `rem_s` on the peer's behalf.

use crate::wire::{Decoder, Encoder, WireError};
use serde::Serialize;

/// One role's worth of counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ustat {
    pub no_bytes: u64,
    pub no_msgs: u64,
    pub no_errs: u64,
}

impl Ustat {
    /// Account one successful operation of `bytes` payload bytes.
    pub fn add_op(&mut self, bytes: u64) {
        self.no_bytes += bytes;
        self.no_msgs += 1;
    }

    pub fn add_error(&mut self) {
        self.no_errs += 1;
    }

    fn merge(&mut self, other: &Ustat) {
        self.no_bytes += other.no_bytes;
        self.no_msgs += other.no_msgs;
        self.no_errs += other.no_errs;
    }
}

/// Indexes into [`StatBlock::time_s`].
pub mod time_index {
    pub const REAL: usize = 0;
    pub const USER: usize = 1;
    pub const NICE: usize = 2;
    pub const KERNEL: usize = 3;
    pub const IDLE: usize = 4;
    pub const IOWAIT: usize = 5;
    pub const IRQ: usize = 6;
    pub const SOFTIRQ: usize = 7;
    pub const STEAL: usize = 8;
    pub const COUNT: usize = 9;
}

/// The per-side statistics block, exchanged once at the end of every test.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatBlock {
    /// Online processors on this side; the peer needs it to weigh CPU time.
    pub no_cpus: u32,
    /// Clock ticks per second on this side, the unit of `time_s`.
    pub no_ticks: u32,
    /// Completion-queue depth high-water mark (RDMA tests only).
    pub max_cqes: u32,
    /// Nine time samples in ticks: real, user, nice, kernel, idle, iowait,
    /// irq, softirq, steal.
    pub time_s: [u64; time_index::COUNT],
    /// Local send.
    pub s: Ustat,
    /// Local receive.
    pub r: Ustat,
    /// Remote send, as observed by this side.
    pub rem_s: Ustat,
    /// Remote receive, as observed by this side.
    pub rem_r: Ustat,
}

impl StatBlock {
    /// Exact wire length: three u32 gauges, nine u64 times, four roles of
    /// three u64 counters.
    pub const WIRE_LEN: usize = 3 * 4 + time_index::COUNT * 8 + 4 * 3 * 8;

    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completion-queue depth observation.
    pub fn note_cq_depth(&mut self, depth: u32) {
        if depth > self.max_cqes {
            self.max_cqes = depth;
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(Self::WIRE_LEN);
        enc.put_int(u64::from(self.no_cpus), 4);
        enc.put_int(u64::from(self.no_ticks), 4);
        enc.put_int(u64::from(self.max_cqes), 4);
        for &t in &self.time_s {
            enc.put_int(t, 8);
        }
        for u in [&self.s, &self.r, &self.rem_s, &self.rem_r] {
            enc.put_int(u.no_bytes, 8);
            enc.put_int(u.no_msgs, 8);
            enc.put_int(u.no_errs, 8);
        }
        let bytes = enc.finish();
        debug_assert_eq!(bytes.len(), Self::WIRE_LEN);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(bytes);
        let no_cpus = dec.get_u32()?;
        let no_ticks = dec.get_u32()?;
        let max_cqes = dec.get_u32()?;
        let mut time_s = [0u64; time_index::COUNT];
        for t in &mut time_s {
            *t = dec.get_u64()?;
        }
        let mut roles = [Ustat::default(); 4];
        for u in &mut roles {
            u.no_bytes = dec.get_u64()?;
            u.no_msgs = dec.get_u64()?;
            u.no_errs = dec.get_u64()?;
        }
        Ok(Self {
            no_cpus,
            no_ticks,
            max_cqes,
            time_s,
            s: roles[0],
            r: roles[1],
            rem_s: roles[2],
            rem_r: roles[3],
        })
    }

    /// Fold the peer's view into this block after the statistics exchange.
    ///
    /// The peer's local roles land in our remote roles, on top of any
    /// synthetic credits one-sided operations already recorded there. After
    /// both sides merge, each holds the same four-role picture of the test
    /// (mirrored between `s`/`r` and `rem_s`/`rem_r`).
    pub fn merge_remote(&mut self, peer: &StatBlock) {
        self.rem_s.merge(&peer.s);
        self.rem_r.merge(&peer.r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatBlock {
        let mut b = StatBlock::new();
        b.no_cpus = 8;
        b.no_ticks = 100;
        b.max_cqes = 1024;
        b.time_s = [200, 40, 0, 10, 150, 0, 0, 3, 0];
        b.s.add_op(65536);
        b.s.add_op(65536);
        b.r.add_op(512);
        b.r.add_error();
        b.rem_s.add_op(8);
        b
    }

    #[test]
    fn test_stat_block_round_trip() {
        let b = sample();
        let bytes = b.encode();
        assert_eq!(bytes.len(), StatBlock::WIRE_LEN);
        assert_eq!(StatBlock::decode(&bytes).unwrap(), b);
    }

    /// After both sides merge, each observes the same mirrored block.
    #[test]
    fn test_merge_is_symmetric() {
        let mut client = sample();
        client.rem_s = Ustat::default();
        let mut server = StatBlock::new();
        server.no_cpus = 4;
        server.no_ticks = 100;
        server.r.add_op(65536);
        server.r.add_op(65536);

        let client_wire = StatBlock::decode(&client.encode()).unwrap();
        let server_wire = StatBlock::decode(&server.encode()).unwrap();
        client.merge_remote(&server_wire);
        server.merge_remote(&client_wire);

        assert_eq!(client.s, server.rem_s);
        assert_eq!(client.r, server.rem_r);
        assert_eq!(server.s, client.rem_s);
        assert_eq!(server.r, client.rem_r);
    }

    #[test]
    fn test_cq_watermark() {
        let mut b = StatBlock::new();
        b.note_cq_depth(3);
        b.note_cq_depth(17);
        b.note_cq_depth(5);
        assert_eq!(b.max_cqes, 17);
    }
}
