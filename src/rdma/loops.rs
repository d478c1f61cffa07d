//! # RDMA Measurement Loops Module
//!
//! The per-test driver functions for the queue-pair transports: send/receive
//! and bidirectional bandwidth, ping-pong latency, RDMA read and write in
//! their latency and bandwidth forms, and the atomic messaging-rate tests
//! with optional verification.
//!
//! Every loop follows the same discipline: harvest a batch of completions
//! through the common helper, check the finished flag before accounting
//! anything from the batch, account, then top the pipeline back up — one
//! replacement work request per harvested completion, so the send queue
//! never exceeds its configured depth. Receivers prime their receive queues
//! before the barrier so no message can arrive into an empty queue.

use anyhow::{bail, Result};
use rdma_sys::{ibv_wc, ibv_wc_status, ibv_wc_status_str, ibv_wr_opcode};
use std::ffi::CStr;
use std::ptr;
use tracing::{debug, warn};

use super::{
    AtomicOp, BufLayout, QpTransport, RdmaDevice, GRH_LEN, NCQE, WRID_RDMA, WRID_RECV, WRID_SEND,
};
use crate::clock::finished;
use crate::params::{ParamId, Value};
use crate::registry::TestContext;

/// Completions harvested per helper call.
const WC_BATCH: usize = 16;

/// Starting value of the compare-and-swap verification sequence.
const ATOMIC_SEED: u64 = 0x0123_4567_89ab_cdef;

fn wc_batch() -> [ibv_wc; WC_BATCH] {
    unsafe { std::mem::zeroed() }
}

fn wc_ok(wc: &ibv_wc) -> bool {
    wc.status == ibv_wc_status::IBV_WC_SUCCESS
}

fn wc_status_name(wc: &ibv_wc) -> String {
    let s = unsafe { ibv_wc_status_str(wc.status) };
    if s.is_null() {
        format!("status {}", wc.status)
    } else {
        unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned()
    }
}

/// Received payload bytes of a completion; UD receives carry the GRH.
fn recv_payload(transport: QpTransport, wc: &ibv_wc) -> u64 {
    let len = u64::from(wc.byte_len);
    if transport == QpTransport::Ud {
        len.saturating_sub(GRH_LEN as u64)
    } else {
        len
    }
}

/// Pull every received cache line, for runs that want the touch cost in
/// the measurement.
fn touch_buffer(dev: &RdmaDevice, len: usize) {
    let ptr = dev.buffer();
    let mut i = 0;
    while i < len {
        unsafe { ptr::read_volatile(ptr.add(i)) };
        i += 64;
    }
}

/// Send side of the send/receive bandwidth test: keep NCQE signaled sends
/// in flight, posting one replacement per harvested completion.
fn send_bw_client(ctx: &mut TestContext, transport: QpTransport) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, Value::Num(default_bw_size(transport)));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    let cap = u64::from(ctx.params.take_u32(ParamId::NoMsgs));
    // Honored on the receiving side.
    ctx.params.mark_used(ParamId::AccessRecv);

    let mut dev = RdmaDevice::open(ctx, transport, NCQE, 0, msg_size, BufLayout::Message)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    if ctx.validate_and_barrier()? {
        let mut wc = wc_batch();
        let mut posted: u64 = 0;
        let prime = if cap > 0 {
            u64::from(NCQE).min(cap)
        } else {
            u64::from(NCQE)
        };
        for _ in 0..prime {
            dev.post_send()?;
            posted += 1;
        }

        while !finished() {
            let n = dev.completions(&mut wc)?;
            if finished() {
                break;
            }
            if n == 0 {
                continue;
            }
            ctx.stats.note_cq_depth(n as u32);
            for c in &wc[..n] {
                match c.wr_id {
                    WRID_SEND if wc_ok(c) => ctx.stats.s.add_op(msg_size as u64),
                    WRID_SEND => {
                        debug!("send completion failed: {}", wc_status_name(c));
                        ctx.stats.s.add_error();
                    }
                    other => warn!("ignoring completion with unknown wr id {}", other),
                }
            }
            let done = ctx.stats.s.no_msgs + ctx.stats.s.no_errs;
            if cap > 0 && done >= cap {
                break;
            }
            for _ in 0..n {
                if cap > 0 && posted >= cap {
                    break;
                }
                dev.post_send()?;
                posted += 1;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Receive side of the send/receive bandwidth test.
fn send_bw_server(ctx: &mut TestContext, transport: QpTransport) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, Value::Num(default_bw_size(transport)));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    ctx.params.mark_used(ParamId::NoMsgs);
    let access_recv = ctx.params.take_u32(ParamId::AccessRecv) != 0;

    let mut dev = RdmaDevice::open(ctx, transport, 0, NCQE, msg_size, BufLayout::Message)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    // The receive queue is primed before the barrier so the first message
    // cannot beat the first receive.
    for _ in 0..NCQE {
        dev.post_recv()?;
    }

    if ctx.validate_and_barrier()? {
        let mut wc = wc_batch();
        while !finished() {
            let n = dev.completions(&mut wc)?;
            if finished() {
                break;
            }
            if n == 0 {
                continue;
            }
            ctx.stats.note_cq_depth(n as u32);
            for c in &wc[..n] {
                match c.wr_id {
                    WRID_RECV if wc_ok(c) => {
                        ctx.stats.r.add_op(recv_payload(transport, c));
                        if access_recv {
                            touch_buffer(&dev, c.byte_len as usize);
                        }
                    }
                    WRID_RECV => {
                        debug!("receive completion failed: {}", wc_status_name(c));
                        ctx.stats.r.add_error();
                    }
                    other => warn!("ignoring completion with unknown wr id {}", other),
                }
            }
            for _ in 0..n {
                dev.post_recv()?;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Bidirectional bandwidth: both sides run the same loop with NCQE sends
/// and NCQE receives in flight.
fn bi_bw(ctx: &mut TestContext, transport: QpTransport) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, Value::Num(default_bw_size(transport)));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    let cap = u64::from(ctx.params.take_u32(ParamId::NoMsgs));
    let access_recv = ctx.params.take_u32(ParamId::AccessRecv) != 0;

    let mut dev = RdmaDevice::open(ctx, transport, NCQE, NCQE, msg_size, BufLayout::Message)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    for _ in 0..NCQE {
        dev.post_recv()?;
    }

    if ctx.validate_and_barrier()? {
        let mut wc = wc_batch();
        let mut posted: u64 = 0;
        let prime = if cap > 0 {
            u64::from(NCQE).min(cap)
        } else {
            u64::from(NCQE)
        };
        for _ in 0..prime {
            dev.post_send()?;
            posted += 1;
        }

        while !finished() {
            let n = dev.completions(&mut wc)?;
            if finished() {
                break;
            }
            if n == 0 {
                continue;
            }
            ctx.stats.note_cq_depth(n as u32);
            let mut sends = 0u64;
            let mut recvs = 0u64;
            for c in &wc[..n] {
                match c.wr_id {
                    WRID_SEND => {
                        if wc_ok(c) {
                            ctx.stats.s.add_op(msg_size as u64);
                        } else {
                            debug!("send completion failed: {}", wc_status_name(c));
                            ctx.stats.s.add_error();
                        }
                        sends += 1;
                    }
                    WRID_RECV => {
                        if wc_ok(c) {
                            ctx.stats.r.add_op(recv_payload(transport, c));
                            if access_recv {
                                touch_buffer(&dev, c.byte_len as usize);
                            }
                        } else {
                            debug!("receive completion failed: {}", wc_status_name(c));
                            ctx.stats.r.add_error();
                        }
                        recvs += 1;
                    }
                    other => warn!("ignoring completion with unknown wr id {}", other),
                }
            }
            for _ in 0..recvs {
                dev.post_recv()?;
            }
            let done = ctx.stats.s.no_msgs + ctx.stats.s.no_errs;
            if cap > 0 && done >= cap {
                break;
            }
            for _ in 0..sends {
                if cap > 0 && posted >= cap {
                    break;
                }
                dev.post_send()?;
                posted += 1;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Ping-pong latency. Each side tracks a two-bit done mask — bit 0 for the
/// outbound send completing, bit 1 for the inbound message arriving — and
/// fires its next outbound when both are set. The leader starts the volley;
/// the follower begins with its outbound bit already set.
fn pingpong_lat(ctx: &mut TestContext, transport: QpTransport) -> Result<()> {
    ctx.params.set_default(ParamId::MsgSize, Value::Num(1));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    let cap = u64::from(ctx.params.take_u32(ParamId::NoMsgs));
    let leader = ctx.is_client;

    let mut dev = RdmaDevice::open(ctx, transport, 1, 1, msg_size, BufLayout::Message)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    dev.post_recv()?;

    if ctx.validate_and_barrier()? {
        let mut wc = wc_batch();
        let mut done: u8 = if leader { 0b00 } else { 0b01 };
        if leader {
            dev.post_send()?;
        }

        while !finished() {
            let n = dev.completions(&mut wc)?;
            if finished() {
                break;
            }
            if n == 0 {
                continue;
            }
            ctx.stats.note_cq_depth(n as u32);
            for c in &wc[..n] {
                match c.wr_id {
                    WRID_SEND if wc_ok(c) => {
                        ctx.stats.s.add_op(msg_size as u64);
                        done |= 0b01;
                    }
                    WRID_SEND => {
                        debug!("send completion failed: {}", wc_status_name(c));
                        ctx.stats.s.add_error();
                        done |= 0b01;
                    }
                    WRID_RECV if wc_ok(c) => {
                        ctx.stats.r.add_op(recv_payload(transport, c));
                        dev.post_recv()?;
                        done |= 0b10;
                    }
                    WRID_RECV => {
                        debug!("receive completion failed: {}", wc_status_name(c));
                        ctx.stats.r.add_error();
                        dev.post_recv()?;
                        done |= 0b10;
                    }
                    other => warn!("ignoring completion with unknown wr id {}", other),
                }
            }
            if cap > 0 && ctx.stats.s.no_msgs + ctx.stats.s.no_errs >= cap {
                break;
            }
            if done == 0b11 {
                done = 0;
                dev.post_send()?;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// RDMA read, both forms. The peer is a passive target; every completed
/// read accounts local receive bytes plus the synthetic remote-send credit
/// for the data pulled out of the peer's buffer behind its back.
fn rdma_read_client(ctx: &mut TestContext, pipeline: bool) -> Result<()> {
    ctx.params.set_default(
        ParamId::MsgSize,
        Value::Num(if pipeline { 65536 } else { 1 }),
    );
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    let cap = u64::from(ctx.params.take_u32(ParamId::NoMsgs));

    let mut dev = RdmaDevice::open(ctx, QpTransport::Rc, NCQE, 0, msg_size, BufLayout::Message)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    if ctx.validate_and_barrier()? {
        let mut wc = wc_batch();
        let mut posted: u64 = 0;
        // Outstanding reads are bounded by the negotiated rd_atomic depth,
        // not by the send-queue size.
        let depth = if pipeline { dev.rd_atomic() } else { 1 };
        let prime = if cap > 0 {
            u64::from(depth).min(cap)
        } else {
            u64::from(depth)
        };
        for _ in 0..prime {
            dev.post_rdma(ibv_wr_opcode::IBV_WR_RDMA_READ, 0)?;
            posted += 1;
        }

        while !finished() {
            let n = dev.completions(&mut wc)?;
            if finished() {
                break;
            }
            if n == 0 {
                continue;
            }
            ctx.stats.note_cq_depth(n as u32);
            for c in &wc[..n] {
                match c.wr_id {
                    WRID_RDMA if wc_ok(c) => {
                        ctx.stats.r.add_op(msg_size as u64);
                        ctx.stats.rem_s.add_op(msg_size as u64);
                    }
                    WRID_RDMA => {
                        debug!("read completion failed: {}", wc_status_name(c));
                        ctx.stats.r.add_error();
                    }
                    other => warn!("ignoring completion with unknown wr id {}", other),
                }
            }
            let done = ctx.stats.r.no_msgs + ctx.stats.r.no_errs;
            if cap > 0 && done >= cap {
                break;
            }
            for _ in 0..n {
                if cap > 0 && posted >= cap {
                    break;
                }
                dev.post_rdma(ibv_wr_opcode::IBV_WR_RDMA_READ, 0)?;
                posted += 1;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// RDMA write bandwidth: one-sided writes pipelined like sends.
fn rdma_write_bw_client(ctx: &mut TestContext, transport: QpTransport) -> Result<()> {
    ctx.params.set_default(ParamId::MsgSize, Value::Num(65536));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    let cap = u64::from(ctx.params.take_u32(ParamId::NoMsgs));

    let mut dev = RdmaDevice::open(ctx, transport, NCQE, 0, msg_size, BufLayout::Message)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    if ctx.validate_and_barrier()? {
        let mut wc = wc_batch();
        let mut posted: u64 = 0;
        let prime = if cap > 0 {
            u64::from(NCQE).min(cap)
        } else {
            u64::from(NCQE)
        };
        for _ in 0..prime {
            dev.post_rdma(ibv_wr_opcode::IBV_WR_RDMA_WRITE, 0)?;
            posted += 1;
        }

        while !finished() {
            let n = dev.completions(&mut wc)?;
            if finished() {
                break;
            }
            if n == 0 {
                continue;
            }
            ctx.stats.note_cq_depth(n as u32);
            for c in &wc[..n] {
                match c.wr_id {
                    WRID_RDMA if wc_ok(c) => ctx.stats.s.add_op(msg_size as u64),
                    WRID_RDMA => {
                        debug!("write completion failed: {}", wc_status_name(c));
                        ctx.stats.s.add_error();
                    }
                    other => warn!("ignoring completion with unknown wr id {}", other),
                }
            }
            let done = ctx.stats.s.no_msgs + ctx.stats.s.no_errs;
            if cap > 0 && done >= cap {
                break;
            }
            for _ in 0..n {
                if cap > 0 && posted >= cap {
                    break;
                }
                dev.post_rdma(ibv_wr_opcode::IBV_WR_RDMA_WRITE, 0)?;
                posted += 1;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Wait for the one outstanding RDMA write to complete. `direct_poll`
/// bypasses the completion channel entirely; that is how sub-microsecond
/// deltas are measured.
fn wait_write_completion(dev: &mut RdmaDevice, direct_poll: bool) -> Result<bool> {
    let mut wc = wc_batch();
    loop {
        let n = if direct_poll {
            dev.poll(&mut wc)?
        } else {
            dev.completions(&mut wc)?
        };
        if finished() {
            return Ok(false);
        }
        for c in &wc[..n] {
            match c.wr_id {
                WRID_RDMA if wc_ok(c) => return Ok(true),
                WRID_RDMA => {
                    debug!("write completion failed: {}", wc_status_name(c));
                    return Ok(false);
                }
                other => warn!("ignoring completion with unknown wr id {}", other),
            }
        }
    }
}

/// Spin on the inbound half of the mirrored buffer until the peer's marker
/// lands in its first and last byte. The inbound half starts `msg_size`
/// bytes in; the outbound source occupies the first half, so the poll can
/// only ever observe the peer's write, never our own. Returns false if the
/// run finished first.
fn wait_marker(dev: &RdmaDevice, msg_size: usize, marker: u8) -> bool {
    let inbound = unsafe { dev.buffer().add(msg_size) };
    loop {
        if finished() {
            return false;
        }
        let first = unsafe { ptr::read_volatile(inbound) };
        let last = unsafe { ptr::read_volatile(inbound.add(msg_size - 1)) };
        if first == marker && last == marker {
            return true;
        }
        std::hint::spin_loop();
    }
}

/// Stamp the marker into the first and last byte of the outbound source
/// region, ready to be written into the peer's inbound half.
fn place_marker(dev: &RdmaDevice, msg_size: usize, marker: u8) {
    let source = dev.buffer();
    unsafe {
        ptr::write_volatile(source, marker);
        ptr::write_volatile(source.add(msg_size - 1), marker);
    }
}

fn next_marker(marker: u8) -> u8 {
    // The buffer starts zeroed, so zero never marks a round.
    match marker.wrapping_add(1) {
        0 => 1,
        m => m,
    }
}

/// RDMA write ping-pong latency: each round trip is one marker written into
/// the peer's inbound buffer half and the peer's marker observed in ours.
/// Neither side posts receives; arrival detection is memory polling.
fn rdma_write_pingpong(
    ctx: &mut TestContext,
    transport: QpTransport,
    direct_poll: bool,
) -> Result<()> {
    ctx.params.set_default(ParamId::MsgSize, Value::Num(1));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    let cap = u64::from(ctx.params.take_u32(ParamId::NoMsgs));
    let leader = ctx.is_client;

    let mut dev = RdmaDevice::open(ctx, transport, 1, 0, msg_size, BufLayout::Mirrored)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    if ctx.validate_and_barrier()? {
        let mut marker: u8 = 1;
        while !finished() {
            if leader {
                place_marker(&dev, msg_size, marker);
                dev.post_rdma(ibv_wr_opcode::IBV_WR_RDMA_WRITE, msg_size)?;
                if !wait_write_completion(&mut dev, direct_poll)? {
                    break;
                }
                ctx.stats.s.add_op(msg_size as u64);
                if !wait_marker(&dev, msg_size, marker) {
                    break;
                }
                ctx.stats.r.add_op(msg_size as u64);
            } else {
                if !wait_marker(&dev, msg_size, marker) {
                    break;
                }
                ctx.stats.r.add_op(msg_size as u64);
                place_marker(&dev, msg_size, marker);
                dev.post_rdma(ibv_wr_opcode::IBV_WR_RDMA_WRITE, msg_size)?;
                if !wait_write_completion(&mut dev, direct_poll)? {
                    break;
                }
                ctx.stats.s.add_op(msg_size as u64);
            }
            marker = next_marker(marker);
            if cap > 0 && ctx.stats.s.no_msgs + ctx.stats.s.no_errs >= cap {
                break;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Atomic messaging rate, with optional verification of the returned old
/// values. Keeps `rd_atomic` operations outstanding; replacement slots
/// rotate so every in-flight operation lands its result in its own eight
/// bytes.
fn atomic_client(ctx: &mut TestContext, fetch_add: bool, verify: bool) -> Result<()> {
    let cap = u64::from(ctx.params.take_u32(ParamId::NoMsgs));

    let mut dev = RdmaDevice::open(ctx, QpTransport::Rc, NCQE, 0, 8, BufLayout::AtomicSlots)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    if ctx.validate_and_barrier()? {
        let depth = u64::from(dev.rd_atomic());
        let op_for = |k: u64| {
            if fetch_add {
                AtomicOp::FetchAdd(1)
            } else {
                AtomicOp::CompareSwap {
                    compare: ATOMIC_SEED.wrapping_add(k),
                    swap: ATOMIC_SEED.wrapping_add(k + 1),
                }
            }
        };

        let mut wc = wc_batch();
        let mut posted: u64 = 0;
        let mut completed: u64 = 0;
        let mut prev_old: Option<u64> = None;

        let prime = if cap > 0 { depth.min(cap) } else { depth };
        for _ in 0..prime {
            dev.post_atomic(op_for(posted), (posted % depth) as usize)?;
            posted += 1;
        }

        while !finished() {
            let n = dev.completions(&mut wc)?;
            if finished() {
                break;
            }
            if n == 0 {
                continue;
            }
            ctx.stats.note_cq_depth(n as u32);
            for c in &wc[..n] {
                match c.wr_id {
                    WRID_RDMA if wc_ok(c) => {
                        // Eight bytes pulled out of the remote buffer and
                        // eight written back, neither visible over there.
                        ctx.stats.s.add_op(8);
                        ctx.stats.rem_s.add_op(8);
                        ctx.stats.rem_r.add_op(8);
                        if verify {
                            let slot = (completed % depth) as usize;
                            let old = dev.atomic_slot(slot);
                            verify_old_value(fetch_add, completed, prev_old, old)?;
                            prev_old = Some(old);
                        }
                        completed += 1;
                    }
                    WRID_RDMA => {
                        debug!("atomic completion failed: {}", wc_status_name(c));
                        ctx.stats.s.add_error();
                        completed += 1;
                    }
                    other => warn!("ignoring completion with unknown wr id {}", other),
                }
            }
            let done = ctx.stats.s.no_msgs + ctx.stats.s.no_errs;
            if cap > 0 && done >= cap {
                break;
            }
            for _ in 0..n {
                if cap > 0 && posted >= cap {
                    break;
                }
                dev.post_atomic(op_for(posted), (posted % depth) as usize)?;
                posted += 1;
            }
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Check one returned "old" value. Fetch-add increments by one, so
/// consecutive old values differ by exactly one; compare-and-swap walks the
/// documented sequence from the seed. A mismatch is a fatal test error.
fn verify_old_value(fetch_add: bool, completed: u64, prev: Option<u64>, old: u64) -> Result<()> {
    if fetch_add {
        if let Some(prev) = prev {
            if old != prev.wrapping_add(1) {
                bail!(
                    "fetch-add verification failed: old value {:#x} after {:#x}, expected {:#x}",
                    old,
                    prev,
                    prev.wrapping_add(1)
                );
            }
        }
    } else {
        let expected = ATOMIC_SEED.wrapping_add(completed);
        if old != expected {
            bail!(
                "compare-swap verification failed: operation {} returned {:#x}, expected {:#x}",
                completed,
                old,
                expected
            );
        }
    }
    Ok(())
}

/// Passive server half of the one-sided tests: open the device so the peer
/// has a target, exchange contexts, then sit out the measurement interval.
/// Nothing is posted; scenario-visible receive counts on write tests come
/// from the peer's statistics, not from completions here.
fn nop_server(ctx: &mut TestContext, transport: QpTransport, default_size: u32) -> Result<()> {
    ctx.params
        .set_default(ParamId::MsgSize, Value::Num(default_size));
    let msg_size = ctx.params.take_u32(ParamId::MsgSize) as usize;
    ctx.params.mark_used(ParamId::NoMsgs);

    let mut dev = RdmaDevice::open(ctx, transport, 1, 1, msg_size, BufLayout::Message)?;
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    if ctx.validate_and_barrier()? {
        while !finished() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

/// Passive target of the atomic tests. Seeds its buffer so the
/// compare-and-swap verification sequence has a defined start.
pub fn rc_atomic_server(ctx: &mut TestContext) -> Result<()> {
    ctx.params.mark_used(ParamId::NoMsgs);

    let mut dev = RdmaDevice::open(ctx, QpTransport::Rc, 1, 1, 8, BufLayout::AtomicSlots)?;
    unsafe {
        ptr::copy_nonoverlapping(
            ATOMIC_SEED.to_ne_bytes().as_ptr(),
            dev.buffer(),
            8,
        );
    }
    dev.init(&mut ctx.control, ctx.is_client)?;
    dev.prepare()?;

    if ctx.validate_and_barrier()? {
        while !finished() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }
    ctx.run_clock.stop();
    Ok(())
}

fn default_bw_size(transport: QpTransport) -> u32 {
    match transport {
        // UD messages must fit in one MTU.
        QpTransport::Ud => 2048,
        _ => 65536,
    }
}

// Per-test entry points, one pair per registry row.

pub fn rc_bw_client(ctx: &mut TestContext) -> Result<()> {
    send_bw_client(ctx, QpTransport::Rc)
}
pub fn rc_bw_server(ctx: &mut TestContext) -> Result<()> {
    send_bw_server(ctx, QpTransport::Rc)
}
pub fn rc_bi_bw_client(ctx: &mut TestContext) -> Result<()> {
    bi_bw(ctx, QpTransport::Rc)
}
pub fn rc_bi_bw_server(ctx: &mut TestContext) -> Result<()> {
    bi_bw(ctx, QpTransport::Rc)
}
pub fn rc_lat_client(ctx: &mut TestContext) -> Result<()> {
    pingpong_lat(ctx, QpTransport::Rc)
}
pub fn rc_lat_server(ctx: &mut TestContext) -> Result<()> {
    pingpong_lat(ctx, QpTransport::Rc)
}

pub fn uc_bw_client(ctx: &mut TestContext) -> Result<()> {
    send_bw_client(ctx, QpTransport::Uc)
}
pub fn uc_bw_server(ctx: &mut TestContext) -> Result<()> {
    send_bw_server(ctx, QpTransport::Uc)
}
pub fn uc_bi_bw_client(ctx: &mut TestContext) -> Result<()> {
    bi_bw(ctx, QpTransport::Uc)
}
pub fn uc_bi_bw_server(ctx: &mut TestContext) -> Result<()> {
    bi_bw(ctx, QpTransport::Uc)
}
pub fn uc_lat_client(ctx: &mut TestContext) -> Result<()> {
    pingpong_lat(ctx, QpTransport::Uc)
}
pub fn uc_lat_server(ctx: &mut TestContext) -> Result<()> {
    pingpong_lat(ctx, QpTransport::Uc)
}

pub fn ud_bw_client(ctx: &mut TestContext) -> Result<()> {
    send_bw_client(ctx, QpTransport::Ud)
}
pub fn ud_bw_server(ctx: &mut TestContext) -> Result<()> {
    send_bw_server(ctx, QpTransport::Ud)
}
pub fn ud_bi_bw_client(ctx: &mut TestContext) -> Result<()> {
    bi_bw(ctx, QpTransport::Ud)
}
pub fn ud_bi_bw_server(ctx: &mut TestContext) -> Result<()> {
    bi_bw(ctx, QpTransport::Ud)
}
pub fn ud_lat_client(ctx: &mut TestContext) -> Result<()> {
    pingpong_lat(ctx, QpTransport::Ud)
}
pub fn ud_lat_server(ctx: &mut TestContext) -> Result<()> {
    pingpong_lat(ctx, QpTransport::Ud)
}

pub fn rc_rdma_read_bw_client(ctx: &mut TestContext) -> Result<()> {
    rdma_read_client(ctx, true)
}
pub fn rc_rdma_read_lat_client(ctx: &mut TestContext) -> Result<()> {
    rdma_read_client(ctx, false)
}
pub fn rc_rdma_write_bw_client(ctx: &mut TestContext) -> Result<()> {
    rdma_write_bw_client(ctx, QpTransport::Rc)
}
pub fn uc_rdma_write_bw_client(ctx: &mut TestContext) -> Result<()> {
    rdma_write_bw_client(ctx, QpTransport::Uc)
}

pub fn rc_rdma_write_lat_client(ctx: &mut TestContext) -> Result<()> {
    rdma_write_pingpong(ctx, QpTransport::Rc, false)
}
pub fn rc_rdma_write_lat_server(ctx: &mut TestContext) -> Result<()> {
    rdma_write_pingpong(ctx, QpTransport::Rc, false)
}
pub fn rc_rdma_write_poll_lat_client(ctx: &mut TestContext) -> Result<()> {
    rdma_write_pingpong(ctx, QpTransport::Rc, true)
}
pub fn rc_rdma_write_poll_lat_server(ctx: &mut TestContext) -> Result<()> {
    rdma_write_pingpong(ctx, QpTransport::Rc, true)
}
pub fn uc_rdma_write_lat_client(ctx: &mut TestContext) -> Result<()> {
    rdma_write_pingpong(ctx, QpTransport::Uc, false)
}
pub fn uc_rdma_write_lat_server(ctx: &mut TestContext) -> Result<()> {
    rdma_write_pingpong(ctx, QpTransport::Uc, false)
}
pub fn uc_rdma_write_poll_lat_client(ctx: &mut TestContext) -> Result<()> {
    rdma_write_pingpong(ctx, QpTransport::Uc, true)
}
pub fn uc_rdma_write_poll_lat_server(ctx: &mut TestContext) -> Result<()> {
    rdma_write_pingpong(ctx, QpTransport::Uc, true)
}

pub fn rc_nop_bw_server(ctx: &mut TestContext) -> Result<()> {
    nop_server(ctx, QpTransport::Rc, 65536)
}
pub fn rc_nop_lat_server(ctx: &mut TestContext) -> Result<()> {
    nop_server(ctx, QpTransport::Rc, 1)
}
pub fn uc_nop_bw_server(ctx: &mut TestContext) -> Result<()> {
    nop_server(ctx, QpTransport::Uc, 65536)
}

pub fn rc_compare_swap_client(ctx: &mut TestContext) -> Result<()> {
    atomic_client(ctx, false, false)
}
pub fn rc_fetch_add_client(ctx: &mut TestContext) -> Result<()> {
    atomic_client(ctx, true, false)
}
pub fn ver_rc_compare_swap_client(ctx: &mut TestContext) -> Result<()> {
    atomic_client(ctx, false, true)
}
pub fn ver_rc_fetch_add_client(ctx: &mut TestContext) -> Result<()> {
    atomic_client(ctx, true, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_sequence_skips_zero() {
        let mut m: u8 = 1;
        for _ in 0..600 {
            m = next_marker(m);
            assert_ne!(m, 0);
        }
        assert_eq!(next_marker(255), 1);
        assert_eq!(next_marker(7), 8);
    }

    #[test]
    fn test_fetch_add_verification() {
        // First completion establishes the baseline.
        verify_old_value(true, 0, None, 1234).unwrap();
        verify_old_value(true, 1, Some(1234), 1235).unwrap();
        assert!(verify_old_value(true, 2, Some(1235), 1237).is_err());
    }

    #[test]
    fn test_compare_swap_verification() {
        verify_old_value(false, 0, None, ATOMIC_SEED).unwrap();
        verify_old_value(false, 5, None, ATOMIC_SEED + 5).unwrap();
        assert!(verify_old_value(false, 1, None, ATOMIC_SEED).is_err());
    }

    #[test]
    fn test_default_bw_sizes() {
        assert_eq!(default_bw_size(QpTransport::Rc), 65536);
        assert_eq!(default_bw_size(QpTransport::Uc), 65536);
        assert_eq!(default_bw_size(QpTransport::Ud), 2048);
    }
}
