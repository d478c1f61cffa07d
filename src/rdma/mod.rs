//! # RDMA Device Lifecycle Module
//!
//! Everything between "the user asked for an RDMA test" and "there is a
//! queue pair in RTS wired to the peer": device selection, verbs resource
//! acquisition, the connection-context exchange over the control channel,
//! the INIT→RTR→RTS state machine, and teardown.
//!
//! ## Resource ordering
//!
//! Acquisition order is device list → device context → completion channel
//! (event mode only) → protection domain → pinned buffer → memory region →
//! completion queue → queue pair → address handle (UD only). Release runs
//! strictly in reverse, and the completion queue is destroyed before the
//! queue pair; some drivers hang if the order is violated. Each verbs object
//! lives in a small RAII wrapper, and both the fields of [`RdmaDevice`] and
//! the locals of [`RdmaDevice::open`] are arranged so that drop order equals
//! the required release order on every exit path, including mid-setup
//! failures.

pub mod loops;

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::CStr;
use std::ptr::{self, NonNull};

use anyhow::{anyhow, bail, Result};
use rdma_sys::*;
use tracing::{debug, warn};

use crate::clock::finished;
use crate::control::ControlChannel;
use crate::params::ParamId;
use crate::registry::TestContext;
use crate::wire::{Decoder, Encoder, WireError};

/// Work-request identifiers; completions carrying anything else are logged
/// and ignored.
pub const WRID_SEND: u64 = 1;
pub const WRID_RECV: u64 = 2;
pub const WRID_RDMA: u64 = 3;

/// Pipeline depth of the bandwidth loops.
pub const NCQE: u32 = 1024;

/// Bytes of Global Routing Header prepended to every UD receive.
pub const GRH_LEN: usize = 40;

/// Q_Key shared by both ends of a UD test.
const QKEY: u32 = 0x1111_1111;

/// The queue-pair transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpTransport {
    Rc,
    Uc,
    Ud,
}

/// How the pinned buffer of a test is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufLayout {
    /// One message, shared by every in-flight work request.
    Message,
    /// One eight-byte result slot per outstanding atomic, so verification
    /// can read each returned old value separately.
    AtomicSlots,
    /// An outbound source region followed by an inbound region the peer
    /// writes into. Marker ping-pong needs the split: polling the bytes
    /// that are also the RDMA source would observe the local write, not
    /// the peer's.
    Mirrored,
}

impl QpTransport {
    fn qp_type(self) -> ibv_qp_type::Type {
        match self {
            QpTransport::Rc => ibv_qp_type::IBV_QPT_RC,
            QpTransport::Uc => ibv_qp_type::IBV_QPT_UC,
            QpTransport::Ud => ibv_qp_type::IBV_QPT_UD,
        }
    }
}

/// Connection context exchanged once per side per test.
///
/// Wire layout: five big-endian unsigned integers of widths 4/4/4/4/8, in
/// order lid, qpn, psn, rkey, vaddr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConContext {
    pub lid: u32,
    pub qpn: u32,
    pub psn: u32,
    pub rkey: u32,
    pub vaddr: u64,
}

impl ConContext {
    pub const WIRE_LEN: usize = 4 * 4 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(Self::WIRE_LEN);
        enc.put_int(u64::from(self.lid), 4);
        enc.put_int(u64::from(self.qpn), 4);
        enc.put_int(u64::from(self.psn), 4);
        enc.put_int(u64::from(self.rkey), 4);
        enc.put_int(self.vaddr, 8);
        enc.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(bytes);
        Ok(Self {
            lid: dec.get_u32()?,
            qpn: dec.get_u32()?,
            psn: dec.get_u32()?,
            rkey: dec.get_u32()?,
            vaddr: dec.get_u64()?,
        })
    }
}

/// Translate the MTU parameter. Zero means "use the port's active MTU";
/// anything else must be in the fixed set.
fn translate_mtu(mtu_size: u32, active: ibv_mtu::Type) -> Result<ibv_mtu::Type> {
    Ok(match mtu_size {
        0 => active,
        256 => ibv_mtu::IBV_MTU_256,
        512 => ibv_mtu::IBV_MTU_512,
        1024 => ibv_mtu::IBV_MTU_1024,
        2048 => ibv_mtu::IBV_MTU_2048,
        4096 => ibv_mtu::IBV_MTU_4096,
        other => bail!("invalid MTU {}; expected 256, 512, 1024, 2048 or 4096", other),
    })
}

/// Payload bytes one packet of a given MTU can carry.
fn mtu_bytes(mtu: ibv_mtu::Type) -> usize {
    match mtu {
        ibv_mtu::IBV_MTU_256 => 256,
        ibv_mtu::IBV_MTU_512 => 512,
        ibv_mtu::IBV_MTU_1024 => 1024,
        ibv_mtu::IBV_MTU_2048 => 2048,
        _ => 4096,
    }
}

/// The static-rate table. Rates are named either by gigabits or by link
/// width; anything unrecognized fails setup.
fn translate_rate(rate: &str) -> Result<u8> {
    let r = match rate {
        "" => 0, // device default
        "2.5" | "1x" => ibv_rate::IBV_RATE_2_5_GBPS,
        "5" => ibv_rate::IBV_RATE_5_GBPS,
        "10" | "4x" => ibv_rate::IBV_RATE_10_GBPS,
        "20" => ibv_rate::IBV_RATE_20_GBPS,
        "30" | "12x" => ibv_rate::IBV_RATE_30_GBPS,
        "40" => ibv_rate::IBV_RATE_40_GBPS,
        "60" => ibv_rate::IBV_RATE_60_GBPS,
        "80" => ibv_rate::IBV_RATE_80_GBPS,
        "120" => ibv_rate::IBV_RATE_120_GBPS,
        other => bail!("unknown static rate '{}'", other),
    };
    Ok(r as u8)
}

/// Split the identifier parameter into device name and port, defaulting the
/// port to 1: `""`, `"mlx5_0"`, `"mlx5_0:2"`.
fn parse_id(id: &str) -> Result<(Option<&str>, u8)> {
    if id.is_empty() {
        return Ok((None, 1));
    }
    match id.split_once(':') {
        None => Ok((Some(id), 1)),
        Some((dev, port)) => {
            let port: u8 = port
                .parse()
                .map_err(|_| anyhow!("invalid port in identifier '{}'", id))?;
            if port == 0 {
                bail!("invalid port in identifier '{}'", id);
            }
            Ok((if dev.is_empty() { None } else { Some(dev) }, port))
        }
    }
}

fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

// RAII wrappers. Each owns exactly one verbs object; drop is the release
// hook, so drop order is release order.

struct DevList {
    list: NonNull<*mut ibv_device>,
    len: usize,
}

impl DevList {
    fn enumerate() -> Result<Self> {
        let mut n = 0i32;
        let list = unsafe { ibv_get_device_list(&mut n) };
        let list = NonNull::new(list)
            .ok_or_else(|| anyhow!("cannot enumerate RDMA devices: {}", last_os_error()))?;
        Ok(Self {
            list,
            len: n.max(0) as usize,
        })
    }

    fn find(&self, name: Option<&str>) -> Result<*mut ibv_device> {
        let devices =
            unsafe { std::slice::from_raw_parts(self.list.as_ptr(), self.len) };
        match name {
            None => devices
                .first()
                .copied()
                .ok_or_else(|| anyhow!("no RDMA devices present")),
            Some(want) => devices
                .iter()
                .copied()
                .find(|&d| {
                    let c = unsafe { ibv_get_device_name(d) };
                    !c.is_null() && unsafe { CStr::from_ptr(c) }.to_str() == Ok(want)
                })
                .ok_or_else(|| anyhow!("no RDMA device named '{}'", want)),
        }
    }
}

impl Drop for DevList {
    fn drop(&mut self) {
        unsafe { ibv_free_device_list(self.list.as_ptr()) };
    }
}

struct Context(NonNull<ibv_context>);

impl Context {
    fn open(device: *mut ibv_device) -> Result<Self> {
        NonNull::new(unsafe { ibv_open_device(device) })
            .map(Self)
            .ok_or_else(|| anyhow!("cannot open RDMA device: {}", last_os_error()))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if unsafe { ibv_close_device(self.0.as_ptr()) } != 0 {
            warn!("closing RDMA device context failed: {}", last_os_error());
        }
    }
}

struct CompChannel(NonNull<ibv_comp_channel>);

impl CompChannel {
    fn create(ctx: &Context) -> Result<Self> {
        NonNull::new(unsafe { ibv_create_comp_channel(ctx.0.as_ptr()) })
            .map(Self)
            .ok_or_else(|| anyhow!("cannot create completion channel: {}", last_os_error()))
    }
}

impl Drop for CompChannel {
    fn drop(&mut self) {
        unsafe { ibv_destroy_comp_channel(self.0.as_ptr()) };
    }
}

struct Pd(NonNull<ibv_pd>);

impl Pd {
    fn alloc(ctx: &Context) -> Result<Self> {
        NonNull::new(unsafe { ibv_alloc_pd(ctx.0.as_ptr()) })
            .map(Self)
            .ok_or_else(|| anyhow!("cannot allocate protection domain: {}", last_os_error()))
    }
}

impl Drop for Pd {
    fn drop(&mut self) {
        unsafe { ibv_dealloc_pd(self.0.as_ptr()) };
    }
}

/// Page-aligned buffer, registered once per test and shared by every
/// in-flight work request of a bandwidth run.
struct PinnedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PinnedBuf {
    fn alloc(len: usize) -> Result<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = if page > 0 { page as usize } else { 4096 };
        let layout = Layout::from_size_align(len.max(1), page)
            .map_err(|e| anyhow!("bad buffer layout: {}", e))?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| anyhow!("cannot allocate {} byte pinned buffer", len))?;
        Ok(Self { ptr, layout })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for PinnedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct Mr(NonNull<ibv_mr>);

impl Mr {
    fn register(pd: &Pd, buf: &PinnedBuf) -> Result<Self> {
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
        NonNull::new(unsafe {
            ibv_reg_mr(
                pd.0.as_ptr(),
                buf.as_ptr().cast(),
                buf.len(),
                access.0 as i32,
            )
        })
        .map(Self)
        .ok_or_else(|| anyhow!("cannot register memory region: {}", last_os_error()))
    }

    fn lkey(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).lkey }
    }

    fn rkey(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).rkey }
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        if unsafe { ibv_dereg_mr(self.0.as_ptr()) } != 0 {
            warn!("deregistering memory region failed: {}", last_os_error());
        }
    }
}

struct Cq(NonNull<ibv_cq>);

impl Cq {
    fn create(ctx: &Context, cqe: i32, channel: Option<&CompChannel>) -> Result<Self> {
        let ch = channel.map_or(ptr::null_mut(), |c| c.0.as_ptr());
        NonNull::new(unsafe { ibv_create_cq(ctx.0.as_ptr(), cqe, ptr::null_mut(), ch, 0) })
            .map(Self)
            .ok_or_else(|| anyhow!("cannot create completion queue: {}", last_os_error()))
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        if unsafe { ibv_destroy_cq(self.0.as_ptr()) } != 0 {
            warn!("destroying completion queue failed: {}", last_os_error());
        }
    }
}

struct Qp(NonNull<ibv_qp>);

impl Qp {
    fn qp_num(&self) -> u32 {
        unsafe { (*self.0.as_ptr()).qp_num }
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        if unsafe { ibv_destroy_qp(self.0.as_ptr()) } != 0 {
            warn!("destroying queue pair failed: {}", last_os_error());
        }
    }
}

struct Ah(NonNull<ibv_ah>);

impl Drop for Ah {
    fn drop(&mut self) {
        unsafe { ibv_destroy_ah(self.0.as_ptr()) };
    }
}

/// An open RDMA endpoint, from device list to queue pair.
pub struct RdmaDevice {
    // Field order is drop order is the mandated release order: AH, CQ, QP,
    // MR, PD, channel, context, buffer, device list.
    ah: Option<Ah>,
    cq: Cq,
    qp: Qp,
    mr: Mr,
    pd: Pd,
    channel: Option<CompChannel>,
    context: Context,
    buf: PinnedBuf,
    _dev_list: DevList,

    transport: QpTransport,
    port: u8,
    mtu: ibv_mtu::Type,
    static_rate: u8,
    poll_mode: bool,
    msg_size: usize,
    max_inline: u32,
    rd_atomic: u8,
    pub lcon: ConContext,
    pub rcon: ConContext,
    /// Signaled work requests currently outstanding on the send queue.
    outstanding: u32,
    max_send_wr: u32,
}

impl RdmaDevice {
    /// Open the device and allocate every verbs resource for one test.
    ///
    /// `msg_size` is the payload size of one message; `layout` decides how
    /// much pinned memory backs it (atomic tests pass 8 with
    /// [`BufLayout::AtomicSlots`]).
    pub fn open(
        ctx: &mut TestContext,
        transport: QpTransport,
        max_send_wr: u32,
        max_recv_wr: u32,
        msg_size: usize,
        layout: BufLayout,
    ) -> Result<Self> {
        if msg_size == 0 {
            bail!("message size must be positive");
        }
        let mtu_size = ctx.params.take_u32(ParamId::MtuSize);
        let id = ctx.params.take_str(ParamId::Id);
        let rate = ctx.params.take_str(ParamId::StaticRate);
        let poll_mode = ctx.params.take_u32(ParamId::PollMode) != 0;
        let rd_atomic_req = if transport == QpTransport::Rc {
            ctx.params.take_u32(ParamId::RdAtomic)
        } else {
            1
        };

        let static_rate = translate_rate(&rate)?;
        let (dev_name, port) = parse_id(&id)?;

        // Acquisition order from here on is release order in reverse; every
        // early return unwinds the locals already acquired.
        let dev_list = DevList::enumerate()?;
        let device = dev_list.find(dev_name)?;
        let context = Context::open(device)?;

        let mut port_attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        if unsafe { ___ibv_query_port(context.0.as_ptr(), port, &mut port_attr) } != 0 {
            return Err(anyhow!("cannot query port {}: {}", port, last_os_error()));
        }
        let mtu = translate_mtu(mtu_size, port_attr.active_mtu)?;
        if transport == QpTransport::Ud && msg_size > mtu_bytes(mtu) {
            bail!(
                "message size {} exceeds the {} byte UD MTU",
                msg_size,
                mtu_bytes(mtu)
            );
        }

        let mut device_attr = unsafe { std::mem::zeroed::<ibv_device_attr>() };
        if unsafe { ibv_query_device(context.0.as_ptr(), &mut device_attr) } != 0 {
            return Err(anyhow!("cannot query device: {}", last_os_error()));
        }
        let rd_atomic = rd_atomic_req
            .min(device_attr.max_qp_rd_atom.max(1) as u32)
            .max(1) as u8;

        let channel = if poll_mode {
            None
        } else {
            Some(CompChannel::create(&context)?)
        };
        let pd = Pd::alloc(&context)?;

        let mut buf_len = match layout {
            BufLayout::Message => msg_size,
            BufLayout::AtomicSlots => msg_size.max(8 * rd_atomic as usize),
            BufLayout::Mirrored => 2 * msg_size,
        };
        if transport == QpTransport::Ud {
            buf_len += GRH_LEN;
        }
        let buf = PinnedBuf::alloc(buf_len)?;
        let mr = Mr::register(&pd, &buf)?;

        let cqe = (max_send_wr + max_recv_wr).max(1) as i32;
        let cq = Cq::create(&context, cqe, channel.as_ref())?;

        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.send_cq = cq.0.as_ptr();
        init_attr.recv_cq = cq.0.as_ptr();
        init_attr.cap = ibv_qp_cap {
            max_send_wr: max_send_wr.max(1),
            max_recv_wr: max_recv_wr.max(1),
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        init_attr.qp_type = transport.qp_type();
        init_attr.sq_sig_all = 0;
        let qp = NonNull::new(unsafe { ibv_create_qp(pd.0.as_ptr(), &mut init_attr) })
            .map(Qp)
            .ok_or_else(|| anyhow!("cannot create queue pair: {}", last_os_error()))?;

        let mut dev = Self {
            ah: None,
            cq,
            qp,
            mr,
            pd,
            channel,
            context,
            buf,
            _dev_list: dev_list,
            transport,
            port,
            mtu,
            static_rate,
            poll_mode,
            msg_size,
            max_inline: 0,
            rd_atomic,
            lcon: ConContext::default(),
            rcon: ConContext::default(),
            outstanding: 0,
            max_send_wr: max_send_wr.max(1),
        };

        dev.max_inline = dev.query_max_inline()?;
        dev.modify_to_init()?;

        dev.lcon = ConContext {
            lid: u32::from(port_attr.lid),
            qpn: dev.qp.qp_num(),
            psn: rand::random::<u32>() & 0xff_ffff,
            rkey: dev.mr.rkey(),
            vaddr: dev.buf.as_ptr() as u64,
        };
        debug!(
            "rdma open: {:?} port {} mtu {:?} inline {} rd_atomic {} lid {} qpn {:#x} psn {:#x}",
            transport, port, mtu, dev.max_inline, rd_atomic, dev.lcon.lid, dev.lcon.qpn, dev.lcon.psn
        );
        Ok(dev)
    }

    /// What the device actually granted for inline data.
    fn query_max_inline(&self) -> Result<u32> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        let mut init = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        let ret = unsafe {
            ibv_query_qp(
                self.qp.0.as_ptr(),
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_CAP.0 as i32,
                &mut init,
            )
        };
        if ret != 0 {
            return Err(anyhow!("cannot query queue pair: {}", last_os_error()));
        }
        Ok(init.cap.max_inline_data)
    }

    fn modify_to_init(&self) -> Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        let mut mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT;
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = self.port;
        match self.transport {
            QpTransport::Ud => {
                attr.qkey = QKEY;
                mask |= ibv_qp_attr_mask::IBV_QP_QKEY;
            }
            QpTransport::Rc => {
                attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_REMOTE_READ
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
                    .0;
                mask |= ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            }
            QpTransport::Uc => {
                attr.qp_access_flags = ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
                mask |= ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            }
        }
        let ret = unsafe { ibv_modify_qp(self.qp.0.as_ptr(), &mut attr, mask.0 as i32) };
        if ret != 0 {
            return Err(anyhow!("cannot modify QP to INIT: {}", last_os_error()));
        }
        Ok(())
    }

    /// Exchange connection contexts over the control channel: the client
    /// sends first and then reads, the server reads first and then sends.
    pub fn init(&mut self, control: &mut ControlChannel, is_client: bool) -> Result<()> {
        let mut buf = [0u8; ConContext::WIRE_LEN];
        if is_client {
            control.send_mesg(&self.lcon.encode(), "connection context")?;
            control.recv_mesg(&mut buf, "connection context")?;
        } else {
            control.recv_mesg(&mut buf, "connection context")?;
            control.send_mesg(&self.lcon.encode(), "connection context")?;
        }
        self.rcon = ConContext::decode(&buf)?;
        debug!(
            "peer context: lid {} qpn {:#x} psn {:#x} rkey {:#x} vaddr {:#x}",
            self.rcon.lid, self.rcon.qpn, self.rcon.psn, self.rcon.rkey, self.rcon.vaddr
        );
        Ok(())
    }

    /// Drive the queue pair to RTR and then RTS, create the UD address
    /// handle, and arm completion notification for event-mode runs.
    pub fn prepare(&mut self) -> Result<()> {
        self.modify_to_rtr()?;
        self.modify_to_rts()?;
        if self.transport == QpTransport::Ud {
            let mut ah_attr = unsafe { std::mem::zeroed::<ibv_ah_attr>() };
            ah_attr.dlid = self.rcon.lid as u16;
            ah_attr.port_num = self.port;
            ah_attr.static_rate = self.static_rate;
            self.ah = Some(
                NonNull::new(unsafe { ibv_create_ah(self.pd.0.as_ptr(), &mut ah_attr) })
                    .map(Ah)
                    .ok_or_else(|| {
                        anyhow!("cannot create address handle: {}", last_os_error())
                    })?,
            );
        }
        if !self.poll_mode {
            self.req_notify()?;
        }
        Ok(())
    }

    fn modify_to_rtr(&self) -> Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        let mut mask = ibv_qp_attr_mask::IBV_QP_STATE;
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;

        if self.transport != QpTransport::Ud {
            attr.path_mtu = self.mtu;
            attr.dest_qp_num = self.rcon.qpn;
            attr.rq_psn = self.rcon.psn;
            attr.ah_attr.dlid = self.rcon.lid as u16;
            attr.ah_attr.port_num = self.port;
            attr.ah_attr.static_rate = self.static_rate;
            mask |= ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN;
        }
        if self.transport == QpTransport::Rc {
            attr.max_dest_rd_atomic = self.rd_atomic;
            attr.min_rnr_timer = 12;
            mask |= ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        }
        let ret = unsafe { ibv_modify_qp(self.qp.0.as_ptr(), &mut attr, mask.0 as i32) };
        if ret != 0 {
            return Err(anyhow!("cannot modify QP to RTR: {}", last_os_error()));
        }
        Ok(())
    }

    fn modify_to_rts(&self) -> Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        let mut mask = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_SQ_PSN;
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = self.lcon.psn;

        if self.transport == QpTransport::Rc {
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = self.rd_atomic;
            mask |= ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        }
        let ret = unsafe { ibv_modify_qp(self.qp.0.as_ptr(), &mut attr, mask.0 as i32) };
        if ret != 0 {
            return Err(anyhow!("cannot modify QP to RTS: {}", last_os_error()));
        }
        Ok(())
    }

    /// Message payload size of this run.
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Clamped outstanding-atomic count.
    pub fn rd_atomic(&self) -> u32 {
        u32::from(self.rd_atomic)
    }

    /// Poll mode (spin on the CQ) versus event mode (completion channel).
    pub fn poll_mode(&self) -> bool {
        self.poll_mode
    }

    /// Room left on the send queue.
    pub fn send_slots_free(&self) -> u32 {
        self.max_send_wr - self.outstanding
    }

    /// Raw view of the pinned buffer, for marker polling and verification.
    pub fn buffer(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    fn sge(&self, offset: usize, length: usize) -> ibv_sge {
        ibv_sge {
            addr: self.buf.as_ptr() as u64 + offset as u64,
            length: length as u32,
            lkey: self.mr.lkey(),
        }
    }

    /// Whether a send of this run's message size may use the INLINE path.
    /// Never applied to RDMA reads or atomics.
    fn inline_flag(&self) -> u32 {
        if self.msg_size <= self.max_inline as usize {
            ibv_send_flags::IBV_SEND_INLINE.0
        } else {
            0
        }
    }

    /// Post one signaled send of the message buffer.
    pub fn post_send(&mut self) -> Result<()> {
        debug_assert!(self.outstanding < self.max_send_wr);
        let mut sge = self.sge(0, self.msg_size);
        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = WRID_SEND;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0 | self.inline_flag();
        if self.transport == QpTransport::Ud {
            let ah = self
                .ah
                .as_ref()
                .ok_or_else(|| anyhow!("UD send before address handle creation"))?;
            wr.wr.ud = ud_t {
                ah: ah.0.as_ptr(),
                remote_qpn: self.rcon.qpn,
                remote_qkey: QKEY,
            };
        }
        let mut bad = ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.qp.0.as_ptr(), &mut wr, &mut bad) };
        if ret != 0 {
            return Err(anyhow!("post send failed: {}", last_os_error()));
        }
        self.outstanding += 1;
        Ok(())
    }

    /// Post one receive covering the whole buffer (GRH included on UD).
    pub fn post_recv(&mut self) -> Result<()> {
        let len = if self.transport == QpTransport::Ud {
            self.msg_size + GRH_LEN
        } else {
            self.msg_size
        };
        let mut sge = self.sge(0, len);
        let mut wr = unsafe { std::mem::zeroed::<ibv_recv_wr>() };
        wr.wr_id = WRID_RECV;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        let mut bad = ptr::null_mut();
        let ret = unsafe { ibv_post_recv(self.qp.0.as_ptr(), &mut wr, &mut bad) };
        if ret != 0 {
            return Err(anyhow!("post receive failed: {}", last_os_error()));
        }
        Ok(())
    }

    /// Post one signaled RDMA read or write of the whole message against
    /// the peer's exchanged buffer, `remote_offset` bytes in (ping-pong
    /// targets the peer's inbound half of a mirrored buffer). INLINE
    /// applies to writes only.
    pub fn post_rdma(&mut self, opcode: ibv_wr_opcode::Type, remote_offset: usize) -> Result<()> {
        debug_assert!(self.outstanding < self.max_send_wr);
        let mut sge = self.sge(0, self.msg_size);
        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = WRID_RDMA;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = opcode;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        if opcode == ibv_wr_opcode::IBV_WR_RDMA_WRITE {
            wr.send_flags |= self.inline_flag();
        }
        wr.wr.rdma = rdma_t {
            remote_addr: self.rcon.vaddr + remote_offset as u64,
            rkey: self.rcon.rkey,
        };
        let mut bad = ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.qp.0.as_ptr(), &mut wr, &mut bad) };
        if ret != 0 {
            return Err(anyhow!("post rdma failed: {}", last_os_error()));
        }
        self.outstanding += 1;
        Ok(())
    }

    /// Post one signaled atomic against the first eight bytes of the peer's
    /// buffer, returning the old value into local slot `slot`.
    pub fn post_atomic(&mut self, op: AtomicOp, slot: usize) -> Result<()> {
        debug_assert!(self.outstanding < self.max_send_wr);
        let mut sge = self.sge(slot * 8, 8);
        let mut wr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = WRID_RDMA;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        let (opcode, compare_add, swap) = match op {
            AtomicOp::FetchAdd(add) => (ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD, add, 0),
            AtomicOp::CompareSwap { compare, swap } => {
                (ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP, compare, swap)
            }
        };
        wr.opcode = opcode;
        wr.wr.atomic = atomic_t {
            remote_addr: self.rcon.vaddr,
            compare_add,
            swap,
            rkey: self.rcon.rkey,
        };
        let mut bad = ptr::null_mut();
        let ret = unsafe { ibv_post_send(self.qp.0.as_ptr(), &mut wr, &mut bad) };
        if ret != 0 {
            return Err(anyhow!("post atomic failed: {}", last_os_error()));
        }
        self.outstanding += 1;
        Ok(())
    }

    /// Read the eight-byte value an atomic wrote into local slot `slot`.
    pub fn atomic_slot(&self, slot: usize) -> u64 {
        let mut raw = [0u8; 8];
        unsafe {
            ptr::copy_nonoverlapping(self.buf.as_ptr().add(slot * 8), raw.as_mut_ptr(), 8);
        }
        u64::from_ne_bytes(raw)
    }

    fn req_notify(&self) -> Result<()> {
        if unsafe { ibv_req_notify_cq(self.cq.0.as_ptr(), 0) } != 0 {
            return Err(anyhow!("cannot arm CQ notification: {}", last_os_error()));
        }
        Ok(())
    }

    /// Harvest completions without blocking.
    pub fn poll(&mut self, wc: &mut [ibv_wc]) -> Result<usize> {
        let n = unsafe {
            ibv_poll_cq(self.cq.0.as_ptr(), wc.len() as i32, wc.as_mut_ptr())
        };
        if n < 0 {
            return Err(anyhow!("poll CQ failed"));
        }
        let n = n as usize;
        for c in &wc[..n] {
            if c.wr_id == WRID_SEND || c.wr_id == WRID_RDMA {
                self.outstanding = self.outstanding.saturating_sub(1);
            }
        }
        Ok(n)
    }

    /// The common completion helper: poll mode spins on the CQ from the
    /// caller's loop; event mode blocks on the completion channel, re-arms,
    /// and polls. EINTR with the finished flag raised yields zero
    /// completions, never an error.
    pub fn completions(&mut self, wc: &mut [ibv_wc]) -> Result<usize> {
        let n = self.poll(wc)?;
        if n > 0 || self.poll_mode || finished() {
            return Ok(n);
        }

        loop {
            let mut cq = ptr::null_mut();
            let mut cq_ctx = ptr::null_mut();
            let channel = self
                .channel
                .as_ref()
                .ok_or_else(|| anyhow!("event wait without completion channel"))?;
            let ret = unsafe { ibv_get_cq_event(channel.0.as_ptr(), &mut cq, &mut cq_ctx) };
            if ret != 0 {
                let err = last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    if finished() {
                        return Ok(0);
                    }
                    continue;
                }
                return Err(anyhow!("completion event wait failed: {}", err));
            }
            unsafe { ibv_ack_cq_events(cq, 1) };
            self.req_notify()?;
            return self.poll(wc);
        }
    }
}

/// The two verbs atomics.
#[derive(Debug, Clone, Copy)]
pub enum AtomicOp {
    FetchAdd(u64),
    CompareSwap { compare: u64, swap: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_con_context_round_trip() {
        let con = ConContext {
            lid: 7,
            qpn: 0x1c_0203,
            psn: 0xab_cdef,
            rkey: 0xdead_beef,
            vaddr: 0x7fff_0000_1234,
        };
        let bytes = con.encode();
        assert_eq!(bytes.len(), ConContext::WIRE_LEN);
        assert_eq!(ConContext::decode(&bytes).unwrap(), con);
    }

    #[test]
    fn test_translate_mtu() {
        let active = ibv_mtu::IBV_MTU_4096;
        assert_eq!(translate_mtu(0, active).unwrap(), active);
        assert_eq!(translate_mtu(256, active).unwrap(), ibv_mtu::IBV_MTU_256);
        assert_eq!(translate_mtu(2048, active).unwrap(), ibv_mtu::IBV_MTU_2048);
        assert!(translate_mtu(1500, active).is_err());
        assert!(translate_mtu(9000, active).is_err());
    }

    #[test]
    fn test_translate_rate() {
        assert_eq!(translate_rate("").unwrap(), 0);
        assert_eq!(
            translate_rate("2.5").unwrap(),
            ibv_rate::IBV_RATE_2_5_GBPS as u8
        );
        assert_eq!(translate_rate("1x").unwrap(), translate_rate("2.5").unwrap());
        assert_eq!(translate_rate("4x").unwrap(), translate_rate("10").unwrap());
        assert_eq!(translate_rate("12x").unwrap(), translate_rate("30").unwrap());
        assert!(translate_rate("7").is_err());
        assert!(translate_rate("fast").is_err());
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("").unwrap(), (None, 1));
        assert_eq!(parse_id("mlx5_0").unwrap(), (Some("mlx5_0"), 1));
        assert_eq!(parse_id("mlx5_0:2").unwrap(), (Some("mlx5_0"), 2));
        assert_eq!(parse_id(":2").unwrap(), (None, 2));
        assert!(parse_id("mlx5_0:zero").is_err());
        assert!(parse_id("mlx5_0:0").is_err());
    }
}
