use crate::completion_queue::CompletionQueue;
use crate::context::check_dev_cap;
use crate::error::{log_last_os_err, log_ret_last_os_err};
use crate::protection_domain::ProtectionDomain;
use crate::work_request::{RecvWr, SendWr};
use clippy_utilities::Cast;
use derive_builder::Builder;
use getset::Getters;
use rdma_sys::{
    ibv_access_flags, ibv_create_qp, ibv_destroy_qp, ibv_modify_qp, ibv_mtu, ibv_post_recv,
    ibv_post_send, ibv_qp, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_init_attr, ibv_qp_state,
    ibv_qp_type, ibv_query_qp, ibv_recv_wr, ibv_send_wr,
};
use std::{fmt::Debug, io, ptr::NonNull, sync::Arc};
use tracing::{debug, warn};

/// Maximum outstanding send work requests. Sends are signaled and reaped
/// lazily, so the queue must hold a full ring's worth of small frames.
const MAX_SEND_WR: u32 = 256;
/// Maximum outstanding receive work requests. The ring has no two-sided
/// traffic, the receive queue only holds the priming requests.
const MAX_RECV_WR: u32 = 8;
/// A frame write scatters header, payload and footer
const MAX_SEND_SGE: u32 = 3;
/// Receive requests carry no scatter entries
const MAX_RECV_SGE: u32 = 1;
/// Inline capacity requested at creation; clamped to what the device grants
const REQUESTED_INLINE_DATA: u32 = 256;

/// Default `pkey_index`
const DEFAULT_PKEY_INDEX: u16 = 0;
/// Default packet sequence numbers, both directions
const DEFAULT_PSN: u32 = 0;
/// Default `max_dest_rd_atomic`: the sender issues one cursor read at a time
const DEFAULT_MAX_DEST_RD_ATOMIC: u8 = 1;
/// Default `min_rnr_timer`
const DEFAULT_MIN_RNR_TIMER: u8 = 0x12;
/// Default ACK timeout exponent, `4.096us * 2^timeout`
const DEFAULT_TIMEOUT: u8 = 0x12;
/// Default transport retry count
const DEFAULT_RETRY_CNT: u8 = 6;
/// Default receiver-not-ready retry count
const DEFAULT_RNR_RETRY: u8 = 6;
/// Default `max_rd_atomic`
const DEFAULT_MAX_RD_ATOMIC: u8 = 1;
/// Default path MTU
const DEFAULT_MTU: MTU = MTU::MTU1024;

/// The path MTU, the maximum payload of a single packet on the path. The
/// device fragments larger messages transparently on RC queue pairs.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MTU {
    /// 256 bytes
    MTU256,
    /// 512 bytes
    MTU512,
    /// 1024 bytes
    MTU1024,
    /// 2048 bytes
    MTU2048,
    /// 4096 bytes
    MTU4096,
}

impl From<MTU> for u32 {
    fn from(mtu: MTU) -> Self {
        match mtu {
            MTU::MTU256 => ibv_mtu::IBV_MTU_256,
            MTU::MTU512 => ibv_mtu::IBV_MTU_512,
            MTU::MTU1024 => ibv_mtu::IBV_MTU_1024,
            MTU::MTU2048 => ibv_mtu::IBV_MTU_2048,
            MTU::MTU4096 => ibv_mtu::IBV_MTU_4096,
        }
    }
}

/// Attributes applied on the transition to ready-to-receive. The remote
/// fields come out of the peer's handshake record; routing is by LID only,
/// both ends sit in the same subnet (no global route header).
#[derive(Debug, Clone, Copy, Getters, Builder)]
#[builder(derive(Debug))]
#[getset(get = "pub(crate)")]
pub(crate) struct RecvQueueAttr {
    /// Remote queue pair number
    dest_qp_number: u32,
    /// Remote port LID
    dest_lid: u16,
    /// Local port the packets leave through
    port_num: u8,
    /// Path MTU
    #[builder(default = "DEFAULT_MTU")]
    mtu: MTU,
    /// Packet sequence number of the received packets
    #[builder(default = "DEFAULT_PSN")]
    rq_psn: u32,
    /// Outstanding one-sided reads with this end as the destination
    #[builder(default = "DEFAULT_MAX_DEST_RD_ATOMIC")]
    max_dest_rd_atomic: u8,
    /// Minimum receiver-not-ready NAK timer
    #[builder(default = "DEFAULT_MIN_RNR_TIMER")]
    min_rnr_timer: u8,
}

/// Attributes applied on the transition to ready-to-send.
#[derive(Debug, Clone, Copy, Getters, Builder)]
#[builder(derive(Debug))]
#[getset(get = "pub(crate)")]
pub(crate) struct SendQueueAttr {
    /// ACK timeout exponent
    #[builder(default = "DEFAULT_TIMEOUT")]
    timeout: u8,
    /// Transport retry count
    #[builder(default = "DEFAULT_RETRY_CNT")]
    retry_cnt: u8,
    /// Receiver-not-ready retry count
    #[builder(default = "DEFAULT_RNR_RETRY")]
    rnr_retry: u8,
    /// Packet sequence number of the sent packets
    #[builder(default = "DEFAULT_PSN")]
    sq_psn: u32,
    /// Outstanding one-sided reads with this end as the initiator
    #[builder(default = "DEFAULT_MAX_RD_ATOMIC")]
    max_rd_atomic: u8,
}

/// Map a builder error onto `io::Error` at the call site
pub(crate) fn builder_err<E: std::error::Error>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

/// The state of a queue pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuePairState {
    /// Reset state
    Reset,
    /// Initialized
    Init,
    /// Ready to receive
    ReadyToRecv,
    /// Ready to send
    ReadyToSend,
    /// Error state
    Err,
    /// Any other state of the verbs state machine
    Other,
}

impl From<u32> for QueuePairState {
    fn from(num: u32) -> Self {
        if num == ibv_qp_state::IBV_QPS_RTS {
            Self::ReadyToSend
        } else if num == ibv_qp_state::IBV_QPS_RTR {
            Self::ReadyToRecv
        } else if num == ibv_qp_state::IBV_QPS_INIT {
            Self::Init
        } else if num == ibv_qp_state::IBV_QPS_ERR {
            Self::Err
        } else if num == ibv_qp_state::IBV_QPS_RESET {
            Self::Reset
        } else {
            Self::Other
        }
    }
}

/// Reliable-connected queue pair wrapper.
///
/// All posting goes through this type; libibverbs serializes concurrent
/// posts internally, which is what allows the send path and the receive
/// path to share one queue pair from two threads.
pub(crate) struct QueuePair {
    /// protection domain it belongs to
    _pd: Arc<ProtectionDomain>,
    /// internal `ibv_qp` pointer
    inner_qp: NonNull<ibv_qp>,
    /// queue pair number, cached at creation
    qp_num: u32,
    /// inline capacity granted by the device for this queue pair
    max_inline_data: u32,
}

impl QueuePair {
    /// get `ibv_qp` pointer
    pub(crate) fn as_ptr(&self) -> *mut ibv_qp {
        self.inner_qp.as_ptr()
    }

    /// The queue pair number
    pub(crate) fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Inline capacity granted by the device
    pub(crate) fn max_inline_data(&self) -> u32 {
        self.max_inline_data
    }

    /// Create a reliable-connected queue pair on the given completion
    /// queues.
    ///
    /// Inline capacity is best effort: if the device refuses a queue with
    /// the requested `max_inline_data`, creation is retried without it and
    /// every send takes the registered-scratch path.
    pub(crate) fn create(
        pd: &Arc<ProtectionDomain>,
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
    ) -> io::Result<Self> {
        let dev_attr = pd.ctx.dev_attr();
        check_dev_cap(&MAX_SEND_SGE, &dev_attr.max_sge.cast(), "max_send_sge")?;
        check_dev_cap(&MAX_SEND_WR, &dev_attr.max_qp_wr.cast(), "max_send_wr")?;

        let mut init_attr = Self::init_attr(send_cq, recv_cq, REQUESTED_INLINE_DATA);
        // SAFETY: ffi
        let created = NonNull::new(unsafe { ibv_create_qp(pd.as_ptr(), &mut init_attr) });
        let inner_qp = match created {
            Some(qp) => qp,
            None => {
                warn!(
                    "queue pair with {} inline bytes rejected, retrying without inline",
                    REQUESTED_INLINE_DATA
                );
                let mut fallback = Self::init_attr(send_cq, recv_cq, 0);
                // SAFETY: ffi
                NonNull::new(unsafe { ibv_create_qp(pd.as_ptr(), &mut fallback) })
                    .ok_or_else(|| log_ret_last_os_err("ibv_create_qp"))?
            }
        };

        // SAFETY: valid `ibv_qp` pointer
        let qp_num = unsafe { (*inner_qp.as_ptr()).qp_num };

        let mut qp = Self {
            _pd: Arc::<ProtectionDomain>::clone(pd),
            inner_qp,
            qp_num,
            max_inline_data: 0,
        };
        qp.max_inline_data = qp.query_max_inline()?;
        debug!(
            "created qp {} with {} inline bytes",
            qp.qp_num, qp.max_inline_data
        );
        Ok(qp)
    }

    /// The creation attributes shared by both attempts
    fn init_attr(
        send_cq: &CompletionQueue,
        recv_cq: &CompletionQueue,
        max_inline_data: u32,
    ) -> ibv_qp_init_attr {
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.send_cq = send_cq.as_ptr();
        init_attr.recv_cq = recv_cq.as_ptr();
        init_attr.cap.max_send_wr = MAX_SEND_WR;
        init_attr.cap.max_recv_wr = MAX_RECV_WR;
        init_attr.cap.max_send_sge = MAX_SEND_SGE;
        init_attr.cap.max_recv_sge = MAX_RECV_SGE;
        init_attr.cap.max_inline_data = max_inline_data;
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = 0_i32;
        init_attr
    }

    /// Ask the device what it actually granted for this queue pair.
    fn query_max_inline(&self) -> io::Result<u32> {
        // SAFETY: POD FFI types
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        // SAFETY: POD FFI types
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        // SAFETY: ffi
        let errno = unsafe {
            ibv_query_qp(
                self.as_ptr(),
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_CAP.0.cast(),
                &mut init_attr,
            )
        };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_query_qp"));
        }
        Ok(attr.cap.max_inline_data)
    }

    /// Query the current state of the queue pair
    pub(crate) fn query_state(&self) -> io::Result<QueuePairState> {
        // SAFETY: POD FFI types
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        // SAFETY: POD FFI types
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        // SAFETY: ffi
        let errno = unsafe {
            ibv_query_qp(
                self.as_ptr(),
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0.cast(),
                &mut init_attr,
            )
        };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_query_qp"));
        }
        Ok(attr.qp_state.into())
    }

    /// Transition reset -> init
    pub(crate) fn modify_to_init(
        &self,
        access: ibv_access_flags,
        port_num: u8,
    ) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = DEFAULT_PKEY_INDEX;
        attr.port_num = port_num;
        attr.qp_access_flags = access.0;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        // SAFETY: ffi, the qp is not modified concurrently during setup
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, flags.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_modify_qp to INIT"));
        }
        Ok(())
    }

    /// Transition init -> ready-to-receive, wiring in the peer
    pub(crate) fn modify_to_rtr(&self, rq_attr: RecvQueueAttr) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = (*rq_attr.mtu()).into();
        attr.dest_qp_num = *rq_attr.dest_qp_number();
        attr.rq_psn = *rq_attr.rq_psn();
        attr.max_dest_rd_atomic = *rq_attr.max_dest_rd_atomic();
        attr.min_rnr_timer = *rq_attr.min_rnr_timer();
        attr.ah_attr.dlid = *rq_attr.dest_lid();
        attr.ah_attr.sl = 0_u8;
        attr.ah_attr.src_path_bits = 0_u8;
        attr.ah_attr.static_rate = 0_u8;
        attr.ah_attr.is_global = 0_u8;
        attr.ah_attr.port_num = *rq_attr.port_num();
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        // SAFETY: ffi, the qp is not modified concurrently during setup
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, flags.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_modify_qp to RTR"));
        }
        Ok(())
    }

    /// Transition ready-to-receive -> ready-to-send
    pub(crate) fn modify_to_rts(&self, sq_attr: SendQueueAttr) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = *sq_attr.timeout();
        attr.retry_cnt = *sq_attr.retry_cnt();
        attr.rnr_retry = *sq_attr.rnr_retry();
        attr.sq_psn = *sq_attr.sq_psn();
        attr.max_rd_atomic = *sq_attr.max_rd_atomic();
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        // SAFETY: ffi, the qp is not modified concurrently during setup
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, flags.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_modify_qp to RTS"));
        }
        Ok(())
    }

    /// Force the queue pair into the error state. Outstanding work requests
    /// flush with an error completion, which is what the teardown drain
    /// waits for.
    pub(crate) fn modify_to_error(&self) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_ERR;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE;
        // SAFETY: ffi
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, flags.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_modify_qp to ERR"));
        }
        Ok(())
    }

    /// Post a send work request
    pub(crate) fn post_send(&self, wr: &mut SendWr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_send_wr>();
        // SAFETY: ffi, `wr` owns its scatter list
        let errno = unsafe { ibv_post_send(self.as_ptr(), wr.as_mut(), &mut bad_wr) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_post_send"));
        }
        Ok(())
    }

    /// Post a receive work request
    pub(crate) fn post_recv(&self, wr: &mut RecvWr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: ffi
        let errno = unsafe { ibv_post_recv(self.as_ptr(), wr.as_mut(), &mut bad_wr) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err("ibv_post_recv"));
        }
        Ok(())
    }
}

impl Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.qp_num)
            .field("max_inline_data", &self.max_inline_data)
            .finish()
    }
}

// SAFETY: libibverbs verbs are thread safe, the pointer is owned
unsafe impl Send for QueuePair {}
// SAFETY: see above
unsafe impl Sync for QueuePair {}

impl Drop for QueuePair {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_qp(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_destroy_qp");
        }
    }
}
