//! A reliable single-connection message ring over one RDMA
//! reliable-connected queue pair.
//!
//! Two cooperating endpoints, symmetric in code, each build a
//! [`MessageRing`] over a connected TCP socket. The socket carries one
//! fixed-size handshake record in each direction (queue pair number, port
//! LID and the remote descriptors of the receive ring and the cursor
//! block), then stays around purely as a fallback channel. From that point
//! every message is one RDMA write into the peer's ring, framed by a
//! length header and a validity footer that doubles as the arrival signal,
//! and every receive is a busy-poll over local memory. The steady-state
//! data path performs no kernel entry in either direction.
//!
//! ```text
//!   endpoint A                              endpoint B
//!  ┌───────────────┐   RDMA write (frame)  ┌───────────────┐
//!  │ SendPath      │ ────────────────────▶ │ receive ring  │
//!  │  write_pos    │                       │  read_pos     │
//!  │               │ ◀──────────────────── │               │
//!  │ cursor mirror │   RDMA write (cursor) │ ReceivePath   │
//!  └───────────────┘    or RDMA read pull  └───────────────┘
//! ```
//!
//! Each ring is single-producer, single-consumer: one thread may call
//! [`MessageRing::send`] while another calls [`MessageRing::receive`], but
//! neither operation may be called concurrently with itself. Messages
//! arrive in send order with byte-exact contents; the two directions of a
//! connection are independent rings.

#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::unwrap_used,
    clippy::expect_used
)]

/// Typed wrapper for memory region access rights
mod access;
/// The RDMA device context
mod context;
/// The polled completion queue and per-queue-pair completion routing
mod completion_queue;
/// Device enumeration
mod device;
/// The error taxonomy
mod error;
/// The record exchange over the control socket
mod handshake;
/// Registered memory regions and the cursor block
mod memory_region;
/// The protection domain
mod protection_domain;
/// The queue pair and its state machine
mod queue_pair;
/// The consumer half of a ring
mod receiver;
/// Framing and cursor arithmetic
mod ring;
/// The producer half of a ring
mod sender;
/// Scatter/gather assembly and work request ids
mod work_request;

pub use error::{Result, RingError};

use access::{flags_into_ibv_access, AccessFlag};
use completion_queue::{CompletionQueue, CompletionRouter, QueuePairTracker, DEFAULT_CQ_SIZE};
use context::Context;
use handshake::HandshakeRecord;
use memory_region::{CursorBlock, RemoteRegion, CURSOR_BLOCK_LEN};
use parking_lot::Mutex;
use protection_domain::ProtectionDomain;
use queue_pair::{
    builder_err, QueuePair, QueuePairState, RecvQueueAttrBuilder, SendQueueAttrBuilder,
};
use receiver::ReceivePath;
use sender::SendPath;
use work_request::{RecvWr, WorkRequestId, WrKind};

use clippy_utilities::{Cast, OverflowArithmetic};
use std::fmt::Debug;
use std::hint;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default ring size, the buffer size the socket shim historically used.
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Default counter span up to which frames are posted inline.
pub const DEFAULT_INLINE_THRESHOLD: usize = 256;

/// Receive requests posted before the queue pair leaves the reset state.
/// The ring carries no two-sided traffic, but the transition to
/// ready-to-receive wants an armed receive queue.
const PRIME_RECV_COUNT: usize = 4;

/// How long teardown keeps reaping before abandoning unreaped requests.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Default deadline for a header whose footer never validates.
const DEFAULT_TORN_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// The process-wide verbs resources a ring runs on: device context,
/// protection domain and the two shared completion queues.
///
/// Rings on the same device should share one of these. Completions of all
/// rings land in the shared queues and are routed back to their ring by
/// queue pair number.
pub struct RdmaContext {
    /// device context
    ctx: Arc<Context>,
    /// protection domain
    pd: Arc<ProtectionDomain>,
    /// shared send completion queue
    send_cq: Arc<CompletionQueue>,
    /// shared receive completion queue
    recv_cq: Arc<CompletionQueue>,
    /// completion routing across rings
    router: Arc<CompletionRouter>,
}

impl RdmaContext {
    /// Open the named device, or the most recently added one when no name
    /// is given, on the given port.
    pub fn open(dev_name: Option<&str>, port_num: u8) -> Result<Self> {
        let ctx =
            Arc::new(Context::open(dev_name, port_num).map_err(RingError::RdmaSetupFailed)?);
        let pd = Arc::new(ProtectionDomain::create(&ctx).map_err(RingError::RdmaSetupFailed)?);
        let send_cq = Arc::new(
            CompletionQueue::create(&ctx, DEFAULT_CQ_SIZE).map_err(RingError::RdmaSetupFailed)?,
        );
        let recv_cq = Arc::new(
            CompletionQueue::create(&ctx, DEFAULT_CQ_SIZE).map_err(RingError::RdmaSetupFailed)?,
        );
        Ok(Self {
            ctx,
            pd,
            send_cq,
            recv_cq,
            router: Arc::new(CompletionRouter::new()),
        })
    }
}

impl Debug for RdmaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaContext")
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// What the producer and consumer halves of one ring share: the queue pair
/// and its completion bookkeeping.
pub(crate) struct RingShared {
    /// the reliable-connected queue pair
    pub(crate) qp: Arc<QueuePair>,
    /// the shared send completion queue
    pub(crate) send_cq: Arc<CompletionQueue>,
    /// completion routing
    pub(crate) router: Arc<CompletionRouter>,
    /// this ring's completion tracker
    pub(crate) tracker: Arc<QueuePairTracker>,
}

/// Builder for a [`MessageRing`], following the builder pattern.
#[derive(Debug, Clone)]
pub struct MessageRingBuilder {
    /// Ring size; rounded up to a power of two. Both endpoints must use
    /// the same value.
    buffer_size: usize,
    /// Rdma device name, the most recently added device when `None`
    dev_name: Option<String>,
    /// Device port number
    port_num: u8,
    /// Frames up to this counter span are posted inline, clamped to the
    /// inline capacity the device grants
    inline_threshold: usize,
    /// Cursor push threshold, half the ring when `None`
    publish_threshold: Option<u64>,
    /// Yield the CPU instead of spinning while blocked
    yield_while_waiting: bool,
    /// Deadline for a header whose footer never validates
    torn_frame_timeout: Duration,
    /// Shared verbs resources; a private context is opened when `None`
    context: Option<Arc<RdmaContext>>,
}

impl Default for MessageRingBuilder {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            dev_name: None,
            port_num: 1,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            publish_threshold: None,
            yield_while_waiting: false,
            torn_frame_timeout: DEFAULT_TORN_FRAME_TIMEOUT,
            context: None,
        }
    }
}

impl MessageRingBuilder {
    /// Create a builder with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ring size. Rounded up to a power of two; both endpoints of
    /// a connection must use the same value.
    #[must_use]
    pub fn set_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the device name
    #[must_use]
    pub fn set_dev(mut self, dev: &str) -> Self {
        self.dev_name = Some(dev.to_owned());
        self
    }

    /// Set the device port number
    #[must_use]
    pub fn set_port_num(mut self, port_num: u8) -> Self {
        self.port_num = port_num;
        self
    }

    /// Set the inline threshold. The effective value is clamped to what
    /// the device grants at queue pair creation.
    #[must_use]
    pub fn set_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    /// Set the cursor publish threshold in bytes. The default is half the
    /// ring: frequent pushes waste bandwidth, rare pushes stall the peer's
    /// sender into pulling.
    #[must_use]
    pub fn set_publish_threshold(mut self, threshold: u64) -> Self {
        self.publish_threshold = Some(threshold);
        self
    }

    /// Yield the CPU instead of spinning while blocked on ring space or
    /// incoming data.
    #[must_use]
    pub fn set_yield_while_waiting(mut self, yield_while_waiting: bool) -> Self {
        self.yield_while_waiting = yield_while_waiting;
        self
    }

    /// Set the torn-frame deadline of the receive path.
    #[must_use]
    pub fn set_torn_frame_timeout(mut self, timeout: Duration) -> Self {
        self.torn_frame_timeout = timeout;
        self
    }

    /// Run the ring on shared verbs resources instead of opening a
    /// private device context.
    #[must_use]
    pub fn set_context(mut self, context: Arc<RdmaContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Build a ring over the connected, blocking TCP socket `tcp_fd`.
    ///
    /// The socket is only borrowed for the handshake and the final
    /// barrier. On failure it is left intact and usable for plain TCP.
    pub fn establish(&self, tcp_fd: RawFd) -> Result<MessageRing> {
        let ctx = match &self.context {
            Some(ctx) => Arc::<RdmaContext>::clone(ctx),
            None => Arc::new(RdmaContext::open(self.dev_name.as_deref(), self.port_num)?),
        };
        let size = self
            .buffer_size
            .next_power_of_two()
            .max(ring::MIN_RING_SIZE);

        // Ring memory: the peer writes frames into the ring and cursor
        // pushes into the mirror cell; it pulls from the cursor cell.
        let ring_mr = ctx
            .pd
            .register_region(size, AccessFlag::LocalWrite | AccessFlag::RemoteWrite)
            .map_err(RingError::RdmaSetupFailed)?;
        let cursor_mr = ctx
            .pd
            .register_region(
                CURSOR_BLOCK_LEN,
                AccessFlag::LocalWrite | AccessFlag::RemoteWrite | AccessFlag::RemoteRead,
            )
            .map_err(RingError::RdmaSetupFailed)?;
        let scratch = ctx
            .pd
            .register_region(size, AccessFlag::LocalWrite.into())
            .map_err(RingError::RdmaSetupFailed)?;
        let cursors = Arc::new(CursorBlock::new(cursor_mr));

        let qp = Arc::new(
            QueuePair::create(&ctx.pd, &ctx.send_cq, &ctx.recv_cq)
                .map_err(RingError::RdmaSetupFailed)?,
        );
        let access = flags_into_ibv_access(
            AccessFlag::LocalWrite | AccessFlag::RemoteWrite | AccessFlag::RemoteRead,
        );
        qp.modify_to_init(access, self.port_num)
            .map_err(RingError::RdmaSetupFailed)?;

        let tracker = Arc::new(QueuePairTracker::default());
        for _ in 0..PRIME_RECV_COUNT {
            let mut wr = RecvWr::new_empty(WorkRequestId::new(WrKind::Prime));
            qp.post_recv(&mut wr).map_err(RingError::RdmaSetupFailed)?;
        }

        let local = HandshakeRecord {
            qp_num: qp.qp_num(),
            lid: ctx.ctx.lid(),
            ring_addr: ring_mr.addr(),
            ring_rkey: ring_mr.rkey(),
            cursor_addr: cursors.addr(),
            cursor_rkey: cursors.rkey(),
        };
        let remote = handshake::exchange(tcp_fd, &local).map_err(RingError::HandshakeFailed)?;

        let rq_attr = RecvQueueAttrBuilder::default()
            .dest_qp_number(remote.qp_num)
            .dest_lid(remote.lid)
            .port_num(self.port_num)
            .build()
            .map_err(builder_err)
            .map_err(RingError::RdmaSetupFailed)?;
        qp.modify_to_rtr(rq_attr).map_err(RingError::RdmaSetupFailed)?;
        let sq_attr = SendQueueAttrBuilder::default()
            .build()
            .map_err(builder_err)
            .map_err(RingError::RdmaSetupFailed)?;
        qp.modify_to_rts(sq_attr).map_err(RingError::RdmaSetupFailed)?;
        let state = qp.query_state().map_err(RingError::RdmaSetupFailed)?;
        if state != QueuePairState::ReadyToSend {
            return Err(RingError::RdmaSetupFailed(io::Error::new(
                io::ErrorKind::Other,
                format!("queue pair in {:?} after the state transitions", state),
            )));
        }

        // From here completions for this queue pair can arrive; route them.
        ctx.router.register(qp.qp_num(), Arc::<QueuePairTracker>::clone(&tracker));

        // Neither side may post before both reached ready-to-send.
        if let Err(e) = handshake::barrier(tcp_fd) {
            ctx.router.deregister(qp.qp_num());
            return Err(RingError::HandshakeFailed(e));
        }
        debug!("ring established, local qp {}, remote qp {}", qp.qp_num(), remote.qp_num);

        let shared = Arc::new(RingShared {
            qp: Arc::<QueuePair>::clone(&qp),
            send_cq: Arc::<CompletionQueue>::clone(&ctx.send_cq),
            router: Arc::<CompletionRouter>::clone(&ctx.router),
            tracker,
        });

        // The device cap bounds the wire bytes of a frame, which is 4 less
        // than its counter span (the reserved trailing bytes never travel).
        let inline_cap: usize = (shared.qp.max_inline_data().overflow_add(4)).cast();
        let inline_threshold: u64 = self.inline_threshold.min(inline_cap).cast();

        let remote_ring = RemoteRegion {
            addr: remote.ring_addr,
            rkey: remote.ring_rkey,
        };
        let remote_cursors = RemoteRegion {
            addr: remote.cursor_addr,
            rkey: remote.cursor_rkey,
        };

        let sender = SendPath::new(
            Arc::<RingShared>::clone(&shared),
            scratch,
            Arc::<CursorBlock>::clone(&cursors),
            remote_ring,
            remote_cursors,
            inline_threshold,
            self.yield_while_waiting,
        );
        let publish_threshold = self
            .publish_threshold
            .unwrap_or_else(|| (size / 2).cast());
        let receiver = ReceivePath::new(
            Arc::<RingShared>::clone(&shared),
            ring_mr,
            cursors,
            remote_cursors,
            publish_threshold,
            self.torn_frame_timeout,
            self.yield_while_waiting,
        );

        Ok(MessageRing {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
            shared,
            ctx,
        })
    }
}

/// One endpoint of a reliable message ring.
///
/// Built over a connected TCP socket by [`MessageRingBuilder::establish`]
/// or [`MessageRing::new`]. Single producer, single consumer: one thread
/// may send while another receives, but concurrent sends (or concurrent
/// receives) are serialized by an internal mutex rather than supported.
pub struct MessageRing {
    /// producer half, one caller at a time
    sender: Mutex<SendPath>,
    /// consumer half, one caller at a time
    receiver: Mutex<ReceivePath>,
    /// queue pair and completion bookkeeping
    shared: Arc<RingShared>,
    /// the verbs resources the ring runs on
    ctx: Arc<RdmaContext>,
}

impl MessageRing {
    /// Build a ring of `buffer_size` bytes over the connected, blocking
    /// TCP socket `tcp_fd`, with default settings otherwise.
    ///
    /// On failure the socket is left intact and usable for plain TCP.
    pub fn new(buffer_size: usize, tcp_fd: RawFd) -> Result<Self> {
        MessageRingBuilder::default()
            .set_buffer_size(buffer_size)
            .establish(tcp_fd)
    }

    /// Send one message. Blocks until the peer's ring has space and the
    /// frame is posted; there is no partial send.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.sender.lock().send(data)
    }

    /// Receive one message into `dst`, returning its length. Blocks until
    /// a message is available. A too-small `dst` fails with
    /// [`RingError::BufferTooSmall`] and leaves the message in the ring.
    pub fn receive(&self, dst: &mut [u8]) -> Result<usize> {
        self.receiver.lock().receive(dst)
    }

    /// Whether a complete message is ready right now. Never blocks.
    pub fn has_data(&self) -> bool {
        self.receiver.lock().has_data()
    }

    /// Push the read cursor to the peer immediately instead of waiting for
    /// the publish threshold.
    pub fn flush_read_position(&self) -> Result<()> {
        self.receiver.lock().publish_cursor()
    }

    /// Reap both completion queues until nothing of this ring is
    /// outstanding or the deadline passes.
    fn drain(&self, deadline: Instant) {
        while self.shared.tracker.outstanding() > 0 && Instant::now() < deadline {
            let _sends = self.shared.send_cq.reap(&self.shared.router);
            let _recvs = self.ctx.recv_cq.reap(&self.shared.router);
            hint::spin_loop();
        }
    }
}

impl Debug for MessageRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRing")
            .field("qp_num", &self.shared.qp.qp_num())
            .finish()
    }
}

impl Drop for MessageRing {
    /// Teardown in the order the registered memory demands: drain send
    /// completions, transition the queue pair to error so everything else
    /// flushes, drain the flushes, only then let the memory regions
    /// deregister (field drop).
    fn drop(&mut self) {
        let deadline = Instant::now() + DRAIN_DEADLINE;
        self.drain(deadline);
        if let Err(e) = self.shared.qp.modify_to_error() {
            warn!("queue pair error transition failed during teardown: {}", e);
        }
        self.drain(deadline);
        // One last sweep for the flushed priming receives, which are not
        // part of the outstanding count.
        let _sends = self.shared.send_cq.reap(&self.shared.router);
        let _recvs = self.ctx.recv_cq.reap(&self.shared.router);
        let left = self.shared.tracker.outstanding();
        if left > 0 {
            warn!("abandoning {} unreaped work requests at teardown", left);
        }
        self.ctx.router.deregister(self.shared.qp.qp_num());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = MessageRingBuilder::default();
        assert_eq!(builder.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(builder.inline_threshold, DEFAULT_INLINE_THRESHOLD);
        assert!(builder.publish_threshold.is_none());
        assert!(!builder.yield_while_waiting);
    }

    #[test]
    fn ring_is_send_and_sync() {
        fn require_send_sync<T: Send + Sync>() {}

        require_send_sync::<MessageRing>();
        require_send_sync::<RdmaContext>();
    }
}
