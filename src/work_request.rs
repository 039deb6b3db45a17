use clippy_utilities::Cast;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rand::Rng;
use rdma_sys::{ibv_recv_wr, ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wr_opcode};
use std::ptr;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a posted work request was for, recovered from the completion's
/// work request id when the shared queue is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub(crate) enum WrKind {
    /// An RDMA write carrying one framed message into the peer's ring
    FrameWrite = 1,
    /// An RDMA write pushing the local read cursor to the peer's mirror cell
    CursorWrite = 2,
    /// An RDMA read pulling the peer's read cursor into the local mirror cell
    CursorRead = 3,
    /// An RDMA write placing the wrap marker ahead of a padded frame
    MarkerWrite = 4,
    /// A receive request priming the queue before the state transitions
    Prime = 5,
}

impl WrKind {
    /// Recover the kind from a raw work request id
    pub(crate) fn of(wr_id: u64) -> Option<Self> {
        Self::from_u64(wr_id & 0xff)
    }
}

/// Work request id carrying the request kind in its low byte.
///
/// The upper bytes concatenate the sub-second clock and a random number so
/// ids stay distinguishable in logs across rings and restarts.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub(crate) struct WorkRequestId(u64);

impl WorkRequestId {
    /// Create an id for a work request of the given kind
    pub(crate) fn new(kind: WrKind) -> Self {
        let start = SystemTime::now();
        let micros: u64 = start
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_micros())
            .unwrap_or(0)
            .into();
        let nonce: u64 = rand::thread_rng().gen::<u32>().into();
        let body = (micros.wrapping_shl(32) | nonce) & !0xff_u64;
        let tag: u8 = kind as u8;
        WorkRequestId(body | u64::from(tag))
    }
}

impl From<WorkRequestId> for u64 {
    fn from(wr_id: WorkRequestId) -> Self {
        wr_id.0
    }
}

/// Build a scatter/gather entry from raw address, length and local key.
///
/// `lkey` may be zero for inline posts, the provider copies the bytes during
/// the post call and never performs a DMA read of the source.
pub(crate) fn sge(addr: u64, length: u32, lkey: u32) -> ibv_sge {
    ibv_sge { addr, length, lkey }
}

/// The address of a buffer as the device wants it
#[allow(clippy::as_conversions)] // pointer to usize for the ibv scatter list
pub(crate) fn addr_of(ptr: *const u8) -> u64 {
    (ptr as usize).cast()
}

/// Send work request
#[repr(C)]
pub(crate) struct SendWr {
    /// internal `ibv_send_wr`
    inner: ibv_send_wr,
    /// the scatter/gather list, kept alive alongside the request
    sges: Vec<ibv_sge>,
}

impl SendWr {
    /// Common part of every one-sided request
    fn new(sges: Vec<ibv_sge>, wr_id: WorkRequestId, remote_addr: u64, rkey: u32) -> Self {
        debug_assert!(!sges.is_empty());
        // SAFETY: POD FFI type
        let mut inner = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        inner.wr_id = wr_id.into();
        inner.next = ptr::null_mut();
        inner.num_sge = sges.len().cast();
        inner.wr.rdma.remote_addr = remote_addr;
        inner.wr.rdma.rkey = rkey;
        let mut wr = Self { inner, sges };
        wr.inner.sg_list = wr.sges.as_mut_ptr();
        wr
    }

    /// One-sided RDMA write. Always signaled so teardown can account for it;
    /// `inline` additionally asks the provider to take the payload out of
    /// the descriptor instead of DMA-reading the source regions.
    pub(crate) fn new_write(
        sges: Vec<ibv_sge>,
        wr_id: WorkRequestId,
        remote_addr: u64,
        rkey: u32,
        inline: bool,
    ) -> Self {
        let mut wr = Self::new(sges, wr_id, remote_addr, rkey);
        wr.inner.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wr.inner.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        if inline {
            wr.inner.send_flags |= ibv_send_flags::IBV_SEND_INLINE.0;
        }
        wr
    }

    /// One-sided RDMA read into a single local scatter entry.
    pub(crate) fn new_read(
        local: ibv_sge,
        wr_id: WorkRequestId,
        remote_addr: u64,
        rkey: u32,
    ) -> Self {
        let mut wr = Self::new(vec![local], wr_id, remote_addr, rkey);
        wr.inner.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        wr.inner.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr
    }
}

impl AsMut<ibv_send_wr> for SendWr {
    fn as_mut(&mut self) -> &mut ibv_send_wr {
        &mut self.inner
    }
}

/// Receive work request
#[repr(C)]
pub(crate) struct RecvWr {
    /// internal `ibv_recv_wr`
    inner: ibv_recv_wr,
}

impl RecvWr {
    /// A receive request without scatter entries. The ring carries no
    /// two-sided traffic, the receive queue only needs to be armed for the
    /// transition to ready-to-receive.
    pub(crate) fn new_empty(wr_id: WorkRequestId) -> Self {
        // SAFETY: POD FFI type
        let mut inner = unsafe { std::mem::zeroed::<ibv_recv_wr>() };
        inner.wr_id = wr_id.into();
        inner.next = ptr::null_mut();
        inner.sg_list = ptr::null_mut();
        inner.num_sge = 0_i32;
        Self { inner }
    }
}

impl AsMut<ibv_recv_wr> for RecvWr {
    fn as_mut(&mut self) -> &mut ibv_recv_wr {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        for kind in [
            WrKind::FrameWrite,
            WrKind::CursorWrite,
            WrKind::CursorRead,
            WrKind::MarkerWrite,
            WrKind::Prime,
        ] {
            let id = WorkRequestId::new(kind);
            assert_eq!(WrKind::of(id.into()), Some(kind));
        }
    }

    #[test]
    fn unknown_kind() {
        assert_eq!(WrKind::of(0), None);
        assert_eq!(WrKind::of(0xff), None);
    }
}
