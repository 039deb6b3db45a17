use crate::error::log_last_os_err;
use crate::protection_domain::ProtectionDomain;
use clippy_utilities::Cast;
use rdma_sys::{ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_reg_mr};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{ptr::NonNull, sync::Arc};

/// Alignment of every registered buffer. Page aligned buffers keep the
/// pinning granularity of the driver and the allocation in step.
const REGION_ALIGN: usize = 4096;

/// A registered memory region backed by an allocation this struct owns.
///
/// The region is deregistered before the backing memory is freed, and the
/// protection domain is kept alive for as long as the registration exists.
pub(crate) struct LocalMemoryRegion {
    /// the internal `ibv_mr` pointer
    inner_mr: NonNull<ibv_mr>,
    /// the owned backing buffer
    buf: NonNull<u8>,
    /// layout of the backing buffer
    layout: Layout,
    /// the protection domain the region belongs to
    _pd: Arc<ProtectionDomain>,
}

impl LocalMemoryRegion {
    /// Allocate `len` zeroed bytes and register them with `pd`.
    pub(crate) fn register(
        pd: &Arc<ProtectionDomain>,
        len: usize,
        access: ibv_access_flags,
    ) -> io::Result<Self> {
        let layout = Layout::from_size_align(len, REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        // SAFETY: layout has non-zero size for every caller in this crate
        let buf = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        // SAFETY: ffi, `buf` stays alive until deregistration
        let inner_mr = NonNull::new(unsafe {
            ibv_reg_mr(pd.as_ptr(), buf.as_ptr().cast(), len, access.0.cast())
        })
        .ok_or_else(|| {
            let err = io::Error::last_os_error();
            // SAFETY: allocated with the same layout right above
            unsafe { dealloc(buf.as_ptr(), layout) };
            err
        })?;

        Ok(Self {
            inner_mr,
            buf,
            layout,
            _pd: Arc::<ProtectionDomain>::clone(pd),
        })
    }

    /// Start address of the region
    pub(crate) fn addr(&self) -> u64 {
        (self.buf.as_ptr() as usize).cast()
    }

    /// Length of the region
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    /// Local key for scatter/gather entries
    pub(crate) fn lkey(&self) -> u32 {
        // SAFETY: the mr pointer is valid until drop
        unsafe { self.inner_mr.as_ref() }.lkey
    }

    /// Remote key handed to the peer during the handshake
    pub(crate) fn rkey(&self) -> u32 {
        // SAFETY: the mr pointer is valid until drop
        unsafe { self.inner_mr.as_ref() }.rkey
    }

    /// Raw pointer to the backing buffer
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    /// Raw mutable pointer to the backing buffer
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// The region as a byte slice.
    ///
    /// The peer writes into this memory concurrently. Readers of ring
    /// content must go through the volatile loads in [`crate::ring`], the
    /// plain slice is only a carrier for base pointer and length.
    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: owned allocation of `len` bytes
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), self.len()) }
    }
}

impl Debug for LocalMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMemoryRegion")
            .field("addr", &self.addr())
            .field("len", &self.len())
            .finish()
    }
}

unsafe impl Sync for LocalMemoryRegion {}

unsafe impl Send for LocalMemoryRegion {}

impl Drop for LocalMemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dereg_mr(self.inner_mr.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_dereg_mr");
        }
        // SAFETY: allocated in `register` with this layout
        unsafe { dealloc(self.buf.as_ptr(), self.layout) };
    }
}

/// Remote descriptor of a registered region on the peer: address plus key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteRegion {
    /// Remote virtual address
    pub(crate) addr: u64,
    /// Remote memory region key
    pub(crate) rkey: u32,
}

impl RemoteRegion {
    /// Remote address at `offset` bytes into the region
    pub(crate) fn at(&self, offset: u64) -> u64 {
        self.addr.wrapping_add(offset)
    }
}

/// The cursor block is the 16 byte region each endpoint advertises during
/// the handshake.
///
/// Offset 0 holds this endpoint's own read cursor, maintained by the local
/// receive path and read by the peer's sender through a one-sided RDMA read.
/// Offset 8 mirrors the peer's read cursor. It is written by the device
/// only, either when our own RDMA read of the peer's cell lands or when the
/// peer pushes its cursor with an RDMA write. The mirror may lag the true
/// cursor, it never leads it.
pub(crate) struct CursorBlock {
    /// the registered 16 byte cell pair
    mr: LocalMemoryRegion,
}

/// Offset of the own read cursor inside the block
pub(crate) const CURSOR_OWN_OFFSET: u64 = 0;
/// Offset of the peer cursor mirror inside the block
pub(crate) const CURSOR_MIRROR_OFFSET: u64 = 8;
/// Size of the block
pub(crate) const CURSOR_BLOCK_LEN: usize = 16;

impl CursorBlock {
    /// Wrap a freshly registered 16 byte region.
    pub(crate) fn new(mr: LocalMemoryRegion) -> Self {
        debug_assert_eq!(mr.len(), CURSOR_BLOCK_LEN);
        Self { mr }
    }

    /// Cell holding our own read cursor
    fn own_cell(&self) -> &AtomicU64 {
        // SAFETY: the block is 8 byte aligned (page aligned allocation) and
        // lives as long as `self`
        unsafe { &*self.mr.as_ptr().cast::<AtomicU64>() }
    }

    /// Cell mirroring the peer's read cursor
    fn mirror_cell(&self) -> &AtomicU64 {
        // SAFETY: same as `own_cell`, offset 8 keeps the alignment
        unsafe {
            &*self
                .mr
                .as_ptr()
                .add(CURSOR_MIRROR_OFFSET.cast())
                .cast::<AtomicU64>()
        }
    }

    /// Publish the local read cursor for the peer to pull.
    pub(crate) fn store_read_pos(&self, pos: u64) {
        self.own_cell().store(pos, Ordering::Release);
    }

    /// The local read cursor as last published.
    pub(crate) fn read_pos(&self) -> u64 {
        self.own_cell().load(Ordering::Acquire)
    }

    /// Last known value of the peer's read cursor.
    pub(crate) fn peer_read_pos(&self) -> u64 {
        self.mirror_cell().load(Ordering::Acquire)
    }

    /// Local address of the own cursor cell, the source of cursor pushes.
    pub(crate) fn own_addr(&self) -> u64 {
        self.mr.addr()
    }

    /// Local address of the mirror cell, the landing zone of cursor reads.
    pub(crate) fn mirror_addr(&self) -> u64 {
        self.mr.addr().wrapping_add(CURSOR_MIRROR_OFFSET)
    }

    /// Base address advertised in the handshake record.
    pub(crate) fn addr(&self) -> u64 {
        self.mr.addr()
    }

    /// Local key of the block
    pub(crate) fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    /// Remote key advertised in the handshake record.
    pub(crate) fn rkey(&self) -> u32 {
        self.mr.rkey()
    }
}

impl Debug for CursorBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorBlock")
            .field("read_pos", &self.read_pos())
            .field("peer_read_pos", &self.peer_read_pos())
            .finish()
    }
}
