use crate::access::{flags_into_ibv_access, AccessFlag};
use crate::context::Context;
use crate::error::{log_last_os_err, log_ret_last_os_err};
use crate::memory_region::LocalMemoryRegion;
use enumflags2::BitFlags;
use std::{io, ptr::NonNull, sync::Arc};

use rdma_sys::{ibv_alloc_pd, ibv_dealloc_pd, ibv_pd};

/// Protection Domain wrapper
#[derive(Debug)]
pub(crate) struct ProtectionDomain {
    /// The device context
    pub(crate) ctx: Arc<Context>,
    /// Internal `ibv_pd` pointer
    inner_pd: NonNull<ibv_pd>,
}

impl ProtectionDomain {
    /// Get pointer to the internal `ibv_pd`
    pub(crate) fn as_ptr(&self) -> *mut ibv_pd {
        self.inner_pd.as_ptr()
    }

    /// Create a protection domain on the given context
    pub(crate) fn create(ctx: &Arc<Context>) -> io::Result<Self> {
        // SAFETY: ffi
        let inner_pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) })
            .ok_or_else(|| log_ret_last_os_err("ibv_alloc_pd"))?;
        Ok(Self {
            ctx: Arc::<Context>::clone(ctx),
            inner_pd,
        })
    }

    /// Allocate a zeroed, page aligned buffer of `len` bytes and register it
    /// with this protection domain.
    pub(crate) fn register_region(
        self: &Arc<Self>,
        len: usize,
        access: BitFlags<AccessFlag>,
    ) -> io::Result<LocalMemoryRegion> {
        LocalMemoryRegion::register(self, len, flags_into_ibv_access(access))
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dealloc_pd(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err("ibv_dealloc_pd");
        }
    }
}

unsafe impl Send for ProtectionDomain {}

unsafe impl Sync for ProtectionDomain {}
